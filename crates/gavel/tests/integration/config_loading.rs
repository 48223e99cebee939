use gavel::config::{AdmissionPolicy, Config, ConfigError};
use gavel::types::ResourceLimits;

use super::fixture_config;

#[test]
fn test_load_valid_config() {
    let config = Config::from_file(fixture_config("valid_full.toml")).expect("Failed to load config");

    assert!(config.languages.contains_key("cpp"));
    assert_eq!(config.sandbox_user, "1000:1000");
    assert_eq!(config.max_live_environments, Some(4));
    assert_eq!(config.admission, AdmissionPolicy::Reject);
    assert_eq!(config.default_limits.wall_time_limit, Some(2.0));
    assert_eq!(config.default_limits.memory_limit, Some(64 * ResourceLimits::MB));
    assert_eq!(config.default_limits.max_output, Some(16));
}

#[test]
fn test_registry_layers_defaults() {
    let config = Config::from_file(fixture_config("valid_full.toml")).unwrap();
    let registry = config.registry().unwrap();

    let cpp = registry.lookup("C++").unwrap();
    assert_eq!(cpp.limits.wall_time_limit, Some(2.0));
    assert_eq!(cpp.limits.compile_time_limit, Some(10.0));
    assert_eq!(cpp.max_limits.wall_time_limit, Some(4.0));
    assert_eq!(cpp.denylist.len(), 1);
}

#[test]
fn test_load_minimal_config() {
    let config = Config::from_file(fixture_config("valid_minimal.toml")).expect("Failed to load config");

    assert!(config.languages.contains_key("python"));
    assert!(!config.insecure_fallback);
    assert_eq!(config.sandbox_user, "65534:65534");
}

#[test]
fn test_load_missing_file() {
    let result = Config::from_file(fixture_config("does_not_exist.toml"));
    assert!(matches!(result, Err(ConfigError::ReadFile { .. })));
}

#[test]
fn test_load_invalid_root_user() {
    let result = Config::from_file(fixture_config("invalid_root_user.toml"));
    assert!(matches!(result, Err(ConfigError::Invalid(_))));
}

#[test]
fn test_load_invalid_empty_run_command() {
    let result = Config::from_file(fixture_config("invalid_empty_run_command.toml"));
    assert!(result.is_err());
}

#[test]
fn test_load_invalid_denylist_pattern() {
    let result = Config::from_file(fixture_config("invalid_denylist_pattern.toml"));
    assert!(result.is_err());
}

#[test]
fn test_duplicate_alias_fails_registry() {
    let config = Config::from_file(fixture_config("duplicate_alias.toml")).unwrap();
    assert!(matches!(config.registry(), Err(ConfigError::Invalid(_))));
}

#[test]
fn test_example_config_parses() {
    let config = Config::parse_toml(gavel::EXAMPLE_CONFIG).expect("Failed to parse example config");
    let registry = config.registry().unwrap();
    assert_eq!(registry.len(), 5);
    assert_eq!(registry.lookup("py").unwrap().image, "gavel-python:latest");
}
