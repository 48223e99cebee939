use gavel::config::Config;
use gavel::{Engine, EngineError, Submission, VerdictKind};

const SHELL_LANGUAGE: &str = r#"
    [languages.shell]
    name = "POSIX shell"
    image = "gavel-shell:latest"
    extension = "sh"

    [languages.shell.run]
    command = ["sh", "{source}"]
"#;

/// Config pointing at an endpoint nothing listens on
fn unreachable_config(insecure_fallback: bool) -> Config {
    let mut config = Config::parse_toml(SHELL_LANGUAGE).unwrap();
    config.docker_host = Some("tcp://127.0.0.1:9".to_owned());
    config.insecure_fallback = insecure_fallback;
    config
}

#[tokio::test]
async fn test_unreachable_runtime_stays_secure() {
    let engine = Engine::connect(&unreachable_config(false)).await.unwrap();
    assert!(!engine.is_insecure());

    let readiness = engine.check_system_requirements().await;
    assert!(!readiness.runtime_available);
    assert_eq!(readiness.images.get("shell"), Some(&false));

    let err = engine
        .judge(&Submission::new("shell", "echo hi"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::EnvironmentUnavailable(_)));
    assert_eq!(engine.stats().unwrap().created, 0);
}

#[tokio::test]
async fn test_insecure_fallback_flags_verdicts() {
    let engine = Engine::connect(&unreachable_config(true)).await.unwrap();
    assert!(engine.is_insecure());

    let verdict = engine
        .judge(&Submission::new("shell", "read x; echo \"got $x\"").with_stdin("42\n").with_expected_output("got 42"))
        .await
        .unwrap();

    assert_eq!(verdict.kind(), VerdictKind::Accepted);
    assert!(verdict.is_insecure());
    assert!(engine.check_system_requirements().await.insecure);
}
