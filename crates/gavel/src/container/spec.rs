//! Builder for environment creation requests
//!
//! Translates a language image and a set of [`ResourceLimits`] into the
//! Docker container create body. Every isolation property of an environment
//! is decided here, before any user code exists inside it.

use std::collections::HashMap;

use bollard::container::{Config, CreateContainerOptions};
use bollard::models::{HostConfig, ResourcesUlimits};

use crate::config::SCRATCH_DIR;
use crate::types::ResourceLimits;

/// Label set on every environment so stray ones can be found and removed
pub const MANAGED_LABEL: &str = "io.gavel.managed";

/// Size of the non-executable `/tmp` in kilobytes
const TMP_SIZE_KB: u64 = 10 * 1024;

/// Seconds an environment outlives its time limits before exiting on its own
const KEEPALIVE_GRACE_SECS: u64 = 60;

/// Creation request for one isolated environment
#[derive(Debug, Clone)]
pub struct EnvironmentSpec {
    /// Unique container name, never reused
    name: String,
    /// Image the environment starts from
    image: String,
    /// `uid:gid` of every process inside
    user: String,
    /// Resource ceilings
    limits: ResourceLimits,
    /// Extra labels
    labels: HashMap<String, String>,
}

impl EnvironmentSpec {
    /// Create a new spec with engine default limits
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            user: "65534:65534".to_owned(),
            limits: ResourceLimits::default(),
            labels: HashMap::new(),
        }
    }

    /// Set the identity processes run as
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    /// Set resource limits
    pub fn limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Add a label
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn user_id(&self) -> &str {
        &self.user
    }

    pub fn resource_limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Options for the create call
    pub fn create_options(&self) -> CreateContainerOptions<String> {
        CreateContainerOptions {
            name: self.name.clone(),
            platform: None,
        }
    }

    /// How long the idle keepalive process lives, in seconds.
    ///
    /// An environment whose release failed still exits on its own once this
    /// runs out.
    pub fn keepalive_secs(&self) -> u64 {
        let compile = self.limits.compile_time_limit.unwrap_or(0.0);
        let run = self.limits.wall_time_limit.unwrap_or(0.0);
        (compile + run).max(0.0).ceil() as u64 + KEEPALIVE_GRACE_SECS
    }

    /// Build the container create body
    pub fn build(&self) -> Config<String> {
        let limits = &self.limits;

        let memory = limits
            .memory_limit
            .map(|kb| i64::try_from(kb.saturating_mul(1024)).unwrap_or(i64::MAX));

        let nano_cpus = limits
            .cpu_share
            .filter(|share| share.is_finite() && *share > 0.0)
            .map(|share| (share * 1_000_000_000.0) as i64);

        let mut ulimits = vec![ulimit("core", 0)];
        if let Some(files) = limits.max_open_files {
            ulimits.push(ulimit("nofile", i64::from(files)));
        }
        if let Some(kb) = limits.max_file_size {
            let bytes = i64::try_from(kb.saturating_mul(1024)).unwrap_or(i64::MAX);
            ulimits.push(ulimit("fsize", bytes));
        }

        let mut scratch = String::from("rw,exec,nosuid,nodev,mode=1777");
        if let Some(kb) = limits.scratch_size {
            scratch.push_str(&format!(",size={kb}k"));
        }
        let tmpfs = HashMap::from([
            (SCRATCH_DIR.to_owned(), scratch),
            (
                "/tmp".to_owned(),
                format!("rw,noexec,nosuid,nodev,mode=1777,size={TMP_SIZE_KB}k"),
            ),
        ]);

        let host_config = HostConfig {
            memory,
            // equal to memory: no swap
            memory_swap: memory,
            nano_cpus,
            pids_limit: limits.max_processes.map(i64::from),
            ulimits: Some(ulimits),
            network_mode: Some("none".to_owned()),
            readonly_rootfs: Some(true),
            cap_drop: Some(vec!["ALL".to_owned()]),
            security_opt: Some(vec!["no-new-privileges:true".to_owned()]),
            tmpfs: Some(tmpfs),
            privileged: Some(false),
            init: Some(false),
            // a stopped environment never lingers, even if release is lost
            auto_remove: Some(true),
            ..Default::default()
        };

        let mut labels = self.labels.clone();
        labels.insert(MANAGED_LABEL.to_owned(), "true".to_owned());

        Config {
            image: Some(self.image.clone()),
            user: Some(self.user.clone()),
            working_dir: Some(SCRATCH_DIR.to_owned()),
            entrypoint: Some(vec!["sleep".to_owned()]),
            cmd: Some(vec![self.keepalive_secs().to_string()]),
            network_disabled: Some(true),
            tty: Some(false),
            open_stdin: Some(false),
            attach_stdin: Some(false),
            attach_stdout: Some(false),
            attach_stderr: Some(false),
            labels: Some(labels),
            host_config: Some(host_config),
            ..Default::default()
        }
    }
}

fn ulimit(name: &str, value: i64) -> ResourcesUlimits {
    ResourcesUlimits {
        name: Some(name.to_owned()),
        soft: Some(value),
        hard: Some(value),
    }
}
