use std::path::PathBuf;
use std::time::Duration;

use crate::error::{GateError, Result};

/// Remote queue and observer endpoints.
///
/// The queue serves jobs and accepts log lines on the same app instance; the
/// observer can be pointed elsewhere with `observer_url`.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// App instance base URL, e.g. `http://crowdbotblock.herokuapp.com`
    pub base_url: String,
    /// Path returning the most recently submitted job
    pub latest_path: String,
    /// Path returning the next pending job, accepts `?lastid=`
    pub next_path: String,
    /// Path accepting `{"message": ...}` log lines
    pub log_path: String,
    /// Observer base URL. Falls back to `base_url` when unset.
    pub observer_url: Option<String>,
    /// Upper bound for every queue/observer HTTP call
    pub request_timeout_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            base_url: "http://crowdbotblock.herokuapp.com".to_string(),
            latest_path: "/latest".to_string(),
            next_path: "/cue".to_string(),
            log_path: "/speak".to_string(),
            observer_url: None,
            request_timeout_ms: 10_000,
        }
    }
}

impl QueueConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn observer_base(&self) -> &str {
        self.observer_url.as_deref().unwrap_or(&self.base_url)
    }

    /// Full URL of the observer's log endpoint.
    pub fn log_endpoint(&self) -> String {
        join_url(self.observer_base(), &self.log_path)
    }
}

/// Admission policy settings.
#[derive(Debug, Clone)]
pub struct PolicyConfig {
    /// The single module a job may `require`
    pub allowed_module: String,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            allowed_module: "johnny-five".to_string(),
        }
    }
}

/// Configuration for the child process running an approved job.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Interpreter used to run the staged script
    pub runtime: String,
    /// Arguments placed before the script path
    pub runtime_args: Vec<String>,
    /// Single staging slot the composed script is written to
    pub staging_path: PathBuf,
    /// Hard wall-clock ceiling for one run
    pub execution_timeout_ms: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            runtime: "node".to_string(),
            runtime_args: Vec::new(),
            staging_path: PathBuf::from("submitted-job.js"),
            execution_timeout_ms: 60_000,
        }
    }
}

impl SandboxConfig {
    pub fn execution_timeout(&self) -> Duration {
        Duration::from_millis(self.execution_timeout_ms)
    }
}

/// What the first cycle after a (re)start does with the newest job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum RestartPolicy {
    /// Execute the most recent job, even if it already ran before the restart
    #[default]
    RerunLatest,
    /// Record the most recent job as already seen without executing it
    SkipLatest,
}

#[derive(Debug, Clone)]
pub struct PollConfig {
    pub max_iterations: u64,
    pub max_duration_ms: u64,
    /// Wait after an idle, failed or rejected cycle
    pub short_wait_ms: u64,
    /// Minimum spacing between two launches
    pub long_wait_ms: u64,
    pub restart_policy: RestartPolicy,
    /// Post host-side notices (rejections, timeouts) to the observer
    pub announce_outcomes: bool,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            // 175 cycles at 45s is a little over two hours of unattended running
            max_iterations: 175,
            max_duration_ms: 2 * 60 * 60 * 1000,
            short_wait_ms: 45_000,
            long_wait_ms: 60_000,
            restart_policy: RestartPolicy::RerunLatest,
            announce_outcomes: false,
        }
    }
}

impl PollConfig {
    pub fn max_duration(&self) -> Duration {
        Duration::from_millis(self.max_duration_ms)
    }

    pub fn short_wait(&self) -> Duration {
        Duration::from_millis(self.short_wait_ms)
    }

    pub fn long_wait(&self) -> Duration {
        Duration::from_millis(self.long_wait_ms)
    }
}

#[derive(Debug, Clone, Default)]
pub struct GateConfig {
    pub queue: QueueConfig,
    pub policy: PolicyConfig,
    pub sandbox: SandboxConfig,
    pub poll: PollConfig,
}

impl GateConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            queue: QueueConfig {
                base_url: base_url.into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.sandbox.execution_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_waits(mut self, short: Duration, long: Duration) -> Self {
        self.poll.short_wait_ms = short.as_millis() as u64;
        self.poll.long_wait_ms = long.as_millis() as u64;
        self
    }

    pub fn with_restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.poll.restart_policy = policy;
        self
    }

    /// Check the startup invariants. Any error here is fatal: the loop must
    /// not start spinning on a configuration it can never satisfy.
    pub fn validate(&self) -> Result<()> {
        validate_url("base URL", &self.queue.base_url)?;
        if let Some(observer) = &self.queue.observer_url {
            validate_url("observer URL", observer)?;
        }
        for (name, path) in [
            ("latest path", &self.queue.latest_path),
            ("next path", &self.queue.next_path),
            ("log path", &self.queue.log_path),
        ] {
            if !path.starts_with('/') {
                return Err(GateError::Config(format!(
                    "{} must start with '/': {:?}",
                    name, path
                )));
            }
        }
        if self.queue.request_timeout_ms == 0 {
            return Err(GateError::Config(
                "request timeout must be greater than zero".to_string(),
            ));
        }

        let module = &self.policy.allowed_module;
        if module.is_empty()
            || module
                .chars()
                .any(|c| matches!(c, '\'' | '"' | '`' | '\\' | '[' | ']') || c.is_whitespace())
        {
            return Err(GateError::Config(format!(
                "allowed module name is not a plain module identifier: {:?}",
                module
            )));
        }

        if self.sandbox.runtime.trim().is_empty() {
            return Err(GateError::Config("runtime must not be empty".to_string()));
        }
        if self.sandbox.staging_path.as_os_str().is_empty() {
            return Err(GateError::Config(
                "staging path must not be empty".to_string(),
            ));
        }
        if self.sandbox.execution_timeout_ms == 0 {
            return Err(GateError::Config(
                "execution timeout must be greater than zero".to_string(),
            ));
        }

        if self.poll.max_iterations == 0 {
            return Err(GateError::Config(
                "max iterations must be greater than zero".to_string(),
            ));
        }
        if self.poll.long_wait_ms < self.sandbox.execution_timeout_ms {
            return Err(GateError::Config(format!(
                "long wait ({}ms) must be at least the execution timeout ({}ms)",
                self.poll.long_wait_ms, self.sandbox.execution_timeout_ms
            )));
        }
        Ok(())
    }
}

fn validate_url(name: &str, raw: &str) -> Result<()> {
    let url = reqwest::Url::parse(raw)
        .map_err(|e| GateError::Config(format!("invalid {} {:?}: {}", name, raw, e)))?;
    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(GateError::Config(format!(
                "{} must use http or https, got {:?}",
                name, other
            )))
        }
    }
    if url.host_str().is_none() {
        return Err(GateError::Config(format!("{} has no host: {:?}", name, raw)));
    }
    Ok(())
}

/// Join a base URL and an absolute path without doubling the slash.
pub fn join_url(base: &str, path: &str) -> String {
    format!("{}{}", base.trim_end_matches('/'), path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_config_default() {
        let cfg = GateConfig::default();
        assert_eq!(cfg.queue.latest_path, "/latest");
        assert_eq!(cfg.queue.next_path, "/cue");
        assert_eq!(cfg.queue.log_path, "/speak");
        assert_eq!(cfg.policy.allowed_module, "johnny-five");
        assert_eq!(cfg.sandbox.runtime, "node");
        assert_eq!(cfg.sandbox.execution_timeout_ms, 60_000);
        assert_eq!(cfg.poll.max_iterations, 175);
        assert_eq!(cfg.poll.restart_policy, RestartPolicy::RerunLatest);
        assert!(!cfg.poll.announce_outcomes);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn observer_defaults_to_base_url() {
        let mut cfg = QueueConfig {
            base_url: "http://queue.local/".to_string(),
            ..Default::default()
        };
        assert_eq!(cfg.log_endpoint(), "http://queue.local/speak");

        cfg.observer_url = Some("https://observer.local".to_string());
        assert_eq!(cfg.log_endpoint(), "https://observer.local/speak");
    }

    #[test]
    fn rejects_bad_base_url() {
        let cfg = GateConfig::new("not a url");
        assert!(matches!(cfg.validate(), Err(GateError::Config(_))));

        let cfg = GateConfig::new("ftp://queue.local");
        assert!(matches!(cfg.validate(), Err(GateError::Config(_))));
    }

    #[test]
    fn rejects_long_wait_shorter_than_timeout() {
        let cfg = GateConfig::new("http://queue.local")
            .with_execution_timeout(Duration::from_secs(10))
            .with_waits(Duration::from_secs(1), Duration::from_secs(5));
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("long wait"));
    }

    #[test]
    fn rejects_zero_timeouts() {
        let mut cfg = GateConfig::new("http://queue.local");
        cfg.sandbox.execution_timeout_ms = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = GateConfig::new("http://queue.local");
        cfg.queue.request_timeout_ms = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_quoted_module_name() {
        let mut cfg = GateConfig::new("http://queue.local");
        cfg.policy.allowed_module = "johnny-five')".to_string();
        assert!(cfg.validate().is_err());

        cfg.policy.allowed_module = String::new();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_relative_paths() {
        let mut cfg = GateConfig::new("http://queue.local");
        cfg.queue.next_path = "cue".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn builders_set_fields() {
        let cfg = GateConfig::new("http://queue.local")
            .with_execution_timeout(Duration::from_millis(250))
            .with_waits(Duration::from_millis(10), Duration::from_millis(300))
            .with_restart_policy(RestartPolicy::SkipLatest);
        assert_eq!(cfg.sandbox.execution_timeout(), Duration::from_millis(250));
        assert_eq!(cfg.poll.short_wait(), Duration::from_millis(10));
        assert_eq!(cfg.poll.long_wait(), Duration::from_millis(300));
        assert_eq!(cfg.poll.restart_policy, RestartPolicy::SkipLatest);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn join_url_avoids_double_slash() {
        assert_eq!(join_url("http://a/", "/b"), "http://a/b");
        assert_eq!(join_url("http://a", "/b"), "http://a/b");
    }
}
