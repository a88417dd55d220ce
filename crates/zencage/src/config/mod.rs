use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::isolate::{IsolationPolicy, TimeoutStrategy};
use crate::marshal::OverflowPolicy;
use crate::native::PROBE;
use crate::types::Capacities;

mod loader;

/// Example configuration embedded at compile time.
///
/// Library users can access this to generate a starter config file.
pub const EXAMPLE_CONFIG: &str = include_str!("../../zencage.example.toml");

/// File name of the worker binary
pub const WORKER_BINARY: &str = "zencage-worker";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file at {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] config::ConfigError),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Config for Zencage
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Config {
    /// Path to the worker binary (see [`Config::worker_binary`]).
    #[serde(default)]
    pub worker_path: Option<PathBuf>,

    /// Name of the native unit calls go to
    #[serde(default = "default_unit")]
    pub unit: String,

    /// Isolation policy used by [`Harness::run`](crate::Harness::run)
    #[serde(default)]
    pub policy: IsolationPolicy,

    /// Seconds to wait for a result; unset waits forever
    #[serde(default)]
    pub timeout: Option<f64>,

    /// What happens to a worker still running after a timeout
    #[serde(default)]
    pub on_timeout: TimeoutStrategy,

    /// What happens when a unit writes more than a capacity
    #[serde(default)]
    pub overflow: OverflowPolicy,

    /// Byte capacities of the captured outputs
    #[serde(default)]
    pub capacities: Capacities,
}

impl Config {
    /// Create a new config from the embedded defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a config from built-in values only, without parsing anything
    pub fn empty() -> Self {
        Self {
            worker_path: None,
            unit: default_unit(),
            policy: IsolationPolicy::default(),
            timeout: None,
            on_timeout: TimeoutStrategy::default(),
            overflow: OverflowPolicy::default(),
            capacities: Capacities::default(),
        }
    }

    /// Get the path to the worker binary.
    ///
    /// Falls back to `zencage-worker` beside the current executable, then to
    /// a bare name resolved through PATH.
    pub fn worker_binary(&self) -> PathBuf {
        if let Some(path) = &self.worker_path {
            return path.clone();
        }
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(WORKER_BINARY)))
            .filter(|candidate| candidate.is_file())
            .unwrap_or_else(|| PathBuf::from(WORKER_BINARY))
    }

    /// The configured timeout as a [`Duration`]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::parse_toml(EXAMPLE_CONFIG).expect("embedded default config should be valid")
    }
}

fn default_unit() -> String {
    PROBE.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_empty() {
        assert_eq!(Config::default(), Config::empty());
    }

    #[test]
    fn worker_binary_custom_path() {
        let config = Config {
            worker_path: Some(PathBuf::from("/opt/zencage/bin/worker")),
            ..Config::empty()
        };
        assert_eq!(
            config.worker_binary(),
            PathBuf::from("/opt/zencage/bin/worker")
        );
    }

    #[test]
    fn worker_binary_default_ends_with_name() {
        let config = Config::empty();
        assert!(config.worker_binary().ends_with(WORKER_BINARY));
    }

    #[test]
    fn timeout_converts_seconds() {
        let config = Config {
            timeout: Some(1.5),
            ..Config::empty()
        };
        assert_eq!(config.timeout(), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn timeout_unset() {
        assert_eq!(Config::empty().timeout(), None);
    }

    #[test]
    fn timeout_unrepresentable_is_none() {
        let config = Config {
            timeout: Some(-1.0),
            ..Config::empty()
        };
        assert_eq!(config.timeout(), None);
    }

    #[test]
    fn empty_defaults() {
        let config = Config::empty();
        assert_eq!(config.unit, "probe");
        assert_eq!(config.policy, IsolationPolicy::Process);
        assert_eq!(config.on_timeout, TimeoutStrategy::Abandon);
        assert_eq!(config.overflow, OverflowPolicy::Truncate);
        assert_eq!(config.capacities, Capacities::default());
    }
}
