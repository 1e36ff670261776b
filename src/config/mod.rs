//! Engine configuration.
//!
//! Loaded once at startup from a JSON file and then shared read-only across
//! tasks. Unknown keys are rejected at load time so typos in operator config
//! files surface immediately instead of silently falling back to defaults.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Errors surfaced while loading configuration. Fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parse config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// All tunable parameters for a worker node.
///
/// `request_timeout` is expressed in whole seconds in the JSON file
/// (`"request_timeout": 30`).
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// How many independent sessions the engine maintains concurrently.
    /// Keep this <= 2000 for safe operation.
    pub number_of_sessions: usize,

    /// End-to-end timeout for a single HTTP request, in seconds: connection
    /// setup, TLS handshake, request body, and full response read.
    #[serde(rename = "request_timeout", deserialize_with = "de_secs")]
    pub request_timeout: Duration,

    /// How many times a failed request is retried by the job closure before
    /// it is counted as a permanent failure.
    pub max_retries: u32,

    /// Base URL the engine drives traffic against.
    pub target_url: String,

    /// Path to a newline-delimited proxy list. Empty runs direct.
    pub proxy_file: String,

    /// Global idle-connection cap across all hosts. Recognised for
    /// config-file compatibility, but hyper's pool exposes no global idle
    /// cap, so the value is not enforced; `max_idle_conns_per_host` is the
    /// knob the transport applies.
    pub max_idle_conns: usize,

    /// Idle connections kept per host. This is the limit the transport
    /// enforces; setting it close to `number_of_sessions` avoids
    /// connection churn against a single origin.
    pub max_idle_conns_per_host: usize,

    /// Per-host cap on total connections (idle + active). Recognised for
    /// config-file compatibility, but not enforceable through hyper's
    /// pool, which caps idle connections only.
    pub max_conns_per_host: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            number_of_sessions: 500,
            request_timeout: Duration::from_secs(30),
            max_retries: 3,
            target_url: String::new(),
            proxy_file: String::new(),
            max_idle_conns: 500,
            max_idle_conns_per_host: 100,
            max_conns_per_host: 200,
        }
    }
}

impl Config {
    /// Reads and parses a JSON config file. Unknown keys are an error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }
}

fn de_secs<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let secs = u64::deserialize(deserializer)?;
    Ok(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(name: &str, contents: &str) -> std::path::PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("cohort-config-{}-{}.json", std::process::id(), name));
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn loads_partial_config_with_defaults() {
        let path = write_temp("partial", r#"{"number_of_sessions": 12, "request_timeout": 5}"#);
        let cfg = Config::load(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(cfg.number_of_sessions, 12);
        assert_eq!(cfg.request_timeout, Duration::from_secs(5));
        assert_eq!(cfg.max_retries, 3);
    }

    #[test]
    fn rejects_unknown_keys() {
        let path = write_temp("unknown", r#"{"number_of_sesions": 12}"#);
        let err = Config::load(&path).unwrap_err();
        std::fs::remove_file(&path).ok();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
