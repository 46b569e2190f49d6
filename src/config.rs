//! Configuration module for PulseWatch.
//!
//! Server settings come from environment variables with sensible defaults.
//! Classification and lifecycle thresholds come from an optional JSON
//! policy file; every field in it is optional.

use crate::classify::ClassifierPolicy;
use crate::scheduler::{default_policies, validate_retention_policies, RetentionPolicy};
use crate::surveillance::SurveillancePolicy;
use crate::telemetry::StorePolicy;
use crate::trend::TrendPolicy;

use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read policy file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse policy file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid {section} policy: {message}")]
    Invalid {
        section: &'static str,
        message: String,
    },
}

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the web server (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "pulsewatch.db")
    pub db_path: String,
    /// Optional JSON policy file.
    pub policy_path: Option<PathBuf>,
    /// Period of the surveillance evaluation tick (default: 60s)
    pub eval_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "pulsewatch.db".to_string(),
            policy_path: None,
            eval_interval: Duration::from_secs(60),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `PULSEWATCH_HTTP_PORT`: HTTP port (default: 8080)
    /// - `PULSEWATCH_DB_PATH`: Database file path (default: "pulsewatch.db")
    /// - `PULSEWATCH_POLICY_PATH`: JSON policy file (default: none)
    /// - `PULSEWATCH_EVAL_INTERVAL_SECS`: evaluation period (default: 60)
    pub fn load() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();

        if let Some(port_str) = lookup("PULSEWATCH_HTTP_PORT") {
            match port_str.parse() {
                Ok(port) => cfg.http_port = port,
                Err(_) => tracing::warn!("Ignoring invalid PULSEWATCH_HTTP_PORT={}", port_str),
            }
        }

        if let Some(db_path) = lookup("PULSEWATCH_DB_PATH") {
            cfg.db_path = db_path;
        }

        if let Some(policy_path) = lookup("PULSEWATCH_POLICY_PATH").filter(|p| !p.trim().is_empty()) {
            cfg.policy_path = Some(PathBuf::from(policy_path));
        }

        if let Some(secs) = lookup("PULSEWATCH_EVAL_INTERVAL_SECS") {
            match secs.parse::<u64>() {
                Ok(secs) if secs > 0 => cfg.eval_interval = Duration::from_secs(secs),
                _ => tracing::warn!("Ignoring invalid PULSEWATCH_EVAL_INTERVAL_SECS={}", secs),
            }
        }

        cfg
    }
}

/// Operator-tunable thresholds for every component.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub store: StorePolicy,
    pub classifier: ClassifierPolicy,
    pub surveillance: SurveillancePolicy,
    pub trend: TrendPolicy,
    pub retention: Vec<RetentionPolicy>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            store: StorePolicy::default(),
            classifier: ClassifierPolicy::default(),
            surveillance: SurveillancePolicy::default(),
            trend: TrendPolicy::default(),
            retention: default_policies(),
        }
    }
}

impl PolicyConfig {
    /// Load and validate a policy file. `None` yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let cfg = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                })?
            }
            None => Self::default(),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |section: &'static str| move |message: String| ConfigError::Invalid { section, message };

        if self.store.raw_capacity == 0 || self.store.retention_secs <= 0 {
            return Err(ConfigError::Invalid {
                section: "store",
                message: "raw_capacity and retention_secs must be positive".to_string(),
            });
        }
        self.classifier.validate().map_err(invalid("classifier"))?;
        self.surveillance.validate().map_err(invalid("surveillance"))?;
        if !(self.trend.width > 0.0 && self.trend.height > 0.0) {
            return Err(ConfigError::Invalid {
                section: "trend",
                message: "width and height must be positive".to_string(),
            });
        }
        validate_retention_policies(&self.retention).map_err(invalid("retention"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.http_port, 8080);
        assert_eq!(cfg.db_path, "pulsewatch.db");
        assert!(cfg.policy_path.is_none());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("PULSEWATCH_HTTP_PORT", "9090"),
            ("PULSEWATCH_DB_PATH", "/tmp/pw.db"),
            ("PULSEWATCH_EVAL_INTERVAL_SECS", "0"),
        ]
        .into_iter()
        .collect();
        let cfg = ServerConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.http_port, 9090);
        assert_eq!(cfg.db_path, "/tmp/pw.db");
        assert_eq!(cfg.eval_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_partial_policy_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"classifier": {{"loss_threshold_pct": 5.0}}, "surveillance": {{"max_add_per_eval": 0}}}}"#
        )
        .unwrap();

        let cfg = PolicyConfig::load(Some(file.path())).unwrap();
        assert_eq!(cfg.classifier.loss_threshold_pct, 5.0);
        assert_eq!(cfg.classifier.latency_threshold_ms, 200.0);
        assert_eq!(cfg.surveillance.max_add_per_eval, 0);
        assert_eq!(cfg.retention, default_policies());
    }

    #[test]
    fn test_invalid_policy_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"retention": [{{"window": 60, "retention": 10}}, {{"window": 90, "retention": 10}}]}}"#).unwrap();
        assert!(matches!(
            PolicyConfig::load(Some(file.path())),
            Err(ConfigError::Invalid { section: "retention", .. })
        ));

        let mut garbage = NamedTempFile::new().unwrap();
        write!(garbage, "not json").unwrap();
        assert!(matches!(
            PolicyConfig::load(Some(garbage.path())),
            Err(ConfigError::Parse { .. })
        ));
    }
}
