use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::snapshot::write_atomic;

pub const CONFIG_VERSION: u32 = 1;
/// Longest accepted gap between snapshot saves.
pub const MAX_UPDATE_INTERVAL_SECS: f64 = 86_400.0;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("serializing config: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("writing config {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config update: {0}")]
    Patch(#[source] serde_json::Error),
    #[error("config version {found} is newer than supported version {supported}")]
    UnsupportedVersion { found: u32, supported: u32 },
    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Settings for one measurement session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub version: u32,
    pub test_urls: Vec<String>,
    /// Informational ceiling; exceeding it only logs milestones.
    pub data_cap_gb: f64,
    pub update_interval_seconds: f64,
    /// Percent below baseline that counts as throttled.
    pub throttle_threshold_percent: f64,
    pub expected_speed_mbps: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            test_urls: vec!["https://speed.cloudflare.com/__down?bytes=100000000".to_string()],
            data_cap_gb: 50.0,
            update_interval_seconds: 2.0,
            throttle_threshold_percent: 30.0,
            expected_speed_mbps: 60.0,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.version > CONFIG_VERSION {
            return Err(ConfigError::UnsupportedVersion {
                found: self.version,
                supported: CONFIG_VERSION,
            });
        }
        if self.test_urls.is_empty() || self.test_urls.iter().any(|u| u.trim().is_empty()) {
            return Err(invalid("test_urls", "at least one non-empty target is required"));
        }
        if !(self.data_cap_gb > 0.0) {
            return Err(invalid("data_cap_gb", "must be greater than zero"));
        }
        if !(self.update_interval_seconds > 0.0 && self.update_interval_seconds <= MAX_UPDATE_INTERVAL_SECS) {
            return Err(invalid("update_interval_seconds", "must be greater than zero and at most one day"));
        }
        if !(self.throttle_threshold_percent > 0.0 && self.throttle_threshold_percent < 100.0) {
            return Err(invalid("throttle_threshold_percent", "must be between 0 and 100"));
        }
        if !(self.expected_speed_mbps > 0.0) {
            return Err(invalid("expected_speed_mbps", "must be greater than zero"));
        }
        Ok(())
    }

    /// Apply `patch` to a copy and validate the result; `self` is untouched on error.
    pub fn patched(&self, patch: &ConfigPatch) -> Result<Config, ConfigError> {
        let mut next = self.clone();
        if let Some(urls) = &patch.test_urls {
            next.test_urls = urls.clone();
        }
        if let Some(v) = patch.data_cap_gb {
            next.data_cap_gb = v;
        }
        if let Some(v) = patch.update_interval_seconds {
            next.update_interval_seconds = v;
        }
        if let Some(v) = patch.throttle_threshold_percent {
            next.throttle_threshold_percent = v;
        }
        if let Some(v) = patch.expected_speed_mbps {
            next.expected_speed_mbps = v;
        }
        next.version = CONFIG_VERSION;
        next.validate()?;
        Ok(next)
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid { field, reason: reason.to_string() }
}

/// Typed partial update. Unknown keys are rejected rather than merged.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_urls: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_cap_gb: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_interval_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throttle_threshold_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_speed_mbps: Option<f64>,
}

impl ConfigPatch {
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(raw).map_err(ConfigError::Patch)
    }

    pub fn is_empty(&self) -> bool {
        *self == ConfigPatch::default()
    }
}

/// Files shared by the supervisor and the worker.
#[derive(Clone, Debug)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.json")
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.root.join("data.json")
    }

    pub fn log_path(&self) -> PathBuf {
        self.root.join("worker.log")
    }

    pub fn signal_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.signal"))
    }
}

/// Flat settings file on disk.
#[derive(Clone, Debug)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Missing file yields defaults; anything unparsable or invalid is an error.
    pub fn load(&self) -> Result<Config, ConfigError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Config::default()),
            Err(source) => return Err(ConfigError::Io { path: self.path.clone(), source }),
        };
        let config: Config = serde_json::from_str(&raw)
            .map_err(|source| ConfigError::Parse { path: self.path.clone(), source })?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, config: &Config) -> Result<(), ConfigError> {
        let body = serde_json::to_vec_pretty(config).map_err(ConfigError::Serialize)?;
        write_atomic(&self.path, &body)
            .map_err(|source| ConfigError::Write { path: self.path.clone(), source })
    }

    pub fn apply(&self, patch: &ConfigPatch) -> Result<Config, ConfigError> {
        let next = self.load()?.patched(patch)?;
        self.save(&next)?;
        Ok(next)
    }
}
