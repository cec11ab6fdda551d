use crate::timeouts::{
    DEFAULT_COMPACTION_TIMEOUT, DEFAULT_REQUEST_TIMEOUT, DEFAULT_WRITE_TIMEOUT,
};
use crate::wire::DEFAULT_MAX_PAYLOAD_BYTES;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Per-node settings, loaded once at startup and handed to constructors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node_id: String,
    pub data_dir: PathBuf,
    #[serde(default)]
    pub control: ControlConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Listen address for the control plane; `None` disables the listener.
    pub bind: Option<String>,
    pub default_timeout_ms: u64,
    pub compaction_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub max_payload_bytes: usize,
    pub max_connections: usize,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            bind: None,
            default_timeout_ms: DEFAULT_REQUEST_TIMEOUT.as_millis() as u64,
            compaction_timeout_ms: DEFAULT_COMPACTION_TIMEOUT.as_millis() as u64,
            write_timeout_ms: DEFAULT_WRITE_TIMEOUT.as_millis() as u64,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            max_connections: 64,
        }
    }
}

impl ControlConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn compaction_timeout(&self) -> Duration {
        Duration::from_millis(self.compaction_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "control.default_timeout_ms must be positive".into(),
            ));
        }
        if self.compaction_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "control.compaction_timeout_ms must be positive".into(),
            ));
        }
        if self.write_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "control.write_timeout_ms must be positive".into(),
            ));
        }
        if self.max_payload_bytes == 0 {
            return Err(ConfigError::Invalid(
                "control.max_payload_bytes must be positive".into(),
            ));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "control.max_connections must be positive".into(),
            ));
        }
        Ok(())
    }
}

impl NodeConfig {
    pub fn new(node_id: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            node_id: node_id.into(),
            data_dir: data_dir.into(),
            control: ControlConfig::default(),
        }
    }

    /// Reads a YAML file. A relative `data_dir` is taken relative to the
    /// file's own directory.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: NodeConfig =
            serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        let base = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        if config.data_dir.is_relative() {
            config.data_dir = base.join(&config.data_dir);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id.trim().is_empty() {
            return Err(ConfigError::Invalid("node_id must not be empty".into()));
        }
        if self.data_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("data_dir must not be empty".into()));
        }
        self.control.validate()
    }

    /// Root of one replica's state machine files.
    pub fn replica_dir(&self, shard_id: u64, replica_id: u64) -> PathBuf {
        self.data_dir
            .join(format!("shard-{shard_id}"))
            .join(format!("replica-{replica_id}"))
    }

    pub fn store_path(&self, shard_id: u64, replica_id: u64) -> PathBuf {
        self.replica_dir(shard_id, replica_id).join("store.db")
    }

    pub fn shard_state_dir(&self) -> PathBuf {
        self.data_dir.join("shards")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_paths_are_keyed_by_shard_and_replica() {
        let config = NodeConfig::new("node-a", "/var/lib/fabric");
        assert_eq!(
            config.store_path(7, 2),
            PathBuf::from("/var/lib/fabric/shard-7/replica-2/store.db")
        );
        assert_eq!(
            config.shard_state_dir(),
            PathBuf::from("/var/lib/fabric/shards")
        );
    }

    #[test]
    fn zero_limits_are_rejected() {
        let mut config = NodeConfig::new("node-a", "/tmp/x");
        config.control.max_payload_bytes = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
