//! Server configuration.
//!
//! Configuration is layered: [`Config::default`] provides the built-in values,
//! an optional JSON file (loaded with [`Config::load`]) overrides them, and the
//! command line (see `main.rs`) overrides the file. Every field carries a serde
//! default, so a config file only needs the keys it wants to change:
//!
//! ```json
//! {
//!     "appendonly": true,
//!     "appendfsync": "always",
//!     "maxmemory": 104857600
//! }
//! ```

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Fsync policy of the append-only log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum FsyncPolicy {
    /// Fsync after every record, synchronously on the writing task.
    Always,
    /// A background ticker fsyncs once per second.
    #[default]
    #[serde(rename = "everysec")]
    #[value(name = "everysec")]
    EverySec,
    /// Leave flushing to the operating system.
    No,
}

impl FsyncPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            FsyncPolicy::Always => "always",
            FsyncPolicy::EverySec => "everysec",
            FsyncPolicy::No => "no",
        }
    }
}

/// Full server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Number of logical databases
    pub databases: usize,
    /// Directory holding the log and snapshot files
    pub dir: PathBuf,
    /// Whether the append-only log is enabled
    pub appendonly: bool,
    /// File name of the append-only log, relative to `dir`
    pub appendfilename: String,
    pub appendfsync: FsyncPolicy,
    /// Rewrite the log as a binary snapshot preamble instead of commands
    pub aof_use_rdb_preamble: bool,
    /// File name of the standalone snapshot, relative to `dir`
    pub dbfilename: String,
    /// Memory ceiling in bytes; 0 disables eviction
    pub maxmemory: u64,
    /// Keys sampled per database on each eviction pass
    pub maxmemory_samples: usize,
    pub lfu_log_factor: u32,
    /// Minutes of idleness per counter decrement; 0 disables decay
    pub lfu_decay_time: u32,
    /// Resolution of the expiration wheel in milliseconds
    pub expire_tick_ms: u64,
    /// Interval of the memory sampler in milliseconds
    pub memory_sample_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: crate::DEFAULT_HOST.to_string(),
            port: crate::DEFAULT_PORT,
            databases: 16,
            dir: PathBuf::from("."),
            appendonly: false,
            appendfilename: "appendonly.aof".to_string(),
            appendfsync: FsyncPolicy::EverySec,
            aof_use_rdb_preamble: false,
            dbfilename: "dump.rdb".to_string(),
            maxmemory: 0,
            maxmemory_samples: 5,
            lfu_log_factor: 10,
            lfu_decay_time: 1,
            expire_tick_ms: 100,
            memory_sample_interval_ms: 5000,
        }
    }
}

impl Config {
    /// Loads a configuration file, falling back to defaults for missing keys.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to a JSON configuration file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(path.as_ref())?;
        let config: Config = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks values that would make the server unusable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.databases == 0 {
            return Err(ConfigError::Invalid("databases must be at least 1".into()));
        }
        if self.expire_tick_ms == 0 {
            return Err(ConfigError::Invalid("expire_tick_ms must be positive".into()));
        }
        if self.memory_sample_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "memory_sample_interval_ms must be positive".into(),
            ));
        }
        if self.appendfilename.is_empty() || self.dbfilename.is_empty() {
            return Err(ConfigError::Invalid("file names must not be empty".into()));
        }
        if self.maxmemory_samples == 0 {
            return Err(ConfigError::Invalid("maxmemory_samples must be positive".into()));
        }
        Ok(())
    }

    /// Returns the bind address as a string
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn aof_path(&self) -> PathBuf {
        self.dir.join(&self.appendfilename)
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.dir.join(&self.dbfilename)
    }

    pub fn expire_tick(&self) -> Duration {
        Duration::from_millis(self.expire_tick_ms)
    }

    pub fn memory_sample_interval(&self) -> Duration {
        Duration::from_millis(self.memory_sample_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.databases, 16);
        assert_eq!(config.appendfsync, FsyncPolicy::EverySec);
        assert_eq!(config.lfu_log_factor, 10);
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"appendonly": true, "appendfsync": "always", "maxmemory": 1024}}"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert!(config.appendonly);
        assert_eq!(config.appendfsync, FsyncPolicy::Always);
        assert_eq!(config.maxmemory, 1024);
        assert_eq!(config.port, crate::DEFAULT_PORT);
    }

    #[test]
    fn test_everysec_spelling() {
        let policy: FsyncPolicy = serde_json::from_str("\"everysec\"").unwrap();
        assert_eq!(policy, FsyncPolicy::EverySec);
        assert_eq!(policy.as_str(), "everysec");
    }

    #[test]
    fn test_rejects_zero_databases() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"databases": 0}}"#).unwrap();
        assert!(matches!(
            Config::load(file.path()),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_paths_join_dir() {
        let config = Config {
            dir: PathBuf::from("/var/lib/tidekv"),
            ..Default::default()
        };
        assert_eq!(
            config.aof_path(),
            PathBuf::from("/var/lib/tidekv/appendonly.aof")
        );
        assert_eq!(config.snapshot_path(), PathBuf::from("/var/lib/tidekv/dump.rdb"));
    }
}
