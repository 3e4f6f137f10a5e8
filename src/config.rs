//! Runtime configuration.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Main configuration, loadable from TOML and overridable from the CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Network device to capture from; system default when unset.
    pub interface: Option<String>,

    /// BPF filter expression.
    pub filter: String,

    /// Reassembly worker count; 0 means one per CPU.
    pub shards: usize,

    /// Per-shard cap on tracked streams; the oldest flow is evicted past it.
    pub max_streams: usize,

    /// Seconds a closing flow may linger after its last FIN.
    pub closing_timeout: u64,

    /// Log file name; logs go to stderr when unset. A `.log` extension is
    /// appended if missing.
    pub log_file: Option<String>,

    /// Directory for the log file.
    pub log_dir: Option<PathBuf>,

    /// Log level or tracing filter directive.
    pub log_level: String,

    /// Capture snapshot length.
    pub snaplen: u32,

    /// Kernel capture buffer size in bytes.
    pub buffer_size: u32,

    /// Capture read timeout in milliseconds.
    pub timeout_ms: u32,

    /// Put the interface into promiscuous mode.
    pub promiscuous: bool,

    /// Capacity of each pipeline queue.
    pub channel_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interface: None,
            filter: "tcp".to_string(),
            shards: 0,
            max_streams: 65_535,
            closing_timeout: 30,
            log_file: None,
            log_dir: None,
            log_level: "info".to_string(),
            snaplen: 65_535,
            buffer_size: 16 * 1024 * 1024,
            timeout_ms: 100,
            promiscuous: true,
            channel_capacity: 100_000,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Load from the first config file found in the usual places, or fall
    /// back to defaults.
    pub fn load_or_default() -> Result<Self> {
        let candidates = [
            PathBuf::from("/etc/flowscope/config.toml"),
            PathBuf::from("flowscope.toml"),
        ];
        for path in candidates {
            if path.exists() {
                return Self::load(path);
            }
        }
        Ok(Self::default())
    }

    /// Actual number of reassembly shards.
    pub fn shard_count(&self) -> usize {
        if self.shards == 0 {
            num_cpus::get().max(1)
        } else {
            self.shards
        }
    }

    /// Closing-flow timeout as a duration.
    pub fn closing_duration(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.closing_timeout as i64)
    }

    /// Resolved log file path, if file logging is configured.
    pub fn log_path(&self) -> Option<PathBuf> {
        let file = self.log_file.as_ref()?;
        let mut name = file.clone();
        if !name.ends_with(".log") {
            name.push_str(".log");
        }
        let dir = self.log_dir.clone().unwrap_or_else(|| PathBuf::from("."));
        Some(dir.join(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.filter, "tcp");
        assert_eq!(config.max_streams, 65_535);
        assert_eq!(config.closing_timeout, 30);
        assert_eq!(config.channel_capacity, 100_000);
        assert!(config.shard_count() >= 1);
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = Config {
            interface: Some("eth0".to_string()),
            shards: 4,
            ..Config::default()
        };
        let serialized = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&serialized).unwrap();
        assert_eq!(parsed.interface.as_deref(), Some("eth0"));
        assert_eq!(parsed.shards, 4);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let parsed: Config = toml::from_str("interface = \"en0\"\nmax_streams = 100\n").unwrap();
        assert_eq!(parsed.interface.as_deref(), Some("en0"));
        assert_eq!(parsed.max_streams, 100);
        assert_eq!(parsed.filter, "tcp");
    }

    #[test]
    fn test_log_path() {
        let config = Config {
            log_file: Some("flowscope".to_string()),
            log_dir: Some(PathBuf::from("/var/log")),
            ..Config::default()
        };
        assert_eq!(config.log_path(), Some(PathBuf::from("/var/log/flowscope.log")));
        assert_eq!(Config::default().log_path(), None);
    }
}
