//! Command line interface.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::Config;
use crate::pipeline;

#[derive(Parser, Debug)]
#[command(author, version, about = "Passive TCP traffic analyzer emitting per-session breakdowns")]
pub struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Network interface to capture from
    #[arg(short, long)]
    pub interface: Option<String>,

    /// BPF filter expression
    #[arg(short, long)]
    pub filter: Option<String>,

    /// Number of reassembly shards (default: CPU count)
    #[arg(long)]
    pub shards: Option<usize>,

    /// Maximum tracked streams per shard
    #[arg(long)]
    pub max_streams: Option<usize>,

    /// Seconds before a closing flow times out
    #[arg(long)]
    pub closing_timeout: Option<u64>,

    /// Log file name (stderr when unset)
    #[arg(long)]
    pub log_file: Option<String>,

    /// Directory for the log file
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

impl Cli {
    /// Merge file configuration with CLI overrides.
    pub fn into_config(self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::load_or_default()?,
        };

        if self.interface.is_some() {
            config.interface = self.interface;
        }
        if let Some(filter) = self.filter {
            config.filter = filter;
        }
        if let Some(shards) = self.shards {
            config.shards = shards;
        }
        if let Some(max_streams) = self.max_streams {
            config.max_streams = max_streams;
        }
        if let Some(closing_timeout) = self.closing_timeout {
            config.closing_timeout = closing_timeout;
        }
        if self.log_file.is_some() {
            config.log_file = self.log_file;
        }
        if self.log_dir.is_some() {
            config.log_dir = self.log_dir;
        }
        if let Some(log_level) = self.log_level {
            config.log_level = log_level;
        }

        Ok(config)
    }
}

/// Parse configuration, initialize logging, and run the pipeline.
pub fn run(cli: Cli) -> Result<()> {
    let config = cli.into_config()?;
    init_logging(&config)?;

    info!(filter = %config.filter, shards = config.shard_count(), "flowscope starting");
    pipeline::run(config)
}

fn init_logging(config: &Config) -> Result<()> {
    let filter = EnvFilter::try_new(&config.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));

    match config.log_path() {
        Some(path) => {
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("failed to create log dir {}", dir.display()))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            tracing_subscriber::registry()
                .with(fmt::layer().with_target(false).with_ansi(false).with_writer(Arc::new(file)))
                .with(filter)
                .init();
        }
        None => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
                .with(filter)
                .init();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides_config() {
        let cli = Cli::parse_from([
            "flowscope",
            "--interface",
            "eth1",
            "--filter",
            "tcp port 80",
            "--shards",
            "3",
            "--closing-timeout",
            "60",
        ]);
        let config = cli.into_config().unwrap();

        assert_eq!(config.interface.as_deref(), Some("eth1"));
        assert_eq!(config.filter, "tcp port 80");
        assert_eq!(config.shard_count(), 3);
        assert_eq!(config.closing_timeout, 60);
        // Untouched fields keep their defaults.
        assert_eq!(config.max_streams, 65_535);
    }

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::parse_from(["flowscope"]);
        let config = cli.into_config().unwrap();
        assert_eq!(config.filter, "tcp");
        assert!(config.interface.is_none());
    }
}
