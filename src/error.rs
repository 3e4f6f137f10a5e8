use thiserror::Error;

/// Crate-level error taxonomy.
///
/// Flow-level anomalies (protocol violations, capacity evictions, stalled
/// analyzers) are not represented here: they terminate a single stream via
/// its terminal [`crate::assembly::StreamState`] and the pipeline carries on.
/// Only capture I/O and configuration failures are fatal to the process.
#[derive(Debug, Error)]
pub enum FlowscopeError {
    #[error("capture error: {0}")]
    Capture(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FlowscopeError>;
