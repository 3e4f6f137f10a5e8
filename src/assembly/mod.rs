//! TCP stream reassembly.
//!
//! A per-shard [`Assembler`] tracks every TCP connection in its partition:
//! handshake, sequence-space progress, out-of-order buffering, FIN/RST
//! teardown, table eviction and closing-flow timeouts. Reconstructed,
//! direction-tagged bytes are handed to the flow's protocol analyzer.

pub mod assembler;
pub mod key;
pub mod seq;
pub mod stream;

pub use assembler::Assembler;
pub use key::{dispatch_hash, Tuple4};
pub use seq::seq_diff;
pub use stream::{HalfStream, Page, Stream};

/// Which endpoint sent a packet, resolved by flow-table lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    FromClient,
    FromServer,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::FromClient => write!(f, "FromClient"),
            Direction::FromServer => write!(f, "FromServer"),
        }
    }
}

/// Per-direction TCP endpoint state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Closed,
    SynSent,
    SynReceived,
    Established,
    FinSent,
    FinConfirmed,
}

/// Connection-level state.
///
/// Everything from `Closed` down is terminal: the stream is removed from
/// the table when it enters one of these states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Connecting,
    Connected,
    DataExchanging,
    Closing,
    Closed,
    ClosingTimeout,
    ClosedAbnormally,
    ClosedExceedMaxCount,
    ResetByClientBeforeConn,
    ResetByServerBeforeConn,
    ResetByClientAfterConn,
    ResetByServerAfterConn,
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StreamState::Connecting => "Connecting",
            StreamState::Connected => "Connected",
            StreamState::DataExchanging => "DataExchanging",
            StreamState::Closing => "Closing",
            StreamState::Closed => "Closed",
            StreamState::ClosingTimeout => "ClosingTimeout",
            StreamState::ClosedAbnormally => "ClosedAbnormally",
            StreamState::ClosedExceedMaxCount => "ClosedExceedMaxCount",
            StreamState::ResetByClientBeforeConn => "ResetByClientBeforeConn",
            StreamState::ResetByServerBeforeConn => "ResetByServerBeforeConn",
            StreamState::ResetByClientAfterConn => "ResetByClientAfterConn",
            StreamState::ResetByServerAfterConn => "ResetByServerAfterConn",
        };
        write!(f, "{}", name)
    }
}
