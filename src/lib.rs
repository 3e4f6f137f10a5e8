//! Passive TCP traffic analyzer.
//!
//! flowscope captures live packets off a network interface, reconstructs
//! bidirectional TCP byte streams across loss, retransmission and
//! reordering, and feeds each stream into an application-protocol analyzer
//! that emits one JSON session record per completed request/response
//! exchange.
//!
//! # Architecture
//!
//! Five pipeline stages joined by bounded channels:
//!
//! 1. Capture - pulls packets, decodes link + IP
//! 2. IP - splits ICMP from TCP
//! 3. TCP demux - decodes the TCP header, routes by symmetric flow hash
//! 4. Reassembly + analysis - one [`assembly::Assembler`] per shard
//! 5. Emitter - serializes session records to stdout
//!
//! Each reassembly shard owns a disjoint partition of flows, so no locking
//! is needed on the stream table and per-flow packet order is preserved.

pub mod analyzer;
pub mod assembly;
pub mod capture;
pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod pipeline;
pub mod record;

pub use config::Config;
pub use error::{FlowscopeError, Result};
