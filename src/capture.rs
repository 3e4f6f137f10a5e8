//! Live packet capture.
//!
//! Thin wrapper over libpcap: open a device, apply the BPF filter, and
//! hand raw frames with capture timestamps to the pipeline. The capture
//! driver is an external collaborator; everything above it consumes the
//! [`PacketCapture`] trait, which is what the tests mock.

use chrono::{DateTime, Utc};
use pcap::{Active, Capture, Device, Linktype};
use tracing::warn;

use crate::config::Config;
use crate::error::{FlowscopeError, Result};

/// A raw frame off the wire with its capture timestamp.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub timestamp: DateTime<Utc>,
    pub data: Vec<u8>,
}

/// Capture statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct CaptureStats {
    /// Frames received from the driver.
    pub received: u64,
    /// Frames dropped before decode (truncated captures).
    pub dropped: u64,
}

/// Source of captured frames.
pub trait PacketCapture: Send {
    /// Next frame, or `None` when the read timed out.
    fn next_packet(&mut self) -> Result<Option<CapturedFrame>>;

    fn stats(&self) -> CaptureStats;
}

/// libpcap-backed live capture on a named interface.
pub struct LiveCapture {
    handle: Capture<Active>,
    stats: CaptureStats,
}

impl LiveCapture {
    pub fn open(config: &Config) -> Result<Self> {
        let device = match &config.interface {
            Some(name) => Device::try_from(name.as_str())
                .map_err(|e| FlowscopeError::Capture(e.to_string()))?,
            None => Device::lookup()
                .map_err(|e| FlowscopeError::Capture(e.to_string()))?
                .ok_or_else(|| FlowscopeError::Config("no capture device available".to_string()))?,
        };

        let mut handle = Capture::from_device(device)
            .map_err(|e| FlowscopeError::Capture(e.to_string()))?
            .promisc(config.promiscuous)
            .snaplen(config.snaplen as i32)
            .buffer_size(config.buffer_size as i32)
            .timeout(config.timeout_ms as i32)
            .open()
            .map_err(|e| FlowscopeError::Capture(e.to_string()))?;

        handle
            .filter(&config.filter, true)
            .map_err(|e| FlowscopeError::Capture(format!("bad filter {:?}: {e}", config.filter)))?;

        let linktype = handle.get_datalink();
        if linktype != Linktype::ETHERNET {
            return Err(FlowscopeError::Config(format!(
                "unsupported datalink type {:?}",
                linktype
            )));
        }

        Ok(Self { handle, stats: CaptureStats::default() })
    }
}

impl PacketCapture for LiveCapture {
    fn next_packet(&mut self) -> Result<Option<CapturedFrame>> {
        match self.handle.next_packet() {
            Ok(packet) => {
                self.stats.received += 1;
                let header = packet.header;
                if header.caplen != header.len {
                    warn!(caplen = header.caplen, wirelen = header.len, "incomplete packet");
                    self.stats.dropped += 1;
                    return Ok(None);
                }
                let timestamp =
                    DateTime::from_timestamp(header.ts.tv_sec as i64, (header.ts.tv_usec as u32) * 1000)
                        .unwrap_or_default();
                Ok(Some(CapturedFrame { timestamp, data: packet.data.to_vec() }))
            }
            Err(pcap::Error::TimeoutExpired) => Ok(None),
            Err(e) => Err(FlowscopeError::Capture(e.to_string())),
        }
    }

    fn stats(&self) -> CaptureStats {
        self.stats
    }
}
