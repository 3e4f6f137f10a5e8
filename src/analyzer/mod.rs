//! Protocol analyzer framework.
//!
//! The reassembler owns exactly one analyzer per stream, created lazily
//! when the first payload of the flow identifies its protocol. Analyzers
//! consume contiguous, direction-tagged byte windows and emit
//! [`SessionRecord`]s for completed exchanges.

pub mod dummy;
pub mod http;

use chrono::{DateTime, Utc};

use crate::record::SessionRecord;

/// Lifecycle contract between the reassembler and a protocol analyzer.
///
/// `handle_data` receives the contiguous in-order bytes for one direction
/// since the last delivery and returns how many it consumed; unconsumed
/// bytes are preserved by the caller and re-delivered later. Analyzers must
/// be restartable across calls, buffering their own partial state, and must
/// not retain references into the delivered window.
pub trait Analyzer: Send {
    /// Short protocol tag, e.g. `"HTTP"`.
    fn protocol(&self) -> &'static str;

    /// Connection finished its three-way handshake.
    fn handle_established(&mut self, timestamp: DateTime<Utc>);

    /// Consume reassembled bytes. Returns the number of bytes consumed and
    /// any session records completed by this delivery, in order.
    fn handle_data(
        &mut self,
        payload: &[u8],
        from_client: bool,
        timestamp: DateTime<Utc>,
    ) -> (usize, Vec<SessionRecord>);

    /// Connection was reset; flush the in-flight session if any.
    fn handle_reset(&mut self, from_client: bool, timestamp: DateTime<Utc>) -> Option<SessionRecord>;

    /// An in-order FIN was delivered for one direction.
    fn handle_fin(&mut self, from_client: bool, timestamp: DateTime<Utc>) -> Option<SessionRecord>;
}

/// Identify the application protocol from the first payload of a flow.
pub fn detect_protocol(payload: &[u8], from_client: bool) -> Option<&'static str> {
    if http::detect(payload, from_client) {
        return Some(http::PROTOCOL);
    }
    None
}

/// Build the analyzer for a flow from its first payload. Flows with no
/// recognizable protocol get the dummy analyzer, which swallows everything.
pub fn analyzer_for(payload: &[u8], from_client: bool) -> Box<dyn Analyzer> {
    match detect_protocol(payload, from_client) {
        Some(http::PROTOCOL) => Box::new(http::HttpAnalyzer::new()),
        _ => Box::new(dummy::DummyAnalyzer::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detects_http_request() {
        assert_eq!(
            detect_protocol(b"GET /index.html HTTP/1.1\r\nHost: x\r\n\r\n", true),
            Some("HTTP")
        );
    }

    #[test]
    fn test_detects_http_response() {
        assert_eq!(detect_protocol(b"HTTP/1.1 200 OK\r\n\r\n", false), Some("HTTP"));
    }

    #[test]
    fn test_unknown_payload_gets_dummy() {
        assert_eq!(detect_protocol(b"\x16\x03\x01\x02\x00", true), None);
        let analyzer = analyzer_for(b"\x16\x03\x01\x02\x00", true);
        assert_eq!(analyzer.protocol(), "DUMY");
    }
}
