//! Fallback analyzer for flows with no recognized protocol.

use chrono::{DateTime, Utc};
use tracing::debug;

use super::Analyzer;
use crate::record::SessionRecord;

pub const PROTOCOL: &str = "DUMY";

/// Consumes every delivered byte and never emits a record, keeping
/// unrecognized flows flowing through the reassembler without buffering.
#[derive(Debug, Default)]
pub struct DummyAnalyzer;

impl Analyzer for DummyAnalyzer {
    fn protocol(&self) -> &'static str {
        PROTOCOL
    }

    fn handle_established(&mut self, _timestamp: DateTime<Utc>) {
        debug!("dummy analyzer: connection established");
    }

    fn handle_data(
        &mut self,
        payload: &[u8],
        from_client: bool,
        _timestamp: DateTime<Utc>,
    ) -> (usize, Vec<SessionRecord>) {
        debug!(from_client, len = payload.len(), "dummy analyzer: data");
        (payload.len(), Vec::new())
    }

    fn handle_reset(&mut self, from_client: bool, _timestamp: DateTime<Utc>) -> Option<SessionRecord> {
        debug!(from_client, "dummy analyzer: reset");
        None
    }

    fn handle_fin(&mut self, from_client: bool, _timestamp: DateTime<Utc>) -> Option<SessionRecord> {
        debug!(from_client, "dummy analyzer: fin");
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consumes_everything() {
        let mut analyzer = DummyAnalyzer;
        let t = DateTime::from_timestamp_millis(0).unwrap();
        let (consumed, records) = analyzer.handle_data(b"whatever bytes", true, t);
        assert_eq!(consumed, 14);
        assert!(records.is_empty());
        assert!(analyzer.handle_reset(false, t).is_none());
        assert!(analyzer.handle_fin(false, t).is_none());
    }
}
