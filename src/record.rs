//! Session breakdown output model.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Summary of one application-protocol request/response exchange.
///
/// Serialized as one JSON object per line on stdout. Latencies are
/// milliseconds and never negative.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_state: String,
    pub request_version: String,
    pub request_method: String,
    pub request_uri: String,
    pub request_headers: HashMap<String, String>,
    pub request_header_size: u64,
    pub request_body_size: u64,
    pub response_version: String,
    pub response_headers: HashMap<String, String>,
    pub response_status_code: u16,
    pub response_header_size: u64,
    pub response_body_size: u64,
    pub server_latency: u64,
    pub download_latency: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_json_fields() {
        let record = SessionRecord {
            session_state: "HttpResponseBodyComplete".to_string(),
            request_method: "GET".to_string(),
            response_status_code: 200,
            ..Default::default()
        };

        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"session_state\":\"HttpResponseBodyComplete\""));
        assert!(json.contains("\"request_method\":\"GET\""));
        assert!(json.contains("\"response_status_code\":200"));
        assert!(json.contains("\"server_latency\":0"));
        assert!(json.contains("\"download_latency\":0"));
    }
}
