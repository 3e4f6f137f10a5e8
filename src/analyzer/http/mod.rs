//! HTTP/1.x protocol analyzer.
//!
//! Tracks a FIFO of in-flight sessions per flow: the tail is the request
//! currently being parsed, the head is the request currently being
//! answered, which is what keeps pipelined exchanges matched up. A session
//! is emitted as a [`SessionRecord`] when its response completes, when the
//! server closes mid-body (close-terminated bodies), or when a reset cuts
//! it short.

pub mod parser;

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use tracing::warn;

use self::parser::{HttpCallbacks, HttpParser, MessageInfo, Mode};
use super::Analyzer;
use crate::record::SessionRecord;

pub const PROTOCOL: &str = "HTTP";

/// Request methods recognized by protocol detection.
const METHODS: &[&str] = &[
    "DELETE", "GET", "HEAD", "PUT", "CONNECT", "OPTIONS", "TRACE", "COPY", "LOCK", "MKCOL",
    "MOVE", "PROPFIND", "PROPPATCH", "SEARCH", "UNLOCK", "REPORT", "MKACTIVITY", "CHECKOUT",
    "MERGE", "MSEARCH", "NOTIFY", "SUBSCRIBE", "UNSUBSCRIBE", "PATCH", "PURGE",
];

/// Does this first payload window look like HTTP/1.x?
///
/// Client side: a known method, a space, and a request line ending in
/// `HTTP/1.0` or `HTTP/1.1`. Server side: the payload starts with the
/// version token.
pub fn detect(payload: &[u8], from_client: bool) -> bool {
    if !from_client {
        return payload.starts_with(b"HTTP/1.0") || payload.starts_with(b"HTTP/1.1");
    }

    let matched = METHODS.iter().any(|method| {
        payload.len() > method.len()
            && payload.starts_with(method.as_bytes())
            && payload[method.len()] == b' '
    });
    if !matched {
        return false;
    }

    // The request line itself must carry the version, right before the
    // first CRLF.
    let Some(eol) = payload.windows(2).position(|w| w == b"\r\n") else {
        return false;
    };
    if eol < 8 {
        return false;
    }
    let version = &payload[eol - 8..eol];
    version == b"HTTP/1.0" || version == b"HTTP/1.1"
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Init,
    RequestHeaderBegin,
    RequestHeaderComplete,
    RequestBodyBegin,
    RequestBodyComplete,
    ResponseHeaderBegin,
    ResponseHeaderComplete,
    ResponseBodyBegin,
    ResponseBodyComplete,
}

impl SessionState {
    fn as_str(self) -> &'static str {
        match self {
            SessionState::Init => "HttpSessionInit",
            SessionState::RequestHeaderBegin => "HttpRequestHeaderBegin",
            SessionState::RequestHeaderComplete => "HttpRequestHeaderComplete",
            SessionState::RequestBodyBegin => "HttpRequestBodyBegin",
            SessionState::RequestBodyComplete => "HttpRequestBodyComplete",
            SessionState::ResponseHeaderBegin => "HttpResponseHeaderBegin",
            SessionState::ResponseHeaderComplete => "HttpResponseHeaderComplete",
            SessionState::ResponseBodyBegin => "HttpResponseBodyBegin",
            SessionState::ResponseBodyComplete => "HttpResponseBodyComplete",
        }
    }
}

/// One in-flight request/response exchange.
#[derive(Debug)]
struct HttpSession {
    reset_flag: bool,
    state: SessionState,
    req_version: String,
    req_method: String,
    req_uri: String,
    req_headers: Vec<(String, String)>,
    req_header_size: u64,
    req_body_size: u64,
    resp_version: String,
    resp_headers: Vec<(String, String)>,
    status_code: u16,
    resp_header_size: u64,
    resp_body_size: u64,
    req_time: DateTime<Utc>,
    resp_begin_time: Option<DateTime<Utc>>,
    resp_complete_time: Option<DateTime<Utc>>,
}

impl HttpSession {
    fn new(req_time: DateTime<Utc>) -> Self {
        Self {
            reset_flag: false,
            state: SessionState::Init,
            req_version: String::new(),
            req_method: String::new(),
            req_uri: String::new(),
            req_headers: Vec::new(),
            req_header_size: 0,
            req_body_size: 0,
            resp_version: String::new(),
            resp_headers: Vec::new(),
            status_code: 0,
            resp_header_size: 0,
            resp_body_size: 0,
            req_time,
            resp_begin_time: None,
            resp_complete_time: None,
        }
    }

    fn into_record(self) -> SessionRecord {
        let session_state = if self.reset_flag {
            format!("Reset:{}", self.state.as_str())
        } else {
            self.state.as_str().to_string()
        };

        let server_latency = self
            .resp_begin_time
            .map(|begin| (begin - self.req_time).num_milliseconds().max(0) as u64)
            .unwrap_or(0);
        let download_latency = match (self.resp_begin_time, self.resp_complete_time) {
            (Some(begin), Some(end)) => (end - begin).num_milliseconds().max(0) as u64,
            _ => 0,
        };

        SessionRecord {
            session_state,
            request_version: self.req_version,
            request_method: self.req_method,
            request_uri: self.req_uri,
            request_headers: self.req_headers.into_iter().collect(),
            request_header_size: self.req_header_size,
            request_body_size: self.req_body_size,
            response_version: self.resp_version,
            response_headers: self.resp_headers.into_iter().collect(),
            response_status_code: self.status_code,
            response_header_size: self.resp_header_size,
            response_body_size: self.resp_body_size,
            server_latency,
            download_latency,
        }
    }
}

/// Parser sink for one `handle_data` delivery. Request callbacks work on
/// the FIFO tail, response callbacks on the head; a completed head rotates
/// out immediately so pipelined follow-ups attach to the right session.
struct SessionSink<'a> {
    sessions: &'a mut VecDeque<HttpSession>,
    completed: &'a mut Vec<SessionRecord>,
    timestamp: DateTime<Utc>,
    from_client: bool,
}

impl SessionSink<'_> {
    fn current(&mut self) -> Option<&mut HttpSession> {
        if self.from_client {
            self.sessions.back_mut()
        } else {
            self.sessions.front_mut()
        }
    }
}

impl HttpCallbacks for SessionSink<'_> {
    fn on_message_begin(&mut self) {
        if self.from_client {
            let mut session = HttpSession::new(self.timestamp);
            session.state = SessionState::RequestHeaderBegin;
            self.sessions.push_back(session);
        } else if let Some(head) = self.sessions.front_mut() {
            head.resp_begin_time = Some(self.timestamp);
        } else {
            warn!("http analyzer: response began with no request in flight");
        }
    }

    fn on_url(&mut self, method: &str, uri: &[u8]) {
        if let Some(session) = self.current() {
            session.req_method = method.to_string();
            session.req_uri = String::from_utf8_lossy(uri).into_owned();
        }
    }

    fn on_header_field(&mut self, name: &[u8]) {
        let from_client = self.from_client;
        if let Some(session) = self.current() {
            session.state = if from_client {
                SessionState::RequestHeaderBegin
            } else {
                SessionState::ResponseHeaderBegin
            };
            let name = String::from_utf8_lossy(name).into_owned();
            let headers = if from_client {
                &mut session.req_headers
            } else {
                &mut session.resp_headers
            };
            headers.push((name, String::new()));
        }
    }

    fn on_header_value(&mut self, value: &[u8]) {
        let from_client = self.from_client;
        if let Some(session) = self.current() {
            let headers = if from_client {
                &mut session.req_headers
            } else {
                &mut session.resp_headers
            };
            if let Some(last) = headers.last_mut() {
                if !last.1.is_empty() {
                    last.1.push(' ');
                }
                last.1.push_str(&String::from_utf8_lossy(value));
            }
        }
    }

    fn on_headers_complete(&mut self, info: &MessageInfo) {
        let from_client = self.from_client;
        if let Some(session) = self.current() {
            if from_client {
                session.req_version = info.version.clone();
                session.req_header_size = info.header_size;
                session.state = SessionState::RequestHeaderComplete;
            } else {
                session.resp_version = info.version.clone();
                session.status_code = info.status_code;
                session.resp_header_size = info.header_size;
                session.state = SessionState::ResponseHeaderComplete;
            }
        }
    }

    fn on_body(&mut self, chunk: &[u8]) {
        let from_client = self.from_client;
        if let Some(session) = self.current() {
            if from_client {
                session.req_body_size += chunk.len() as u64;
                session.state = SessionState::RequestBodyBegin;
            } else {
                session.resp_body_size += chunk.len() as u64;
                session.state = SessionState::ResponseBodyBegin;
            }
        }
    }

    fn on_message_complete(&mut self) {
        if self.from_client {
            if let Some(session) = self.sessions.back_mut() {
                session.state = SessionState::RequestBodyComplete;
            }
        } else if let Some(mut session) = self.sessions.pop_front() {
            session.state = SessionState::ResponseBodyComplete;
            session.resp_complete_time = Some(self.timestamp);
            self.completed.push(session.into_record());
        }
    }
}

/// Per-flow HTTP analyzer: one request parser, one response parser, and
/// the session FIFO they both feed.
pub struct HttpAnalyzer {
    request_parser: HttpParser,
    response_parser: HttpParser,
    sessions: VecDeque<HttpSession>,
}

impl HttpAnalyzer {
    pub fn new() -> Self {
        Self {
            request_parser: HttpParser::new(Mode::Request),
            response_parser: HttpParser::new(Mode::Response),
            sessions: VecDeque::new(),
        }
    }
}

impl Default for HttpAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl Analyzer for HttpAnalyzer {
    fn protocol(&self) -> &'static str {
        PROTOCOL
    }

    fn handle_established(&mut self, _timestamp: DateTime<Utc>) {}

    fn handle_data(
        &mut self,
        payload: &[u8],
        from_client: bool,
        timestamp: DateTime<Utc>,
    ) -> (usize, Vec<SessionRecord>) {
        let mut completed = Vec::new();
        let mut sink = SessionSink {
            sessions: &mut self.sessions,
            completed: &mut completed,
            timestamp,
            from_client,
        };
        let parser = if from_client {
            &mut self.request_parser
        } else {
            &mut self.response_parser
        };
        let consumed = parser.execute(&mut sink, payload);
        (consumed, completed)
    }

    fn handle_reset(&mut self, from_client: bool, timestamp: DateTime<Utc>) -> Option<SessionRecord> {
        let mut session = self.sessions.pop_front()?;
        if !from_client && session.state == SessionState::ResponseBodyBegin {
            // A reset from the server mid-body reads as the server closing
            // the connection to delimit the body; no reset flag.
            session.state = SessionState::ResponseBodyComplete;
            session.resp_complete_time = Some(timestamp);
        } else {
            session.reset_flag = true;
        }
        Some(session.into_record())
    }

    fn handle_fin(&mut self, from_client: bool, timestamp: DateTime<Utc>) -> Option<SessionRecord> {
        if from_client {
            return None;
        }
        // Server close delimits a response body that had no length.
        let head = self.sessions.front_mut()?;
        if head.state != SessionState::ResponseBodyBegin {
            return None;
        }
        let mut session = self.sessions.pop_front()?;
        session.state = SessionState::ResponseBodyComplete;
        session.resp_complete_time = Some(timestamp);
        Some(session.into_record())
    }
}
