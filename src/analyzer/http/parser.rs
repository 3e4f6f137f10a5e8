//! Streaming HTTP/1.x message parser.
//!
//! Two independent automatons (request side and response side) consume
//! bytes incrementally and report structure through [`HttpCallbacks`]. The
//! parser buffers partial lines internally, so a caller may feed it
//! arbitrary byte windows and it consumes everything it is given unless
//! the input violates the grammar; after an error it is stuck and consumes
//! nothing. Parser state lives here, message state lives in the sink passed
//! to every [`HttpParser::execute`] call.

use std::str;

/// Upper bound on a buffered line; longer input is a parse error rather
/// than unbounded memory.
const MAX_LINE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Request,
    Response,
}

/// Message metadata available once the header section is finished.
#[derive(Debug, Clone, Default)]
pub struct MessageInfo {
    /// Normalized version string, e.g. `"HTTP/1.1"`.
    pub version: String,
    /// Response status code; zero for requests.
    pub status_code: u16,
    /// Bytes from the first start-line byte through the blank line.
    pub header_size: u64,
}

/// Structure events reported by the parser.
///
/// `on_header_field`/`on_header_value` fire once per header line; a folded
/// continuation line fires `on_header_value` again for the same header.
pub trait HttpCallbacks {
    fn on_message_begin(&mut self);
    /// Request line parsed: uppercased method and raw URI.
    fn on_url(&mut self, method: &str, uri: &[u8]);
    fn on_header_field(&mut self, name: &[u8]);
    fn on_header_value(&mut self, value: &[u8]);
    fn on_headers_complete(&mut self, info: &MessageInfo);
    fn on_body(&mut self, chunk: &[u8]);
    fn on_message_complete(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Between messages; leading CR/LF are skipped.
    Idle,
    StartLine,
    Header,
    BodyIdentity { remaining: u64 },
    /// Response body terminated by connection close.
    BodyUntilClose,
    ChunkSize,
    ChunkData { remaining: u64 },
    /// CRLF line after a chunk's data.
    ChunkDataEnd,
    Trailer,
    Failed,
}

pub struct HttpParser {
    mode: Mode,
    phase: Phase,
    line: Vec<u8>,
    message_bytes: u64,
    info: MessageInfo,
    content_length: Option<u64>,
    chunked: bool,
}

impl HttpParser {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            phase: Phase::Idle,
            line: Vec::new(),
            message_bytes: 0,
            info: MessageInfo::default(),
            content_length: None,
            chunked: false,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.phase == Phase::Failed
    }

    /// Feed bytes through the automaton, reporting structure to `sink`.
    /// Returns the number of bytes consumed; anything less than the input
    /// length means the parser hit a grammar violation and is stuck.
    pub fn execute<C: HttpCallbacks>(&mut self, sink: &mut C, data: &[u8]) -> usize {
        let mut pos = 0;
        while pos < data.len() {
            match self.phase {
                Phase::Failed => break,
                Phase::BodyIdentity { remaining } => {
                    let take = remaining.min((data.len() - pos) as u64) as usize;
                    sink.on_body(&data[pos..pos + take]);
                    pos += take;
                    let left = remaining - take as u64;
                    if left == 0 {
                        self.finish_message(sink);
                    } else {
                        self.phase = Phase::BodyIdentity { remaining: left };
                    }
                }
                Phase::BodyUntilClose => {
                    sink.on_body(&data[pos..]);
                    pos = data.len();
                }
                Phase::ChunkData { remaining } => {
                    let take = remaining.min((data.len() - pos) as u64) as usize;
                    sink.on_body(&data[pos..pos + take]);
                    pos += take;
                    let left = remaining - take as u64;
                    self.phase = if left == 0 {
                        Phase::ChunkDataEnd
                    } else {
                        Phase::ChunkData { remaining: left }
                    };
                }
                _ => {
                    let byte = data[pos];
                    pos += 1;
                    self.step_line(sink, byte);
                }
            }
        }
        pos
    }

    fn step_line<C: HttpCallbacks>(&mut self, sink: &mut C, byte: u8) {
        if self.phase == Phase::Idle {
            if byte == b'\r' || byte == b'\n' {
                return;
            }
            self.begin_message(sink);
        }

        if matches!(self.phase, Phase::StartLine | Phase::Header) {
            self.message_bytes += 1;
        }

        if byte == b'\n' {
            // CR before LF is optional.
            let mut line = std::mem::take(&mut self.line);
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            self.process_line(sink, &line);
        } else {
            self.line.push(byte);
            if self.line.len() > MAX_LINE {
                self.fail();
            }
        }
    }

    fn process_line<C: HttpCallbacks>(&mut self, sink: &mut C, line: &[u8]) {
        match self.phase {
            Phase::StartLine => self.process_start_line(sink, line),
            Phase::Header => self.process_header_line(sink, line),
            Phase::ChunkSize => match parse_chunk_size(line) {
                Some(0) => self.phase = Phase::Trailer,
                Some(size) => self.phase = Phase::ChunkData { remaining: size },
                None => self.fail(),
            },
            Phase::ChunkDataEnd => {
                if line.is_empty() {
                    self.phase = Phase::ChunkSize;
                } else {
                    self.fail();
                }
            }
            Phase::Trailer => {
                // Trailer headers are consumed without callbacks.
                if line.is_empty() {
                    self.finish_message(sink);
                }
            }
            _ => {}
        }
    }

    fn process_start_line<C: HttpCallbacks>(&mut self, sink: &mut C, line: &[u8]) {
        let text = match str::from_utf8(line) {
            Ok(text) => text,
            Err(_) => return self.fail(),
        };
        let mut parts = text.split_whitespace();

        match self.mode {
            Mode::Request => {
                let (Some(method), Some(uri), Some(version)) =
                    (parts.next(), parts.next(), parts.next())
                else {
                    return self.fail();
                };
                let Some(version) = parse_version(version) else {
                    return self.fail();
                };
                self.info.version = version;
                sink.on_url(&method.to_ascii_uppercase(), uri.as_bytes());
            }
            Mode::Response => {
                let (Some(version), Some(code)) = (parts.next(), parts.next()) else {
                    return self.fail();
                };
                let Some(version) = parse_version(version) else {
                    return self.fail();
                };
                let Ok(code) = code.parse::<u16>() else {
                    return self.fail();
                };
                if !(100..=999).contains(&code) {
                    return self.fail();
                }
                self.info.version = version;
                self.info.status_code = code;
            }
        }
        self.phase = Phase::Header;
    }

    fn process_header_line<C: HttpCallbacks>(&mut self, sink: &mut C, line: &[u8]) {
        if line.is_empty() {
            return self.finish_headers(sink);
        }

        // Continuation line: the previous header's value folds on.
        if line[0] == b' ' || line[0] == b'\t' {
            let folded = line.trim_ascii();
            if !folded.is_empty() {
                sink.on_header_value(folded);
            }
            return;
        }

        let Some(colon) = line.iter().position(|&b| b == b':') else {
            return self.fail();
        };
        let name = line[..colon].trim_ascii();
        let value = line[colon + 1..].trim_ascii();
        sink.on_header_field(name);
        sink.on_header_value(value);

        if name.eq_ignore_ascii_case(b"content-length") {
            match str::from_utf8(value).ok().and_then(|v| v.parse::<u64>().ok()) {
                Some(n) => self.content_length = Some(n),
                None => self.fail(),
            }
        } else if name.eq_ignore_ascii_case(b"transfer-encoding")
            && contains_ignore_case(value, b"chunked")
        {
            self.chunked = true;
        }
    }

    fn finish_headers<C: HttpCallbacks>(&mut self, sink: &mut C) {
        self.info.header_size = self.message_bytes;
        sink.on_headers_complete(&self.info);

        match self.mode {
            Mode::Request => {
                if self.chunked {
                    self.phase = Phase::ChunkSize;
                } else {
                    match self.content_length {
                        Some(n) if n > 0 => self.phase = Phase::BodyIdentity { remaining: n },
                        _ => self.finish_message(sink),
                    }
                }
            }
            Mode::Response => {
                let code = self.info.status_code;
                if (100..200).contains(&code) || code == 204 || code == 304 {
                    self.finish_message(sink);
                } else if self.chunked {
                    self.phase = Phase::ChunkSize;
                } else {
                    match self.content_length {
                        Some(0) => self.finish_message(sink),
                        Some(n) => self.phase = Phase::BodyIdentity { remaining: n },
                        None => self.phase = Phase::BodyUntilClose,
                    }
                }
            }
        }
    }

    fn begin_message<C: HttpCallbacks>(&mut self, sink: &mut C) {
        self.phase = Phase::StartLine;
        self.message_bytes = 0;
        self.info = MessageInfo::default();
        self.content_length = None;
        self.chunked = false;
        sink.on_message_begin();
    }

    fn finish_message<C: HttpCallbacks>(&mut self, sink: &mut C) {
        sink.on_message_complete();
        self.phase = Phase::Idle;
    }

    fn fail(&mut self) {
        self.phase = Phase::Failed;
    }
}

fn parse_version(token: &str) -> Option<String> {
    let t = token.as_bytes();
    if t.len() == 8
        && t[..5].eq_ignore_ascii_case(b"HTTP/")
        && t[5].is_ascii_digit()
        && t[6] == b'.'
        && t[7].is_ascii_digit()
    {
        Some(format!("HTTP/{}.{}", t[5] as char, t[7] as char))
    } else {
        None
    }
}

fn parse_chunk_size(line: &[u8]) -> Option<u64> {
    let mut size: u64 = 0;
    let mut digits = 0usize;
    for &byte in line {
        let digit = match byte {
            b'0'..=b'9' => byte - b'0',
            b'a'..=b'f' => byte - b'a' + 10,
            b'A'..=b'F' => byte - b'A' + 10,
            b';' | b' ' | b'\t' => break, // chunk extensions are ignored
            _ => return None,
        };
        size = size.checked_mul(16)?.checked_add(u64::from(digit))?;
        digits += 1;
    }
    (digits > 0).then_some(size)
}

fn contains_ignore_case(haystack: &[u8], needle: &[u8]) -> bool {
    haystack
        .windows(needle.len())
        .any(|w| w.eq_ignore_ascii_case(needle))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecSink {
        begins: usize,
        completes: usize,
        method: String,
        uri: String,
        headers: Vec<(String, String)>,
        infos: Vec<MessageInfo>,
        body_bytes: usize,
    }

    impl HttpCallbacks for RecSink {
        fn on_message_begin(&mut self) {
            self.begins += 1;
        }
        fn on_url(&mut self, method: &str, uri: &[u8]) {
            self.method = method.to_string();
            self.uri = String::from_utf8_lossy(uri).into_owned();
        }
        fn on_header_field(&mut self, name: &[u8]) {
            self.headers
                .push((String::from_utf8_lossy(name).into_owned(), String::new()));
        }
        fn on_header_value(&mut self, value: &[u8]) {
            if let Some(last) = self.headers.last_mut() {
                if !last.1.is_empty() {
                    last.1.push(' ');
                }
                last.1.push_str(&String::from_utf8_lossy(value));
            }
        }
        fn on_headers_complete(&mut self, info: &MessageInfo) {
            self.infos.push(info.clone());
        }
        fn on_body(&mut self, chunk: &[u8]) {
            self.body_bytes += chunk.len();
        }
        fn on_message_complete(&mut self) {
            self.completes += 1;
        }
    }

    fn run(mode: Mode, input: &[u8]) -> (RecSink, usize) {
        let mut parser = HttpParser::new(mode);
        let mut sink = RecSink::default();
        let consumed = parser.execute(&mut sink, input);
        (sink, consumed)
    }

    #[test]
    fn test_simple_get() {
        let input = b"GET /index.html HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let (sink, consumed) = run(Mode::Request, input);

        assert_eq!(consumed, input.len());
        assert_eq!(sink.begins, 1);
        assert_eq!(sink.completes, 1);
        assert_eq!(sink.method, "GET");
        assert_eq!(sink.uri, "/index.html");
        assert_eq!(sink.headers, vec![("Host".to_string(), "example.com".to_string())]);
        assert_eq!(sink.infos[0].version, "HTTP/1.1");
        assert_eq!(sink.infos[0].header_size, input.len() as u64);
    }

    #[test]
    fn test_request_body_content_length() {
        let input = b"POST /api HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello";
        let (sink, consumed) = run(Mode::Request, input);

        assert_eq!(consumed, input.len());
        assert_eq!(sink.body_bytes, 5);
        assert_eq!(sink.completes, 1);
    }

    #[test]
    fn test_split_across_calls() {
        let mut parser = HttpParser::new(Mode::Request);
        let mut sink = RecSink::default();

        // Feed one byte at a time; the parser buffers partial lines itself.
        let input = b"PUT /x HTTP/1.0\r\nContent-Length: 3\r\n\r\nabc";
        for &byte in input.iter() {
            assert_eq!(parser.execute(&mut sink, &[byte]), 1);
        }
        assert_eq!(sink.completes, 1);
        assert_eq!(sink.method, "PUT");
        assert_eq!(sink.body_bytes, 3);
        assert_eq!(sink.infos[0].version, "HTTP/1.0");
    }

    #[test]
    fn test_response_status_line() {
        let input = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";
        let (sink, consumed) = run(Mode::Response, input);

        assert_eq!(consumed, input.len());
        assert_eq!(sink.infos[0].status_code, 200);
        assert_eq!(sink.infos[0].header_size, 38);
        assert_eq!(sink.body_bytes, 2);
        assert_eq!(sink.completes, 1);
    }

    #[test]
    fn test_response_no_body_status() {
        let input = b"HTTP/1.1 304 Not Modified\r\nETag: \"x\"\r\n\r\n";
        let (sink, consumed) = run(Mode::Response, input);

        assert_eq!(consumed, input.len());
        assert_eq!(sink.completes, 1);
        assert_eq!(sink.body_bytes, 0);
    }

    #[test]
    fn test_response_until_close() {
        let input = b"HTTP/1.0 200 OK\r\n\r\nstreaming body with no length";
        let (sink, consumed) = run(Mode::Response, input);

        assert_eq!(consumed, input.len());
        assert_eq!(sink.body_bytes, input.len() - 19);
        // Completion comes from connection teardown, not the parser.
        assert_eq!(sink.completes, 0);
    }

    #[test]
    fn test_chunked_body() {
        let input = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
                      5\r\nhello\r\n6;ext=1\r\n world\r\n0\r\n\r\n";
        let (sink, consumed) = run(Mode::Response, input);

        assert_eq!(consumed, input.len());
        assert_eq!(sink.body_bytes, 11);
        assert_eq!(sink.completes, 1);
    }

    #[test]
    fn test_header_folding() {
        let input = b"GET / HTTP/1.1\r\nX-Long: first\r\n  second part\r\n\r\n";
        let (sink, _) = run(Mode::Request, input);

        assert_eq!(sink.headers.len(), 1);
        assert_eq!(sink.headers[0].1, "first second part");
    }

    #[test]
    fn test_lf_only_line_endings() {
        let input = b"GET / HTTP/1.1\nHost: x\n\n";
        let (sink, consumed) = run(Mode::Request, input);

        assert_eq!(consumed, input.len());
        assert_eq!(sink.completes, 1);
        assert_eq!(sink.headers[0].0, "Host");
    }

    #[test]
    fn test_case_insensitive_tokens() {
        let input = b"get / http/1.1\r\ncontent-length: 2\r\n\r\nhi";
        let (sink, consumed) = run(Mode::Request, input);

        assert_eq!(consumed, input.len());
        assert_eq!(sink.method, "GET");
        assert_eq!(sink.infos[0].version, "HTTP/1.1");
        assert_eq!(sink.body_bytes, 2);
    }

    #[test]
    fn test_pipelined_requests() {
        let input = b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n";
        let (sink, consumed) = run(Mode::Request, input);

        assert_eq!(consumed, input.len());
        assert_eq!(sink.begins, 2);
        assert_eq!(sink.completes, 2);
        assert_eq!(sink.uri, "/b");
    }

    #[test]
    fn test_parse_error_sticks() {
        let mut parser = HttpParser::new(Mode::Request);
        let mut sink = RecSink::default();

        let consumed = parser.execute(&mut sink, b"NOT A REQUEST LINE\r\nmore\r\n");
        assert!(consumed < 26);
        assert!(parser.is_failed());
        assert_eq!(parser.execute(&mut sink, b"GET / HTTP/1.1\r\n\r\n"), 0);
    }

    #[test]
    fn test_chunk_size_parsing() {
        assert_eq!(parse_chunk_size(b"1a"), Some(26));
        assert_eq!(parse_chunk_size(b"FF"), Some(255));
        assert_eq!(parse_chunk_size(b"0"), Some(0));
        assert_eq!(parse_chunk_size(b"5;name=value"), Some(5));
        assert_eq!(parse_chunk_size(b""), None);
        assert_eq!(parse_chunk_size(b"xyz"), None);
    }
}
