//! Connection table and the per-packet reassembly state machine.

use std::collections::{HashMap, VecDeque};
use std::net::Ipv4Addr;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use super::key::Tuple4;
use super::seq::seq_diff;
use super::stream::Stream;
use super::{Direction, StreamState, TcpState};
use crate::core::packet::TcpSegment;
use crate::record::SessionRecord;

pub const DEFAULT_MAX_STREAMS: usize = 65_535;
pub const DEFAULT_CLOSING_TIMEOUT_SECS: i64 = 30;

/// Handle into the closing list. Entries are invalidated lazily: a stream
/// that died, or whose deadline was refreshed by a later FIN, no longer
/// matches and is skipped during the sweep.
#[derive(Debug, Clone)]
struct ClosingEntry {
    key: Tuple4,
    id: u64,
    deadline: DateTime<Utc>,
}

/// Per-shard TCP reassembler.
///
/// Owns every stream whose flow hash maps to this shard. Single-threaded:
/// the pipeline guarantees all packets of a flow arrive here in capture
/// order, so no locking is involved.
pub struct Assembler {
    streams: HashMap<Tuple4, Stream>,
    /// Streams in creation order; the front is the eviction victim when
    /// the table exceeds its cap. Entries are invalidated lazily by id.
    lru: VecDeque<(Tuple4, u64)>,
    /// Streams in `Closing`, ordered by deadline.
    closing: VecDeque<ClosingEntry>,
    records: Vec<SessionRecord>,
    count: u64,
    max_streams: usize,
    closing_timeout: Duration,
}

impl Assembler {
    pub fn new(max_streams: usize, closing_timeout: Duration) -> Self {
        Self {
            streams: HashMap::new(),
            lru: VecDeque::new(),
            closing: VecDeque::new(),
            records: Vec::new(),
            count: 0,
            max_streams,
            closing_timeout,
        }
    }

    /// Cumulative number of flows this shard has seen.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Currently tracked flows.
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Drain session records completed since the last call.
    pub fn take_records(&mut self) -> Vec<SessionRecord> {
        std::mem::take(&mut self.records)
    }

    /// Process one TCP segment for this shard.
    pub fn assemble(
        &mut self,
        src_ip: Ipv4Addr,
        dst_ip: Ipv4Addr,
        seg: &TcpSegment,
        timestamp: DateTime<Utc>,
    ) {
        self.check_closing(timestamp);

        let Some((key, direction)) = self.find(src_ip, seg.src_port, dst_ip, seg.dst_port) else {
            // Only the first packet of a handshake opens a flow.
            if seg.flags.syn && !seg.flags.ack && !seg.flags.rst {
                self.add_stream(src_ip, dst_ip, seg, timestamp);
            }
            return;
        };
        let from_client = direction == Direction::FromClient;

        if seg.flags.syn {
            self.handle_syn(&key, direction, seg, timestamp);
            return;
        }

        {
            let Some(stream) = self.streams.get_mut(&key) else { return };
            let snd = if from_client { &mut stream.client } else { &mut stream.server };
            snd.seq = seg.seq;
        }

        if seg.flags.rst {
            self.handle_reset(&key, direction, timestamp);
            return;
        }

        if seg.flags.ack {
            let mut abnormal = false;
            let mut closed = false;
            {
                let Some(stream) = self.streams.get_mut(&key) else { return };

                // Third packet of the handshake.
                if from_client
                    && stream.client.state == TcpState::SynSent
                    && stream.server.state == TcpState::SynReceived
                {
                    if seg.seq != stream.server.expected_rcv_seq {
                        debug!(
                            stream = %stream.addr,
                            seq = seg.seq,
                            expected = stream.server.expected_rcv_seq,
                            "unexpected sequence on third handshake packet"
                        );
                        abnormal = true;
                    } else {
                        stream.client.state = TcpState::Established;
                        stream.server.state = TcpState::Established;
                        stream.state = StreamState::Connected;
                        debug!(stream = %stream.addr, "connection established");
                        if let Some(analyzer) = stream.analyzer.as_mut() {
                            analyzer.handle_established(timestamp);
                        }
                    }
                }

                if !abnormal {
                    let (snd, rcv) = if from_client {
                        (&mut stream.client, &mut stream.server)
                    } else {
                        (&mut stream.server, &mut stream.client)
                    };
                    if seq_diff(snd.ack, seg.ack) < 0 {
                        snd.ack = seg.ack;
                    }
                    if rcv.state == TcpState::FinSent {
                        rcv.state = TcpState::FinConfirmed;
                    }
                    if snd.state == TcpState::FinConfirmed && rcv.state == TcpState::FinConfirmed {
                        closed = true;
                    }
                }
            }
            if abnormal {
                self.close_stream(&key, StreamState::ClosedAbnormally, timestamp);
                return;
            }
            if closed {
                if let Some(mut stream) = self.streams.remove(&key) {
                    stream.state = StreamState::Closed;
                    debug!(stream = %stream.addr, "connection closed");
                }
                return;
            }
        }

        if !seg.payload.is_empty() || seg.flags.fin {
            let mut fin = false;
            let mut stalled = false;
            {
                let Some(stream) = self.streams.get_mut(&key) else { return };
                if stream.state != StreamState::DataExchanging {
                    // Leaving `Closing` disarms any pending deadline.
                    stream.closing_deadline = None;
                    stream.state = StreamState::DataExchanging;
                }
                let result = stream.queue_segment(direction, seg, timestamp, &mut self.records);
                fin = result.fin;
                stalled = result.stalled;
            }
            if stalled {
                self.close_stream(&key, StreamState::ClosedAbnormally, timestamp);
                return;
            }
            if fin {
                self.arm_closing(&key, timestamp);
            }
        }
    }

    /// Expire streams that have been closing for longer than the timeout.
    /// Driven by packet timestamps, not wall clock.
    pub fn check_closing(&mut self, now: DateTime<Utc>) {
        while let Some(entry) = self.closing.front().cloned() {
            let live = self
                .streams
                .get(&entry.key)
                .is_some_and(|s| s.id == entry.id && s.closing_deadline == Some(entry.deadline));
            if !live {
                self.closing.pop_front();
                continue;
            }
            if now < entry.deadline {
                break;
            }
            self.closing.pop_front();
            self.close_stream(&entry.key, StreamState::ClosingTimeout, now);
        }
    }

    fn find(
        &self,
        src_ip: Ipv4Addr,
        src_port: u16,
        dst_ip: Ipv4Addr,
        dst_port: u16,
    ) -> Option<(Tuple4, Direction)> {
        let forward = Tuple4::new(src_ip, src_port, dst_ip, dst_port);
        if self.streams.contains_key(&forward) {
            return Some((forward, Direction::FromClient));
        }
        let reverse = forward.reversed();
        if self.streams.contains_key(&reverse) {
            return Some((reverse, Direction::FromServer));
        }
        None
    }

    fn add_stream(
        &mut self,
        src_ip: Ipv4Addr,
        dst_ip: Ipv4Addr,
        seg: &TcpSegment,
        timestamp: DateTime<Utc>,
    ) {
        let addr = Tuple4::new(src_ip, seg.src_port, dst_ip, seg.dst_port);
        self.count += 1;
        let id = self.count;
        debug!(stream = %addr, "new connection");

        self.streams.insert(addr, Stream::new(addr, id, seg));
        self.lru.push_back((addr, id));

        while self.streams.len() > self.max_streams {
            let Some((victim, victim_id)) = self.lru.pop_front() else { break };
            if self.streams.get(&victim).is_some_and(|s| s.id == victim_id) {
                self.close_stream(&victim, StreamState::ClosedExceedMaxCount, timestamp);
            }
        }
    }

    fn handle_syn(
        &mut self,
        key: &Tuple4,
        direction: Direction,
        seg: &TcpSegment,
        timestamp: DateTime<Utc>,
    ) {
        let Some(stream) = self.streams.get_mut(key) else { return };

        // Second packet of the handshake.
        if direction == Direction::FromServer
            && seg.flags.ack
            && stream.client.state == TcpState::SynSent
            && stream.server.state == TcpState::Closed
        {
            stream.server.state = TcpState::SynReceived;
            stream.server.seq = seg.seq;
            stream.server.ack = seg.ack;
            stream.client.expected_rcv_seq = seg.seq.wrapping_add(1);
            return;
        }

        if direction == Direction::FromClient && stream.client.state == TcpState::SynSent {
            debug!(stream = %stream.addr, "syn retransmit");
            return;
        }
        if direction == Direction::FromServer && stream.server.state == TcpState::SynReceived {
            debug!(stream = %stream.addr, "syn/ack retransmit");
            return;
        }

        // A SYN anywhere else is a protocol violation.
        self.close_stream(key, StreamState::ClosedAbnormally, timestamp);
    }

    fn handle_reset(&mut self, key: &Tuple4, direction: Direction, timestamp: DateTime<Utc>) {
        let Some(mut stream) = self.streams.remove(key) else { return };
        let from_client = direction == Direction::FromClient;

        stream.state = match (stream.state, direction) {
            (StreamState::Connecting, Direction::FromClient) => StreamState::ResetByClientBeforeConn,
            (StreamState::Connecting, Direction::FromServer) => StreamState::ResetByServerBeforeConn,
            (_, Direction::FromClient) => StreamState::ResetByClientAfterConn,
            (_, Direction::FromServer) => StreamState::ResetByServerAfterConn,
        };
        warn!(stream = %stream.addr, state = %stream.state, "connection reset");

        if let Some(analyzer) = stream.analyzer.as_mut() {
            if let Some(record) = analyzer.handle_reset(from_client, timestamp) {
                self.records.push(record);
            }
        }
    }

    /// Tear a stream down into a terminal state, flushing any in-flight
    /// session through a synthetic reset so it is not silently lost.
    fn close_stream(&mut self, key: &Tuple4, state: StreamState, timestamp: DateTime<Utc>) {
        let Some(mut stream) = self.streams.remove(key) else { return };
        stream.state = state;
        warn!(stream = %stream.addr, state = %state, "connection torn down");

        if let Some(analyzer) = stream.analyzer.as_mut() {
            if let Some(record) = analyzer.handle_reset(true, timestamp) {
                self.records.push(record);
            }
        }
    }

    fn arm_closing(&mut self, key: &Tuple4, timestamp: DateTime<Utc>) {
        let deadline = timestamp + self.closing_timeout;
        let Some(stream) = self.streams.get_mut(key) else { return };
        stream.closing_deadline = Some(deadline);
        self.closing.push_back(ClosingEntry {
            key: *key,
            id: stream.id,
            deadline,
        });
    }
}

impl Default for Assembler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_STREAMS, Duration::seconds(DEFAULT_CLOSING_TIMEOUT_SECS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::packet::TcpFlags;

    const CLIENT: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 2);
    const SERVER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const CLIENT_PORT: u16 = 54321;
    const SERVER_PORT: u16 = 80;

    fn ts(ms: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(ms).unwrap()
    }

    fn segment(
        src_port: u16,
        dst_port: u16,
        seq: u32,
        ack: u32,
        flags: TcpFlags,
        payload: &[u8],
    ) -> TcpSegment {
        TcpSegment {
            src_port,
            dst_port,
            seq,
            ack,
            flags,
            urgent_ptr: 0,
            payload: payload.to_vec(),
        }
    }

    fn from_client(a: &mut Assembler, seq: u32, ack: u32, flags: TcpFlags, payload: &[u8], at: i64) {
        let seg = segment(CLIENT_PORT, SERVER_PORT, seq, ack, flags, payload);
        a.assemble(CLIENT, SERVER, &seg, ts(at));
    }

    fn from_server(a: &mut Assembler, seq: u32, ack: u32, flags: TcpFlags, payload: &[u8], at: i64) {
        let seg = segment(SERVER_PORT, CLIENT_PORT, seq, ack, flags, payload);
        a.assemble(SERVER, CLIENT, &seg, ts(at));
    }

    const SYN: TcpFlags = TcpFlags {
        syn: true, ack: false, fin: false, rst: false, psh: false, urg: false, ece: false, cwr: false,
    };
    const SYN_ACK: TcpFlags = TcpFlags {
        syn: true, ack: true, fin: false, rst: false, psh: false, urg: false, ece: false, cwr: false,
    };
    const ACK: TcpFlags = TcpFlags {
        syn: false, ack: true, fin: false, rst: false, psh: false, urg: false, ece: false, cwr: false,
    };
    const FIN_ACK: TcpFlags = TcpFlags {
        syn: false, ack: true, fin: true, rst: false, psh: false, urg: false, ece: false, cwr: false,
    };
    const RST: TcpFlags = TcpFlags {
        syn: false, ack: false, fin: false, rst: true, psh: false, urg: false, ece: false, cwr: false,
    };

    fn handshake(a: &mut Assembler, at: i64) {
        from_client(a, 1000, 0, SYN, b"", at);
        from_server(a, 2000, 1001, SYN_ACK, b"", at + 1);
        from_client(a, 1001, 2001, ACK, b"", at + 2);
    }

    #[test]
    fn test_handshake_establishes() {
        let mut a = Assembler::default();
        handshake(&mut a, 0);

        let key = Tuple4::new(CLIENT, CLIENT_PORT, SERVER, SERVER_PORT);
        let stream = a.streams.get(&key).unwrap();
        assert_eq!(stream.state, StreamState::Connected);
        assert_eq!(stream.client.state, TcpState::Established);
        assert_eq!(stream.server.state, TcpState::Established);
        assert_eq!(a.count(), 1);
    }

    #[test]
    fn test_non_syn_does_not_open_flow() {
        let mut a = Assembler::default();
        from_client(&mut a, 1000, 0, ACK, b"data", 0);
        from_client(&mut a, 1000, 0, SYN_ACK, b"", 1);
        from_client(&mut a, 1000, 0, RST, b"", 2);
        assert!(a.is_empty());
        assert_eq!(a.count(), 0);
    }

    #[test]
    fn test_syn_retransmits_tolerated() {
        let mut a = Assembler::default();
        from_client(&mut a, 1000, 0, SYN, b"", 0);
        from_client(&mut a, 1000, 0, SYN, b"", 1);
        from_server(&mut a, 2000, 1001, SYN_ACK, b"", 2);
        from_server(&mut a, 2000, 1001, SYN_ACK, b"", 3);
        assert_eq!(a.len(), 1);
        assert_eq!(a.count(), 1);
    }

    #[test]
    fn test_bad_third_handshake_seq_kills_flow() {
        let mut a = Assembler::default();
        from_client(&mut a, 1000, 0, SYN, b"", 0);
        from_server(&mut a, 2000, 1001, SYN_ACK, b"", 1);
        from_client(&mut a, 1005, 2001, ACK, b"", 2); // expected 1001
        assert!(a.is_empty());
    }

    #[test]
    fn test_unexpected_syn_kills_flow() {
        let mut a = Assembler::default();
        handshake(&mut a, 0);
        from_client(&mut a, 3000, 0, SYN, b"", 5);
        assert!(a.is_empty());
    }

    #[test]
    fn test_reset_removes_flow() {
        let mut a = Assembler::default();
        handshake(&mut a, 0);
        from_server(&mut a, 2001, 1001, RST, b"", 5);
        assert!(a.is_empty());
    }

    #[test]
    fn test_eviction_drops_oldest_first() {
        let mut a = Assembler::new(2, Duration::seconds(30));
        for i in 0..4u16 {
            let seg = segment(10_000 + i, SERVER_PORT, 1000, 0, SYN, b"");
            a.assemble(CLIENT, SERVER, &seg, ts(i as i64));
        }
        assert_eq!(a.len(), 2);
        assert_eq!(a.count(), 4);
        // Oldest two are gone, newest two remain.
        assert!(a.streams.contains_key(&Tuple4::new(CLIENT, 10_002, SERVER, SERVER_PORT)));
        assert!(a.streams.contains_key(&Tuple4::new(CLIENT, 10_003, SERVER, SERVER_PORT)));
    }

    #[test]
    fn test_normal_close_via_fin_exchange() {
        let mut a = Assembler::default();
        handshake(&mut a, 0);

        from_client(&mut a, 1001, 2001, FIN_ACK, b"", 10);
        from_server(&mut a, 2001, 1002, ACK, b"", 11);
        from_server(&mut a, 2001, 1002, FIN_ACK, b"", 12);
        from_client(&mut a, 1002, 2002, ACK, b"", 13);

        assert!(a.is_empty());
    }

    #[test]
    fn test_closing_timeout_expires_flow() {
        let mut a = Assembler::default();
        handshake(&mut a, 0);
        from_client(&mut a, 1001, 2001, FIN_ACK, b"", 10);
        assert_eq!(a.len(), 1);

        // A packet on another flow 31s later drives the sweep.
        let other = segment(40_000, SERVER_PORT, 500, 0, SYN, b"");
        a.assemble(CLIENT, SERVER, &other, ts(10 + 31_000));

        let key = Tuple4::new(CLIENT, CLIENT_PORT, SERVER, SERVER_PORT);
        assert!(!a.streams.contains_key(&key));
    }

    #[test]
    fn test_fin_refresh_extends_deadline() {
        let mut a = Assembler::default();
        handshake(&mut a, 0);
        from_client(&mut a, 1001, 2001, FIN_ACK, b"", 10);
        // Server FIN 20s later refreshes the closing deadline.
        from_server(&mut a, 2001, 1002, FIN_ACK, b"", 20_000);

        // 31s after the first FIN but only 11s after the second: alive.
        a.check_closing(ts(31_010));
        let key = Tuple4::new(CLIENT, CLIENT_PORT, SERVER, SERVER_PORT);
        assert!(a.streams.contains_key(&key));

        // 31s after the second FIN: expired.
        a.check_closing(ts(51_000));
        assert!(!a.streams.contains_key(&key));
    }

    #[test]
    fn test_http_session_through_assembler() {
        let mut a = Assembler::default();
        handshake(&mut a, 0);

        let request = b"GET / HTTP/1.1\r\nHost: x\r\n\r\n";
        from_client(&mut a, 1001, 2001, ACK, request, 10);

        let response = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\n";
        from_server(&mut a, 2001, 1001 + request.len() as u32, ACK, response, 20);
        from_server(&mut a, 2001 + response.len() as u32, 1001 + request.len() as u32, ACK, b"ok", 22);

        let records = a.take_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].request_method, "GET");
        assert_eq!(records[0].response_status_code, 200);
        assert_eq!(records[0].response_body_size, 2);
        assert_eq!(records[0].server_latency, 10);
        assert_eq!(records[0].download_latency, 2);
    }

    #[test]
    fn test_eviction_flushes_in_flight_session() {
        let mut a = Assembler::new(1, Duration::seconds(30));
        handshake(&mut a, 0);
        from_client(&mut a, 1001, 2001, ACK, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n", 10);

        // A second flow evicts the first; its half-done session flushes.
        let seg = segment(40_000, SERVER_PORT, 500, 0, SYN, b"");
        a.assemble(CLIENT, SERVER, &seg, ts(20));

        let records = a.take_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].session_state, "Reset:HttpRequestBodyComplete");
        assert_eq!(a.len(), 1);
    }

    #[test]
    fn test_reset_mid_response_emits_reset_record() {
        let mut a = Assembler::default();
        handshake(&mut a, 0);
        from_client(&mut a, 1001, 2001, ACK, b"GET / HTTP/1.1\r\n\r\n", 10);
        from_server(&mut a, 2001, 1019, ACK, b"HTTP/1.1 200 OK\r\nContent-Length: 9\r\n\r\n", 20);
        from_server(&mut a, 2040, 1019, RST, b"", 25);

        let records = a.take_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].session_state, "Reset:HttpResponseHeaderComplete");
    }
}
