//! Per-connection stream state and the half-stream reorder buffer.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::key::Tuple4;
use super::seq::seq_diff;
use super::{Direction, StreamState, TcpState};
use crate::analyzer::{self, Analyzer};
use crate::core::packet::TcpSegment;
use crate::record::SessionRecord;

/// Initial capacity of a half-stream's contiguous receive buffer.
const RECV_BUFFER_CAPACITY: usize = 4096;

/// Consecutive zero-progress analyzer deliveries before the flow is torn
/// down as abnormal.
const MAX_ANALYZER_STALLS: u8 = 2;

/// A buffered out-of-order segment awaiting its predecessor.
#[derive(Debug, Clone)]
pub struct Page {
    pub seq: u32,
    pub ack: u32,
    pub urg: bool,
    pub fin: bool,
    pub urgent_ptr: u16,
    pub payload: Vec<u8>,
}

impl Page {
    fn from_segment(seg: &TcpSegment) -> Self {
        Self {
            seq: seg.seq,
            ack: seg.ack,
            urg: seg.flags.urg,
            fin: seg.flags.fin,
            urgent_ptr: seg.urgent_ptr,
            payload: seg.payload.clone(),
        }
    }

    /// One past the last sequence number this page occupies, counting the
    /// FIN ghost byte.
    fn end_seq(&self) -> u32 {
        let end = self.seq.wrapping_add(self.payload.len() as u32);
        if self.fin { end.wrapping_add(1) } else { end }
    }
}

/// One direction of a connection.
///
/// `expected_rcv_seq` and `recv_buffer` track the bytes this side receives
/// from its peer; `pending_pages` holds segments that arrived ahead of the
/// contiguous point, ordered by ascending wrap-aware sequence.
#[derive(Debug)]
pub struct HalfStream {
    pub state: TcpState,
    /// Last send sequence seen from this side.
    pub seq: u32,
    /// Highest ack observed from this side.
    pub ack: u32,
    /// Next in-order sequence to deliver to the analyzer.
    pub expected_rcv_seq: u32,
    /// Contiguous in-order bytes not yet consumed by the analyzer.
    pub recv_buffer: Vec<u8>,
    pub pending_pages: VecDeque<Page>,
}

impl HalfStream {
    fn new(state: TcpState) -> Self {
        Self {
            state,
            seq: 0,
            ack: 0,
            expected_rcv_seq: 0,
            recv_buffer: Vec::with_capacity(RECV_BUFFER_CAPACITY),
            pending_pages: VecDeque::new(),
        }
    }
}

/// What the assembler must act on after a segment was queued.
#[derive(Debug, Default)]
pub struct QueueResult {
    /// A FIN was observed (in order or lazily); the stream entered
    /// `Closing` and its deadline must be (re)armed.
    pub fin: bool,
    /// The analyzer made no progress twice in a row; tear the flow down.
    pub stalled: bool,
}

/// A full TCP connection, oriented by the first SYN.
pub struct Stream {
    pub addr: Tuple4,
    pub id: u64,
    pub state: StreamState,
    pub client: HalfStream,
    pub server: HalfStream,
    pub closing_deadline: Option<DateTime<Utc>>,
    /// Created lazily when the first payload identifies the protocol.
    pub analyzer: Option<Box<dyn Analyzer>>,
    stall_strikes: u8,
}

impl Stream {
    /// New stream created from the first SYN of a handshake.
    pub fn new(addr: Tuple4, id: u64, seg: &TcpSegment) -> Self {
        let mut client = HalfStream::new(TcpState::SynSent);
        client.seq = seg.seq;
        client.ack = seg.ack;

        let mut server = HalfStream::new(TcpState::Closed);
        server.expected_rcv_seq = seg.seq.wrapping_add(1);

        Self {
            addr,
            id,
            state: StreamState::Connecting,
            client,
            server,
            closing_deadline: None,
            analyzer: None,
            stall_strikes: 0,
        }
    }

    fn half_mut(&mut self, direction: Direction) -> &mut HalfStream {
        match direction {
            Direction::FromClient => &mut self.client,
            Direction::FromServer => &mut self.server,
        }
    }

    /// Receiving half for traffic flowing in `direction`.
    fn receiver_mut(&mut self, direction: Direction) -> &mut HalfStream {
        match direction {
            Direction::FromClient => &mut self.server,
            Direction::FromServer => &mut self.client,
        }
    }

    /// Queue one data-bearing (or FIN-bearing) segment per the reorder
    /// rules, draining any pending pages it unblocks and delivering the
    /// contiguous bytes to the analyzer.
    pub fn queue_segment(
        &mut self,
        direction: Direction,
        seg: &TcpSegment,
        timestamp: DateTime<Utc>,
        records: &mut Vec<SessionRecord>,
    ) -> QueueResult {
        let mut result = QueueResult::default();
        let addr = self.addr;
        let page = Page::from_segment(seg);

        let mut fin_delivered = false;
        let mut lazy_fin = false;
        let mut delivered = false;

        {
            let rcv = self.receiver_mut(direction);
            if seq_diff(page.seq, rcv.expected_rcv_seq) <= 0 {
                if seq_diff(page.end_seq(), rcv.expected_rcv_seq) <= 0 {
                    debug!(stream = %addr, seq = page.seq, "retransmitted segment");
                    return result;
                }

                fin_delivered |= apply_page(rcv, &page);
                while let Some(head) = rcv.pending_pages.front() {
                    if seq_diff(head.seq, rcv.expected_rcv_seq) > 0 {
                        break;
                    }
                    let Some(head) = rcv.pending_pages.pop_front() else { break };
                    if seq_diff(head.end_seq(), rcv.expected_rcv_seq) <= 0 {
                        continue;
                    }
                    fin_delivered |= apply_page(rcv, &head);
                }
                delivered = true;
            } else {
                let pos = rcv
                    .pending_pages
                    .iter()
                    .position(|p| seq_diff(p.seq, page.seq) > 0);
                match pos {
                    Some(i) => rcv.pending_pages.insert(i, page),
                    None => rcv.pending_pages.push_back(page),
                }
                if seg.flags.fin {
                    lazy_fin = true;
                }
            }
        }

        if delivered {
            result.stalled = self.deliver(direction, timestamp, records);
        }

        if fin_delivered {
            self.handle_fin(direction, timestamp, false, records);
            result.fin = true;
        } else if lazy_fin {
            self.handle_fin(direction, timestamp, true, records);
            result.fin = true;
        }

        result
    }

    /// Hand the contiguous receive buffer to the analyzer, preserving any
    /// unconsumed tail at the head of a fresh buffer.
    ///
    /// Returns true when the analyzer has stalled past its strike limit.
    fn deliver(
        &mut self,
        direction: Direction,
        timestamp: DateTime<Utc>,
        records: &mut Vec<SessionRecord>,
    ) -> bool {
        let from_client = direction == Direction::FromClient;

        let buf = std::mem::take(&mut self.receiver_mut(direction).recv_buffer);
        if buf.is_empty() {
            self.receiver_mut(direction).recv_buffer = buf;
            return false;
        }

        if self.analyzer.is_none() {
            let analyzer = analyzer::analyzer_for(&buf, from_client);
            debug!(stream = %self.addr, protocol = analyzer.protocol(), "protocol detected");
            self.analyzer = Some(analyzer);
        }

        let mut consumed = buf.len();
        if let Some(analyzer) = self.analyzer.as_mut() {
            let (parsed, mut completed) = analyzer.handle_data(&buf, from_client, timestamp);
            records.append(&mut completed);
            consumed = parsed.min(buf.len());
        }

        // The analyzer may retain nothing from the delivered window, so the
        // old buffer is never reused in place.
        let tail = &buf[consumed..];
        let mut fresh = Vec::with_capacity(RECV_BUFFER_CAPACITY.max(tail.len()));
        fresh.extend_from_slice(tail);
        self.receiver_mut(direction).recv_buffer = fresh;

        if consumed == 0 {
            self.stall_strikes += 1;
            if self.stall_strikes >= MAX_ANALYZER_STALLS {
                warn!(stream = %self.addr, "analyzer made no progress, giving up on flow");
                return true;
            }
        } else {
            self.stall_strikes = 0;
        }
        false
    }

    /// Record a FIN. A lazy FIN (seen out of order) only marks the
    /// connection closing; the sender is promoted to `FinSent` and the
    /// analyzer notified once the FIN byte is delivered in order.
    fn handle_fin(
        &mut self,
        direction: Direction,
        timestamp: DateTime<Utc>,
        lazy: bool,
        records: &mut Vec<SessionRecord>,
    ) {
        debug!(stream = %self.addr, %direction, lazy, "fin");

        if !lazy {
            self.half_mut(direction).state = TcpState::FinSent;
            let from_client = direction == Direction::FromClient;
            if let Some(analyzer) = self.analyzer.as_mut() {
                if let Some(record) = analyzer.handle_fin(from_client, timestamp) {
                    records.push(record);
                }
            }
        }
        self.state = StreamState::Closing;
    }
}

/// Copy the in-order portion of a page into the receive buffer and advance
/// `expected_rcv_seq`. An urgent byte inside the delivered window is elided.
/// Returns whether the page carried a FIN.
fn apply_page(rcv: &mut HalfStream, page: &Page) -> bool {
    let offset = seq_diff(rcv.expected_rcv_seq, page.seq).max(0) as usize;
    let payload = &page.payload;

    let mut plain = true;
    if page.urg && page.urgent_ptr >= 1 {
        let urgent_idx = usize::from(page.urgent_ptr - 1);
        if urgent_idx >= offset && urgent_idx < payload.len() {
            rcv.recv_buffer.extend_from_slice(&payload[offset..urgent_idx]);
            rcv.recv_buffer.extend_from_slice(&payload[urgent_idx + 1..]);
            plain = false;
        }
    }
    if plain {
        rcv.recv_buffer.extend_from_slice(&payload[offset.min(payload.len())..]);
    }

    rcv.expected_rcv_seq = page.end_seq();
    page.fin
}
