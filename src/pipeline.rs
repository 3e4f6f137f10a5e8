//! The capture-to-output pipeline.
//!
//! Five kinds of worker joined by bounded channels: capture, IP split,
//! TCP demux, N reassembly shards, and the record emitter. Backpressure is
//! blocking sends; a full downstream queue stalls the producer. Every
//! receiver polls the shutdown flag with a one second timeout and drains
//! its backlog best-effort before exiting.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration as PollDuration;

use anyhow::{Context, Result};
use chrono::Duration;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, info, warn};

use crate::assembly::{dispatch_hash, Assembler};
use crate::capture::{LiveCapture, PacketCapture};
use crate::config::Config;
use crate::core::packet::{IpPacket, IpProtocol, TcpPacket};
use crate::core::parser;
use crate::record::SessionRecord;

const POLL_TIMEOUT: PollDuration = PollDuration::from_secs(1);

/// Open the configured interface and run the pipeline until SIGINT or
/// SIGTERM.
pub fn run(config: Config) -> Result<()> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))
        .context("failed to install signal handler")?;

    let capture = LiveCapture::open(&config).context("failed to open capture")?;
    info!(
        interface = config.interface.as_deref().unwrap_or("(default)"),
        filter = %config.filter,
        shards = config.shard_count(),
        "starting capture"
    );
    run_with_capture(config, Box::new(capture), shutdown)
}

/// Run the pipeline over an already-open capture source. Returns once all
/// workers have drained and exited.
pub fn run_with_capture(
    config: Config,
    capture: Box<dyn PacketCapture>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    let capacity = config.channel_capacity;
    let shards = config.shard_count();
    let max_streams = config.max_streams;
    let closing_timeout = config.closing_duration();

    let (ip_tx, ip_rx) = bounded::<IpPacket>(capacity);
    let (tcp_tx, tcp_rx) = bounded::<IpPacket>(capacity);
    let (record_tx, record_rx) = bounded::<SessionRecord>(capacity);

    let mut shard_txs = Vec::with_capacity(shards);
    let mut shard_rxs = Vec::with_capacity(shards);
    for _ in 0..shards {
        let (tx, rx) = bounded::<TcpPacket>(capacity);
        shard_txs.push(tx);
        shard_rxs.push(rx);
    }

    let mut workers = Vec::new();

    {
        let shutdown = shutdown.clone();
        workers.push(
            thread::Builder::new()
                .name("capture".to_string())
                .spawn(move || capture_stage(capture, ip_tx, shutdown))?,
        );
    }
    {
        let shutdown = shutdown.clone();
        workers.push(
            thread::Builder::new()
                .name("ip".to_string())
                .spawn(move || ip_stage(ip_rx, tcp_tx, shutdown))?,
        );
    }
    {
        let shutdown = shutdown.clone();
        workers.push(
            thread::Builder::new()
                .name("tcp-demux".to_string())
                .spawn(move || demux_stage(tcp_rx, shard_txs, shutdown))?,
        );
    }
    for (index, rx) in shard_rxs.into_iter().enumerate() {
        let record_tx = record_tx.clone();
        let shutdown = shutdown.clone();
        workers.push(
            thread::Builder::new()
                .name(format!("reassembly-{index}"))
                .spawn(move || {
                    assembly_stage(index, rx, record_tx, max_streams, closing_timeout, shutdown)
                })?,
        );
    }
    drop(record_tx);
    {
        let shutdown = shutdown.clone();
        workers.push(
            thread::Builder::new()
                .name("emitter".to_string())
                .spawn(move || emit_stage(record_rx, shutdown))?,
        );
    }

    for worker in workers {
        if worker.join().is_err() {
            error!("pipeline worker panicked");
        }
    }
    Ok(())
}

/// Receive loop shared by the channel-fed stages: poll with a timeout so
/// the shutdown flag is observed, then drain the backlog best-effort.
fn run_stage<T>(rx: Receiver<T>, shutdown: &AtomicBool, mut handle: impl FnMut(T)) {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match rx.recv_timeout(POLL_TIMEOUT) {
            Ok(item) => handle(item),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
    while let Ok(item) = rx.try_recv() {
        handle(item);
    }
}

fn capture_stage(
    mut capture: Box<dyn PacketCapture>,
    ip_tx: Sender<IpPacket>,
    shutdown: Arc<AtomicBool>,
) {
    while !shutdown.load(Ordering::SeqCst) {
        match capture.next_packet() {
            Ok(Some(frame)) => match parser::decode_link_ip(&frame.data, frame.timestamp) {
                Ok(Some(pkt)) => {
                    if ip_tx.send(pkt).is_err() {
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("dropping undecodable frame: {e}"),
            },
            Ok(None) => {}
            Err(e) => {
                // Capture failure is fatal to the whole process.
                error!("capture failed: {e}");
                shutdown.store(true, Ordering::SeqCst);
                break;
            }
        }
    }
    let stats = capture.stats();
    info!(received = stats.received, dropped = stats.dropped, "capture finished");
}

fn ip_stage(ip_rx: Receiver<IpPacket>, tcp_tx: Sender<IpPacket>, shutdown: Arc<AtomicBool>) {
    run_stage(ip_rx, &shutdown, move |pkt| match pkt.header.protocol {
        IpProtocol::Tcp => {
            let _ = tcp_tx.send(pkt);
        }
        IpProtocol::Icmp => {
            debug!(src = %pkt.header.src_ip, dst = %pkt.header.dst_ip, "icmp packet");
        }
        other => debug!(protocol = %other, "unsupported transport"),
    });
}

fn demux_stage(
    tcp_rx: Receiver<IpPacket>,
    shard_txs: Vec<Sender<TcpPacket>>,
    shutdown: Arc<AtomicBool>,
) {
    let shards = shard_txs.len().max(1) as u32;
    run_stage(tcp_rx, &shutdown, move |pkt| {
        match parser::decode_tcp(&pkt.payload) {
            Ok(segment) => {
                let hash = dispatch_hash(
                    pkt.header.src_ip,
                    segment.src_port,
                    pkt.header.dst_ip,
                    segment.dst_port,
                );
                let _ = shard_txs[(hash % shards) as usize].send(TcpPacket {
                    timestamp: pkt.timestamp,
                    src_ip: pkt.header.src_ip,
                    dst_ip: pkt.header.dst_ip,
                    segment,
                });
            }
            Err(e) => warn!("dropping malformed tcp segment: {e}"),
        }
    });
}

fn assembly_stage(
    index: usize,
    rx: Receiver<TcpPacket>,
    record_tx: Sender<SessionRecord>,
    max_streams: usize,
    closing_timeout: Duration,
    shutdown: Arc<AtomicBool>,
) {
    let mut assembler = Assembler::new(max_streams, closing_timeout);
    run_stage(rx, &shutdown, |pkt: TcpPacket| {
        assembler.assemble(pkt.src_ip, pkt.dst_ip, &pkt.segment, pkt.timestamp);
        for record in assembler.take_records() {
            let _ = record_tx.send(record);
        }
    });
    info!(shard = index, flows = assembler.count(), "reassembly worker finished");
}

fn emit_stage(record_rx: Receiver<SessionRecord>, shutdown: Arc<AtomicBool>) {
    run_stage(record_rx, &shutdown, |record| {
        match serde_json::to_string(&record) {
            Ok(line) => println!("{line}"),
            Err(e) => warn!("failed to serialize session record: {e}"),
        }
    });
}
