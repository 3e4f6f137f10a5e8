//! Staged packet decoding.
//!
//! Decoding is split the way the pipeline is: the capture stage decodes
//! link + IP with [`decode_link_ip`], the TCP demux stage decodes the
//! transport header with [`decode_tcp`]. Malformed input is a
//! [`FlowscopeError::Decode`]; the caller drops the packet and logs, a
//! decode failure never tears down a flow.

use chrono::{DateTime, Utc};
use etherparse::{NetSlice, SlicedPacket, TcpHeaderSlice};

use super::packet::{IpPacket, IpProtocol, Ipv4Info, TcpFlags, TcpSegment};
use crate::error::FlowscopeError;

/// Decode an ethernet frame down to the IP layer.
///
/// Returns `Ok(None)` for frames that are not IPv4 (ARP, IPv6, ...).
pub fn decode_link_ip(frame: &[u8], timestamp: DateTime<Utc>) -> Result<Option<IpPacket>, FlowscopeError> {
    let sliced = SlicedPacket::from_ethernet(frame)
        .map_err(|e| FlowscopeError::Decode(format!("ethernet frame: {e}")))?;

    let pkt = match &sliced.net {
        Some(NetSlice::Ipv4(ipv4)) => {
            let header = ipv4.header();
            Some(IpPacket {
                timestamp,
                header: Ipv4Info {
                    src_ip: header.source_addr(),
                    dst_ip: header.destination_addr(),
                    protocol: IpProtocol::from(header.protocol().0),
                },
                payload: ipv4.payload().payload.to_vec(),
            })
        }
        _ => None,
    };
    Ok(pkt)
}

/// Decode a TCP header and payload from an IP payload.
pub fn decode_tcp(ip_payload: &[u8]) -> Result<TcpSegment, FlowscopeError> {
    let header = TcpHeaderSlice::from_slice(ip_payload)
        .map_err(|e| FlowscopeError::Decode(format!("tcp header: {e}")))?;

    let data_offset = header.slice().len();
    Ok(TcpSegment {
        src_port: header.source_port(),
        dst_port: header.destination_port(),
        seq: header.sequence_number(),
        ack: header.acknowledgment_number(),
        flags: TcpFlags {
            fin: header.fin(),
            syn: header.syn(),
            rst: header.rst(),
            psh: header.psh(),
            ack: header.ack(),
            urg: header.urg(),
            ece: header.ece(),
            cwr: header.cwr(),
        },
        urgent_ptr: header.urgent_pointer(),
        payload: ip_payload[data_offset..].to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use etherparse::PacketBuilder;

    fn sample_frame(payload: &[u8]) -> Vec<u8> {
        let builder = PacketBuilder::ethernet2([1, 2, 3, 4, 5, 6], [7, 8, 9, 10, 11, 12])
            .ipv4([192, 168, 1, 1], [10, 0, 0, 1], 64)
            .tcp(54321, 80, 1000, 65535);
        let mut frame = Vec::with_capacity(builder.size(payload.len()));
        builder.write(&mut frame, payload).unwrap();
        frame
    }

    #[test]
    fn test_decode_link_ip() {
        let frame = sample_frame(b"hello");
        let pkt = decode_link_ip(&frame, Utc::now()).unwrap().unwrap();

        assert_eq!(pkt.header.src_ip.octets(), [192, 168, 1, 1]);
        assert_eq!(pkt.header.dst_ip.octets(), [10, 0, 0, 1]);
        assert_eq!(pkt.header.protocol, IpProtocol::Tcp);
    }

    #[test]
    fn test_decode_tcp() {
        let frame = sample_frame(b"hello");
        let pkt = decode_link_ip(&frame, Utc::now()).unwrap().unwrap();
        let segment = decode_tcp(&pkt.payload).unwrap();

        assert_eq!(segment.src_port, 54321);
        assert_eq!(segment.dst_port, 80);
        assert_eq!(segment.seq, 1000);
        assert_eq!(segment.payload, b"hello");
    }

    #[test]
    fn test_decode_truncated_tcp() {
        assert!(decode_tcp(&[0u8; 10]).is_err());
    }

    #[test]
    fn test_decode_garbage_frame() {
        assert!(matches!(decode_link_ip(&[0u8; 4], Utc::now()), Err(_) | Ok(None)));
    }
}
