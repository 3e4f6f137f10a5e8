//! Packet representations flowing between pipeline stages.

use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// IP protocol numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IpProtocol {
    Icmp,
    Tcp,
    Udp,
    Other(u8),
}

impl From<u8> for IpProtocol {
    fn from(val: u8) -> Self {
        match val {
            1 => IpProtocol::Icmp,
            6 => IpProtocol::Tcp,
            17 => IpProtocol::Udp,
            other => IpProtocol::Other(other),
        }
    }
}

impl std::fmt::Display for IpProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IpProtocol::Icmp => write!(f, "ICMP"),
            IpProtocol::Tcp => write!(f, "TCP"),
            IpProtocol::Udp => write!(f, "UDP"),
            IpProtocol::Other(n) => write!(f, "Proto({})", n),
        }
    }
}

/// TCP header flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
    pub urg: bool,
    pub ece: bool,
    pub cwr: bool,
}

impl TcpFlags {
    pub fn from_u8(flags: u8) -> Self {
        Self {
            fin: flags & 0x01 != 0,
            syn: flags & 0x02 != 0,
            rst: flags & 0x04 != 0,
            psh: flags & 0x08 != 0,
            ack: flags & 0x10 != 0,
            urg: flags & 0x20 != 0,
            ece: flags & 0x40 != 0,
            cwr: flags & 0x80 != 0,
        }
    }

    /// SYN without ACK: the first packet of a handshake.
    pub fn is_syn(&self) -> bool {
        self.syn && !self.ack
    }

    pub fn is_syn_ack(&self) -> bool {
        self.syn && self.ack
    }
}

impl std::fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = String::new();
        if self.syn { s.push('S'); }
        if self.ack { s.push('A'); }
        if self.fin { s.push('F'); }
        if self.rst { s.push('R'); }
        if self.psh { s.push('P'); }
        if self.urg { s.push('U'); }
        if s.is_empty() { s.push('.'); }
        write!(f, "{}", s)
    }
}

/// Decoded IPv4 header fields the pipeline cares about.
#[derive(Debug, Clone, Copy)]
pub struct Ipv4Info {
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub protocol: IpProtocol,
}

/// A captured IPv4 packet after link + IP decode (capture stage output).
#[derive(Debug, Clone)]
pub struct IpPacket {
    pub timestamp: DateTime<Utc>,
    pub header: Ipv4Info,
    /// IP payload bytes; the transport header is decoded downstream.
    pub payload: Vec<u8>,
}

/// A decoded TCP segment.
#[derive(Debug, Clone)]
pub struct TcpSegment {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub urgent_ptr: u16,
    pub payload: Vec<u8>,
}

/// A TCP segment plus its network envelope (demux stage output).
#[derive(Debug, Clone)]
pub struct TcpPacket {
    pub timestamp: DateTime<Utc>,
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub segment: TcpSegment,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_from_u8() {
        let flags = TcpFlags::from_u8(0x12); // SYN + ACK
        assert!(flags.syn);
        assert!(flags.ack);
        assert!(!flags.fin);
        assert!(flags.is_syn_ack());
        assert!(!flags.is_syn());
    }

    #[test]
    fn test_protocol_from_u8() {
        assert_eq!(IpProtocol::from(6), IpProtocol::Tcp);
        assert_eq!(IpProtocol::from(1), IpProtocol::Icmp);
        assert_eq!(IpProtocol::from(47), IpProtocol::Other(47));
    }

    #[test]
    fn test_flags_display() {
        let flags = TcpFlags { syn: true, ack: true, ..Default::default() };
        assert_eq!(flags.to_string(), "SA");
        assert_eq!(TcpFlags::default().to_string(), ".");
    }
}
