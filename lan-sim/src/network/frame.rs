//! Simulated Ethernet frames and everything they carry
//!
//! Frames are immutable once sent. Switches and modems forward clones of the same frame (keeping
//! its id), while routers build a new frame for every hop.

use crate::network::mac::MacAddress;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::net::Ipv4Addr;
use std::ops::BitOr;
use uuid::Uuid;

#[derive(Clone, Debug)]
pub struct Frame {
    pub id: Uuid,
    pub number: u64,
    pub source: MacAddress,
    pub destination: MacAddress,
    pub payload: FramePayload,
}

impl Frame {
    pub fn kind(&self) -> FrameKind {
        match &self.payload {
            FramePayload::Arp(arp) => match arp.operation {
                ArpOperation::Request => FrameKind::ArpRequest,
                ArpOperation::Reply => FrameKind::ArpReply,
            },
            FramePayload::Ipv4(datagram) => match &datagram.payload {
                IpPayload::Icmp(_) => FrameKind::Icmp,
                IpPayload::Tcp(_) => FrameKind::Tcp,
                IpPayload::Udp(_) => FrameKind::Udp,
            },
        }
    }

    /// The size of the frame on the wire, headers included
    pub fn size_bytes(&self) -> usize {
        const ETHERNET_HEADER: usize = 14;
        ETHERNET_HEADER
            + match &self.payload {
                FramePayload::Arp(_) => ArpPacket::SIZE,
                FramePayload::Ipv4(datagram) => datagram.size_bytes(),
            }
    }
}

#[derive(Clone, Debug)]
pub enum FramePayload {
    Arp(ArpPacket),
    Ipv4(Ipv4Datagram),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FrameKind {
    ArpRequest,
    ArpReply,
    Icmp,
    Tcp,
    Udp,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ArpOperation {
    Request,
    Reply,
}

#[derive(Clone, Debug)]
pub struct ArpPacket {
    pub operation: ArpOperation,
    pub sender_mac: MacAddress,
    pub sender_ip: Ipv4Addr,
    pub target_mac: MacAddress,
    pub target_ip: Ipv4Addr,
}

impl ArpPacket {
    pub const SIZE: usize = 28;
}

#[derive(Clone, Debug)]
pub struct Ipv4Datagram {
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    pub ttl: u8,
    pub identification: u16,
    pub payload: IpPayload,
}

impl Ipv4Datagram {
    pub const HEADER_SIZE: usize = 20;
    pub const DEFAULT_TTL: u8 = 64;

    pub fn protocol(&self) -> IpProtocol {
        match &self.payload {
            IpPayload::Icmp(_) => IpProtocol::Icmp,
            IpPayload::Tcp(_) => IpProtocol::Tcp,
            IpPayload::Udp(_) => IpProtocol::Udp,
        }
    }

    pub fn size_bytes(&self) -> usize {
        Self::HEADER_SIZE
            + match &self.payload {
                IpPayload::Icmp(icmp) => icmp.size_bytes(),
                IpPayload::Tcp(segment) => TcpSegment::HEADER_SIZE + segment.data.len(),
                IpPayload::Udp(datagram) => UdpDatagram::HEADER_SIZE + datagram.data.len(),
            }
    }

    /// Destination port of the transport payload, if any
    pub fn destination_port(&self) -> Option<u16> {
        match &self.payload {
            IpPayload::Icmp(_) => None,
            IpPayload::Tcp(segment) => Some(segment.destination_port),
            IpPayload::Udp(datagram) => Some(datagram.destination_port),
        }
    }

    pub(crate) fn is_icmp_error(&self) -> bool {
        matches!(&self.payload, IpPayload::Icmp(icmp) if icmp.is_error())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IpProtocol {
    Icmp,
    Tcp,
    Udp,
}

impl IpProtocol {
    pub fn number(&self) -> u8 {
        match self {
            IpProtocol::Icmp => 1,
            IpProtocol::Tcp => 6,
            IpProtocol::Udp => 17,
        }
    }
}

#[derive(Clone, Debug)]
pub enum IpPayload {
    Icmp(IcmpMessage),
    Tcp(TcpSegment),
    Udp(UdpDatagram),
}

#[derive(Clone, Debug)]
pub enum IcmpMessage {
    EchoRequest {
        identifier: u16,
        sequence: u16,
        data: Vec<u8>,
    },
    EchoReply {
        identifier: u16,
        sequence: u16,
        data: Vec<u8>,
    },
    DestinationUnreachable {
        code: UnreachableCode,
        original: Box<Ipv4Datagram>,
    },
    TimeExceeded {
        original: Box<Ipv4Datagram>,
    },
}

impl IcmpMessage {
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            IcmpMessage::DestinationUnreachable { .. } | IcmpMessage::TimeExceeded { .. }
        )
    }

    fn size_bytes(&self) -> usize {
        // Type, code, checksum and the 4 bytes of the rest of the header
        const HEADER: usize = 8;
        match self {
            IcmpMessage::EchoRequest { data, .. } | IcmpMessage::EchoReply { data, .. } => {
                HEADER + data.len()
            }
            // The original IP header plus the first 8 bytes of its payload
            IcmpMessage::DestinationUnreachable { .. } | IcmpMessage::TimeExceeded { .. } => {
                HEADER + Ipv4Datagram::HEADER_SIZE + 8
            }
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UnreachableCode {
    Network,
    Host,
}

impl UnreachableCode {
    pub fn code(&self) -> u8 {
        match self {
            UnreachableCode::Network => 0,
            UnreachableCode::Host => 1,
        }
    }
}

#[derive(Clone, Debug)]
pub struct TcpSegment {
    pub source_port: u16,
    pub destination_port: u16,
    pub sequence: u32,
    pub acknowledgment: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub data: Vec<u8>,
}

impl TcpSegment {
    pub const HEADER_SIZE: usize = 20;

    /// Sequence space consumed by the segment (SYN and FIN count as one byte each)
    pub fn sequence_len(&self) -> u32 {
        let mut len = self.data.len() as u32;
        if self.flags.contains(TcpFlags::SYN) {
            len += 1;
        }
        if self.flags.contains(TcpFlags::FIN) {
            len += 1;
        }
        len
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub struct TcpFlags(pub u8);

impl TcpFlags {
    pub const FIN: TcpFlags = TcpFlags(0x01);
    pub const SYN: TcpFlags = TcpFlags(0x02);
    pub const RST: TcpFlags = TcpFlags(0x04);
    pub const PSH: TcpFlags = TcpFlags(0x08);
    pub const ACK: TcpFlags = TcpFlags(0x10);

    pub fn contains(&self, other: TcpFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for TcpFlags {
    type Output = TcpFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        TcpFlags(self.0 | rhs.0)
    }
}

impl Display for TcpFlags {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let names = [
            (TcpFlags::SYN, "SYN"),
            (TcpFlags::FIN, "FIN"),
            (TcpFlags::RST, "RST"),
            (TcpFlags::PSH, "PSH"),
            (TcpFlags::ACK, "ACK"),
        ];

        let set: Vec<_> = names
            .into_iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| name)
            .collect();
        write!(f, "{}", set.join("|"))
    }
}

#[derive(Clone, Debug)]
pub struct UdpDatagram {
    pub source_port: u16,
    pub destination_port: u16,
    pub data: Vec<u8>,
}

impl UdpDatagram {
    pub const HEADER_SIZE: usize = 8;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_tcp_flags() {
        let flags = TcpFlags::SYN | TcpFlags::ACK;
        assert!(flags.contains(TcpFlags::SYN));
        assert!(flags.contains(TcpFlags::ACK));
        assert!(!flags.contains(TcpFlags::FIN));
        assert!(!TcpFlags::SYN.contains(flags));
        assert_eq!(flags.to_string(), "SYN|ACK");
    }

    #[test]
    fn test_sequence_len() {
        let mut segment = TcpSegment {
            source_port: 1,
            destination_port: 2,
            sequence: 0,
            acknowledgment: 0,
            flags: TcpFlags::SYN,
            window: 0,
            data: Vec::new(),
        };
        assert_eq!(segment.sequence_len(), 1);

        segment.flags = TcpFlags::FIN | TcpFlags::ACK;
        segment.data = vec![0; 10];
        assert_eq!(segment.sequence_len(), 11);
    }
}
