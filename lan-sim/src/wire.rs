//! Byte-level encoding of simulated frames, used for pcap captures

use crate::network::frame::{
    ArpOperation, ArpPacket, Frame, FramePayload, IcmpMessage, IpPayload, Ipv4Datagram,
    TcpSegment, UdpDatagram,
};
use pnet_packet::arp::{ArpHardwareTypes, ArpOperations, MutableArpPacket};
use pnet_packet::ethernet::{EtherTypes, MutableEthernetPacket};
use pnet_packet::icmp::{IcmpCode, IcmpType, IcmpTypes, MutableIcmpPacket};
use pnet_packet::ip::IpNextHeaderProtocol;
use pnet_packet::ipv4::MutableIpv4Packet;
use pnet_packet::tcp::MutableTcpPacket;
use pnet_packet::udp::MutableUdpPacket;
use pnet_packet::{icmp, ipv4, tcp, udp};
use std::net::Ipv4Addr;
use thiserror::Error;

const ETHERNET_HEADER_LEN: usize = 14;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// The simulation carries payloads of any size, but real headers have 16-bit length fields
    #[error("{what} of {len} bytes exceeds the 16-bit length field")]
    TooLarge { what: &'static str, len: usize },
    #[error("buffer too small for {0}")]
    BufferTooSmall(&'static str),
}

fn length_field(what: &'static str, len: usize) -> Result<u16, EncodeError> {
    u16::try_from(len).map_err(|_| EncodeError::TooLarge { what, len })
}

pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, EncodeError> {
    let (ethertype, payload) = match &frame.payload {
        FramePayload::Arp(arp) => (EtherTypes::Arp, encode_arp(arp)?),
        FramePayload::Ipv4(datagram) => (EtherTypes::Ipv4, encode_ipv4(datagram)?),
    };

    let mut buffer = vec![0; ETHERNET_HEADER_LEN + payload.len()];
    let mut writer =
        MutableEthernetPacket::new(&mut buffer).ok_or(EncodeError::BufferTooSmall("ethernet frame"))?;
    writer.set_destination(frame.destination.into());
    writer.set_source(frame.source.into());
    writer.set_ethertype(ethertype);
    writer.set_payload(&payload);
    drop(writer);

    Ok(buffer)
}

fn encode_arp(arp: &ArpPacket) -> Result<Vec<u8>, EncodeError> {
    let mut buffer = vec![0; ArpPacket::SIZE];
    let mut writer =
        MutableArpPacket::new(&mut buffer).ok_or(EncodeError::BufferTooSmall("arp packet"))?;
    writer.set_hardware_type(ArpHardwareTypes::Ethernet);
    writer.set_protocol_type(EtherTypes::Ipv4);
    writer.set_hw_addr_len(6);
    writer.set_proto_addr_len(4);
    writer.set_operation(match arp.operation {
        ArpOperation::Request => ArpOperations::Request,
        ArpOperation::Reply => ArpOperations::Reply,
    });
    writer.set_sender_hw_addr(arp.sender_mac.into());
    writer.set_sender_proto_addr(arp.sender_ip);
    writer.set_target_hw_addr(arp.target_mac.into());
    writer.set_target_proto_addr(arp.target_ip);
    drop(writer);

    Ok(buffer)
}

pub fn encode_ipv4(datagram: &Ipv4Datagram) -> Result<Vec<u8>, EncodeError> {
    let payload = match &datagram.payload {
        IpPayload::Icmp(message) => encode_icmp(message)?,
        IpPayload::Tcp(segment) => encode_tcp(segment, datagram.source, datagram.destination)?,
        IpPayload::Udp(udp) => encode_udp(udp, datagram.source, datagram.destination)?,
    };

    let total_length = Ipv4Datagram::HEADER_SIZE + payload.len();
    let ip_length = length_field("ipv4 datagram", total_length)?;
    let mut buffer = vec![0; total_length];
    let mut writer =
        MutableIpv4Packet::new(&mut buffer).ok_or(EncodeError::BufferTooSmall("ipv4 packet"))?;
    writer.set_version(4);
    writer.set_header_length(5); // We don't use options
    writer.set_dscp(0);
    writer.set_ecn(0);
    writer.set_identification(datagram.identification);
    writer.set_flags(0b010); // We never fragment
    writer.set_fragment_offset(0);
    writer.set_ttl(datagram.ttl);
    writer.set_next_level_protocol(IpNextHeaderProtocol::new(datagram.protocol().number()));
    writer.set_source(datagram.source);
    writer.set_destination(datagram.destination);
    writer.set_total_length(ip_length);
    writer.set_payload(&payload);
    let checksum = ipv4::checksum(&writer.to_immutable());
    writer.set_checksum(checksum);
    drop(writer);

    Ok(buffer)
}

fn encode_icmp(message: &IcmpMessage) -> Result<Vec<u8>, EncodeError> {
    // Everything after the type, code and checksum fields
    let (icmp_type, code, rest): (IcmpType, u8, Vec<u8>) = match message {
        IcmpMessage::EchoRequest {
            identifier,
            sequence,
            data,
        } => (IcmpTypes::EchoRequest, 0, echo_body(*identifier, *sequence, data)),
        IcmpMessage::EchoReply {
            identifier,
            sequence,
            data,
        } => (IcmpTypes::EchoReply, 0, echo_body(*identifier, *sequence, data)),
        IcmpMessage::DestinationUnreachable { code, original } => (
            IcmpTypes::DestinationUnreachable,
            code.code(),
            error_body(original)?,
        ),
        IcmpMessage::TimeExceeded { original } => {
            (IcmpTypes::TimeExceeded, 0, error_body(original)?)
        }
    };

    let mut buffer = vec![0; 4 + rest.len()];
    let mut writer =
        MutableIcmpPacket::new(&mut buffer).ok_or(EncodeError::BufferTooSmall("icmp message"))?;
    writer.set_icmp_type(icmp_type);
    writer.set_icmp_code(IcmpCode::new(code));
    writer.set_payload(&rest);
    let checksum = icmp::checksum(&writer.to_immutable());
    writer.set_checksum(checksum);
    drop(writer);

    Ok(buffer)
}

fn echo_body(identifier: u16, sequence: u16, data: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(4 + data.len());
    body.extend_from_slice(&identifier.to_be_bytes());
    body.extend_from_slice(&sequence.to_be_bytes());
    body.extend_from_slice(data);
    body
}

fn error_body(original: &Ipv4Datagram) -> Result<Vec<u8>, EncodeError> {
    // Four unused bytes, then the original header and the first 8 bytes of its payload
    let original = encode_ipv4(original)?;
    let quoted_len = original.len().min(Ipv4Datagram::HEADER_SIZE + 8);
    let mut body = vec![0; 4];
    body.extend_from_slice(&original[..quoted_len]);
    Ok(body)
}

fn encode_tcp(segment: &TcpSegment, source: Ipv4Addr, destination: Ipv4Addr) -> Result<Vec<u8>, EncodeError> {
    let mut buffer = vec![0; TcpSegment::HEADER_SIZE + segment.data.len()];
    let mut writer =
        MutableTcpPacket::new(&mut buffer).ok_or(EncodeError::BufferTooSmall("tcp segment"))?;
    writer.set_source(segment.source_port);
    writer.set_destination(segment.destination_port);
    writer.set_sequence(segment.sequence);
    writer.set_acknowledgement(segment.acknowledgment);
    writer.set_data_offset(5);
    writer.set_flags(segment.flags.0.into());
    writer.set_window(segment.window);
    writer.set_urgent_ptr(0);
    writer.set_payload(&segment.data);
    let checksum = tcp::ipv4_checksum(&writer.to_immutable(), &source, &destination);
    writer.set_checksum(checksum);
    drop(writer);

    Ok(buffer)
}

fn encode_udp(datagram: &UdpDatagram, source: Ipv4Addr, destination: Ipv4Addr) -> Result<Vec<u8>, EncodeError> {
    let length = UdpDatagram::HEADER_SIZE + datagram.data.len();
    let udp_length = length_field("udp datagram", length)?;
    let mut buffer = vec![0; length];
    let mut writer =
        MutableUdpPacket::new(&mut buffer).ok_or(EncodeError::BufferTooSmall("udp datagram"))?;
    writer.set_source(datagram.source_port);
    writer.set_destination(datagram.destination_port);
    writer.set_length(udp_length);
    writer.set_payload(&datagram.data);
    let checksum = udp::ipv4_checksum(&writer.to_immutable(), &source, &destination);
    writer.set_checksum(checksum);
    drop(writer);

    Ok(buffer)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::network::frame::{TcpFlags, UnreachableCode};
    use crate::network::mac::MacAddress;
    use pnet_packet::Packet;
    use pnet_packet::ethernet::EthernetPacket;
    use pnet_packet::ipv4::Ipv4Packet;
    use pnet_packet::tcp::TcpPacket;
    use uuid::Uuid;

    fn tcp_datagram() -> Ipv4Datagram {
        Ipv4Datagram {
            source: Ipv4Addr::new(10, 0, 1, 2),
            destination: Ipv4Addr::new(10, 0, 2, 2),
            ttl: 63,
            identification: 7,
            payload: IpPayload::Tcp(TcpSegment {
                source_port: 49152,
                destination_port: 80,
                sequence: 1000,
                acknowledgment: 2000,
                flags: TcpFlags::ACK | TcpFlags::PSH,
                window: 2144,
                data: b"hello".to_vec(),
            }),
        }
    }

    #[test]
    fn test_encoded_frame_matches_reported_size() {
        let frame = Frame {
            id: Uuid::nil(),
            number: 0,
            source: MacAddress([2, 0, 0, 0, 0, 1]),
            destination: MacAddress([2, 0, 0, 0, 0, 2]),
            payload: FramePayload::Ipv4(tcp_datagram()),
        };

        let bytes = encode_frame(&frame).unwrap();
        assert_eq!(bytes.len(), frame.size_bytes());

        let ethernet = EthernetPacket::new(&bytes).unwrap();
        assert_eq!(ethernet.get_ethertype(), EtherTypes::Ipv4);
        assert_eq!(
            ethernet.get_destination(),
            pnet_base::MacAddr::from(MacAddress([2, 0, 0, 0, 0, 2]))
        );

        let ip = Ipv4Packet::new(ethernet.payload()).unwrap();
        assert_eq!(ip.get_ttl(), 63);
        assert_eq!(ip.get_identification(), 7);
        assert_eq!(ip.get_source(), Ipv4Addr::new(10, 0, 1, 2));
        assert_eq!(ip.get_checksum(), ipv4::checksum(&ip));

        let tcp = TcpPacket::new(ip.payload()).unwrap();
        assert_eq!(tcp.get_destination(), 80);
        assert_eq!(tcp.get_sequence(), 1000);
        assert_eq!(tcp.payload(), b"hello");
    }

    #[test]
    fn test_icmp_error_quotes_original_header() {
        let datagram = Ipv4Datagram {
            source: Ipv4Addr::new(10, 0, 1, 1),
            destination: Ipv4Addr::new(10, 0, 1, 2),
            ttl: 64,
            identification: 8,
            payload: IpPayload::Icmp(IcmpMessage::DestinationUnreachable {
                code: UnreachableCode::Host,
                original: Box::new(tcp_datagram()),
            }),
        };

        let bytes = encode_ipv4(&datagram).unwrap();
        assert_eq!(bytes.len(), datagram.size_bytes());
    }

    #[test]
    fn test_oversized_datagrams_are_rejected() {
        let udp = |len: usize| Ipv4Datagram {
            source: Ipv4Addr::new(10, 0, 1, 2),
            destination: Ipv4Addr::new(10, 0, 2, 2),
            ttl: 64,
            identification: 1,
            payload: IpPayload::Udp(UdpDatagram {
                source_port: 5000,
                destination_port: 5001,
                data: vec![0; len],
            }),
        };

        // The largest payload that fits the IPv4 total length
        let largest = u16::MAX as usize - Ipv4Datagram::HEADER_SIZE - UdpDatagram::HEADER_SIZE;
        assert_eq!(encode_ipv4(&udp(largest)).unwrap().len(), u16::MAX as usize);

        assert_eq!(
            encode_ipv4(&udp(largest + 1)),
            Err(EncodeError::TooLarge {
                what: "ipv4 datagram",
                len: u16::MAX as usize + 1
            })
        );

        let oversized_udp = u16::MAX as usize;
        assert_eq!(
            encode_ipv4(&udp(oversized_udp)),
            Err(EncodeError::TooLarge {
                what: "udp datagram",
                len: oversized_udp + UdpDatagram::HEADER_SIZE
            })
        );
    }
}
