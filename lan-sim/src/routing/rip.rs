//! Distance-vector route exchange between routers
//!
//! Every beacon interval a router broadcasts its routing table on each addressed interface as a
//! UDP datagram to port 520. The encoding follows the RIPv2 response layout: a 4-byte header
//! followed by up to 25 entries of 20 bytes.

use crate::network::ip::Ipv4Cidr;
use crate::stack::ProtocolStack;
use crate::stack::udp::{UdpPacket, UdpSocket};
use futures::{FutureExt, select_biased};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

pub const RIP_PORT: u16 = 520;
pub const RIP_INFINITY: u32 = 16;

const COMMAND_RESPONSE: u8 = 2;
const VERSION: u8 = 2;
const AFI_INET: u16 = 2;
const HEADER_SIZE: usize = 4;
const ENTRY_SIZE: usize = 20;
const MAX_ENTRIES_PER_MESSAGE: usize = 25;

#[derive(Clone, Debug)]
pub struct RipConfig {
    pub beacon_interval: Duration,
    /// Routes that are not refreshed within this time are removed
    pub route_timeout: Duration,
}

impl Default for RipConfig {
    fn default() -> Self {
        Self {
            beacon_interval: Duration::from_secs(30),
            route_timeout: Duration::from_secs(180),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RipEntry {
    pub target: Ipv4Cidr,
    pub metric: u32,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RipDecodeError {
    #[error("message too short ({0} bytes)")]
    TooShort(usize),
    #[error("unsupported command {0}")]
    UnsupportedCommand(u8),
    #[error("unsupported version {0}")]
    UnsupportedVersion(u8),
    #[error("trailing {0} bytes do not form an entry")]
    TruncatedEntry(usize),
    #[error("unsupported address family {0}")]
    UnsupportedAddressFamily(u16),
    #[error("invalid network mask {0}")]
    InvalidMask(Ipv4Addr),
}

/// Encodes the entries as one or more messages of at most 25 entries each
pub fn encode(entries: &[RipEntry]) -> Vec<Vec<u8>> {
    entries
        .chunks(MAX_ENTRIES_PER_MESSAGE)
        .map(|chunk| {
            let mut message = Vec::with_capacity(HEADER_SIZE + chunk.len() * ENTRY_SIZE);
            message.extend_from_slice(&[COMMAND_RESPONSE, VERSION, 0, 0]);
            for entry in chunk {
                message.extend_from_slice(&AFI_INET.to_be_bytes());
                // Route tag
                message.extend_from_slice(&[0, 0]);
                message.extend_from_slice(&entry.target.network().octets());
                message.extend_from_slice(&entry.target.mask().octets());
                // Next hop: the sender itself
                message.extend_from_slice(&Ipv4Addr::UNSPECIFIED.octets());
                message.extend_from_slice(&entry.metric.to_be_bytes());
            }
            message
        })
        .collect()
}

pub fn decode(message: &[u8]) -> Result<Vec<RipEntry>, RipDecodeError> {
    if message.len() < HEADER_SIZE {
        return Err(RipDecodeError::TooShort(message.len()));
    }
    if message[0] != COMMAND_RESPONSE {
        return Err(RipDecodeError::UnsupportedCommand(message[0]));
    }
    if message[1] != VERSION {
        return Err(RipDecodeError::UnsupportedVersion(message[1]));
    }

    let body = &message[HEADER_SIZE..];
    let trailing = body.len() % ENTRY_SIZE;
    if trailing != 0 {
        return Err(RipDecodeError::TruncatedEntry(trailing));
    }

    body.chunks_exact(ENTRY_SIZE)
        .map(|entry| {
            let afi = u16::from_be_bytes([entry[0], entry[1]]);
            if afi != AFI_INET {
                return Err(RipDecodeError::UnsupportedAddressFamily(afi));
            }

            let address = Ipv4Addr::new(entry[4], entry[5], entry[6], entry[7]);
            let mask = Ipv4Addr::new(entry[8], entry[9], entry[10], entry[11]);
            let target = Ipv4Cidr::from_mask(address, mask)
                .map_err(|_| RipDecodeError::InvalidMask(mask))?;
            let metric = u32::from_be_bytes([entry[16], entry[17], entry[18], entry[19]]);

            Ok(RipEntry { target, metric })
        })
        .collect()
}

/// Advertises the routing table periodically and merges the advertisements of neighbors
pub(crate) async fn run(stack: Arc<ProtocolStack>, mut socket: UdpSocket) {
    let token = stack.token().clone();
    let mut next_beacon = Instant::now();
    loop {
        let beacon = tokio::time::sleep_until(next_beacon);
        select_biased! {
            _ = token.cancelled().fuse() => break,
            packet = socket.recv().fuse() => match packet {
                Ok(packet) => handle_advertisement(&stack, packet),
                Err(_) => break,
            },
            _ = beacon.fuse() => {
                let config = &stack.config().rip;
                stack.routing_table().expire_rip(stack.context().scaled(config.route_timeout));
                advertise(&stack, &socket).await;
                next_beacon = Instant::now() + stack.context().scaled(config.beacon_interval);
            }
        }
    }
}

fn handle_advertisement(stack: &ProtocolStack, packet: UdpPacket) {
    let neighbor = *packet.source.ip();
    if stack.is_own_address(neighbor) {
        return;
    }

    let Some(interface) = packet
        .interface
        .and_then(|index| stack.nics().get(index))
        .and_then(|nic| nic.ip())
    else {
        return;
    };

    match decode(&packet.data) {
        Ok(entries) => stack.routing_table().merge_rip(&entries, neighbor, interface),
        Err(e) => stack
            .context()
            .tracer()
            .warn_invalid_rip_message(stack.node_id(), neighbor, e),
    }
}

async fn advertise(stack: &ProtocolStack, socket: &UdpSocket) {
    let routes = stack.routing_table().snapshot();
    for nic in stack.nics() {
        let Some(address) = nic.ip() else {
            continue;
        };
        if !nic.port().is_connected() {
            continue;
        }

        // Split horizon
        let entries: Vec<_> = routes
            .iter()
            .filter(|route| route.interface != address && route.metric < RIP_INFINITY)
            .map(|route| RipEntry {
                target: route.target,
                metric: route.metric,
            })
            .collect();

        for message in encode(&entries) {
            // A failing interface does not prevent advertising on the others
            socket
                .send_broadcast_on(nic.index(), RIP_PORT, message)
                .await
                .ok();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn entry(target: &str, metric: u32) -> RipEntry {
        RipEntry {
            target: target.parse().unwrap(),
            metric,
        }
    }

    #[test]
    fn test_encode_layout() {
        let messages = encode(&[entry("10.1.0.0/16", 3)]);
        assert_eq!(messages.len(), 1);
        assert_eq!(
            messages[0],
            vec![
                2, 2, 0, 0, // header
                0, 2, 0, 0, // afi + tag
                10, 1, 0, 0, // network
                255, 255, 0, 0, // mask
                0, 0, 0, 0, // next hop
                0, 0, 0, 3, // metric
            ]
        );

        assert_eq!(decode(&messages[0]).unwrap(), vec![entry("10.1.0.0/16", 3)]);
    }

    #[test]
    fn test_large_tables_are_split() {
        let entries: Vec<_> = (0..60)
            .map(|i| entry(&format!("10.{i}.0.0/16"), 1))
            .collect();

        let messages = encode(&entries);
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[2].len(), HEADER_SIZE + 10 * ENTRY_SIZE);

        let decoded: Vec<_> = messages
            .iter()
            .flat_map(|m| decode(m).unwrap())
            .collect();
        assert_eq!(decoded, entries);
    }

    #[test]
    fn test_decode_rejects_malformed_messages() {
        assert_eq!(decode(&[2, 2]), Err(RipDecodeError::TooShort(2)));
        assert_eq!(decode(&[1, 2, 0, 0]), Err(RipDecodeError::UnsupportedCommand(1)));
        assert_eq!(decode(&[2, 1, 0, 0]), Err(RipDecodeError::UnsupportedVersion(1)));
        assert_eq!(
            decode(&[2, 2, 0, 0, 0, 2]),
            Err(RipDecodeError::TruncatedEntry(2))
        );

        let mut message = encode(&[entry("10.0.0.0/8", 1)]).remove(0);
        message[12] = 0;
        message[13] = 255;
        assert_eq!(
            decode(&message),
            Err(RipDecodeError::InvalidMask(Ipv4Addr::new(0, 255, 0, 0)))
        );
    }
}
