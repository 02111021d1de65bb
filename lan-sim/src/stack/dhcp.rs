//! Dynamic address assignment
//!
//! A reduced DHCP: DISCOVER, OFFER, REQUEST and ACK (or NAK) exchanged as broadcasts between UDP
//! ports 68 and 67. Messages use a fixed 32-byte layout instead of BOOTP with options:
//!
//! ```text
//! 0       operation
//! 1       prefix length of the assigned address
//! 2..4    reserved
//! 4..8    transaction id
//! 8..14   client MAC
//! 14..16  reserved
//! 16..20  assigned address
//! 20..24  server address
//! 24..28  gateway (0.0.0.0 when absent)
//! 28..32  DNS server (0.0.0.0 when absent)
//! ```

use crate::network::ip::Ipv4Cidr;
use crate::network::mac::MacAddress;
use crate::network::nic::NicAddressing;
use crate::stack::ProtocolStack;
use crate::stack::udp::{UdpError, UdpSocket};
use anyhow::{Context, bail};
use futures::{FutureExt, select_biased};
use serde::{Deserialize, Serialize};
use serde_with::{DisplayFromStr, serde_as};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

pub const SERVER_PORT: u16 = 67;
pub const CLIENT_PORT: u16 = 68;

const MESSAGE_SIZE: usize = 32;

#[derive(Clone, Debug)]
pub struct DhcpConfig {
    /// How long a client waits for each answer of the server
    pub timeout: Duration,
    /// Number of DISCOVER attempts before giving up
    pub attempts: u32,
}

impl Default for DhcpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(2),
            attempts: 3,
        }
    }
}

#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DhcpReservation {
    #[serde_as(as = "DisplayFromStr")]
    pub mac: MacAddress,
    pub ip: Ipv4Addr,
}

/// Settings of a DHCP server running on one interface of a router or gateway
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DhcpServerConfig {
    /// Index of the served interface
    pub interface: usize,
    pub pool_start: Ipv4Addr,
    pub pool_end: Ipv4Addr,
    /// Gateway handed out with the lease
    #[serde(default)]
    pub gateway: Option<Ipv4Addr>,
    #[serde(default)]
    pub dns: Option<Ipv4Addr>,
    #[serde(default)]
    pub reservations: Vec<DhcpReservation>,
}

impl DhcpServerConfig {
    fn reservation_for(&self, mac: MacAddress) -> Option<Ipv4Addr> {
        self.reservations
            .iter()
            .find(|r| r.mac == mac)
            .map(|r| r.ip)
    }

    fn is_reserved_for_other(&self, ip: Ipv4Addr, mac: MacAddress) -> bool {
        self.reservations.iter().any(|r| r.ip == ip && r.mac != mac)
    }

    fn pool(&self) -> impl Iterator<Item = Ipv4Addr> {
        (u32::from(self.pool_start)..=u32::from(self.pool_end)).map(Ipv4Addr::from)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DhcpOperation {
    Discover = 1,
    Offer = 2,
    Request = 3,
    Ack = 4,
    Nak = 5,
}

impl TryFrom<u8> for DhcpOperation {
    type Error = DhcpDecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => DhcpOperation::Discover,
            2 => DhcpOperation::Offer,
            3 => DhcpOperation::Request,
            4 => DhcpOperation::Ack,
            5 => DhcpOperation::Nak,
            other => return Err(DhcpDecodeError::UnknownOperation(other)),
        })
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DhcpDecodeError {
    #[error("expected a 32-byte message, got {0} bytes")]
    InvalidLength(usize),
    #[error("unknown operation {0}")]
    UnknownOperation(u8),
    #[error("invalid prefix length {0}")]
    InvalidPrefixLength(u8),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DhcpMessage {
    pub operation: DhcpOperation,
    pub transaction_id: u32,
    pub client_mac: MacAddress,
    pub your_ip: Ipv4Addr,
    pub server_ip: Ipv4Addr,
    pub prefix_len: u8,
    pub gateway: Option<Ipv4Addr>,
    pub dns: Option<Ipv4Addr>,
}

impl DhcpMessage {
    fn new(operation: DhcpOperation, transaction_id: u32, client_mac: MacAddress) -> Self {
        Self {
            operation,
            transaction_id,
            client_mac,
            your_ip: Ipv4Addr::UNSPECIFIED,
            server_ip: Ipv4Addr::UNSPECIFIED,
            prefix_len: 0,
            gateway: None,
            dns: None,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let optional = |ip: Option<Ipv4Addr>| ip.unwrap_or(Ipv4Addr::UNSPECIFIED).octets();

        let mut buf = vec![0; MESSAGE_SIZE];
        buf[0] = self.operation as u8;
        buf[1] = self.prefix_len;
        buf[4..8].copy_from_slice(&self.transaction_id.to_be_bytes());
        buf[8..14].copy_from_slice(&self.client_mac.octets());
        buf[16..20].copy_from_slice(&self.your_ip.octets());
        buf[20..24].copy_from_slice(&self.server_ip.octets());
        buf[24..28].copy_from_slice(&optional(self.gateway));
        buf[28..32].copy_from_slice(&optional(self.dns));
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DhcpDecodeError> {
        if buf.len() != MESSAGE_SIZE {
            return Err(DhcpDecodeError::InvalidLength(buf.len()));
        }

        let ip = |offset: usize| {
            Ipv4Addr::new(buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3])
        };
        let optional = |offset: usize| Some(ip(offset)).filter(|ip| !ip.is_unspecified());

        let prefix_len = buf[1];
        if prefix_len > 32 {
            return Err(DhcpDecodeError::InvalidPrefixLength(prefix_len));
        }

        let mut mac = [0; 6];
        mac.copy_from_slice(&buf[8..14]);

        Ok(Self {
            operation: buf[0].try_into()?,
            transaction_id: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            client_mac: MacAddress(mac),
            your_ip: ip(16),
            server_ip: ip(20),
            prefix_len,
            gateway: optional(24),
            dns: optional(28),
        })
    }
}

/// Addressing obtained from a DHCP server
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DhcpLease {
    pub address: Ipv4Cidr,
    pub gateway: Option<Ipv4Addr>,
    pub dns: Option<Ipv4Addr>,
    pub server: Ipv4Addr,
}

impl DhcpLease {
    pub fn addressing(&self) -> NicAddressing {
        NicAddressing {
            ip: Some(self.address),
            gateway: self.gateway,
            dns: self.dns,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DhcpError {
    #[error("no DHCP server answered")]
    NoServer,
    #[error("the DHCP server rejected the request")]
    Rejected,
    #[error("the node stopped")]
    Stopped,
    #[error(transparent)]
    Udp(#[from] UdpError),
}

pub(crate) fn bind_server(
    stack: &Arc<ProtocolStack>,
    config: &DhcpServerConfig,
) -> anyhow::Result<UdpSocket> {
    if config.interface >= stack.nics().len() {
        bail!(
            "DHCP server of `{}` refers to missing interface {}",
            stack.node_id(),
            config.interface
        );
    }

    stack
        .udp_bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, SERVER_PORT))
        .with_context(|| format!("unable to start the DHCP server of `{}`", stack.node_id()))
}

/// Answers DHCP clients on the configured interface until the stack stops
pub(crate) async fn serve(stack: Arc<ProtocolStack>, config: DhcpServerConfig, mut socket: UdpSocket) {
    let token = stack.token().clone();
    let mut leases: HashMap<MacAddress, Ipv4Addr> = HashMap::new();

    while let Some(Ok(packet)) = token.run_until_cancelled(socket.recv()).await {
        if packet.interface != Some(config.interface) {
            continue;
        }

        let Ok(request) = DhcpMessage::decode(&packet.data) else {
            continue;
        };
        let Some(server) = stack.nics()[config.interface].cidr() else {
            continue;
        };

        let reply = match request.operation {
            DhcpOperation::Discover => {
                let Some(ip) = choose_address(&stack, &config, &leases, request.client_mac) else {
                    continue;
                };
                leases.insert(request.client_mac, ip);
                lease_reply(DhcpOperation::Offer, &request, ip, server, &config)
            }
            DhcpOperation::Request => {
                let offered = leases.get(&request.client_mac).copied();
                if request.server_ip != server.address() {
                    // Addressed to another server
                    continue;
                } else if offered == Some(request.your_ip) {
                    lease_reply(DhcpOperation::Ack, &request, request.your_ip, server, &config)
                } else {
                    let mut nak =
                        DhcpMessage::new(DhcpOperation::Nak, request.transaction_id, request.client_mac);
                    nak.server_ip = server.address();
                    nak
                }
            }
            _ => continue,
        };

        socket
            .send_broadcast_on(config.interface, CLIENT_PORT, reply.encode())
            .await
            .ok();
    }
}

fn lease_reply(
    operation: DhcpOperation,
    request: &DhcpMessage,
    ip: Ipv4Addr,
    server: Ipv4Cidr,
    config: &DhcpServerConfig,
) -> DhcpMessage {
    DhcpMessage {
        your_ip: ip,
        server_ip: server.address(),
        prefix_len: server.prefix_len(),
        gateway: config.gateway,
        dns: config.dns,
        ..DhcpMessage::new(operation, request.transaction_id, request.client_mac)
    }
}

/// Reservation first, then the address the client already holds, then the first free one
fn choose_address(
    stack: &ProtocolStack,
    config: &DhcpServerConfig,
    leases: &HashMap<MacAddress, Ipv4Addr>,
    mac: MacAddress,
) -> Option<Ipv4Addr> {
    if let Some(ip) = config.reservation_for(mac) {
        return Some(ip);
    }

    if let Some(&ip) = leases.get(&mac) {
        return Some(ip);
    }

    config.pool().find(|&ip| {
        !config.is_reserved_for_other(ip, mac)
            && !leases.values().any(|&leased| leased == ip)
            && !stack.is_own_address(ip)
    })
}

impl ProtocolStack {
    /// Runs the client side of the exchange on one interface
    pub(crate) async fn acquire_lease(self: &Arc<Self>, nic_index: usize) -> Result<DhcpLease, DhcpError> {
        let mut socket = self.udp_bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, CLIENT_PORT))?;
        let mac = self.nics[nic_index].mac();
        let timeout = self.context.scaled(self.config.dhcp.timeout);

        for _ in 0..self.config.dhcp.attempts {
            let transaction_id = self.context.random_u32();
            let discover = DhcpMessage::new(DhcpOperation::Discover, transaction_id, mac);
            socket
                .send_broadcast_on(nic_index, SERVER_PORT, discover.encode())
                .await?;

            let deadline = Instant::now() + timeout;
            let Some(offer) =
                wait_for_reply(&mut socket, self, nic_index, transaction_id, deadline).await?
            else {
                continue;
            };
            if offer.operation != DhcpOperation::Offer {
                continue;
            }

            let request = DhcpMessage {
                your_ip: offer.your_ip,
                server_ip: offer.server_ip,
                ..DhcpMessage::new(DhcpOperation::Request, transaction_id, mac)
            };
            socket
                .send_broadcast_on(nic_index, SERVER_PORT, request.encode())
                .await?;

            let deadline = Instant::now() + timeout;
            let Some(answer) =
                wait_for_reply(&mut socket, self, nic_index, transaction_id, deadline).await?
            else {
                continue;
            };

            match answer.operation {
                DhcpOperation::Ack => {
                    let Ok(address) = Ipv4Cidr::new(answer.your_ip, answer.prefix_len) else {
                        return Err(DhcpError::Rejected);
                    };
                    return Ok(DhcpLease {
                        address,
                        gateway: answer.gateway,
                        dns: answer.dns,
                        server: answer.server_ip,
                    });
                }
                DhcpOperation::Nak => return Err(DhcpError::Rejected),
                _ => continue,
            }
        }

        Err(DhcpError::NoServer)
    }
}

/// Waits for a server message of the given transaction, or `None` once the deadline passes
async fn wait_for_reply(
    socket: &mut UdpSocket,
    stack: &ProtocolStack,
    nic_index: usize,
    transaction_id: u32,
    deadline: Instant,
) -> Result<Option<DhcpMessage>, DhcpError> {
    let token = stack.token().clone();
    loop {
        let packet = select_biased! {
            _ = token.cancelled().fuse() => return Err(DhcpError::Stopped),
            packet = socket.recv().fuse() => packet?,
            _ = tokio::time::sleep_until(deadline).fuse() => return Ok(None),
        };

        if packet.interface != Some(nic_index) {
            continue;
        }

        match DhcpMessage::decode(&packet.data) {
            Ok(message)
                if message.transaction_id == transaction_id
                    && matches!(
                        message.operation,
                        DhcpOperation::Offer | DhcpOperation::Ack | DhcpOperation::Nak
                    ) =>
            {
                return Ok(Some(message));
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn server_config() -> DhcpServerConfig {
        DhcpServerConfig {
            interface: 0,
            pool_start: Ipv4Addr::new(192, 168, 1, 100),
            pool_end: Ipv4Addr::new(192, 168, 1, 102),
            gateway: Some(Ipv4Addr::new(192, 168, 1, 1)),
            dns: None,
            reservations: vec![DhcpReservation {
                mac: MacAddress([2, 0, 0, 0, 0, 9]),
                ip: Ipv4Addr::new(192, 168, 1, 100),
            }],
        }
    }

    #[test]
    fn test_message_layout() {
        let message = DhcpMessage {
            your_ip: Ipv4Addr::new(192, 168, 1, 100),
            server_ip: Ipv4Addr::new(192, 168, 1, 1),
            prefix_len: 24,
            gateway: Some(Ipv4Addr::new(192, 168, 1, 1)),
            ..DhcpMessage::new(DhcpOperation::Offer, 0xdeadbeef, MacAddress([2, 0, 0, 0, 0, 1]))
        };

        let encoded = message.encode();
        assert_eq!(encoded.len(), MESSAGE_SIZE);
        assert_eq!(encoded[0], 2);
        assert_eq!(encoded[1], 24);
        assert_eq!(&encoded[4..8], &[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(&encoded[28..32], &[0, 0, 0, 0]);
        assert_eq!(DhcpMessage::decode(&encoded), Ok(message));
    }

    #[test]
    fn test_decode_rejects_malformed_messages() {
        assert_eq!(
            DhcpMessage::decode(&[1; 10]),
            Err(DhcpDecodeError::InvalidLength(10))
        );

        let mut buf = vec![0; MESSAGE_SIZE];
        buf[0] = 9;
        assert_eq!(
            DhcpMessage::decode(&buf),
            Err(DhcpDecodeError::UnknownOperation(9))
        );

        buf[0] = 1;
        buf[1] = 33;
        assert_eq!(
            DhcpMessage::decode(&buf),
            Err(DhcpDecodeError::InvalidPrefixLength(33))
        );
    }

    #[test]
    fn test_pool_skips_addresses_reserved_for_others() {
        let config = server_config();
        let other = MacAddress([2, 0, 0, 0, 0, 1]);

        assert!(config.is_reserved_for_other(Ipv4Addr::new(192, 168, 1, 100), other));
        let free: Vec<_> = config
            .pool()
            .filter(|&ip| !config.is_reserved_for_other(ip, other))
            .collect();
        assert_eq!(
            free,
            vec![Ipv4Addr::new(192, 168, 1, 101), Ipv4Addr::new(192, 168, 1, 102)]
        );
    }

    #[test]
    fn test_server_config_serde() {
        let json = r#"{
            "interface": 1,
            "poolStart": "10.0.0.10",
            "poolEnd": "10.0.0.20",
            "reservations": [{ "mac": "02:00:00:00:00:09", "ip": "10.0.0.15" }]
        }"#;
        let config: DhcpServerConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.interface, 1);
        assert_eq!(config.gateway, None);
        assert_eq!(
            config.reservation_for(MacAddress([2, 0, 0, 0, 0, 9])),
            Some(Ipv4Addr::new(10, 0, 0, 15))
        );
    }
}
