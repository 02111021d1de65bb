use crate::network::frame::{IpPayload, Ipv4Datagram, UdpDatagram};
use crate::stack::ProtocolStack;
use crate::stack::ip::IpError;
use crate::tracing::simulation_step::DatagramDropReason;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

const EPHEMERAL_PORTS: std::ops::RangeInclusive<u16> = 49152..=65535;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UdpError {
    #[error("address {0} is already in use")]
    AddressInUse(SocketAddrV4),
    #[error("{0} is not an address of this node")]
    AddressNotAvailable(Ipv4Addr),
    #[error("the node has no interface with index {0}")]
    NoSuchInterface(usize),
    #[error("the node is not running")]
    Stopped,
    #[error("unable to send: {0}")]
    Send(#[from] IpError),
}

/// A datagram received on a [`UdpSocket`]
#[derive(Clone, Debug)]
pub struct UdpPacket {
    pub source: SocketAddrV4,
    pub destination: SocketAddrV4,
    /// The interface the datagram arrived on (`None` for loopback)
    pub interface: Option<usize>,
    pub data: Vec<u8>,
}

pub(crate) struct UdpBindings {
    sockets: Mutex<HashMap<SocketAddrV4, mpsc::UnboundedSender<UdpPacket>>>,
}

impl UdpBindings {
    pub(crate) fn new() -> Self {
        Self {
            sockets: Mutex::default(),
        }
    }

    pub(crate) fn clear(&self) {
        self.sockets.lock().clear();
    }

    fn bind(
        &self,
        mut local: SocketAddrV4,
    ) -> Result<(SocketAddrV4, mpsc::UnboundedReceiver<UdpPacket>), UdpError> {
        let mut sockets = self.sockets.lock();
        let port_in_use = |port: u16| sockets.keys().any(|bound| bound.port() == port);

        if local.port() == 0 {
            let port = EPHEMERAL_PORTS
                .into_iter()
                .find(|&port| !port_in_use(port))
                .ok_or(UdpError::AddressInUse(local))?;
            local.set_port(port);
        } else if sockets.contains_key(&local) {
            return Err(UdpError::AddressInUse(local));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        sockets.insert(local, tx);
        Ok((local, rx))
    }

    fn lookup(&self, destination: SocketAddrV4) -> Option<mpsc::UnboundedSender<UdpPacket>> {
        let sockets = self.sockets.lock();
        sockets
            .get(&destination)
            .or_else(|| {
                sockets.get(&SocketAddrV4::new(
                    Ipv4Addr::UNSPECIFIED,
                    destination.port(),
                ))
            })
            .cloned()
    }
}

/// A bound UDP port; dropping the socket unbinds it
pub struct UdpSocket {
    local: SocketAddrV4,
    stack: Arc<ProtocolStack>,
    incoming: mpsc::UnboundedReceiver<UdpPacket>,
}

impl UdpSocket {
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local
    }

    /// Sends a datagram, waiting for address resolution of the first hop
    pub async fn send_to(&self, destination: SocketAddrV4, data: Vec<u8>) -> Result<(), UdpError> {
        let source = if self.local.ip().is_unspecified() {
            self.stack.source_address_for(*destination.ip())?
        } else {
            *self.local.ip()
        };

        let datagram = self.datagram(source, destination, data);
        self.stack.send_datagram(datagram, None).await?;
        Ok(())
    }

    /// Broadcasts a datagram on a single interface, which does not need to have an address
    pub async fn send_broadcast_on(
        &self,
        nic_index: usize,
        port: u16,
        data: Vec<u8>,
    ) -> Result<(), UdpError> {
        let nic = self
            .stack
            .nics
            .get(nic_index)
            .ok_or(UdpError::NoSuchInterface(nic_index))?;
        let source = if self.local.ip().is_unspecified() {
            nic.ip().unwrap_or(Ipv4Addr::UNSPECIFIED)
        } else {
            *self.local.ip()
        };

        let destination = SocketAddrV4::new(Ipv4Addr::BROADCAST, port);
        let datagram = self.datagram(source, destination, data);
        self.stack.send_datagram(datagram, Some(nic_index)).await?;
        Ok(())
    }

    pub async fn recv(&mut self) -> Result<UdpPacket, UdpError> {
        self.incoming.recv().await.ok_or(UdpError::Stopped)
    }

    fn datagram(&self, source: Ipv4Addr, destination: SocketAddrV4, data: Vec<u8>) -> Ipv4Datagram {
        self.stack.datagram(
            source,
            *destination.ip(),
            Ipv4Datagram::DEFAULT_TTL,
            IpPayload::Udp(UdpDatagram {
                source_port: self.local.port(),
                destination_port: destination.port(),
                data,
            }),
        )
    }
}

impl Drop for UdpSocket {
    fn drop(&mut self) {
        self.stack.udp.sockets.lock().remove(&self.local);
    }
}

impl ProtocolStack {
    /// Binds a UDP socket; port 0 picks a free ephemeral port
    pub fn udp_bind(self: &Arc<Self>, local: SocketAddrV4) -> Result<UdpSocket, UdpError> {
        if !local.ip().is_unspecified() && !self.is_own_address(*local.ip()) {
            return Err(UdpError::AddressNotAvailable(*local.ip()));
        }

        let (local, incoming) = self.udp.bind(local)?;
        Ok(UdpSocket {
            local,
            stack: self.clone(),
            incoming,
        })
    }

    pub(crate) fn handle_udp(&self, datagram: &Ipv4Datagram, udp: &UdpDatagram, ingress: Option<usize>) {
        let destination = SocketAddrV4::new(datagram.destination, udp.destination_port);
        let delivered = self.udp.lookup(destination).is_some_and(|socket| {
            socket
                .send(UdpPacket {
                    source: SocketAddrV4::new(datagram.source, udp.source_port),
                    destination,
                    interface: ingress,
                    data: udp.data.clone(),
                })
                .is_ok()
        });

        if !delivered {
            // Silently discarded, as far as the sender is concerned
            self.context.tracer.track_datagram_dropped(
                &self.node_id,
                datagram,
                DatagramDropReason::PortUnreachable,
            );
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_bind_rejects_duplicates() {
        let bindings = UdpBindings::new();
        let local = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 520);

        let _bound = bindings.bind(local).unwrap();
        assert_eq!(bindings.bind(local).unwrap_err(), UdpError::AddressInUse(local));
    }

    #[test]
    fn test_port_zero_picks_a_free_ephemeral_port() {
        let bindings = UdpBindings::new();
        let any = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0);

        let (first, _first_rx) = bindings.bind(any).unwrap();
        let (second, _second_rx) = bindings.bind(any).unwrap();
        assert_eq!(first.port(), 49152);
        assert_eq!(second.port(), 49153);
    }

    #[test]
    fn test_lookup_prefers_exact_binding() {
        let bindings = UdpBindings::new();
        let ip = Ipv4Addr::new(10, 0, 0, 1);
        let (_, mut wildcard) = bindings
            .bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 7))
            .unwrap();
        let (_, mut exact) = bindings.bind(SocketAddrV4::new(ip, 7)).unwrap();

        let packet = UdpPacket {
            source: SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 1234),
            destination: SocketAddrV4::new(ip, 7),
            interface: Some(0),
            data: vec![1, 2, 3],
        };
        bindings
            .lookup(SocketAddrV4::new(ip, 7))
            .unwrap()
            .send(packet.clone())
            .unwrap();
        bindings
            .lookup(SocketAddrV4::new(Ipv4Addr::new(10, 0, 1, 1), 7))
            .unwrap()
            .send(packet)
            .unwrap();

        assert!(exact.try_recv().is_ok());
        assert!(exact.try_recv().is_err());
        assert!(wildcard.try_recv().is_ok());
    }
}
