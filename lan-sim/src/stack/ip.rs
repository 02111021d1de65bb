//! IPv4: local delivery, forwarding and next-hop selection

use crate::firewall::FirewallAction;
use crate::network::frame::{FramePayload, IcmpMessage, IpPayload, Ipv4Datagram, UnreachableCode};
use crate::network::mac::MacAddress;
use crate::routing::RouteNotFound;
use crate::stack::ProtocolStack;
use crate::stack::arp::ArpError;
use crate::tracing::simulation_step::DatagramDropReason;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IpError {
    #[error(transparent)]
    RouteNotFound(#[from] RouteNotFound),
    #[error("address resolution failed: {0}")]
    AddressResolution(#[from] ArpError),
    #[error("no interface has an address to send from")]
    NoAddress,
}

pub(crate) struct InboundDatagram {
    /// The interface the datagram arrived on (`None` for loopback)
    pub nic_index: Option<usize>,
    pub datagram: Ipv4Datagram,
}

enum NextHop {
    Local,
    Broadcast(Vec<usize>),
    Unicast { nic: usize, next_hop: Ipv4Addr },
}

pub(crate) async fn process_inbound(
    stack: Arc<ProtocolStack>,
    mut input: mpsc::UnboundedReceiver<InboundDatagram>,
) {
    let token = stack.token().clone();
    while let Some(Some(inbound)) = token.run_until_cancelled(input.recv()).await {
        stack.receive_datagram(inbound);
    }
}

impl ProtocolStack {
    pub(crate) fn next_identification(&self) -> u16 {
        self.next_identification.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn datagram(
        &self,
        source: Ipv4Addr,
        destination: Ipv4Addr,
        ttl: u8,
        payload: IpPayload,
    ) -> Ipv4Datagram {
        Ipv4Datagram {
            source,
            destination,
            ttl,
            identification: self.next_identification(),
            payload,
        }
    }

    fn is_local_destination(&self, destination: Ipv4Addr, ingress: Option<usize>) -> bool {
        if destination.is_broadcast() || destination.is_loopback() || self.is_own_address(destination)
        {
            return true;
        }

        // Directed broadcast of the subnet the datagram arrived on
        ingress
            .and_then(|index| self.nics[index].cidr())
            .is_some_and(|cidr| cidr.prefix_len() < 32 && cidr.broadcast() == destination)
    }

    fn next_hop(&self, destination: Ipv4Addr, via: Option<usize>) -> Result<NextHop, IpError> {
        if destination.is_loopback() || self.is_own_address(destination) {
            return Ok(NextHop::Local);
        }

        if destination.is_broadcast() {
            let nics = match via {
                Some(index) => vec![index],
                None => self
                    .nics
                    .iter()
                    .filter(|nic| nic.ip().is_some() && nic.port().is_connected())
                    .map(|nic| nic.index())
                    .collect(),
            };
            return Ok(NextHop::Broadcast(nics));
        }

        let directed_broadcast = self.nics.iter().find(|nic| {
            nic.cidr()
                .is_some_and(|cidr| cidr.prefix_len() < 32 && cidr.broadcast() == destination)
        });
        if let Some(nic) = directed_broadcast {
            return Ok(NextHop::Broadcast(vec![nic.index()]));
        }

        let route = self.routing.best_route(destination)?;
        let nic = self
            .nics
            .iter()
            .find(|nic| nic.ip() == Some(route.interface))
            .ok_or(RouteNotFound(destination))?;

        Ok(NextHop::Unicast {
            nic: nic.index(),
            next_hop: route.gateway.unwrap_or(destination),
        })
    }

    /// The address a locally originated datagram to `destination` should carry as its source
    pub(crate) fn source_address_for(&self, destination: Ipv4Addr) -> Result<Ipv4Addr, IpError> {
        match self.next_hop(destination, None)? {
            NextHop::Local => Ok(destination),
            NextHop::Broadcast(nics) => nics
                .into_iter()
                .find_map(|index| self.nics[index].ip())
                .ok_or(IpError::NoAddress),
            NextHop::Unicast { nic, .. } => self.nics[nic].ip().ok_or(IpError::NoAddress),
        }
    }

    /// Sends a datagram, waiting for address resolution if needed
    ///
    /// When `via` is given, limited broadcasts only go out on that interface (which does not
    /// need to have an address).
    pub(crate) async fn send_datagram(
        &self,
        datagram: Ipv4Datagram,
        via: Option<usize>,
    ) -> Result<(), IpError> {
        match self.next_hop(datagram.destination, via)? {
            NextHop::Local => self.loop_back(datagram),
            NextHop::Broadcast(nics) => self.broadcast(&nics, datagram),
            NextHop::Unicast { nic, next_hop } => {
                let mac = self.resolve(nic, next_hop).await?;
                self.transmit(nic, mac, datagram);
            }
        }

        Ok(())
    }

    /// Sends a datagram without waiting; failures are traced (and answered with ICMP errors when
    /// forwarding)
    pub(crate) fn route_datagram(self: &Arc<Self>, datagram: Ipv4Datagram, forwarded: bool) {
        let hop = match self.next_hop(datagram.destination, None) {
            Ok(hop) => hop,
            Err(e) => {
                self.send_failed(datagram, e, forwarded);
                return;
            }
        };

        match hop {
            NextHop::Local => self.loop_back(datagram),
            NextHop::Broadcast(nics) => self.broadcast(&nics, datagram),
            NextHop::Unicast { nic, next_hop } => match self.arp.cached(next_hop) {
                Some(mac) => self.transmit(nic, mac, datagram),
                None => {
                    let stack = self.clone();
                    self.spawn("ip send", async move {
                        match stack.resolve(nic, next_hop).await {
                            Ok(mac) => stack.transmit(nic, mac, datagram),
                            Err(e) => stack.send_failed(datagram, e.into(), forwarded),
                        }
                    });
                }
            },
        }
    }

    fn loop_back(&self, datagram: Ipv4Datagram) {
        self.ip_input
            .send(InboundDatagram {
                nic_index: None,
                datagram,
            })
            .ok();
    }

    fn broadcast(&self, nics: &[usize], datagram: Ipv4Datagram) {
        for &index in nics {
            self.send_frame(
                &self.nics[index],
                MacAddress::BROADCAST,
                FramePayload::Ipv4(datagram.clone()),
            );
        }
    }

    fn transmit(&self, nic: usize, mac: MacAddress, datagram: Ipv4Datagram) {
        self.send_frame(&self.nics[nic], mac, FramePayload::Ipv4(datagram));
    }

    fn send_failed(self: &Arc<Self>, datagram: Ipv4Datagram, error: IpError, forwarded: bool) {
        let (reason, code) = match error {
            IpError::AddressResolution(ArpError::Cancelled) => return,
            IpError::AddressResolution(_) => {
                (DatagramDropReason::AddressResolution, UnreachableCode::Host)
            }
            IpError::RouteNotFound(_) | IpError::NoAddress => {
                (DatagramDropReason::RouteNotFound, UnreachableCode::Network)
            }
        };

        self.context
            .tracer
            .track_datagram_dropped(&self.node_id, &datagram, reason);

        if forwarded {
            let message = IcmpMessage::DestinationUnreachable {
                code,
                original: Box::new(datagram.clone()),
            };
            self.send_icmp_error(&datagram, message);
        }
    }

    fn receive_datagram(self: &Arc<Self>, inbound: InboundDatagram) {
        let datagram = inbound.datagram;
        if !self.is_local_destination(datagram.destination, inbound.nic_index) {
            if self.forwarding {
                self.forward(datagram);
            } else {
                self.context.tracer.track_datagram_dropped(
                    &self.node_id,
                    &datagram,
                    DatagramDropReason::NotForwarding,
                );
            }
            return;
        }

        self.context
            .tracer
            .track_datagram_delivered(&self.node_id, &datagram);
        match &datagram.payload {
            IpPayload::Icmp(message) => self.handle_icmp(&datagram, message, inbound.nic_index),
            IpPayload::Tcp(segment) => self.handle_tcp(&datagram, segment),
            IpPayload::Udp(udp) => self.handle_udp(&datagram, udp, inbound.nic_index),
        }
    }

    fn forward(self: &Arc<Self>, mut datagram: Ipv4Datagram) {
        // A datagram is never forwarded with a TTL of zero
        if datagram.ttl <= 1 {
            self.context.tracer.track_datagram_dropped(
                &self.node_id,
                &datagram,
                DatagramDropReason::TtlExceeded,
            );
            let message = IcmpMessage::TimeExceeded {
                original: Box::new(datagram.clone()),
            };
            self.send_icmp_error(&datagram, message);
            return;
        }

        datagram.ttl -= 1;

        if self.firewall.evaluate(&datagram) == FirewallAction::Drop {
            self.context.tracer.track_datagram_dropped(
                &self.node_id,
                &datagram,
                DatagramDropReason::Firewall,
            );
            return;
        }

        self.route_datagram(datagram, true);
    }
}
