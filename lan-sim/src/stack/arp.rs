//! Address resolution: IPv4 to MAC mapping over broadcast requests and unicast replies

use crate::network::frame::{ArpOperation, ArpPacket, FramePayload};
use crate::network::mac::MacAddress;
use crate::network::nic::NetworkInterface;
use crate::stack::ProtocolStack;
use event_listener::Event;
use futures::{FutureExt, select_biased};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

#[derive(Clone, Debug)]
pub struct ArpConfig {
    /// How long to wait for a reply before giving up (and the minimum time between two requests
    /// for the same address)
    pub timeout: Duration,
}

impl Default for ArpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(1),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ArpError {
    #[error("{0} did not answer the ARP request")]
    AddressResolutionTimeout(Ipv4Addr),
    #[error("address resolution was cancelled")]
    Cancelled,
    #[error("interface {0} has no IP address to resolve from")]
    NoAddress(usize),
}

struct PendingResolution {
    resolved: Arc<Event>,
    requested_at: Option<Instant>,
}

pub(crate) struct ArpTable {
    cache: RwLock<HashMap<Ipv4Addr, MacAddress>>,
    pending: Mutex<HashMap<Ipv4Addr, PendingResolution>>,
}

impl ArpTable {
    pub(crate) fn new() -> Self {
        Self {
            cache: RwLock::default(),
            pending: Mutex::default(),
        }
    }

    pub(crate) fn cached(&self, ip: Ipv4Addr) -> Option<MacAddress> {
        self.cache.read().get(&ip).copied()
    }

    fn learn(&self, ip: Ipv4Addr, mac: MacAddress) {
        self.cache.write().insert(ip, mac);

        // The cache must be updated before waking anyone up
        if let Some(pending) = self.pending.lock().remove(&ip) {
            pending.resolved.notify(usize::MAX);
        }
    }
}

impl ProtocolStack {
    /// A copy of the ARP cache, sorted by IP address
    pub fn arp_cache(&self) -> Vec<(Ipv4Addr, MacAddress)> {
        let mut entries: Vec<_> = self
            .arp
            .cache
            .read()
            .iter()
            .map(|(ip, mac)| (*ip, *mac))
            .collect();
        entries.sort();
        entries
    }

    /// Finds the MAC address of `ip`, which must be reachable through the given interface
    pub(crate) async fn resolve(&self, nic_index: usize, ip: Ipv4Addr) -> Result<MacAddress, ArpError> {
        if let Some(mac) = self.arp.cached(ip) {
            return Ok(mac);
        }

        let nic = &self.nics[nic_index];
        let Some(own_ip) = nic.ip() else {
            return Err(ArpError::NoAddress(nic_index));
        };

        let timeout = self.context.scaled(self.config.arp.timeout);
        let deadline = Instant::now() + timeout;
        loop {
            let (listener, send_request) = {
                let mut pending = self.arp.pending.lock();

                // Checked under the lock, so a reply cannot slip in between the check and the
                // listener registration
                if let Some(mac) = self.arp.cached(ip) {
                    return Ok(mac);
                }

                let now = Instant::now();
                let entry = pending.entry(ip).or_insert_with(|| PendingResolution {
                    resolved: Arc::new(Event::new()),
                    requested_at: None,
                });

                // Concurrent resolutions share the request that is already in flight
                let send_request = entry
                    .requested_at
                    .is_none_or(|requested_at| now >= requested_at + timeout);
                if send_request {
                    entry.requested_at = Some(now);
                }

                (entry.resolved.listen(), send_request)
            };

            if send_request {
                self.send_frame(
                    nic,
                    MacAddress::BROADCAST,
                    FramePayload::Arp(ArpPacket {
                        operation: ArpOperation::Request,
                        sender_mac: nic.mac(),
                        sender_ip: own_ip,
                        target_mac: MacAddress::ZERO,
                        target_ip: ip,
                    }),
                );
            }

            select_biased! {
                _ = self.token.cancelled().fuse() => return Err(ArpError::Cancelled),
                _ = listener.fuse() => {
                    // Resolved, look it up in the next iteration
                }
                _ = tokio::time::sleep_until(deadline).fuse() => {
                    return Err(ArpError::AddressResolutionTimeout(ip));
                }
            }
        }
    }

    pub(crate) fn handle_arp(&self, nic: &NetworkInterface, packet: ArpPacket) {
        let Some(own_ip) = nic.ip() else {
            return;
        };
        if packet.target_ip != own_ip {
            return;
        }

        self.arp.learn(packet.sender_ip, packet.sender_mac);

        if packet.operation == ArpOperation::Request {
            self.send_frame(
                nic,
                packet.sender_mac,
                FramePayload::Arp(ArpPacket {
                    operation: ArpOperation::Reply,
                    sender_mac: nic.mac(),
                    sender_ip: own_ip,
                    target_mac: packet.sender_mac,
                    target_ip: packet.sender_ip,
                }),
            );
        }
    }
}
