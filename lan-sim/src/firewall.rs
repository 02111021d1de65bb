//! Packet filter applied by routers and gateways to forwarded datagrams

use crate::network::frame::{IpPayload, Ipv4Datagram, TcpFlags};
use crate::network::ip::Ipv4Cidr;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_with::{DisplayFromStr, serde_as};
use std::collections::HashMap;
use std::net::SocketAddrV4;
use thiserror::Error;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FirewallAction {
    Accept,
    Drop,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FirewallProtocol {
    #[default]
    Any,
    Tcp,
    Udp,
}

#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallRule {
    #[serde_as(as = "DisplayFromStr")]
    pub source: Ipv4Cidr,
    #[serde_as(as = "DisplayFromStr")]
    pub destination: Ipv4Cidr,
    #[serde(default)]
    pub protocol: FirewallProtocol,
    /// Destination port; `None` matches any port
    #[serde(default)]
    pub port: Option<u16>,
    pub action: FirewallAction,
}

impl FirewallRule {
    pub fn matches(&self, datagram: &Ipv4Datagram) -> bool {
        if !self.source.contains(datagram.source) || !self.destination.contains(datagram.destination)
        {
            return false;
        }

        let protocol_matches = match (self.protocol, &datagram.payload) {
            (FirewallProtocol::Any, _) => true,
            (FirewallProtocol::Tcp, IpPayload::Tcp(_)) => true,
            (FirewallProtocol::Udp, IpPayload::Udp(_)) => true,
            _ => false,
        };

        protocol_matches
            && self
                .port
                .is_none_or(|port| datagram.destination_port() == Some(port))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FirewallConfig {
    pub enabled: bool,
    pub rules: Vec<FirewallRule>,
    pub default_action: FirewallAction,
    /// Only connection attempts are filtered; the rest of an accepted TCP flow passes freely
    #[serde(default)]
    pub syn_only: bool,
    #[serde(default)]
    pub drop_icmp: bool,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            rules: Vec::new(),
            default_action: FirewallAction::Accept,
            syn_only: false,
            drop_icmp: false,
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("rule index {index} is out of bounds (the firewall has {len} rules)")]
pub struct RuleIndexOutOfBounds {
    pub index: usize,
    pub len: usize,
}

/// Both directions of a TCP flow map to the same key
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
struct FlowKey(SocketAddrV4, SocketAddrV4);

impl FlowKey {
    fn new(a: SocketAddrV4, b: SocketAddrV4) -> Self {
        if a <= b { Self(a, b) } else { Self(b, a) }
    }
}

/// Teardown progress of an accepted flow
#[derive(Default)]
struct FlowState {
    // FIN seen from the first and from the second endpoint of the key
    fin: [bool; 2],
}

impl FlowState {
    /// Records a segment of the flow, returning whether the flow is over
    ///
    /// A reset ends the flow at once. After both FINs, the segment that acknowledges the last one
    /// ends it.
    fn observe(&mut self, from_first: bool, flags: TcpFlags) -> bool {
        if flags.contains(TcpFlags::RST) {
            return true;
        }

        if flags.contains(TcpFlags::FIN) {
            self.fin[usize::from(!from_first)] = true;
            return false;
        }

        self.fin == [true, true]
    }
}

pub struct Firewall {
    config: RwLock<FirewallConfig>,
    accepted_flows: Mutex<HashMap<FlowKey, FlowState>>,
}

impl Firewall {
    pub fn new(config: FirewallConfig) -> Self {
        Self {
            config: RwLock::new(config),
            accepted_flows: Mutex::default(),
        }
    }

    pub fn evaluate(&self, datagram: &Ipv4Datagram) -> FirewallAction {
        let config = self.config.read();
        if !config.enabled {
            return FirewallAction::Accept;
        }

        let segment = match &datagram.payload {
            IpPayload::Icmp(_) if config.drop_icmp => return FirewallAction::Drop,
            IpPayload::Tcp(segment) => Some(segment),
            _ => None,
        };

        let flow = segment.filter(|_| config.syn_only).map(|segment| {
            let source = SocketAddrV4::new(datagram.source, segment.source_port);
            let key = FlowKey::new(
                source,
                SocketAddrV4::new(datagram.destination, segment.destination_port),
            );
            (key, key.0 == source, segment.flags)
        });
        if let Some((key, from_first, flags)) = flow {
            let mut flows = self.accepted_flows.lock();
            if let Some(state) = flows.get_mut(&key) {
                if state.observe(from_first, flags) {
                    flows.remove(&key);
                }
                return FirewallAction::Accept;
            }
        }

        let action = config
            .rules
            .iter()
            .find(|rule| rule.matches(datagram))
            .map(|rule| rule.action)
            .unwrap_or(config.default_action);

        let is_syn = segment
            .is_some_and(|s| s.flags.contains(TcpFlags::SYN) && !s.flags.contains(TcpFlags::ACK));
        if let Some((key, _, _)) = flow {
            if is_syn && action == FirewallAction::Accept {
                self.accepted_flows.lock().insert(key, FlowState::default());
            }
        }

        action
    }

    pub fn config(&self) -> FirewallConfig {
        self.config.read().clone()
    }

    pub fn rules(&self) -> Vec<FirewallRule> {
        self.config.read().rules.clone()
    }

    pub fn add_rule(&self, rule: FirewallRule) {
        self.config.write().rules.push(rule);
    }

    pub fn insert_rule(&self, index: usize, rule: FirewallRule) -> Result<(), RuleIndexOutOfBounds> {
        let mut config = self.config.write();
        let len = config.rules.len();
        if index > len {
            return Err(RuleIndexOutOfBounds { index, len });
        }

        config.rules.insert(index, rule);
        Ok(())
    }

    pub fn remove_rule(&self, index: usize) -> Result<FirewallRule, RuleIndexOutOfBounds> {
        let mut config = self.config.write();
        let len = config.rules.len();
        if index >= len {
            return Err(RuleIndexOutOfBounds { index, len });
        }

        Ok(config.rules.remove(index))
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.config.write().enabled = enabled;
    }

    pub fn set_default_action(&self, action: FirewallAction) {
        self.config.write().default_action = action;
    }

    pub fn set_syn_only(&self, syn_only: bool) {
        self.config.write().syn_only = syn_only;
    }

    pub fn set_drop_icmp(&self, drop_icmp: bool) {
        self.config.write().drop_icmp = drop_icmp;
    }

    pub(crate) fn reset_flows(&self) {
        self.accepted_flows.lock().clear();
    }

    /// Number of TCP flows currently let through by SYN-only mode
    pub fn tracked_flows(&self) -> usize {
        self.accepted_flows.lock().len()
    }
}
