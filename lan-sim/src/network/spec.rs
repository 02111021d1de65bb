//! Plain-data description of a network, as produced by a topology editor or a config file

use crate::firewall::FirewallConfig;
use crate::network::ip::Ipv4Cidr;
use crate::network::mac::MacAddress;
use crate::network::nic::NicAddressing;
use crate::routing::Route;
use crate::stack::StackConfig;
use crate::stack::dhcp::DhcpServerConfig;
use std::net::Ipv4Addr;
use std::time::Duration;

#[derive(Clone, Debug, Default)]
pub struct NetworkSpec {
    pub nodes: Vec<NodeSpec>,
    pub cables: Vec<CableSpec>,
    pub config: StackConfig,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NodeKind {
    Host,
    Router,
    Gateway,
    Switch,
    Modem,
}

impl NodeKind {
    /// Whether nodes of this kind route datagrams that are not addressed to them
    pub fn forwards_ip(&self) -> bool {
        matches!(self, NodeKind::Router | NodeKind::Gateway)
    }

    pub fn is_layer2(&self) -> bool {
        matches!(self, NodeKind::Switch | NodeKind::Modem)
    }
}

#[derive(Clone, Debug)]
pub struct NodeSpec {
    pub id: String,
    pub kind: NodeKind,
    /// One interface (and port) per entry; ignored for switches and modems
    pub interfaces: Vec<InterfaceSpec>,
    pub routes: Vec<Route>,
    pub firewall: FirewallConfig,
    pub rip: bool,
    pub dhcp_server: Option<DhcpServerConfig>,
    /// Number of ports of a switch
    pub ports: usize,
}

impl NodeSpec {
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            kind,
            interfaces: Vec::new(),
            routes: Vec::new(),
            firewall: FirewallConfig::default(),
            rip: false,
            dhcp_server: None,
            ports: 0,
        }
    }

    pub fn switch(id: impl Into<String>, ports: usize) -> Self {
        Self {
            ports,
            ..Self::new(id, NodeKind::Switch)
        }
    }

    pub fn with_interface(mut self, interface: InterfaceSpec) -> Self {
        self.interfaces.push(interface);
        self
    }

    pub fn with_route(mut self, route: Route) -> Self {
        self.routes.push(route);
        self
    }

    pub fn port_count(&self) -> usize {
        match self.kind {
            NodeKind::Switch => self.ports,
            NodeKind::Modem => 2,
            NodeKind::Host | NodeKind::Router | NodeKind::Gateway => self.interfaces.len(),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct InterfaceSpec {
    /// A random MAC is generated when absent
    pub mac: Option<MacAddress>,
    pub address: Option<Ipv4Cidr>,
    pub gateway: Option<Ipv4Addr>,
    pub dns: Option<Ipv4Addr>,
    /// Obtain the addressing from a DHCP server when the simulation starts
    pub dhcp: bool,
}

impl InterfaceSpec {
    pub fn with_address(address: Ipv4Cidr) -> Self {
        Self {
            address: Some(address),
            ..Self::default()
        }
    }

    pub fn dhcp() -> Self {
        Self {
            dhcp: true,
            ..Self::default()
        }
    }

    pub fn gateway(mut self, gateway: Ipv4Addr) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub(crate) fn addressing(&self) -> NicAddressing {
        NicAddressing {
            ip: self.address,
            gateway: self.gateway,
            dns: self.dns,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndpointSpec {
    pub node: String,
    pub port: usize,
}

impl EndpointSpec {
    pub fn new(node: impl Into<String>, port: usize) -> Self {
        Self {
            node: node.into(),
            port,
        }
    }
}

#[derive(Clone, Debug)]
pub struct CableSpec {
    pub id: String,
    pub a: EndpointSpec,
    pub b: EndpointSpec,
    /// Propagation delay before applying the speed factor
    pub delay: Duration,
}
