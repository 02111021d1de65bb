use crate::firewall::Firewall;
use crate::network::cable::Port;
use crate::network::nic::NetworkInterface;
use crate::network::spec::NodeKind;
use crate::routing::RoutingTable;
use crate::stack::dhcp::DhcpServerConfig;
use crate::stack::{IpNode, ProtocolStack};
use crate::switch::Switch;
use crate::switch::modem::Modem;
use crate::switch::sat::SourceAddressTable;
use std::sync::Arc;

/// Nodes with network cards (and therefore an IP stack and a routing table)
pub trait HasNics {
    fn nics(&self) -> &[Arc<NetworkInterface>];
    fn routing_table(&self) -> &Arc<RoutingTable>;
    fn stack(&self) -> Option<Arc<ProtocolStack>>;
}

/// Nodes that route datagrams between their interfaces
pub trait ForwardsIp {
    fn firewall(&self) -> &Arc<Firewall>;
    fn rip_enabled(&self) -> bool;
    fn dhcp_server(&self) -> Option<DhcpServerConfig>;
}

/// Nodes that learn which MAC address lives behind which port
pub trait LearnsAddresses {
    fn sat(&self) -> &SourceAddressTable;
}

impl HasNics for IpNode {
    fn nics(&self) -> &[Arc<NetworkInterface>] {
        IpNode::nics(self)
    }

    fn routing_table(&self) -> &Arc<RoutingTable> {
        IpNode::routing_table(self)
    }

    fn stack(&self) -> Option<Arc<ProtocolStack>> {
        IpNode::stack(self)
    }
}

impl ForwardsIp for IpNode {
    fn firewall(&self) -> &Arc<Firewall> {
        IpNode::firewall(self)
    }

    fn rip_enabled(&self) -> bool {
        IpNode::rip_enabled(self)
    }

    fn dhcp_server(&self) -> Option<DhcpServerConfig> {
        IpNode::dhcp_server(self)
    }
}

impl LearnsAddresses for Switch {
    fn sat(&self) -> &SourceAddressTable {
        Switch::sat(self)
    }
}

#[derive(Clone)]
pub enum Node {
    Host(Arc<IpNode>),
    Router(Arc<IpNode>),
    Gateway(Arc<IpNode>),
    Switch(Arc<Switch>),
    Modem(Arc<Modem>),
}

impl Node {
    pub fn id(&self) -> &Arc<str> {
        match self {
            Node::Host(node) | Node::Router(node) | Node::Gateway(node) => node.id(),
            Node::Switch(switch) => switch.id(),
            Node::Modem(modem) => modem.id(),
        }
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            Node::Host(_) => NodeKind::Host,
            Node::Router(_) => NodeKind::Router,
            Node::Gateway(_) => NodeKind::Gateway,
            Node::Switch(_) => NodeKind::Switch,
            Node::Modem(_) => NodeKind::Modem,
        }
    }

    pub fn ports(&self) -> Vec<Arc<Port>> {
        if let Some(node) = self.as_has_nics() {
            return node.nics().iter().map(|nic| nic.port().clone()).collect();
        }

        match self {
            Node::Switch(switch) => switch.ports().to_vec(),
            Node::Modem(modem) => modem.ports().to_vec(),
            Node::Host(_) | Node::Router(_) | Node::Gateway(_) => Vec::new(),
        }
    }

    pub fn port(&self, index: usize) -> Option<Arc<Port>> {
        self.ports().get(index).cloned()
    }

    pub fn ip_node(&self) -> Option<&Arc<IpNode>> {
        match self {
            Node::Host(node) | Node::Router(node) | Node::Gateway(node) => Some(node),
            Node::Switch(_) | Node::Modem(_) => None,
        }
    }

    pub fn switch(&self) -> Option<&Arc<Switch>> {
        match self {
            Node::Switch(switch) => Some(switch),
            _ => None,
        }
    }

    pub fn as_has_nics(&self) -> Option<&dyn HasNics> {
        self.ip_node().map(|node| &**node as &dyn HasNics)
    }

    /// Routers and gateways; hosts have a routing table too, but never forward
    pub fn as_forwarder(&self) -> Option<&dyn ForwardsIp> {
        match self {
            Node::Router(node) | Node::Gateway(node) => Some(&**node as &dyn ForwardsIp),
            _ => None,
        }
    }

    pub fn as_learner(&self) -> Option<&dyn LearnsAddresses> {
        self.switch().map(|switch| &**switch as &dyn LearnsAddresses)
    }

    pub fn is_running(&self) -> bool {
        match self {
            Node::Host(node) | Node::Router(node) | Node::Gateway(node) => node.is_running(),
            Node::Switch(switch) => switch.is_running(),
            Node::Modem(modem) => modem.is_running(),
        }
    }

    pub(crate) fn start(&self) -> anyhow::Result<()> {
        match self {
            Node::Host(node) | Node::Router(node) | Node::Gateway(node) => {
                node.start().map(|_| ())
            }
            Node::Switch(switch) => switch.start(),
            Node::Modem(modem) => modem.start(),
        }
    }

    pub(crate) async fn stop(&self) -> anyhow::Result<()> {
        match self {
            Node::Host(node) | Node::Router(node) | Node::Gateway(node) => node.stop().await,
            Node::Switch(switch) => switch.stop().await,
            Node::Modem(modem) => modem.stop().await,
        }
    }
}
