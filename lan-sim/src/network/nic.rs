use crate::network::cable::Port;
use crate::network::ip::Ipv4Cidr;
use crate::network::mac::MacAddress;
use parking_lot::RwLock;
use std::net::Ipv4Addr;
use std::sync::Arc;

/// Layer-3 configuration of an interface
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NicAddressing {
    pub ip: Option<Ipv4Cidr>,
    pub gateway: Option<Ipv4Addr>,
    pub dns: Option<Ipv4Addr>,
}

/// A network card: one MAC address, one port, and (when configured) one IPv4 address
pub struct NetworkInterface {
    index: usize,
    mac: MacAddress,
    port: Arc<Port>,
    dhcp: bool,
    // Persisted configuration
    configured: RwLock<NicAddressing>,
    // What the interface currently uses, which differs from the above while a DHCP lease is held
    current: RwLock<NicAddressing>,
}

impl NetworkInterface {
    pub(crate) fn new(
        index: usize,
        mac: MacAddress,
        port: Arc<Port>,
        addressing: NicAddressing,
        dhcp: bool,
    ) -> Self {
        Self {
            index,
            mac,
            port,
            dhcp,
            configured: RwLock::new(addressing),
            current: RwLock::new(addressing),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn mac(&self) -> MacAddress {
        self.mac
    }

    pub fn port(&self) -> &Arc<Port> {
        &self.port
    }

    pub fn uses_dhcp(&self) -> bool {
        self.dhcp
    }

    pub fn addressing(&self) -> NicAddressing {
        *self.current.read()
    }

    pub fn configured_addressing(&self) -> NicAddressing {
        *self.configured.read()
    }

    pub fn cidr(&self) -> Option<Ipv4Cidr> {
        self.current.read().ip
    }

    pub fn ip(&self) -> Option<Ipv4Addr> {
        self.cidr().map(|cidr| cidr.address())
    }

    /// Changes the persisted addressing; callers go through [`IpNode::configure_nic`] so the
    /// node's automatic routes follow
    ///
    /// [`IpNode::configure_nic`]: crate::stack::IpNode::configure_nic
    pub(crate) fn configure(&self, addressing: NicAddressing) {
        *self.configured.write() = addressing;
        *self.current.write() = addressing;
    }

    pub(crate) fn apply_lease(&self, addressing: NicAddressing) {
        *self.current.write() = addressing;
    }

    pub(crate) fn reset_addressing(&self) {
        *self.current.write() = *self.configured.read();
    }
}
