//! The layered protocol stack of hosts, routers and gateways
//!
//! An [`IpNode`] holds what persists across simulation runs (interfaces, routing table, firewall,
//! DHCP server settings). Starting it creates a [`ProtocolStack`], which owns the volatile state
//! (ARP cache, sockets, connections) and the tasks that drive it. Stopping the node cancels those
//! tasks and throws the volatile state away.

pub mod arp;
pub mod dhcp;
mod ethernet;
pub mod icmp;
pub mod ip;
pub mod tcp;
pub mod udp;

use crate::cancellation::CancellationToken;
use crate::context::SimulationContext;
use crate::firewall::Firewall;
use crate::network::nic::{NetworkInterface, NicAddressing};
use crate::network::spec::{NodeKind, NodeSpec};
use crate::routing::rip::{self, RIP_PORT, RipConfig};
use crate::routing::{RoutingTable, auto_routes};
use crate::stack::arp::{ArpConfig, ArpTable};
use crate::stack::dhcp::{DhcpConfig, DhcpServerConfig};
use crate::stack::icmp::{IcmpState, PingError, PingOptions, PingReply};
use crate::stack::ip::InboundDatagram;
use crate::stack::tcp::{TcpConfig, TcpError, TcpListener, TcpStream, TcpTables};
use crate::stack::udp::{UdpBindings, UdpError, UdpSocket};
use crate::task_group::TaskGroup;
use anyhow::bail;
use parking_lot::{Mutex, RwLock};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use tokio::sync::mpsc;

/// Protocol tunables shared by every node of a network
#[derive(Clone, Debug, Default)]
pub struct StackConfig {
    pub arp: ArpConfig,
    pub tcp: TcpConfig,
    pub rip: RipConfig,
    pub dhcp: DhcpConfig,
}

pub struct IpNode {
    id: Arc<str>,
    kind: NodeKind,
    nics: Vec<Arc<NetworkInterface>>,
    routing: Arc<RoutingTable>,
    firewall: Arc<Firewall>,
    rip: AtomicBool,
    dhcp_server: RwLock<Option<DhcpServerConfig>>,
    config: StackConfig,
    context: Arc<SimulationContext>,
    running: Mutex<Option<Arc<ProtocolStack>>>,
}

impl IpNode {
    pub(crate) fn new(
        spec: &NodeSpec,
        nics: Vec<Arc<NetworkInterface>>,
        config: StackConfig,
        context: Arc<SimulationContext>,
    ) -> Self {
        let routing = Arc::new(RoutingTable::new());
        for route in &spec.routes {
            routing.add_manual(route.clone());
        }
        routing.set_auto_routes(auto_routes(&nics));

        Self {
            id: spec.id.as_str().into(),
            kind: spec.kind,
            nics,
            routing,
            firewall: Arc::new(Firewall::new(spec.firewall.clone())),
            rip: AtomicBool::new(spec.rip),
            dhcp_server: RwLock::new(spec.dhcp_server.clone()),
            config,
            context,
            running: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &Arc<str> {
        &self.id
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn nics(&self) -> &[Arc<NetworkInterface>] {
        &self.nics
    }

    pub fn routing_table(&self) -> &Arc<RoutingTable> {
        &self.routing
    }

    pub fn firewall(&self) -> &Arc<Firewall> {
        &self.firewall
    }

    pub fn rip_enabled(&self) -> bool {
        self.rip.load(Ordering::Relaxed)
    }

    /// Takes effect on the next start
    pub fn set_rip_enabled(&self, enabled: bool) {
        self.rip.store(enabled, Ordering::Relaxed);
    }

    pub fn dhcp_server(&self) -> Option<DhcpServerConfig> {
        self.dhcp_server.read().clone()
    }

    /// Takes effect on the next start
    pub fn set_dhcp_server(&self, config: Option<DhcpServerConfig>) {
        *self.dhcp_server.write() = config;
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// The running protocol stack, if the node was started
    pub fn stack(&self) -> Option<Arc<ProtocolStack>> {
        self.running.lock().clone()
    }

    /// Changes the addressing of an interface, along with the routes derived from it
    pub fn configure_nic(&self, index: usize, addressing: NicAddressing) -> anyhow::Result<()> {
        let Some(nic) = self.nics.get(index) else {
            bail!("node `{}` has no interface with index {index}", self.id);
        };

        nic.configure(addressing);
        self.refresh_auto_routes();
        Ok(())
    }

    /// Recomputes the connected-network and default routes after an addressing change
    fn refresh_auto_routes(&self) {
        self.routing.set_auto_routes(auto_routes(&self.nics));
    }

    pub async fn ping(
        &self,
        destination: Ipv4Addr,
        options: PingOptions,
    ) -> Result<PingReply, PingError> {
        let stack = self.stack().ok_or(PingError::Stopped)?;
        stack.ping(destination, options).await
    }

    pub async fn tcp_connect(&self, remote: SocketAddrV4) -> Result<TcpStream, TcpError> {
        let stack = self.stack().ok_or(TcpError::Stopped)?;
        stack.tcp_connect(remote).await
    }

    pub fn tcp_listen(&self, local: SocketAddrV4) -> Result<TcpListener, TcpError> {
        let stack = self.stack().ok_or(TcpError::Stopped)?;
        stack.tcp_listen(local)
    }

    pub fn udp_bind(&self, local: SocketAddrV4) -> Result<UdpSocket, UdpError> {
        let stack = self.stack().ok_or(UdpError::Stopped)?;
        stack.udp_bind(local)
    }

    pub(crate) fn start(&self) -> anyhow::Result<Arc<ProtocolStack>> {
        let mut running = self.running.lock();
        if running.is_some() {
            bail!("node `{}` is already running", self.id);
        }

        self.firewall.reset_flows();
        self.routing.clear_rip();
        self.refresh_auto_routes();

        let stack = ProtocolStack::start(self)?;
        *running = Some(stack.clone());
        Ok(stack)
    }

    /// Obtains addressing for every interface configured to use DHCP
    ///
    /// Failures are reported through the tracer and leave the interface unaddressed.
    pub(crate) async fn acquire_dhcp_leases(&self) {
        let Some(stack) = self.stack() else {
            return;
        };

        // One at a time, since all clients share the DHCP client port
        for nic in self.nics.iter().filter(|nic| nic.uses_dhcp()) {
            match stack.acquire_lease(nic.index()).await {
                Ok(lease) => {
                    nic.apply_lease(lease.addressing());
                    self.refresh_auto_routes();
                }
                Err(e) => self
                    .context
                    .tracer
                    .track_dhcp_failure(&self.id, nic.index(), e),
            }
        }
    }

    /// Tears down the running stack; stopping a stopped node is a no-op
    pub(crate) async fn stop(&self) -> anyhow::Result<()> {
        let Some(stack) = self.running.lock().take() else {
            return Ok(());
        };

        let result = stack.shutdown().await;

        // Learned state does not survive a restart
        self.routing.clear_rip();
        for nic in self.nics.iter().filter(|nic| nic.uses_dhcp()) {
            nic.reset_addressing();
        }
        self.refresh_auto_routes();

        result
    }
}

/// The volatile state of a running [`IpNode`]
pub struct ProtocolStack {
    node_id: Arc<str>,
    forwarding: bool,
    nics: Vec<Arc<NetworkInterface>>,
    routing: Arc<RoutingTable>,
    firewall: Arc<Firewall>,
    config: StackConfig,
    context: Arc<SimulationContext>,
    arp: ArpTable,
    icmp: IcmpState,
    tcp: TcpTables,
    udp: UdpBindings,
    ip_input: mpsc::UnboundedSender<InboundDatagram>,
    next_identification: AtomicU16,
    token: CancellationToken,
    tasks: Mutex<Option<TaskGroup>>,
}

impl ProtocolStack {
    fn start(node: &IpNode) -> anyhow::Result<Arc<Self>> {
        let group = TaskGroup::new(node.id.clone());
        let token = group.token().clone();
        let (ip_input, ip_input_rx) = mpsc::unbounded_channel();

        let stack = Arc::new(Self {
            node_id: node.id.clone(),
            forwarding: node.kind.forwards_ip(),
            nics: node.nics.clone(),
            routing: node.routing.clone(),
            firewall: node.firewall.clone(),
            config: node.config.clone(),
            context: node.context.clone(),
            arp: ArpTable::new(),
            icmp: IcmpState::new(node.context.random_u16()),
            tcp: TcpTables::new(),
            udp: UdpBindings::new(),
            ip_input,
            next_identification: AtomicU16::new(node.context.random_u16()),
            token,
            tasks: Mutex::new(Some(group)),
        });

        // Sockets are bound up front, so a failure leaves no task behind
        let rip_socket = if node.kind.forwards_ip() && node.rip_enabled() {
            Some(stack.udp_bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, RIP_PORT))?)
        } else {
            None
        };
        let dhcp_server = match node.dhcp_server() {
            Some(config) => {
                let socket = dhcp::bind_server(&stack, &config)?;
                Some((config, socket))
            }
            None => None,
        };

        // Bottom-up: link layer first, then IP, then the applications
        for nic in &stack.nics {
            nic.port().clear_inbound();
            stack.spawn(
                "ethernet receiver",
                ethernet::receive_frames(stack.clone(), nic.clone()),
            );
        }
        stack.spawn(
            "ip input",
            ip::process_inbound(stack.clone(), ip_input_rx),
        );

        if let Some(socket) = rip_socket {
            stack.spawn("rip", rip::run(stack.clone(), socket));
        }
        if let Some((config, socket)) = dhcp_server {
            stack.spawn("dhcp server", dhcp::serve(stack.clone(), config, socket));
        }

        Ok(stack)
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        let group = self.tasks.lock().take();
        let result = match group {
            Some(group) => group.shutdown().await,
            None => Ok(()),
        };

        // Wakes up applications blocked on sockets of this stack
        self.tcp.clear();
        self.udp.clear();
        self.icmp.clear();
        result
    }

    /// Runs a task until the stack stops; tasks spawned after stopping are dropped
    pub(crate) fn spawn(
        &self,
        name: &'static str,
        task: impl Future<Output = ()> + Send + 'static,
    ) {
        if let Some(group) = self.tasks.lock().as_mut() {
            group.spawn(name, task);
        }
    }

    /// Tasks of this stack that may still be running
    pub fn task_count(&self) -> usize {
        self.tasks.lock().as_ref().map_or(0, TaskGroup::len)
    }

    pub fn node_id(&self) -> &Arc<str> {
        &self.node_id
    }

    pub fn nics(&self) -> &[Arc<NetworkInterface>] {
        &self.nics
    }

    pub fn routing_table(&self) -> &Arc<RoutingTable> {
        &self.routing
    }

    pub fn firewall(&self) -> &Arc<Firewall> {
        &self.firewall
    }

    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    pub fn context(&self) -> &Arc<SimulationContext> {
        &self.context
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_own_address(&self, ip: Ipv4Addr) -> bool {
        self.nics.iter().any(|nic| nic.ip() == Some(ip))
    }
}
