//! In-memory LAN: nodes, cables and the orchestration of a simulation run
//!
//! A [`Network`] owns every node and cable. Between runs the topology can be edited (cables
//! plugged or unplugged, routes and firewall rules changed); `start` brings the whole network up
//! bottom-up and `stop` tears it down again.

pub mod cable;
pub mod frame;
mod inbound_queue;
pub mod ip;
pub mod mac;
pub mod nic;
pub mod node;
pub mod spec;

use crate::context::SimulationContext;
use crate::network::cable::{Cable, Port};
use crate::network::nic::NetworkInterface;
use crate::network::node::Node;
use crate::network::spec::{CableSpec, NetworkSpec, NodeKind, NodeSpec};
use crate::stack::{IpNode, StackConfig};
use crate::switch::Switch;
use crate::switch::modem::Modem;
use crate::switch::spanning_tree::{BridgeLink, SpanningTree};
use crate::tracing::tracer::SimulationStepTracer;
use anyhow::{Context, bail};
use fastrand::Rng;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

/// The nodes that failed to shut down cleanly; all other nodes were stopped regardless
#[derive(Error, Debug)]
#[error("{} node(s) failed to stop: {}", .failures.len(), describe_failures(.failures))]
pub struct StopError {
    pub failures: Vec<(Arc<str>, anyhow::Error)>,
}

fn describe_failures(failures: &[(Arc<str>, anyhow::Error)]) -> String {
    failures
        .iter()
        .map(|(node_id, error)| format!("`{node_id}` ({error:#})"))
        .collect::<Vec<_>>()
        .join(", ")
}

pub struct Network {
    nodes: Vec<Node>,
    nodes_by_id: HashMap<Arc<str>, usize>,
    cables: RwLock<Vec<Arc<Cable>>>,
    context: Arc<SimulationContext>,
    running: AtomicBool,
    spanning_tree: Mutex<Option<SpanningTree>>,
}

impl Network {
    /// Creates the nodes and plugs in the cables described by `spec`
    ///
    /// Interfaces without a MAC address get a random one.
    pub fn initialize(
        spec: NetworkSpec,
        tracer: Arc<SimulationStepTracer>,
        rng: Rng,
    ) -> anyhow::Result<Arc<Self>> {
        let context = Arc::new(SimulationContext::new(tracer, rng));

        let mut nodes = Vec::with_capacity(spec.nodes.len());
        let mut nodes_by_id = HashMap::new();
        for node_spec in &spec.nodes {
            let node = create_node(node_spec, &spec.config, &context)?;
            if nodes_by_id.insert(node.id().clone(), nodes.len()).is_some() {
                bail!("found duplicate node id `{}`", node_spec.id);
            }
            nodes.push(node);
        }

        let network = Self {
            nodes,
            nodes_by_id,
            cables: RwLock::default(),
            context,
            running: AtomicBool::new(false),
            spanning_tree: Mutex::default(),
        };

        for cable in &spec.cables {
            network.plug(cable)?;
        }

        Ok(Arc::new(network))
    }

    fn plug(&self, spec: &CableSpec) -> anyhow::Result<Arc<Cable>> {
        let mut cables = self.cables.write();
        if cables.iter().any(|c| *c.id == *spec.id) {
            bail!("found duplicate cable id `{}`", spec.id);
        }

        let a = self.endpoint_port(&spec.a.node, spec.a.port)?;
        let b = self.endpoint_port(&spec.b.node, spec.b.port)?;
        let cable = Cable::connect(
            spec.id.as_str().into(),
            &a,
            &b,
            spec.delay,
            self.context.clone(),
        )
        .with_context(|| format!("unable to connect cable `{}`", spec.id))?;

        cables.push(cable.clone());
        Ok(cable)
    }

    fn endpoint_port(&self, node_id: &str, port: usize) -> anyhow::Result<Arc<Port>> {
        let node = self
            .node(node_id)
            .with_context(|| format!("cable endpoint refers to missing node `{node_id}`"))?;
        node.port(port)
            .with_context(|| format!("node `{node_id}` has no port {port}"))
    }

    pub fn context(&self) -> &Arc<SimulationContext> {
        &self.context
    }

    pub fn tracer(&self) -> &Arc<SimulationStepTracer> {
        self.context.tracer()
    }

    /// Changes the global speed factor; takes effect immediately, even while running
    pub fn set_speed_factor(&self, factor: f64) -> anyhow::Result<()> {
        self.context.speed().set_factor(factor)
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes_by_id.get(id).map(|&index| &self.nodes[index])
    }

    pub fn ip_node(&self, id: &str) -> Option<&Arc<IpNode>> {
        self.node(id).and_then(Node::ip_node)
    }

    pub fn switch(&self, id: &str) -> Option<&Arc<Switch>> {
        self.node(id).and_then(Node::switch)
    }

    pub fn cables(&self) -> Vec<Arc<Cable>> {
        self.cables.read().clone()
    }

    pub fn cable(&self, id: &str) -> Option<Arc<Cable>> {
        self.cables.read().iter().find(|c| &*c.id == id).cloned()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// The spanning tree computed by the last `start`
    pub fn spanning_tree(&self) -> Option<SpanningTree> {
        self.spanning_tree.lock().clone()
    }

    /// Plugs in a new cable; the topology can only change while stopped
    pub fn connect(&self, spec: &CableSpec) -> anyhow::Result<Arc<Cable>> {
        if self.is_running() {
            bail!("cannot connect cable `{}` while the network is running", spec.id);
        }

        self.plug(spec)
    }

    pub fn disconnect(&self, cable_id: &str) -> anyhow::Result<()> {
        if self.is_running() {
            bail!("cannot disconnect cable `{cable_id}` while the network is running");
        }

        let mut cables = self.cables.write();
        let index = cables
            .iter()
            .position(|c| &*c.id == cable_id)
            .with_context(|| format!("cable `{cable_id}` does not exist"))?;
        let cable = cables.remove(index);
        cable.disconnect()?;
        Ok(())
    }

    /// Brings the network up: spanning tree first, then layer-2 nodes, then IP nodes (which
    /// afterwards obtain their DHCP leases)
    ///
    /// If any node fails to start, the nodes started so far are stopped again.
    pub async fn start(&self) -> anyhow::Result<SpanningTree> {
        if self.running.swap(true, Ordering::SeqCst) {
            bail!("the network is already running");
        }

        let tree = self.compute_spanning_tree();
        for cable in self.cables.read().iter() {
            cable.set_blocked(tree.is_blocked(&cable.id));
        }
        *self.spanning_tree.lock() = Some(tree.clone());

        let (layer2, layer3): (Vec<_>, Vec<_>) =
            self.nodes.iter().partition(|node| node.kind().is_layer2());
        for node in layer2.iter().chain(&layer3) {
            if let Err(e) = node.start() {
                // Best effort, the start error is the one worth reporting
                self.stop().await.ok();
                return Err(e.context(format!("unable to start node `{}`", node.id())));
            }
        }

        let leases = layer3
            .iter()
            .filter_map(|node| node.ip_node())
            .map(|node| node.acquire_dhcp_leases());
        futures::future::join_all(leases).await;

        Ok(tree)
    }

    fn compute_spanning_tree(&self) -> SpanningTree {
        let bridges: Vec<_> = self
            .nodes
            .iter()
            .filter(|node| node.kind().is_layer2())
            .map(|node| node.id().clone())
            .collect();

        let is_bridge = |port: &Arc<Port>| {
            self.node(port.owner())
                .is_some_and(|node| node.kind().is_layer2())
        };
        let links: Vec<_> = self
            .cables
            .read()
            .iter()
            .filter(|cable| cable.is_connected())
            .filter(|cable| cable.ends().iter().all(|port| is_bridge(port)))
            .map(|cable| {
                let [a, b] = cable.ends();
                BridgeLink {
                    cable_id: cable.id.clone(),
                    a: a.owner().clone(),
                    b: b.owner().clone(),
                }
            })
            .collect();

        SpanningTree::compute(&bridges, &links)
    }

    /// Tears the network down: IP nodes first, then layer-2 nodes
    ///
    /// Every node is stopped, even if stopping another one failed. Stopping a stopped network is
    /// a no-op.
    pub async fn stop(&self) -> Result<(), StopError> {
        let mut failures = Vec::new();
        let (layer2, layer3): (Vec<_>, Vec<_>) =
            self.nodes.iter().partition(|node| node.kind().is_layer2());
        for node in layer3.into_iter().chain(layer2) {
            if let Err(e) = node.stop().await {
                failures.push((node.id().clone(), e));
            }
        }

        self.running.store(false, Ordering::SeqCst);
        if failures.is_empty() {
            Ok(())
        } else {
            Err(StopError { failures })
        }
    }
}

fn create_node(
    spec: &NodeSpec,
    config: &StackConfig,
    context: &Arc<SimulationContext>,
) -> anyhow::Result<Node> {
    let id: Arc<str> = spec.id.as_str().into();
    let node = match spec.kind {
        NodeKind::Switch => {
            if spec.ports == 0 {
                bail!("switch `{id}` has no ports");
            }
            Node::Switch(Arc::new(Switch::new(id, spec.ports, context.clone())))
        }
        NodeKind::Modem => Node::Modem(Arc::new(Modem::new(id, context.clone()))),
        NodeKind::Host | NodeKind::Router | NodeKind::Gateway => {
            if let Some(dhcp) = &spec.dhcp_server {
                if dhcp.interface >= spec.interfaces.len() {
                    bail!(
                        "DHCP server of `{id}` refers to missing interface {}",
                        dhcp.interface
                    );
                }
            }

            let nics = spec
                .interfaces
                .iter()
                .enumerate()
                .map(|(index, interface)| {
                    Arc::new(NetworkInterface::new(
                        index,
                        interface.mac.unwrap_or_else(|| context.random_mac()),
                        Port::new(id.clone(), index),
                        interface.addressing(),
                        interface.dhcp,
                    ))
                })
                .collect();
            let ip_node = Arc::new(IpNode::new(spec, nics, config.clone(), context.clone()));
            match spec.kind {
                NodeKind::Host => Node::Host(ip_node),
                NodeKind::Router => Node::Router(ip_node),
                _ => Node::Gateway(ip_node),
            }
        }
    };

    Ok(node)
}
