//! Layer-2 forwarders: the learning bridge (switch) and the two-port repeater (modem)

pub mod modem;
pub mod sat;
pub mod spanning_tree;

use crate::context::SimulationContext;
use crate::network::cable::Port;
use crate::network::frame::Frame;
use crate::switch::sat::SourceAddressTable;
use crate::task_group::TaskGroup;
use anyhow::bail;
use parking_lot::Mutex;
use std::sync::Arc;

pub struct Switch {
    id: Arc<str>,
    ports: Vec<Arc<Port>>,
    sat: SourceAddressTable,
    context: Arc<SimulationContext>,
    tasks: Mutex<Option<TaskGroup>>,
}

impl Switch {
    pub(crate) fn new(id: Arc<str>, port_count: usize, context: Arc<SimulationContext>) -> Self {
        let ports = (0..port_count)
            .map(|index| Port::new(id.clone(), index))
            .collect();
        Self {
            id,
            ports,
            sat: SourceAddressTable::new(),
            context,
            tasks: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &Arc<str> {
        &self.id
    }

    pub fn ports(&self) -> &[Arc<Port>] {
        &self.ports
    }

    pub fn sat(&self) -> &SourceAddressTable {
        &self.sat
    }

    pub fn is_running(&self) -> bool {
        self.tasks.lock().is_some()
    }

    /// Learns the frame's source and returns the ports the frame should be forwarded to
    pub fn forwarding_decision(&self, frame: &Frame, ingress: usize) -> Vec<usize> {
        self.sat.learn(frame.source, ingress);

        if !frame.destination.is_broadcast() {
            if let Some(port) = self.sat.port_of(frame.destination) {
                // A frame whose destination lives behind the ingress port is filtered
                return if port == ingress || self.ports[port].is_blocked() {
                    Vec::new()
                } else {
                    vec![port]
                };
            }
        }

        // Flood
        self.ports
            .iter()
            .filter(|p| p.index != ingress && p.is_connected() && !p.is_blocked())
            .map(|p| p.index)
            .collect()
    }

    pub(crate) fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        let mut tasks = self.tasks.lock();
        if tasks.is_some() {
            bail!("switch `{}` is already running", self.id);
        }

        self.sat.clear();
        let mut group = TaskGroup::new(self.id.clone());
        for port in &self.ports {
            port.clear_inbound();
            let switch = self.clone();
            let port = port.clone();
            let token = group.token().clone();
            group.spawn("switch port", async move {
                while let Some(frames) = token.run_until_cancelled(port.next_frames()).await {
                    for frame in frames {
                        switch.context.tracer.track_frame_received(&switch.id, &frame);
                        for egress in switch.forwarding_decision(&frame, port.index) {
                            switch.ports[egress].send(frame.clone());
                        }
                    }
                }
            });
        }

        *tasks = Some(group);
        Ok(())
    }

    pub(crate) async fn stop(&self) -> anyhow::Result<()> {
        let group = self.tasks.lock().take();
        match group {
            Some(group) => group.shutdown().await,
            None => Ok(()),
        }
    }
}
