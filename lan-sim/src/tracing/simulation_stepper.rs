use crate::network::frame::FrameKind;
use crate::tracing::simulation_step::{
    DatagramDropReason, DatagramDropped, DatagramEvent, FrameDropReason, SimulationStep,
    SimulationStepKind,
};
use crate::tracing::stats::{NetworkStats, NodeStats};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Answers questions about a recorded simulation
#[derive(Clone, Default)]
pub struct SimulationStepper {
    steps: Vec<SimulationStep>,
}

impl SimulationStepper {
    pub fn new(steps: Vec<SimulationStep>) -> Self {
        Self { steps }
    }

    pub fn steps(self) -> Vec<SimulationStep> {
        self.steps
    }

    /// The nodes a frame visited, starting with the node that sent it
    pub fn get_frame_hops(&self, id: Uuid) -> Vec<(Duration, Arc<str>)> {
        let mut hops = Vec::new();
        for step in &self.steps {
            match &step.kind {
                SimulationStepKind::FrameSent(s) if s.frame_id == id && hops.is_empty() => {
                    hops.push((step.relative_time, s.node_id.clone()));
                }
                SimulationStepKind::FrameReceived(s) if s.frame_id == id => {
                    hops.push((step.relative_time, s.node_id.clone()));
                }
                _ => {}
            }
        }

        hops
    }

    pub fn get_frame_path(&self, id: Uuid) -> Vec<Arc<str>> {
        self.get_frame_hops(id)
            .into_iter()
            .map(|(_, node_id)| node_id)
            .collect()
    }

    /// Ids of the frames of a given kind sent by a node, in order
    pub fn frames_sent_by(&self, node_id: &str, kind: FrameKind) -> Vec<Uuid> {
        self.steps
            .iter()
            .filter_map(|s| match &s.kind {
                SimulationStepKind::FrameSent(sent)
                    if sent.node_id.as_ref() == node_id && sent.frame_kind == kind =>
                {
                    Some(sent.frame_id)
                }
                _ => None,
            })
            .collect()
    }

    pub fn frames_dropped(&self, reason: FrameDropReason) -> Vec<Uuid> {
        self.steps
            .iter()
            .filter_map(|s| match &s.kind {
                SimulationStepKind::FrameDropped(dropped) if dropped.reason == reason => {
                    Some(dropped.frame_id)
                }
                _ => None,
            })
            .collect()
    }

    /// Datagrams delivered to the protocol stack of a node
    pub fn datagrams_delivered_to(&self, node_id: &str) -> Vec<DatagramEvent> {
        self.steps
            .iter()
            .filter_map(|s| match &s.kind {
                SimulationStepKind::DatagramDelivered(event)
                    if event.node_id.as_ref() == node_id =>
                {
                    Some(event.clone())
                }
                _ => None,
            })
            .collect()
    }

    pub fn datagrams_dropped(&self, reason: DatagramDropReason) -> Vec<DatagramDropped> {
        self.steps
            .iter()
            .filter_map(|s| match &s.kind {
                SimulationStepKind::DatagramDropped(dropped) if dropped.reason == reason => {
                    Some(dropped.clone())
                }
                _ => None,
            })
            .collect()
    }

    pub fn stats(&self) -> NetworkStats {
        let mut stats = NetworkStats::default();
        for step in &self.steps {
            match &step.kind {
                SimulationStepKind::FrameSent(s) => {
                    let node = node_stats(&mut stats, &s.node_id);
                    node.sent.track_one(s.frame_size_bytes);
                    stats
                        .by_cable
                        .entry(s.cable_id.clone())
                        .or_default()
                        .carried
                        .track_one(s.frame_size_bytes);
                }
                SimulationStepKind::FrameReceived(s) => {
                    node_stats(&mut stats, &s.node_id)
                        .received
                        .track_one(s.frame_size_bytes);
                }
                SimulationStepKind::FrameDropped(s) => {
                    node_stats(&mut stats, &s.node_id).dropped_frames += 1;
                }
                SimulationStepKind::DatagramDropped(s) => {
                    node_stats(&mut stats, &s.datagram.node_id).dropped_datagrams += 1;
                }
                SimulationStepKind::DatagramDelivered(s) => {
                    node_stats(&mut stats, &s.node_id).delivered_datagrams += 1;
                }
                SimulationStepKind::TcpStateChanged(_) => {}
            }
        }

        stats
    }
}

fn node_stats<'a>(stats: &'a mut NetworkStats, node_id: &Arc<str>) -> &'a mut NodeStats {
    stats.by_node.entry(node_id.clone()).or_default()
}
