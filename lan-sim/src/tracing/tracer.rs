use crate::network::frame::{Frame, Ipv4Datagram};
use crate::pcap_exporter::{PcapExporter, PcapExporterFactory};
use crate::stack::tcp::TcpState;
use crate::tracing::simulation_step::{
    DatagramDropReason, DatagramDropped, DatagramEvent, FrameDropReason, FrameDropped,
    FrameInTransit, GenericFrameEvent, SimulationStep, SimulationStepKind, TcpStateChanged,
};
use crate::tracing::simulation_stepper::SimulationStepper;
use crate::tracing::stats::NetworkStats;
use anyhow::Context;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::net::SocketAddrV4;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::Instant;

pub struct SimulationStepTracer {
    simulation_start: Instant,
    pcap_exporter_factory: Arc<dyn PcapExporterFactory>,
    pcap_exporters: Mutex<HashMap<Arc<str>, Arc<PcapExporter>>>,
    recorded_steps: Mutex<Vec<SimulationStep>>,
    live_steps: broadcast::Sender<SimulationStep>,
    already_warned_firewall_drop: Mutex<HashSet<Arc<str>>>,
}

impl SimulationStepTracer {
    pub fn new(pcap_exporter_factory: Arc<dyn PcapExporterFactory>) -> Self {
        let (live_steps, _) = broadcast::channel(1024);
        Self {
            simulation_start: Instant::now(),
            pcap_exporter_factory,
            pcap_exporters: Mutex::default(),
            recorded_steps: Mutex::default(),
            live_steps,
            already_warned_firewall_drop: Mutex::default(),
        }
    }

    pub fn steps(&self) -> Vec<SimulationStep> {
        self.recorded_steps.lock().clone()
    }

    pub fn stepper(&self) -> SimulationStepper {
        SimulationStepper::new(self.steps())
    }

    pub fn stats(&self) -> NetworkStats {
        self.stepper().stats()
    }

    /// Live notifications of every recorded step (e.g. to highlight cables)
    pub fn subscribe(&self) -> broadcast::Receiver<SimulationStep> {
        self.live_steps.subscribe()
    }

    pub fn flush_pcaps(&self) -> anyhow::Result<()> {
        let exporters: Vec<_> = self.pcap_exporters.lock().values().cloned().collect();
        for exporter in exporters {
            exporter.flush()?;
        }

        Ok(())
    }

    fn record(&self, kind: SimulationStepKind) {
        let step = SimulationStep {
            relative_time: self.simulation_start.elapsed(),
            kind,
        };

        // Nobody listening is fine
        self.live_steps.send(step.clone()).ok();
        self.recorded_steps.lock().push(step);
    }

    fn warn(&self, message: impl Display) {
        println!(
            "{:.2}s WARN {message}",
            self.simulation_start.elapsed().as_secs_f64()
        );
    }

    fn capture(&self, node_id: &Arc<str>, frame: &Frame) {
        let exporter = {
            let mut exporters = self.pcap_exporters.lock();
            match exporters.get(node_id) {
                Some(exporter) => exporter.clone(),
                None => {
                    let exporter = self
                        .pcap_exporter_factory
                        .create_pcap_exporter_for_node(node_id)
                        .with_context(|| format!("pcap capture disabled for node `{node_id}`"))
                        .unwrap_or_else(|e| {
                            self.warn(format!("{e:#}"));
                            PcapExporter::noop()
                        });
                    let exporter = Arc::new(exporter);
                    exporters.insert(node_id.clone(), exporter.clone());
                    exporter
                }
            }
        };

        if let Err(e) = exporter.track_frame(frame) {
            self.warn(format!("{e:#}"));
        }
    }

    pub(crate) fn track_frame_sent(&self, node_id: &Arc<str>, cable_id: &Arc<str>, frame: &Frame) {
        self.record(SimulationStepKind::FrameSent(FrameInTransit {
            frame_id: frame.id,
            frame_number: frame.number,
            frame_size_bytes: frame.size_bytes(),
            frame_kind: frame.kind(),
            node_id: node_id.clone(),
            cable_id: cable_id.clone(),
        }));
        self.capture(node_id, frame);
    }

    pub(crate) fn track_frame_received(&self, node_id: &Arc<str>, frame: &Frame) {
        self.record(SimulationStepKind::FrameReceived(GenericFrameEvent {
            frame_id: frame.id,
            frame_number: frame.number,
            frame_size_bytes: frame.size_bytes(),
            frame_kind: frame.kind(),
            node_id: node_id.clone(),
        }));
        self.capture(node_id, frame);
    }

    pub(crate) fn track_dropped_on_blocked_cable(&self, node_id: &Arc<str>, frame: &Frame) {
        self.record(SimulationStepKind::FrameDropped(FrameDropped {
            frame_id: frame.id,
            frame_kind: frame.kind(),
            node_id: node_id.clone(),
            reason: FrameDropReason::CableBlocked,
        }));
    }

    pub(crate) fn track_frame_not_addressed(&self, node_id: &Arc<str>, frame: &Frame) {
        self.record(SimulationStepKind::FrameDropped(FrameDropped {
            frame_id: frame.id,
            frame_kind: frame.kind(),
            node_id: node_id.clone(),
            reason: FrameDropReason::NotAddressed,
        }));
    }

    pub(crate) fn track_datagram_delivered(&self, node_id: &Arc<str>, datagram: &Ipv4Datagram) {
        self.record(SimulationStepKind::DatagramDelivered(datagram_event(
            node_id, datagram,
        )));
    }

    pub(crate) fn track_datagram_dropped(
        &self,
        node_id: &Arc<str>,
        datagram: &Ipv4Datagram,
        reason: DatagramDropReason,
    ) {
        self.record(SimulationStepKind::DatagramDropped(DatagramDropped {
            datagram: datagram_event(node_id, datagram),
            reason,
        }));

        let description = format!(
            "datagram {} -> {} ({:?}) dropped by `{node_id}`",
            datagram.source,
            datagram.destination,
            datagram.protocol()
        );
        match reason {
            DatagramDropReason::TtlExceeded => self.warn(format!("{description}: TTL exceeded")),
            DatagramDropReason::RouteNotFound => self.warn(format!("{description}: no route")),
            DatagramDropReason::AddressResolution => {
                self.warn(format!("{description}: next hop did not answer ARP"))
            }
            DatagramDropReason::Firewall => {
                let first_dropped = self
                    .already_warned_firewall_drop
                    .lock()
                    .insert(node_id.clone());
                if first_dropped {
                    self.warn(format!("{description}: rejected by the firewall (Note: further firewall warnings for this node will be omitted to avoid cluttering the output)"));
                }
            }
            DatagramDropReason::NotForwarding | DatagramDropReason::PortUnreachable => {}
        }
    }

    pub(crate) fn track_tcp_state_change(
        &self,
        node_id: &Arc<str>,
        local: SocketAddrV4,
        remote: SocketAddrV4,
        from: TcpState,
        to: TcpState,
    ) {
        self.record(SimulationStepKind::TcpStateChanged(TcpStateChanged {
            node_id: node_id.clone(),
            local,
            remote,
            from,
            to,
        }));
    }

    pub(crate) fn track_tcp_connection_failed(
        &self,
        node_id: &Arc<str>,
        local: SocketAddrV4,
        remote: SocketAddrV4,
        error: impl Display,
    ) {
        self.warn(format!(
            "TCP connection {local} -> {remote} of `{node_id}` failed: {error}"
        ));
    }

    pub(crate) fn warn_invalid_rip_message(
        &self,
        node_id: &Arc<str>,
        neighbor: std::net::Ipv4Addr,
        error: impl Display,
    ) {
        self.warn(format!(
            "`{node_id}` ignored a RIP message from {neighbor}: {error}"
        ));
    }

    pub(crate) fn track_dhcp_failure(&self, node_id: &Arc<str>, nic_index: usize, error: impl Display) {
        self.warn(format!(
            "`{node_id}` could not obtain an address for interface {nic_index}: {error}"
        ));
    }
}

fn datagram_event(node_id: &Arc<str>, datagram: &Ipv4Datagram) -> DatagramEvent {
    DatagramEvent {
        source: datagram.source,
        destination: datagram.destination,
        identification: datagram.identification,
        protocol: datagram.protocol(),
        node_id: node_id.clone(),
    }
}
