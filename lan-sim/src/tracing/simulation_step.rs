use crate::network::frame::{FrameKind, IpProtocol};
use crate::stack::tcp::TcpState;
use serde::{Deserialize, Serialize};
use serde_with::{DisplayFromStr, DurationNanoSeconds, serde_as};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[serde_as]
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SimulationStep {
    #[serde_as(as = "DurationNanoSeconds")]
    #[serde(rename = "relative_time_ns")]
    pub relative_time: Duration,
    #[serde(flatten)]
    pub kind: SimulationStepKind,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type", content = "data")]
pub enum SimulationStepKind {
    /// A node put the frame on a cable
    FrameSent(FrameInTransit),
    /// The frame reached a node
    FrameReceived(GenericFrameEvent),
    /// The frame was dropped before reaching its destination
    FrameDropped(FrameDropped),
    /// A datagram was delivered to the local protocol stack of a node
    DatagramDelivered(DatagramEvent),
    /// A datagram was discarded by the IP layer of a node
    DatagramDropped(DatagramDropped),
    /// A TCP connection changed state
    TcpStateChanged(TcpStateChanged),
}

#[serde_as]
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenericFrameEvent {
    #[serde_as(as = "DisplayFromStr")]
    pub frame_id: Uuid,
    pub frame_number: u64,
    pub frame_size_bytes: usize,
    pub frame_kind: FrameKind,
    pub node_id: Arc<str>,
}

#[serde_as]
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FrameInTransit {
    #[serde_as(as = "DisplayFromStr")]
    pub frame_id: Uuid,
    pub frame_number: u64,
    pub frame_size_bytes: usize,
    pub frame_kind: FrameKind,
    pub node_id: Arc<str>,
    pub cable_id: Arc<str>,
}

#[serde_as]
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FrameDropped {
    #[serde_as(as = "DisplayFromStr")]
    pub frame_id: Uuid,
    pub frame_kind: FrameKind,
    pub node_id: Arc<str>,
    pub reason: FrameDropReason,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FrameDropReason {
    /// The cable was blocked by the spanning tree
    CableBlocked,
    /// The destination MAC address belongs to someone else
    NotAddressed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DatagramEvent {
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    pub identification: u16,
    pub protocol: IpProtocol,
    pub node_id: Arc<str>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DatagramDropped {
    #[serde(flatten)]
    pub datagram: DatagramEvent,
    pub reason: DatagramDropReason,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DatagramDropReason {
    TtlExceeded,
    RouteNotFound,
    AddressResolution,
    Firewall,
    /// A node that does not forward received a datagram for someone else
    NotForwarding,
    /// Nobody listens on the destination port
    PortUnreachable,
}

#[serde_as]
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TcpStateChanged {
    pub node_id: Arc<str>,
    #[serde_as(as = "DisplayFromStr")]
    pub local: SocketAddrV4,
    #[serde_as(as = "DisplayFromStr")]
    pub remote: SocketAddrV4,
    pub from: TcpState,
    pub to: TcpState,
}
