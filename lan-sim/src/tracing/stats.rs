use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Default)]
pub struct NetworkStats {
    pub by_node: BTreeMap<Arc<str>, NodeStats>,
    pub by_cable: BTreeMap<Arc<str>, CableStats>,
}

#[derive(Default)]
pub struct CableStats {
    pub carried: PacketStats,
}

#[derive(Default)]
pub struct NodeStats {
    pub sent: PacketStats,
    pub received: PacketStats,
    pub dropped_frames: u64,
    pub delivered_datagrams: u64,
    pub dropped_datagrams: u64,
}

#[derive(Default)]
pub struct PacketStats {
    pub packets: u64,
    pub bytes: usize,
}

impl PacketStats {
    pub fn track_one(&mut self, size_bytes: usize) {
        self.packets += 1;
        self.bytes += size_bytes;
    }
}
