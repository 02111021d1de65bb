use crate::network::mac::MacAddress;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use tokio::sync::broadcast;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SatChange {
    Learned { mac: MacAddress, port: usize },
    Moved { mac: MacAddress, from: usize, to: usize },
    Cleared,
}

/// The source address table of a learning bridge: which port each MAC address was last seen on
///
/// Entries never age out; a MAC seen on a different port overwrites the previous entry.
pub struct SourceAddressTable {
    entries: RwLock<BTreeMap<MacAddress, usize>>,
    changes: broadcast::Sender<SatChange>,
}

impl SourceAddressTable {
    pub(crate) fn new() -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            entries: RwLock::default(),
            changes,
        }
    }

    pub(crate) fn learn(&self, mac: MacAddress, port: usize) {
        let previous = self.entries.write().insert(mac, port);
        let change = match previous {
            None => SatChange::Learned { mac, port },
            Some(from) if from != port => SatChange::Moved { mac, from, to: port },
            Some(_) => return,
        };

        self.changes.send(change).ok();
    }

    pub(crate) fn clear(&self) {
        self.entries.write().clear();
        self.changes.send(SatChange::Cleared).ok();
    }

    pub fn port_of(&self, mac: MacAddress) -> Option<usize> {
        self.entries.read().get(&mac).copied()
    }

    /// A read-only copy of the table, sorted by MAC address
    pub fn snapshot(&self) -> Vec<(MacAddress, usize)> {
        self.entries
            .read()
            .iter()
            .map(|(mac, port)| (*mac, *port))
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SatChange> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_learning_overwrites_previous_port() {
        let sat = SourceAddressTable::new();
        let mut changes = sat.subscribe();
        let mac = MacAddress([2, 0, 0, 0, 0, 0xaa]);

        sat.learn(mac, 2);
        assert_eq!(sat.port_of(mac), Some(2));

        // Seeing the same port again is not a change
        sat.learn(mac, 2);

        sat.learn(mac, 5);
        assert_eq!(sat.port_of(mac), Some(5));
        assert_eq!(sat.snapshot(), vec![(mac, 5)]);

        assert_eq!(changes.try_recv().unwrap(), SatChange::Learned { mac, port: 2 });
        assert_eq!(
            changes.try_recv().unwrap(),
            SatChange::Moved {
                mac,
                from: 2,
                to: 5
            }
        );
        assert!(changes.try_recv().is_err());

        sat.clear();
        assert_eq!(sat.port_of(mac), None);
        assert_eq!(changes.try_recv().unwrap(), SatChange::Cleared);
    }
}
