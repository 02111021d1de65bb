//! Loop prevention for layer-2 forwarders
//!
//! The tree is computed once when the network starts. Each connected component of bridges gets
//! its own root (the bridge with the lowest id) and is explored breadth-first, visiting links in
//! order of cable id. Every link that would close a cycle is blocked.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::sync::Arc;

/// A cable between two layer-2 forwarders
#[derive(Clone, Debug)]
pub struct BridgeLink {
    pub cable_id: Arc<str>,
    pub a: Arc<str>,
    pub b: Arc<str>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SpanningTree {
    /// One root per connected component
    pub roots: Vec<Arc<str>>,
    pub active: Vec<Arc<str>>,
    pub blocked: Vec<Arc<str>>,
}

impl SpanningTree {
    pub fn compute(bridges: &[Arc<str>], links: &[BridgeLink]) -> SpanningTree {
        let bridges: BTreeSet<_> = bridges.iter().cloned().collect();

        // Adjacency lists, sorted by cable id
        let mut sorted_links: Vec<_> = links.iter().collect();
        sorted_links.sort_by(|x, y| x.cable_id.cmp(&y.cable_id));
        let mut adjacent: BTreeMap<&Arc<str>, Vec<&BridgeLink>> = BTreeMap::new();
        for link in &sorted_links {
            adjacent.entry(&link.a).or_default().push(link);
            if link.a != link.b {
                adjacent.entry(&link.b).or_default().push(link);
            }
        }

        let mut tree = SpanningTree::default();
        let mut visited: HashSet<&Arc<str>> = HashSet::new();
        let mut classified: HashSet<&Arc<str>> = HashSet::new();
        for root in &bridges {
            if visited.contains(root) {
                continue;
            }

            tree.roots.push(root.clone());
            visited.insert(root);
            let mut queue = VecDeque::from([root]);
            while let Some(current) = queue.pop_front() {
                for link in adjacent.get(current).into_iter().flatten() {
                    if !classified.insert(&link.cable_id) {
                        continue;
                    }

                    let other = if &link.a == current { &link.b } else { &link.a };
                    if visited.insert(other) {
                        tree.active.push(link.cable_id.clone());
                        queue.push_back(other);
                    } else {
                        // Either a self-loop or a second path to an already reached bridge
                        tree.blocked.push(link.cable_id.clone());
                    }
                }
            }
        }

        // Links towards unknown bridges are left alone
        tree
    }

    pub fn is_blocked(&self, cable_id: &str) -> bool {
        self.blocked.iter().any(|id| id.as_ref() == cable_id)
    }
}
