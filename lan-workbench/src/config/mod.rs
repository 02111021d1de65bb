use crate::config::topology::TopologyJson;
use anyhow::Context;
use lan_sim::network::spec::NetworkSpec;
use std::fs;
use std::path::Path;

pub mod cli;
pub mod topology;

pub fn load_topology(path: &Path) -> anyhow::Result<NetworkSpec> {
    let json = fs::read_to_string(path)
        .with_context(|| format!("failed to read topology file at {}", path.display()))?;
    let topology: TopologyJson = serde_json::from_str(&json)
        .with_context(|| format!("invalid JSON in topology file at {}", path.display()))?;
    NetworkSpec::try_from(topology).with_context(|| format!("invalid topology in {}", path.display()))
}

#[cfg(test)]
mod test {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_bundled_topologies_are_valid() {
        let directory = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("topologies");
        for name in ["two-subnets.json", "rip-ring.json"] {
            let spec = load_topology(&directory.join(name)).unwrap();
            assert!(!spec.nodes.is_empty());
            assert!(!spec.cables.is_empty());
        }
    }
}
