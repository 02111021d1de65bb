use anyhow::{Context, bail};
use lan_sim::firewall::FirewallConfig;
use lan_sim::network::ip::Ipv4Cidr;
use lan_sim::network::mac::MacAddress;
use lan_sim::network::spec::{
    CableSpec, EndpointSpec, InterfaceSpec, NetworkSpec, NodeKind, NodeSpec,
};
use lan_sim::routing::Route;
use lan_sim::stack::StackConfig;
use lan_sim::stack::dhcp::DhcpServerConfig;
use serde::Deserialize;
use serde_with::{DisplayFromStr, serde_as};
use std::net::Ipv4Addr;
use std::time::Duration;

#[derive(Deserialize, Clone)]
pub struct TopologyJson {
    nodes: Vec<NodeJson>,
    #[serde(default)]
    cables: Vec<CableJson>,
    #[serde(default)]
    timers: TimersJson,
}

#[derive(Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
struct NodeJson {
    id: String,
    #[serde(rename = "type")]
    #[serde(default = "default_node_kind")]
    kind: NodeKindJson,
    #[serde(default)]
    interfaces: Vec<InterfaceJson>,
    #[serde(default)]
    routes: Vec<RouteJson>,
    #[serde(default)]
    firewall: Option<FirewallConfig>,
    #[serde(default)]
    rip: bool,
    #[serde(default)]
    dhcp_server: Option<DhcpServerConfig>,
    /// Only used by switches
    #[serde(default)]
    ports: Option<usize>,
}

fn default_node_kind() -> NodeKindJson {
    NodeKindJson::Host
}

#[derive(Deserialize, Clone, Copy)]
#[serde(rename_all = "camelCase")]
enum NodeKindJson {
    Host,
    Router,
    Gateway,
    Switch,
    Modem,
}

#[serde_as]
#[derive(Deserialize, Clone)]
struct InterfaceJson {
    #[serde_as(as = "Option<DisplayFromStr>")]
    #[serde(default)]
    mac: Option<MacAddress>,
    #[serde_as(as = "Option<DisplayFromStr>")]
    #[serde(default)]
    address: Option<Ipv4Cidr>,
    #[serde(default)]
    gateway: Option<Ipv4Addr>,
    #[serde(default)]
    dns: Option<Ipv4Addr>,
    #[serde(default)]
    dhcp: bool,
}

#[serde_as]
#[derive(Deserialize, Clone)]
struct RouteJson {
    #[serde_as(as = "DisplayFromStr")]
    target: Ipv4Cidr,
    #[serde(default)]
    gateway: Option<Ipv4Addr>,
    /// The address of the output interface
    interface: Ipv4Addr,
    #[serde(default = "default_metric")]
    metric: u32,
}

fn default_metric() -> u32 {
    1
}

#[derive(Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
struct CableJson {
    id: String,
    a: EndpointJson,
    b: EndpointJson,
    /// The propagation delay of the cable, in milliseconds
    #[serde(default)]
    delay_ms: u64,
}

#[derive(Deserialize, Clone)]
struct EndpointJson {
    node: String,
    port: usize,
}

/// Overrides of the protocol timers; anything missing keeps its default
#[derive(Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
struct TimersJson {
    arp_timeout_ms: Option<u64>,
    rip_beacon_interval_ms: Option<u64>,
    rip_route_timeout_ms: Option<u64>,
    tcp_mss: Option<usize>,
    tcp_window_segments: Option<usize>,
    tcp_retransmission_timeout_ms: Option<u64>,
    tcp_max_retransmissions: Option<u32>,
    dhcp_timeout_ms: Option<u64>,
}

impl TryFrom<TopologyJson> for NetworkSpec {
    type Error = anyhow::Error;

    fn try_from(json: TopologyJson) -> anyhow::Result<Self> {
        let nodes = json
            .nodes
            .into_iter()
            .map(|node| {
                let id = node.id.clone();
                NodeSpec::try_from(node).with_context(|| format!("invalid node `{id}`"))
            })
            .collect::<anyhow::Result<_>>()?;

        Ok(NetworkSpec {
            nodes,
            cables: json.cables.into_iter().map(CableSpec::from).collect(),
            config: json.timers.into(),
        })
    }
}

impl TryFrom<NodeJson> for NodeSpec {
    type Error = anyhow::Error;

    fn try_from(json: NodeJson) -> anyhow::Result<Self> {
        let kind = match json.kind {
            NodeKindJson::Host => NodeKind::Host,
            NodeKindJson::Router => NodeKind::Router,
            NodeKindJson::Gateway => NodeKind::Gateway,
            NodeKindJson::Switch => NodeKind::Switch,
            NodeKindJson::Modem => NodeKind::Modem,
        };

        if kind.is_layer2() && !json.interfaces.is_empty() {
            bail!("switches and modems have no network interfaces");
        }
        if !kind.forwards_ip() && (json.rip || json.dhcp_server.is_some() || json.firewall.is_some()) {
            bail!("only routers and gateways run RIP, DHCP servers or firewalls");
        }

        let mut spec = match (kind, json.ports) {
            (NodeKind::Switch, Some(ports)) if ports > 0 => NodeSpec::switch(json.id, ports),
            (NodeKind::Switch, _) => bail!("switches need a positive number of `ports`"),
            (_, Some(_)) => bail!("only switches have a configurable number of ports"),
            (kind, None) => NodeSpec::new(json.id, kind),
        };

        spec.interfaces = json.interfaces.into_iter().map(InterfaceSpec::from).collect();
        spec.routes = json
            .routes
            .into_iter()
            .map(|r| Route::manual(r.target, r.gateway, r.interface, r.metric))
            .collect();
        spec.firewall = json.firewall.unwrap_or_default();
        spec.rip = json.rip;
        spec.dhcp_server = json.dhcp_server;
        Ok(spec)
    }
}

impl From<InterfaceJson> for InterfaceSpec {
    fn from(json: InterfaceJson) -> Self {
        InterfaceSpec {
            mac: json.mac,
            address: json.address,
            gateway: json.gateway,
            dns: json.dns,
            dhcp: json.dhcp,
        }
    }
}

impl From<CableJson> for CableSpec {
    fn from(json: CableJson) -> Self {
        CableSpec {
            id: json.id,
            a: EndpointSpec::new(json.a.node, json.a.port),
            b: EndpointSpec::new(json.b.node, json.b.port),
            delay: Duration::from_millis(json.delay_ms),
        }
    }
}

impl From<TimersJson> for StackConfig {
    fn from(json: TimersJson) -> Self {
        let mut config = StackConfig::default();
        if let Some(ms) = json.arp_timeout_ms {
            config.arp.timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = json.rip_beacon_interval_ms {
            config.rip.beacon_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = json.rip_route_timeout_ms {
            config.rip.route_timeout = Duration::from_millis(ms);
        }
        if let Some(mss) = json.tcp_mss {
            config.tcp.mss = mss;
        }
        if let Some(segments) = json.tcp_window_segments {
            config.tcp.window_segments = segments;
        }
        if let Some(ms) = json.tcp_retransmission_timeout_ms {
            config.tcp.retransmission_timeout = Duration::from_millis(ms);
        }
        if let Some(retransmissions) = json.tcp_max_retransmissions {
            config.tcp.max_retransmissions = retransmissions;
        }
        if let Some(ms) = json.dhcp_timeout_ms {
            config.dhcp.timeout = Duration::from_millis(ms);
        }

        config
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use lan_sim::firewall::FirewallAction;
    use lan_sim::routing::RouteSource;

    fn parse(json: &str) -> anyhow::Result<NetworkSpec> {
        let topology: TopologyJson = serde_json::from_str(json)?;
        topology.try_into()
    }

    #[test]
    fn test_parse_topology() {
        let spec = parse(
            r#"{
                "nodes": [
                    {
                        "id": "pc",
                        "interfaces": [{ "address": "10.0.1.10/24", "gateway": "10.0.1.1" }]
                    },
                    { "id": "sw", "type": "switch", "ports": 4 },
                    {
                        "id": "r",
                        "type": "router",
                        "rip": true,
                        "interfaces": [
                            { "mac": "02:00:00:00:00:01", "address": "10.0.1.1/24" },
                            { "address": "10.0.2.1/24" }
                        ],
                        "routes": [
                            { "target": "192.168.0.0/16", "gateway": "10.0.2.254", "interface": "10.0.2.1" }
                        ],
                        "firewall": {
                            "enabled": true,
                            "defaultAction": "drop",
                            "rules": [
                                { "source": "10.0.1.0/24", "destination": "0.0.0.0/0", "action": "accept" }
                            ]
                        }
                    }
                ],
                "cables": [
                    { "id": "pc-sw", "a": { "node": "pc", "port": 0 }, "b": { "node": "sw", "port": 0 }, "delayMs": 5 }
                ],
                "timers": { "ripBeaconIntervalMs": 10000 }
            }"#,
        )
        .unwrap();

        assert_eq!(spec.nodes.len(), 3);
        assert_eq!(spec.nodes[0].kind, NodeKind::Host);
        assert_eq!(spec.nodes[0].interfaces[0].gateway, Some(Ipv4Addr::new(10, 0, 1, 1)));
        assert_eq!(spec.nodes[1].port_count(), 4);

        let router = &spec.nodes[2];
        assert!(router.rip);
        assert_eq!(router.interfaces[0].mac, Some(MacAddress([2, 0, 0, 0, 0, 1])));
        assert_eq!(router.routes[0].source, RouteSource::Manual);
        assert_eq!(router.routes[0].metric, 1);
        assert_eq!(router.firewall.default_action, FirewallAction::Drop);
        assert!(!router.firewall.syn_only);

        assert_eq!(spec.cables[0].delay, Duration::from_millis(5));
        assert_eq!(spec.config.rip.beacon_interval, Duration::from_secs(10));
        assert_eq!(spec.config.rip.route_timeout, Duration::from_secs(180));
    }

    #[test]
    fn test_reject_invalid_nodes() {
        let switch_without_ports = r#"{ "nodes": [{ "id": "sw", "type": "switch" }] }"#;
        assert!(parse(switch_without_ports).is_err());

        let host_with_rip = r#"{ "nodes": [{ "id": "pc", "rip": true }] }"#;
        let error = parse(host_with_rip).unwrap_err();
        assert!(format!("{error:#}").contains("invalid node `pc`"));

        let bad_address = r#"{ "nodes": [{ "id": "pc", "interfaces": [{ "address": "10.0.0.300/24" }] }] }"#;
        assert!(parse(bad_address).is_err());
    }
}
