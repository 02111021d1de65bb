use crate::config::cli::RoutesOpt;
use crate::simulation::Simulation;
use anyhow::anyhow;
use lan_sim::network::node::{ForwardsIp, HasNics, LearnsAddresses};
use lan_sim::network::spec::NodeKind;
use std::time::Duration;

pub async fn run(simulation: &Simulation, routes_opt: &RoutesOpt) -> anyhow::Result<()> {
    let node = simulation
        .network
        .node(&routes_opt.node)
        .ok_or_else(|| anyhow!("there is no node with id `{}`", routes_opt.node))?;

    simulation
        .sleep(Duration::from_millis(routes_opt.wait_ms))
        .await;
    println!("{:.2}s Done waiting", simulation.elapsed_secs());

    if node.kind() == NodeKind::Modem {
        println!("* {} is a modem, which has no tables", routes_opt.node);
    }

    if let Some(learner) = node.as_learner() {
        print_sat(&routes_opt.node, learner);
    }

    if let Some(ip_node) = node.as_has_nics() {
        print_ip_tables(&routes_opt.node, ip_node);
    }

    if let Some(forwarder) = node.as_forwarder() {
        print_forwarding_settings(&routes_opt.node, forwarder);
    }

    Ok(())
}

fn print_sat(node_id: &str, learner: &dyn LearnsAddresses) {
    println!("--- Source address table of {node_id} ---");
    for (mac, port) in learner.sat().snapshot() {
        println!("* {mac} -> port {port}");
    }
}

fn print_ip_tables(node_id: &str, ip_node: &dyn HasNics) {
    println!("--- Interfaces of {node_id} ---");
    for nic in ip_node.nics() {
        let address = nic
            .cidr()
            .map(|cidr| cidr.to_string())
            .unwrap_or_else(|| "unaddressed".to_string());
        println!("* eth{} ({}): {address}", nic.index(), nic.mac());
    }

    println!("--- Routing table of {node_id} ---");
    for route in ip_node.routing_table().snapshot() {
        println!("* {route}");
    }

    if let Some(stack) = ip_node.stack() {
        println!("--- ARP cache of {node_id} ---");
        for (ip, mac) in stack.arp_cache() {
            println!("* {ip} -> {mac}");
        }
    }
}

fn print_forwarding_settings(node_id: &str, forwarder: &dyn ForwardsIp) {
    println!("--- Forwarding settings of {node_id} ---");
    println!(
        "* rip: {}",
        if forwarder.rip_enabled() { "on" } else { "off" }
    );
    if let Some(dhcp) = forwarder.dhcp_server() {
        println!(
            "* dhcp server on eth{}: {} - {} ({} reservations)",
            dhcp.interface,
            dhcp.pool_start,
            dhcp.pool_end,
            dhcp.reservations.len()
        );
    }

    let firewall = forwarder.firewall().config();
    if !firewall.enabled {
        println!("* firewall: off");
        return;
    }

    println!(
        "* firewall: default {:?}, syn only: {}, drop icmp: {}",
        firewall.default_action, firewall.syn_only, firewall.drop_icmp
    );
    for (i, rule) in firewall.rules.iter().enumerate() {
        let port = rule
            .port
            .map(|port| port.to_string())
            .unwrap_or_else(|| "*".to_string());
        println!(
            "  {i}. {} -> {} {:?}/{port}: {:?}",
            rule.source, rule.destination, rule.protocol, rule.action
        );
    }
}
