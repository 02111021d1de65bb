use lan_sim::switch::spanning_tree::SpanningTree;
use lan_sim::tracing::stats::NetworkStats;
use std::sync::Arc;

fn join(ids: &[Arc<str>]) -> String {
    if ids.is_empty() {
        return "none".to_string();
    }

    ids.iter().map(|id| id.as_ref()).collect::<Vec<_>>().join(", ")
}

pub fn print_spanning_tree(tree: &SpanningTree) {
    println!("--- Spanning tree ---");
    println!("* Roots: {}", join(&tree.roots));
    println!("* Active cables: {}", join(&tree.active));
    println!("* Blocked cables: {}", join(&tree.blocked));
}

pub fn print_node_stats(stats: &NetworkStats) {
    println!("--- Node stats ---");
    for (node_id, stats) in &stats.by_node {
        println!("* {node_id}");
        println!(
            "  * Sent frames: {} ({} bytes)",
            stats.sent.packets, stats.sent.bytes
        );
        println!(
            "  * Received frames: {} ({} bytes)",
            stats.received.packets, stats.received.bytes
        );
        println!(
            "    | {} frames dropped, {} datagrams delivered, {} datagrams dropped",
            stats.dropped_frames, stats.delivered_datagrams, stats.dropped_datagrams
        );
    }

    if !stats.by_cable.is_empty() {
        println!("--- Cable stats ---");
    }
    for (cable_id, stats) in &stats.by_cable {
        println!(
            "* {cable_id}: {} frames carried ({} bytes)",
            stats.carried.packets, stats.carried.bytes
        );
    }
}
