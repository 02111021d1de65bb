use crate::config::cli::PingOpt;
use crate::simulation::Simulation;
use lan_sim::stack::icmp::PingOptions;
use std::time::Duration;

pub async fn run(simulation: &Simulation, ping_opt: &PingOpt) -> anyhow::Result<()> {
    let node = simulation.ip_node(&ping_opt.from)?;
    let options = PingOptions {
        ttl: ping_opt.ttl,
        timeout: Duration::from_millis(ping_opt.timeout_ms),
        ..PingOptions::default()
    };

    println!("--- Ping ---");
    println!("* {} -> {}", ping_opt.from, ping_opt.to);

    let mut received = 0;
    let mut round_trips = Vec::new();
    for i in 0..ping_opt.count {
        if i > 0 {
            simulation
                .sleep(Duration::from_millis(ping_opt.interval_ms))
                .await;
        }

        let sent = simulation.elapsed_secs();
        match node.ping(ping_opt.to, options.clone()).await {
            Ok(reply) => {
                received += 1;
                round_trips.push(reply.round_trip);
                println!(
                    "{sent:.2}s - SENT | {:.2}s - REPLY from {} (seq={}, ttl={}) | {:.2}ms - DURATION",
                    simulation.elapsed_secs(),
                    reply.responder,
                    reply.sequence,
                    reply.ttl,
                    reply.round_trip.as_secs_f64() * 1000.0,
                );
            }
            Err(e) => {
                println!(
                    "{sent:.2}s - SENT | {:.2}s - FAILED | {e}",
                    simulation.elapsed_secs()
                );
            }
        }
    }

    let lost = ping_opt.count - received;
    println!(
        "* {} sent, {received} received, {lost} lost",
        ping_opt.count
    );
    if let (Some(min), Some(max)) = (round_trips.iter().min(), round_trips.iter().max()) {
        let average = round_trips.iter().sum::<Duration>() / round_trips.len() as u32;
        println!(
            "* Round trip min/avg/max: {:.2}/{:.2}/{:.2} ms",
            min.as_secs_f64() * 1000.0,
            average.as_secs_f64() * 1000.0,
            max.as_secs_f64() * 1000.0,
        );
    }

    Ok(())
}
