use crate::config::cli::CliOpt;
use crate::config::load_topology;
use crate::util::{print_node_stats, print_spanning_tree};
use anyhow::{Context, anyhow};
use fastrand::Rng;
use lan_sim::network::Network;
use lan_sim::pcap_exporter::{
    FileBasedPcapExporterFactory, NoOpPcapExporterFactory, PcapExporterFactory,
};
use lan_sim::stack::IpNode;
use lan_sim::tracing::tracer::SimulationStepTracer;
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// A started network, plus what is needed to report on it afterwards
pub struct Simulation {
    pub network: Arc<Network>,
    pub start: Instant,
}

impl Simulation {
    pub async fn start(options: &CliOpt) -> anyhow::Result<Self> {
        println!("--- Params ---");
        let rng_seed = if options.non_deterministic {
            Rng::new().u64(..)
        } else {
            options.rng_seed
        };
        println!("* Network seed: {rng_seed}");
        println!("* Speed factor: {}", options.speed_factor);
        println!("* Topology path: {}", options.topology.display());

        let spec = load_topology(&options.topology)?;

        let pcap_exporter_factory: Arc<dyn PcapExporterFactory> = match &options.pcap {
            Some(directory) => {
                fs::create_dir_all(directory).with_context(|| {
                    format!("failed to create pcap directory {}", directory.display())
                })?;
                println!("* Pcap directory: {}", directory.display());
                Arc::new(FileBasedPcapExporterFactory {
                    directory: directory.clone(),
                })
            }
            None => Arc::new(NoOpPcapExporterFactory),
        };

        let tracer = Arc::new(SimulationStepTracer::new(pcap_exporter_factory));
        let network = Network::initialize(spec, tracer, Rng::with_seed(rng_seed))?;
        network.set_speed_factor(options.speed_factor)?;

        println!("--- Network ---");
        println!(
            "* {} nodes, {} cables",
            network.nodes().len(),
            network.cables().len()
        );

        let start = Instant::now();
        let spanning_tree = network.start().await.context("failed to start the network")?;
        print_spanning_tree(&spanning_tree);
        println!(
            "{:.2}s Network started",
            start.elapsed().as_secs_f64()
        );

        Ok(Self { network, start })
    }

    pub fn ip_node(&self, id: &str) -> anyhow::Result<&Arc<IpNode>> {
        self.network
            .ip_node(id)
            .ok_or_else(|| anyhow!("there is no host, router or gateway with id `{id}`"))
    }

    /// Sleeps for a simulated duration, honoring the speed factor
    pub async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(self.network.context().scaled(duration)).await;
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    /// Stops the network and stores the replay log (and pcaps, if requested)
    pub async fn finish(self) -> anyhow::Result<()> {
        let stop_result = self.network.stop().await;
        println!("{:.2}s Network stopped", self.elapsed_secs());

        let tracer = self.network.tracer();
        println!("--- Replay log ---");
        let replay_log_path = "replay-log.json";
        let json_steps =
            serde_json::to_vec_pretty(&tracer.steps()).context("failed to serialize replay log")?;
        fs::write(replay_log_path, json_steps).context("failed to store replay log")?;
        println!("* Replay log available at {replay_log_path}");

        tracer.flush_pcaps().context("failed to store pcap files")?;

        print_node_stats(&tracer.stats());

        stop_result.context("failed to stop the network cleanly")
    }
}
