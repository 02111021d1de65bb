use crate::config::cli::{CliOpt, Command};
use crate::simulation::Simulation;
use clap::Parser;

mod config;
mod ping;
mod routes;
mod simulation;
mod tcp_echo;
mod util;

fn main() -> anyhow::Result<()> {
    let options = CliOpt::parse();

    // Simulated time only advances when every task is idle, so runs are deterministic and do not
    // take wall-clock time
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()?;

    rt.block_on(run(options))
}

async fn run(options: CliOpt) -> anyhow::Result<()> {
    let simulation = Simulation::start(&options).await?;

    let result = match &options.command {
        Command::Ping(ping_opt) => ping::run(&simulation, ping_opt).await,
        Command::TcpEcho(echo_opt) => tcp_echo::run(&simulation, echo_opt).await,
        Command::Routes(routes_opt) => routes::run(&simulation, routes_opt).await,
    };

    // The replay log is most useful when something went wrong, so it is stored regardless
    let finished = simulation.finish().await;
    result?;
    finished
}
