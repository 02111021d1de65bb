use clap::{Parser, Subcommand};
use std::net::Ipv4Addr;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
pub struct CliOpt {
    /// Path to the JSON file describing the nodes and cables of the network
    #[arg(long)]
    pub topology: PathBuf,

    /// Multiplier applied to every simulated delay and timeout (e.g. 0.5 runs twice as fast)
    #[arg(long, default_value_t = 1.0)]
    pub speed_factor: f64,

    /// The random seed used for the simulated network (governing generated MAC addresses, TCP
    /// initial sequence numbers and DHCP transaction ids)
    #[arg(long, default_value_t = 42)]
    pub rng_seed: u64,

    /// Whether the run should be non-deterministic, i.e. using a non-constant seed for the random
    /// number generator
    #[arg(long)]
    pub non_deterministic: bool,

    /// Directory where one pcap file per node will be stored
    #[arg(long)]
    pub pcap: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Send ICMP echo requests from one node to an address
    Ping(PingOpt),
    /// Transfer bytes to a TCP echo server and wait for them to come back
    TcpEcho(TcpEchoOpt),
    /// Let the simulation run for a while and print the routing table of a node
    Routes(RoutesOpt),
}

#[derive(Parser, Debug, Clone)]
pub struct PingOpt {
    /// The id of the node sending the echo requests
    #[arg(long)]
    pub from: String,

    /// The destination address
    #[arg(long)]
    pub to: Ipv4Addr,

    #[arg(long, default_value_t = 4)]
    pub count: u32,

    /// The interval between two echo requests
    #[arg(long, default_value_t = 1000)]
    pub interval_ms: u64,

    #[arg(long, default_value_t = 64)]
    pub ttl: u8,

    /// The time to wait for each reply (after which the request is considered lost)
    #[arg(long, default_value_t = 2000)]
    pub timeout_ms: u64,
}

#[derive(Parser, Debug, Clone)]
pub struct TcpEchoOpt {
    /// The id of the node opening the connection
    #[arg(long)]
    pub client: String,

    /// The id of the node running the echo server
    #[arg(long)]
    pub server: String,

    /// The address the client connects to (defaults to the first address of the server node)
    #[arg(long)]
    pub server_ip: Option<Ipv4Addr>,

    #[arg(long, default_value_t = 7)]
    pub port: u16,

    /// The number of bytes sent by the client
    #[arg(long, default_value_t = 10_000)]
    pub bytes: usize,
}

#[derive(Parser, Debug, Clone)]
pub struct RoutesOpt {
    /// The id of the node whose tables are printed
    #[arg(long)]
    pub node: String,

    /// How long to let the simulation run before printing (e.g. to let RIP converge)
    #[arg(long, default_value_t = 0)]
    pub wait_ms: u64,
}
