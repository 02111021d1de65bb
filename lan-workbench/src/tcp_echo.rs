use crate::config::cli::TcpEchoOpt;
use crate::simulation::Simulation;
use anyhow::{Context, anyhow, bail};
use std::net::{Ipv4Addr, SocketAddrV4};

pub async fn run(simulation: &Simulation, echo_opt: &TcpEchoOpt) -> anyhow::Result<()> {
    let client = simulation.ip_node(&echo_opt.client)?;
    let server = simulation.ip_node(&echo_opt.server)?;

    let server_ip = match echo_opt.server_ip {
        Some(ip) => ip,
        None => server
            .nics()
            .iter()
            .find_map(|nic| nic.ip())
            .ok_or_else(|| anyhow!("node `{}` has no address", echo_opt.server))?,
    };

    println!("--- TCP echo ---");
    let mut listener = server
        .tcp_listen(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, echo_opt.port))
        .context("failed to start the echo server")?;
    let server_task = tokio::spawn(async move {
        let mut stream = listener.accept().await?;
        let data = stream.read_to_end().await?;
        stream.write(data)?;
        stream.close();
        stream.closed().await
    });

    let payload: Vec<u8> = (0..echo_opt.bytes).map(|i| i as u8).collect();
    let start = simulation.elapsed_secs();
    let mut stream = client
        .tcp_connect(SocketAddrV4::new(server_ip, echo_opt.port))
        .await
        .context("failed to connect to the echo server")?;
    println!(
        "{:.2}s Connected {} -> {}",
        simulation.elapsed_secs(),
        stream.local_addr(),
        stream.peer_addr()
    );

    stream.write(payload.clone())?;
    stream.close();
    let echoed = stream
        .read_to_end()
        .await
        .context("failed to read the echoed data")?;
    stream.closed().await.context("failed to close the connection")?;

    server_task
        .await
        .context("server task crashed")?
        .context("server task errored")?;

    if echoed != payload {
        bail!(
            "echoed data does not match (sent {} bytes, got {} bytes back)",
            payload.len(),
            echoed.len()
        );
    }

    let elapsed = simulation.elapsed_secs() - start;
    println!(
        "{:.2}s Echoed {} bytes in {elapsed:.2}s",
        simulation.elapsed_secs(),
        echoed.len()
    );

    Ok(())
}
