use std::{net::IpAddr, str::FromStr, time::Duration};

use kadnode::{Dht, Id};

use clap::Parser;

use tracing::Level;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Port to listen on, a random one if taken
    #[arg(short, long)]
    port: Option<u16>,
    /// Local ip to bind to
    #[arg(long, default_value = "0.0.0.0")]
    bind: IpAddr,
    /// Bootstrap nodes, as host:port
    #[arg(short, long)]
    bootstrap: Vec<String>,
    /// Network id shared by all nodes of the network
    #[arg(short, long, default_value = kadnode::rpc::DEFAULT_NETWORK_ID)]
    network: String,
    /// Node id as 40 hex characters, random if missing
    #[arg(long)]
    id: Option<String>,
    /// Seconds between lookups for a random target
    #[arg(short, long, default_value_t = 30)]
    interval: u64,
}

fn main() {
    tracing_subscriber::fmt()
        // Switch to TRACE to see every message sent and received
        .with_max_level(Level::DEBUG)
        .init();

    let cli = Cli::parse();

    let mut builder = Dht::builder()
        .bind_address(cli.bind)
        .network_id(&cli.network)
        .bootstrap(&cli.bootstrap);

    if let Some(port) = cli.port {
        builder = builder.port(port);
    }
    if let Some(id) = cli.id {
        builder = builder.id(Id::from_str(&id).expect("Expected 40 hex characters"));
    }

    let dht = builder.build().expect("Failed to create node");

    println!("Node {} listening on {}", dht.id(), dht.local_addr());

    if !cli.bootstrap.is_empty() {
        println!("Bootstrapped: {}", dht.bootstrap());
    }

    let (tx_interrupted, rx_interrupted) = flume::bounded::<()>(1);

    ctrlc::set_handler(move || {
        println!();
        println!("Received Ctrl+C! Shutting down...");
        let _ = tx_interrupted.send(());
    })
    .expect("Error setting Ctrl-C handler");

    let interval = Duration::from_secs(cli.interval.max(1));

    while let Err(flume::RecvTimeoutError::Timeout) = rx_interrupted.recv_timeout(interval) {
        let target = Id::random();
        let closest = dht.find_node(target);

        let info = dht.info();
        println!(
            "Lookup for {target} found {} nodes. Routing table: {}, pings: {}, find_nodes: {}, rejected: {}",
            closest.len(),
            info.routing_table_size(),
            info.pings(),
            info.find_nodes(),
            info.rejected(),
        );
    }
}
