use std::time::Instant;

use peerdir::{Dht, Testnet};

use clap::Parser;

use tracing::Level;
use tracing_subscriber;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Number of nodes in the local testnet
    #[arg(default_value_t = 10)]
    count: usize,
}

fn main() {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let cli = Cli::parse();

    println!("Starting a testnet of {} nodes ...", cli.count);
    let testnet = Testnet::new(cli.count).expect("failed to start testnet");

    let announcer = Dht::builder()
        .bootstrap(&testnet.bootstrap)
        .build()
        .unwrap();
    let resolver = Dht::builder()
        .bootstrap(&testnet.bootstrap)
        .build()
        .unwrap();

    let address = announcer.local_addr();

    let start = Instant::now();
    announcer
        .announce_user("alice", address)
        .expect("announce_user failed");
    println!("Announced alice -> {} in {:?}", address, start.elapsed());

    let start = Instant::now();
    let resolved = resolver.get_user("alice");
    println!("Resolved alice -> {:?} in {:?}", resolved, start.elapsed());
}
