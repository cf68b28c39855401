use std::net::SocketAddrV4;
use std::str::FromStr;
use std::thread;
use std::time::Duration;

use peerdir::{Dht, Id, Node};

use clap::Parser;

use tracing::Level;
use tracing_subscriber;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Username to announce from this node
    username: String,

    /// Port to listen on
    #[arg(long)]
    port: Option<u16>,

    /// Bootstrap node as `<hex id>@<ip>:<port>`, repeatable
    #[arg(long)]
    bootstrap: Vec<String>,
}

fn main() {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let cli = Cli::parse();

    let bootstrap: Vec<Node> = cli
        .bootstrap
        .iter()
        .map(|node| {
            parse_node(node).expect("invalid bootstrap node, expected <hex id>@<ip>:<port>")
        })
        .collect();

    let mut builder = Dht::builder().bootstrap(&bootstrap);
    if let Some(port) = cli.port {
        builder = builder.port(port);
    }

    let dht = builder.build().expect("failed to start the node");

    println!("Listening on {} with id {}", dht.local_addr(), dht.id());

    if !bootstrap.is_empty() {
        dht.bootstrap();
        println!("Routing table has {} nodes", dht.nodes().len());
    }

    let address = dht.local_addr();
    match dht.announce_user(&cli.username, address) {
        Ok(target) => println!("Announced {} -> {} under {}", cli.username, address, target),
        Err(error) => println!("Could not announce {}: {}", cli.username, error),
    }

    println!("Serving the directory, press Ctrl+C to stop.");

    loop {
        thread::sleep(Duration::from_secs(30));
        println!(
            "{} nodes in the routing table, {} resolves to {:?}",
            dht.nodes().len(),
            cli.username,
            dht.get_user(&cli.username)
        );
    }
}

fn parse_node(node: &str) -> Option<Node> {
    let (id, address) = node.split_once('@')?;

    Some(Node::new(
        Id::from_str(id).ok()?,
        SocketAddrV4::from_str(address).ok()?,
    ))
}
