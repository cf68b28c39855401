//! Dht node.

use std::net::SocketAddrV4;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use crate::common::{Id, Node};
use crate::rpc::{AnnounceError, Config, Rpc};

/// A peer-to-peer user directory node.
///
/// Cheap to clone and safe to share between threads. The node keeps serving
/// requests until the last clone is dropped or [Dht::shutdown] is called.
#[derive(Debug, Clone)]
pub struct Dht(Arc<Inner>);

#[derive(Debug)]
struct Inner {
    rpc: Arc<Rpc>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Dht {
    /// Returns a builder to configure a node before starting it.
    pub fn builder() -> DhtBuilder {
        DhtBuilder::default()
    }

    /// Creates a new Dht node with default configurations.
    pub fn new() -> Result<Dht, std::io::Error> {
        Dht::builder().build()
    }

    pub(crate) fn with_config(config: Config) -> Result<Dht, std::io::Error> {
        let rpc = Arc::new(Rpc::new(&config)?);
        let threads = rpc.serve();

        Ok(Dht(Arc::new(Inner {
            rpc,
            threads: Mutex::new(threads),
        })))
    }

    // === Getters ===

    /// Returns this node's id, derived from the address it is listening to.
    pub fn id(&self) -> Id {
        self.0.rpc.id()
    }

    /// Returns the address the node is listening to.
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.0.rpc.local_addr()
    }

    /// Returns a snapshot of the nodes currently in the routing table.
    pub fn nodes(&self) -> Vec<Node> {
        self.0.rpc.routing_table().to_vec()
    }

    // === Public Methods ===

    /// Pings the node at the given address, returning whether it answered
    /// in time.
    pub fn ping(&self, address: SocketAddrV4) -> bool {
        self.0.rpc.ping(address)
    }

    /// Finds the closest reachable nodes to the target id.
    pub fn find_node(&self, target: Id) -> Vec<Node> {
        self.0.rpc.lookup(target).into_iter().collect()
    }

    /// Fills the routing table by looking up this node's own id through its
    /// bootstrap nodes.
    pub fn bootstrap(&self) {
        self.0.rpc.populate()
    }

    /// Announces that the username resolves to the given address, storing
    /// the record at the closest nodes to the username's id.
    pub fn announce_user(
        &self,
        username: &str,
        address: SocketAddrV4,
    ) -> Result<Id, AnnounceError> {
        self.0.rpc.announce_user(username, address)
    }

    /// Resolves a previously announced username, or None if no node close
    /// to the username's id knows it.
    pub fn get_user(&self, username: &str) -> Option<SocketAddrV4> {
        self.0.rpc.get_user(username)
    }

    /// Stops serving requests and waits for the node's threads to exit.
    pub fn shutdown(&self) {
        self.0.rpc.initiate_shutdown();

        for handle in self.0.threads.lock().drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.rpc.initiate_shutdown();

        for handle in self.threads.lock().drain(..) {
            let _ = handle.join();
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct DhtBuilder(Config);

impl DhtBuilder {
    /// Set bootstrapping nodes.
    pub fn bootstrap(mut self, bootstrap: &[Node]) -> Self {
        self.0.bootstrap = bootstrap.to_vec();
        self
    }

    /// Set the port to listen on.
    pub fn port(mut self, port: u16) -> Self {
        self.0.port = Some(port);
        self
    }

    /// Set the duration a request awaits a response before it is retried
    /// or abandoned.
    pub fn request_timeout(mut self, request_timeout: Duration) -> Self {
        self.0.request_timeout = request_timeout;
        self
    }

    /// Set how many times an unanswered request is resent before the
    /// queried node is considered unresponsive.
    pub fn max_retries(mut self, max_retries: usize) -> Self {
        self.0.max_retries = max_retries;
        self
    }

    /// Create the Dht node and start serving requests.
    pub fn build(&self) -> Result<Dht, std::io::Error> {
        Dht::with_config(self.0.clone())
    }
}

/// A local network of Dht nodes, wired through the first node.
#[derive(Debug)]
pub struct Testnet {
    pub bootstrap: Vec<Node>,
    pub nodes: Vec<Dht>,
}

impl Testnet {
    pub fn new(count: usize) -> Result<Testnet, std::io::Error> {
        let mut nodes: Vec<Dht> = vec![];
        let mut bootstrap = vec![];

        for i in 0..count {
            if i == 0 {
                let node = Dht::builder().build()?;

                bootstrap.push(Node::new(node.id(), node.local_addr()));
                nodes.push(node);
            } else {
                let node = Dht::builder().bootstrap(&bootstrap).build()?;

                // The self lookup introduces this node to everyone it visits.
                node.bootstrap();
                nodes.push(node);
            }
        }

        Ok(Testnet { bootstrap, nodes })
    }
}
