//! RPC engine: the node's outgoing queries and incoming request handlers.

mod closest_nodes;
mod config;
mod lookup;
mod socket;

use std::net::SocketAddrV4;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::common::{
    AnnounceUserRequestArguments, ErrorSpecific, FindNodeRequestArguments,
    FindNodeResponseArguments, GetUserRequestArguments, GetUserResponseArguments, Id, Message,
    MessageType, Node, PingResponseArguments, RequestSpecific, RequestTypeSpecific,
    ResponseSpecific, RoutingTable, MAX_BUCKET_SIZE_K,
};

pub use closest_nodes::ClosestNodes;
pub use config::Config;
pub use socket::{
    CallError, RpcSocket, SendMessageError, DEFAULT_MAX_RETRIES, DEFAULT_PORT,
    DEFAULT_REQUEST_TIMEOUT,
};

use lookup::lookup;

/// Max concurrent find-node queries per lookup.
pub const ALPHA: usize = 3;

/// Number of threads answering incoming requests.
const REQUEST_WORKER_THREADS: usize = 4;

/// Max user records stored by one node.
const MAX_USER_RECORDS: usize = 2000;

/// Max incoming requests queued while all handler threads are busy.
const MAX_PENDING_REQUESTS: usize = 1024;

/// Max username length in bytes accepted for storage.
const MAX_USERNAME_LENGTH: usize = 255;

#[derive(Debug)]
pub struct Rpc {
    id: Id,
    address: SocketAddrV4,
    socket: Arc<RpcSocket>,
    routing_table: RoutingTable,
    users: Mutex<LruCache<String, SocketAddrV4>>,

    shutdown: AtomicBool,
}

impl Rpc {
    pub fn new(config: &Config) -> Result<Self, std::io::Error> {
        let socket = Arc::new(RpcSocket::new(config)?);

        let address = socket.local_addr();
        let id = Id::from_address(&address);

        let routing_table = RoutingTable::new(id);

        // Bootstrap nodes are taken as given. The table is empty, so nothing
        // needs probing.
        for node in &config.bootstrap {
            routing_table.add(node.clone(), |_| true);
        }

        Ok(Rpc {
            id,
            address,
            socket,
            routing_table,
            users: Mutex::new(LruCache::new(
                NonZeroUsize::new(MAX_USER_RECORDS).expect("MAX_USER_RECORDS is non-zero"),
            )),
            shutdown: AtomicBool::new(false),
        })
    }

    // === Getters ===

    #[inline]
    pub fn id(&self) -> Id {
        self.id
    }

    /// Returns the address the node is listening to.
    #[inline]
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.address
    }

    pub fn routing_table(&self) -> &RoutingTable {
        &self.routing_table
    }

    // === Public Methods ===

    /// Spawns the listener thread and the request handler threads, and
    /// returns their join handles.
    ///
    /// The listener routes responses to blocked callers and queues requests
    /// for the handlers, so it must never block on either.
    pub fn serve(self: &Arc<Self>) -> Vec<thread::JoinHandle<()>> {
        let (requests_sender, requests_receiver) =
            flume::bounded::<(SocketAddrV4, u16, RequestSpecific)>(MAX_PENDING_REQUESTS);

        let mut handles = Vec::with_capacity(REQUEST_WORKER_THREADS + 1);

        let rpc = self.clone();
        handles.push(thread::spawn(move || rpc.listen(requests_sender)));

        for _ in 0..REQUEST_WORKER_THREADS {
            let rpc = self.clone();
            let requests_receiver = requests_receiver.clone();

            handles.push(thread::spawn(move || {
                while let Ok((from, transaction_id, request)) = requests_receiver.recv() {
                    rpc.handle_request(from, transaction_id, &request);
                }
            }));
        }

        handles
    }

    /// Pings the node at the given address, returning whether it answered
    /// with a well formed pong in time.
    pub fn ping(&self, address: SocketAddrV4) -> bool {
        let request = RequestSpecific {
            requester_id: self.id,
            requester_address: self.address,
            request_type: RequestTypeSpecific::Ping,
        };

        match self.socket.call(address, request) {
            Ok(message) => matches!(
                message.message_type,
                MessageType::Response(ResponseSpecific::Ping(_))
            ),
            Err(_) => false,
        }
    }

    /// Finds the closest reachable nodes to the target.
    pub fn lookup(&self, target: Id) -> ClosestNodes {
        lookup(self, target)
    }

    /// Populates the routing table by looking up this node's own id.
    pub fn populate(&self) {
        self.lookup(self.id);

        let table_size = self.routing_table.size();
        if table_size == 0 {
            error!("Could not bootstrap the routing table");
        } else {
            debug!(table_size, "Populated the routing table");
        }
    }

    /// Stores the username and the address it resolves to at the closest
    /// nodes to the username's id.
    ///
    /// Returns the id the record was stored under, as long as at least one
    /// node acknowledged it.
    pub fn announce_user(
        &self,
        username: &str,
        address: SocketAddrV4,
    ) -> Result<Id, AnnounceError> {
        if username.len() > MAX_USERNAME_LENGTH {
            return Err(AnnounceError::UsernameTooLong);
        }

        let target = Id::from_username(username);
        let closest = self.lookup(target);

        if closest.is_empty() {
            return Err(AnnounceError::NoClosestNodes);
        }

        let (results_sender, results_receiver) = flume::bounded::<bool>(closest.len());

        for node in &closest {
            let socket = self.socket.clone();
            let to = node.address;
            let request = RequestSpecific {
                requester_id: self.id,
                requester_address: self.address,
                request_type: RequestTypeSpecific::AnnounceUser(AnnounceUserRequestArguments {
                    username: username.to_string(),
                    address,
                }),
            };
            let results_sender = results_sender.clone();

            thread::spawn(move || {
                let acked = matches!(
                    socket.call(to, request),
                    Ok(Message {
                        message_type: MessageType::Response(ResponseSpecific::Ping(_)),
                        ..
                    })
                );

                let _ = results_sender.send(acked);
            });
        }

        drop(results_sender);

        let acks = results_receiver.iter().filter(|acked| *acked).count();

        debug!(?target, acks, nodes = closest.len(), "Announced user");

        if acks > 0 {
            Ok(target)
        } else {
            Err(AnnounceError::NoAcknowledgment)
        }
    }

    /// Resolves a username to the address it was announced from, or None
    /// if no node close to the username's id knows it.
    pub fn get_user(&self, username: &str) -> Option<SocketAddrV4> {
        let target = Id::from_username(username);
        let closest = self.lookup(target);

        if closest.is_empty() {
            return None;
        }

        let (results_sender, results_receiver) =
            flume::bounded::<Option<SocketAddrV4>>(closest.len());

        for node in &closest {
            let socket = self.socket.clone();
            let to = node.address;
            let request = RequestSpecific {
                requester_id: self.id,
                requester_address: self.address,
                request_type: RequestTypeSpecific::GetUser(GetUserRequestArguments {
                    username: username.to_string(),
                }),
            };
            let results_sender = results_sender.clone();

            thread::spawn(move || {
                let reply = socket
                    .call(to, request)
                    .ok()
                    .and_then(|response| response.get_user_address());

                let _ = results_sender.send(reply);
            });
        }

        drop(results_sender);

        // First resolved address wins, remaining workers die on disconnect.
        for reply in results_receiver.iter() {
            if let Some(address) = reply {
                return Some(address);
            }
        }

        None
    }

    pub(crate) fn initiate_shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    // === Private Methods ===

    fn listen(&self, requests_sender: flume::Sender<(SocketAddrV4, u16, RequestSpecific)>) {
        info!(address = ?self.address, id = ?self.id, "Node listening");

        while !self.shutdown.load(Ordering::Relaxed) {
            let Some((message, from)) = self.socket.recv_from() else {
                continue;
            };

            match message.message_type {
                MessageType::Request(request) => {
                    if requests_sender
                        .try_send((from, message.transaction_id, request))
                        .is_err()
                    {
                        debug!(?from, "Request queue full, dropping request");
                    }
                }
                MessageType::Response(_) | MessageType::Error(_) => {
                    self.socket.route_response(message, from);
                }
            }
        }
    }

    fn handle_request(&self, from: SocketAddrV4, transaction_id: u16, request: &RequestSpecific) {
        // Every caller is a fresh contact, record it before answering.
        self.record_contact(request.requester_id, request.requester_address);

        match &request.request_type {
            RequestTypeSpecific::Ping => {
                self.socket.response(
                    from,
                    transaction_id,
                    ResponseSpecific::Ping(PingResponseArguments {
                        responder_id: self.id,
                    }),
                );
            }
            RequestTypeSpecific::FindNode(FindNodeRequestArguments { target }) => {
                self.socket.response(
                    from,
                    transaction_id,
                    ResponseSpecific::FindNode(FindNodeResponseArguments {
                        responder_id: self.id,
                        nodes: self
                            .routing_table
                            .closest(MAX_BUCKET_SIZE_K, *target)
                            .nodes()
                            .to_vec(),
                    }),
                );
            }
            RequestTypeSpecific::AnnounceUser(AnnounceUserRequestArguments {
                username,
                address,
            }) => {
                if username.len() > MAX_USERNAME_LENGTH {
                    self.socket.error(
                        from,
                        transaction_id,
                        ErrorSpecific {
                            code: 205,
                            description: "Username too long.".to_string(),
                        },
                    );
                    return;
                }

                self.users.lock().put(username.clone(), *address);

                debug!(%username, ?address, "Stored user record");

                self.socket.response(
                    from,
                    transaction_id,
                    ResponseSpecific::Ping(PingResponseArguments {
                        responder_id: self.id,
                    }),
                );
            }
            RequestTypeSpecific::GetUser(GetUserRequestArguments { username }) => {
                let record = self.users.lock().get(username).copied();

                self.socket.response(
                    from,
                    transaction_id,
                    match record {
                        Some(address) => ResponseSpecific::GetUser(GetUserResponseArguments {
                            responder_id: self.id,
                            address,
                        }),
                        // An unknown username gets a bare acknowledgement.
                        None => ResponseSpecific::Ping(PingResponseArguments {
                            responder_id: self.id,
                        }),
                    },
                );
            }
        }
    }

    /// Adds the caller of an incoming request to the routing table,
    /// probing the least recently seen node of a full bucket first.
    fn record_contact(&self, id: Id, address: SocketAddrV4) {
        self.routing_table
            .add(Node::new(id, address), |probed| self.ping(probed));
    }
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum AnnounceError {
    /// The lookup found no nodes to store the record at.
    #[error("Could not find any nodes close to the user id")]
    NoClosestNodes,

    /// No node acknowledged storing the record.
    #[error("No node acknowledged storing the user record")]
    NoAcknowledgment,

    #[error("Username is too long to be stored")]
    UsernameTooLong,
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;

    fn test_config() -> Config {
        Config {
            request_timeout: Duration::from_millis(200),
            max_retries: 1,
            ..Default::default()
        }
    }

    fn loopback(address: SocketAddrV4) -> SocketAddrV4 {
        SocketAddrV4::new([127, 0, 0, 1].into(), address.port())
    }

    #[test]
    fn ping_records_the_caller() {
        let server = Arc::new(Rpc::new(&test_config()).unwrap());
        server.serve();

        let client = Arc::new(Rpc::new(&test_config()).unwrap());
        client.serve();

        assert!(client.ping(loopback(server.local_addr())));

        // The handler records the caller before responding, so by the time
        // the pong arrives the contact is in the table.
        let nodes = server.routing_table().to_vec();
        assert!(nodes.iter().any(|node| node.id == client.id()));

        // The response alone teaches the client nothing about the server.
        assert!(client.routing_table().is_empty());

        server.initiate_shutdown();
        client.initiate_shutdown();
    }

    #[test]
    fn ping_to_a_dead_address_fails() {
        let client = Arc::new(Rpc::new(&test_config()).unwrap());
        client.serve();

        // A bound socket nobody serves swallows the request.
        let silent = RpcSocket::new(&test_config()).unwrap();

        assert!(!client.ping(loopback(silent.local_addr())));

        client.initiate_shutdown();
    }

    #[test]
    fn stores_and_serves_user_records() {
        let server = Arc::new(Rpc::new(&test_config()).unwrap());
        server.serve();

        let client = Arc::new(Rpc::new(&test_config()).unwrap());
        client.serve();

        let server_address = loopback(server.local_addr());
        let user_address = SocketAddrV4::new([127, 0, 0, 1].into(), 4040);

        let announce = RequestSpecific {
            requester_id: client.id(),
            requester_address: client.local_addr(),
            request_type: RequestTypeSpecific::AnnounceUser(AnnounceUserRequestArguments {
                username: "alice".to_string(),
                address: user_address,
            }),
        };

        let ack = client.socket.call(server_address, announce).unwrap();
        assert!(matches!(
            ack.message_type,
            MessageType::Response(ResponseSpecific::Ping(_))
        ));

        let get = RequestSpecific {
            requester_id: client.id(),
            requester_address: client.local_addr(),
            request_type: RequestTypeSpecific::GetUser(GetUserRequestArguments {
                username: "alice".to_string(),
            }),
        };

        let response = client.socket.call(server_address, get).unwrap();
        assert_eq!(response.get_user_address(), Some(user_address));

        let unknown = RequestSpecific {
            requester_id: client.id(),
            requester_address: client.local_addr(),
            request_type: RequestTypeSpecific::GetUser(GetUserRequestArguments {
                username: "nobody".to_string(),
            }),
        };

        let response = client.socket.call(server_address, unknown).unwrap();
        assert_eq!(response.get_user_address(), None);

        server.initiate_shutdown();
        client.initiate_shutdown();
    }

    #[test]
    fn rejects_oversized_usernames() {
        let server = Arc::new(Rpc::new(&test_config()).unwrap());
        server.serve();

        let client = Arc::new(Rpc::new(&test_config()).unwrap());
        client.serve();

        let request = RequestSpecific {
            requester_id: client.id(),
            requester_address: client.local_addr(),
            request_type: RequestTypeSpecific::AnnounceUser(AnnounceUserRequestArguments {
                username: "x".repeat(MAX_USERNAME_LENGTH + 1),
                address: SocketAddrV4::new([127, 0, 0, 1].into(), 4040),
            }),
        };

        let result = client.socket.call(loopback(server.local_addr()), request);
        assert!(matches!(result, Err(CallError::Remote { code: 205, .. })));

        // The local check fails before anything is sent.
        assert_eq!(
            client.announce_user(
                &"x".repeat(MAX_USERNAME_LENGTH + 1),
                SocketAddrV4::new([127, 0, 0, 1].into(), 4040)
            ),
            Err(AnnounceError::UsernameTooLong)
        );

        server.initiate_shutdown();
        client.initiate_shutdown();
    }
}
