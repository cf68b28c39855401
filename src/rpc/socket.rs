//! UDP socket layer managing incoming/outgoing requests and responses.

use std::net::{SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::common::{
    ErrorSpecific, Message, MessageType, RequestSpecific, ResponseSpecific, VERSION,
};

use super::config::Config;

const MTU: usize = 2048;

pub const DEFAULT_PORT: u16 = 6991;
/// Default request timeout before abandoning an inflight request to a
/// non-responding node.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(2000); // 2 seconds
/// Default number of retries after an unanswered request before the call
/// fails.
pub const DEFAULT_MAX_RETRIES: usize = 2;

/// How long a blocking receive waits before giving the listener thread a
/// chance to observe shutdown.
const READ_TIMEOUT: Duration = Duration::from_millis(50);

/// A UdpSocket wrapper that formats and correlates requests and responses.
///
/// Responses are routed to the thread blocked in [RpcSocket::call] through a
/// single-slot channel registered under the request's transaction id, so the
/// socket can be shared freely between the listener thread and any number of
/// calling threads.
#[derive(Debug)]
pub struct RpcSocket {
    next_tid: AtomicU16,
    socket: UdpSocket,
    local_addr: SocketAddrV4,
    request_timeout: Duration,
    max_retries: usize,
    inflight_requests: Mutex<InflightRequestsMap>,
}

#[derive(Debug)]
struct InflightRequest {
    to: SocketAddrV4,
    sender: flume::Sender<Message>,
}

impl RpcSocket {
    pub(crate) fn new(config: &Config) -> Result<Self, std::io::Error> {
        let port = config.port;

        let socket = if let Some(port) = port {
            UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], port)))?
        } else {
            match UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT))) {
                Ok(socket) => Ok(socket),
                Err(_) => UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], 0))),
            }?
        };

        let local_addr = match socket.local_addr()? {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => unimplemented!("RpcSocket does not support Ipv6"),
        };

        socket.set_read_timeout(Some(READ_TIMEOUT))?;

        Ok(Self {
            socket,
            next_tid: AtomicU16::new(0),
            local_addr,
            request_timeout: config.request_timeout,
            max_retries: config.max_retries,
            inflight_requests: Mutex::new(InflightRequestsMap::new()),
        })
    }

    // === Getters ===

    /// Returns the address the socket is listening to.
    #[inline]
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local_addr
    }

    // === Public Methods ===

    /// Send a request to the given address and block until the matching
    /// response arrives.
    ///
    /// Each attempt sends the request under a fresh transaction id and waits
    /// for the configured timeout, up to the configured number of retries, so
    /// this never blocks indefinitely.
    pub fn call(
        &self,
        address: SocketAddrV4,
        request: RequestSpecific,
    ) -> Result<Message, CallError> {
        let attempts = self.max_retries + 1;

        for attempt in 1..=attempts {
            let (sender, receiver) = flume::bounded(1);
            let tid = self.register(address, sender);

            let message = Message {
                transaction_id: tid,
                version: Some(VERSION.to_vec()),
                message_type: MessageType::Request(request.clone()),
            };

            if let Err(error) = self.send(address, message) {
                self.deregister(tid);
                return Err(error.into());
            }

            match receiver.recv_timeout(self.request_timeout) {
                Ok(message) => {
                    if let MessageType::Error(error) = message.message_type {
                        return Err(CallError::Remote {
                            code: error.code,
                            description: error.description,
                        });
                    }

                    return Ok(message);
                }
                Err(_) => {
                    self.deregister(tid);
                    debug!(?address, attempt, "Request timed out");
                }
            }
        }

        Err(CallError::Timeout(attempts))
    }

    /// Send a response to the given address.
    pub fn response(
        &self,
        address: SocketAddrV4,
        transaction_id: u16,
        response: ResponseSpecific,
    ) {
        let message = Message {
            transaction_id,
            version: Some(VERSION.to_vec()),
            message_type: MessageType::Response(response),
        };

        let _ = self.send(address, message).map_err(|e| {
            debug!(?e, "Error sending response message");
        });
    }

    /// Send an error to the given address.
    pub fn error(&self, address: SocketAddrV4, transaction_id: u16, error: ErrorSpecific) {
        let message = Message {
            transaction_id,
            version: Some(VERSION.to_vec()),
            message_type: MessageType::Error(error),
        };

        let _ = self.send(address, message).map_err(|e| {
            debug!(?e, "Error sending error message");
        });
    }

    /// Receives a single message on the socket, waiting at most the read
    /// timeout. On success, returns the message and its origin.
    pub(crate) fn recv_from(&self) -> Option<(Message, SocketAddrV4)> {
        let mut buf = [0u8; MTU];

        match self.socket.recv_from(&mut buf) {
            Ok((amt, SocketAddr::V4(from))) => {
                let bytes = &buf[..amt];

                if from.port() == 0 {
                    trace!(
                        context = "socket_validation",
                        message = "Response from port 0"
                    );
                    return None;
                }

                match Message::from_bytes(bytes) {
                    Ok(message) => {
                        trace!(context = "socket_message_receiving", ?message, ?from);
                        return Some((message, from));
                    }
                    Err(error) => {
                        trace!(
                            context = "socket_error",
                            ?error,
                            ?from,
                            message = ?String::from_utf8_lossy(bytes),
                            "Received invalid Bencode message."
                        );
                    }
                }
            }
            Ok((_, SocketAddr::V6(_))) => {
                trace!(
                    context = "socket_validation",
                    message = "Received IPv6 packet"
                );
            }
            Err(ref e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                // Nothing to read within the timeout.
            }
            Err(e) => {
                trace!(
                    context = "socket_error",
                    ?e,
                    "recv_from failed unexpectedly"
                );
            }
        }

        None
    }

    /// Hand a received response or error to the thread waiting on its
    /// transaction id. Never blocks.
    pub(crate) fn route_response(&self, message: Message, from: SocketAddrV4) {
        let mut inflight_requests = self.inflight_requests.lock();

        match inflight_requests.get(message.transaction_id) {
            Some(request) if compare_socket_addr(&request.to, &from) => {
                if let Some(request) = inflight_requests.remove(message.transaction_id) {
                    // The caller may have timed out and dropped its receiver
                    // already.
                    let _ = request.sender.try_send(message);
                }
            }
            Some(_) => {
                trace!(
                    context = "socket_validation",
                    message = "Response from wrong address"
                );
            }
            None => {
                trace!(
                    context = "socket_validation",
                    message = "Unexpected response id"
                );
            }
        }
    }

    // === Private Methods ===

    /// Increments self.next_tid and returns the previous value.
    fn tid(&self) -> u16 {
        // We don't bother much with reusing freed transaction ids,
        // since the timeout is so short we are unlikely to run out
        // of 65535 ids while requests are waiting.
        self.next_tid.fetch_add(1, Ordering::Relaxed)
    }

    fn register(&self, to: SocketAddrV4, sender: flume::Sender<Message>) -> u16 {
        let mut inflight_requests = self.inflight_requests.lock();

        let mut tid = self.tid();
        while inflight_requests.get(tid).is_some() {
            tid = self.tid();
        }

        inflight_requests.insert(tid, InflightRequest { to, sender });

        tid
    }

    fn deregister(&self, tid: u16) {
        self.inflight_requests.lock().remove(tid);
    }

    #[cfg(test)]
    fn inflight(&self, tid: u16) -> bool {
        self.inflight_requests.lock().get(tid).is_some()
    }

    /// Send a raw message
    fn send(&self, address: SocketAddrV4, message: Message) -> Result<(), SendMessageError> {
        self.socket.send_to(&message.to_bytes()?, address)?;
        trace!(context = "socket_message_sending", message = ?message);
        Ok(())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum SendMessageError {
    /// Errors related to encoding messages.
    #[error("Failed to encode packet bytes: {0}")]
    BencodeError(#[from] serde_bencode::Error),

    #[error(transparent)]
    /// Transparent [std::io::Error]
    IO(#[from] std::io::Error),
}

/// An outgoing request failed to produce a response.
#[derive(thiserror::Error, Debug)]
pub enum CallError {
    #[error("No response after {0} attempts")]
    Timeout(usize),

    #[error("Remote node responded with error {code}: {description}")]
    Remote { code: i32, description: String },

    #[error(transparent)]
    Send(#[from] SendMessageError),
}

// Same as SocketAddrV4::eq but ignores the ip if it is unspecified for testing reasons.
fn compare_socket_addr(a: &SocketAddrV4, b: &SocketAddrV4) -> bool {
    if a.port() != b.port() {
        return false;
    }

    if a.ip().is_unspecified() {
        return true;
    }

    a.ip() == b.ip()
}

#[derive(Debug)]
struct InflightRequestsMap {
    requests: Vec<(u16, InflightRequest)>,
}

impl InflightRequestsMap {
    fn new() -> Self {
        Self { requests: vec![] }
    }

    fn get(&self, key: u16) -> Option<&InflightRequest> {
        match self.find_index(key) {
            Ok(index) => self.requests.get(index).map(|(_, request)| request),
            Err(_) => None,
        }
    }

    fn insert(&mut self, key: u16, inflight_request: InflightRequest) {
        if let Err(index) = self.find_index(key) {
            self.requests.insert(index, (key, inflight_request));
        }
    }

    fn remove(&mut self, key: u16) -> Option<InflightRequest> {
        match self.find_index(key) {
            Ok(index) => Some(self.requests.remove(index).1),
            Err(_) => None,
        }
    }

    fn find_index(&self, key: u16) -> Result<usize, usize> {
        self.requests.binary_search_by(|(tid, _)| tid.cmp(&key))
    }
}

#[cfg(test)]
mod test {
    use std::thread;

    use crate::common::{Id, PingResponseArguments, RequestTypeSpecific};

    use super::*;

    fn test_config() -> Config {
        Config {
            port: None,
            request_timeout: Duration::from_millis(100),
            max_retries: 1,
            ..Default::default()
        }
    }

    fn ping_request() -> RequestSpecific {
        RequestSpecific {
            requester_id: Id::random(),
            requester_address: SocketAddrV4::new([0, 0, 0, 0].into(), 0),
            request_type: RequestTypeSpecific::Ping,
        }
    }

    #[test]
    fn tid() {
        let socket = RpcSocket::new(&test_config()).unwrap();

        assert_eq!(socket.tid(), 0);
        assert_eq!(socket.tid(), 1);
        assert_eq!(socket.tid(), 2);

        socket.next_tid.store(u16::MAX, Ordering::Relaxed);

        assert_eq!(socket.tid(), 65535);
        assert_eq!(socket.tid(), 0);
    }

    #[test]
    fn call_receives_the_matching_response() {
        let server = RpcSocket::new(&test_config()).unwrap();
        let server_address = SocketAddrV4::new([127, 0, 0, 1].into(), server.local_addr().port());

        let responder_id = Id::random();

        let server_thread = thread::spawn(move || loop {
            if let Some((message, from)) = server.recv_from() {
                assert!(matches!(message.message_type, MessageType::Request(_)));
                server.response(
                    from,
                    message.transaction_id,
                    ResponseSpecific::Ping(PingResponseArguments { responder_id }),
                );
                break;
            }
        });

        let client = std::sync::Arc::new(RpcSocket::new(&test_config()).unwrap());

        // Stand in for the listener thread, which routes received responses
        // to the blocked caller in the full node.
        let listener = client.clone();
        let listener_thread = thread::spawn(move || loop {
            if let Some((message, from)) = listener.recv_from() {
                listener.route_response(message, from);
                break;
            }
        });

        let response = client.call(server_address, ping_request()).unwrap();

        assert_eq!(response.get_author_id(), Some(responder_id));
        assert!(
            !client.inflight(response.transaction_id),
            "a routed response removes the inflight request"
        );

        server_thread.join().unwrap();
        listener_thread.join().unwrap();
    }

    #[test]
    fn call_gives_up_after_capped_retries() {
        let client = RpcSocket::new(&test_config()).unwrap();

        // A socket that never reads still receives packets, so sends succeed
        // and the call has to time out on its own.
        let silent = RpcSocket::new(&test_config()).unwrap();
        let silent_address = SocketAddrV4::new([127, 0, 0, 1].into(), silent.local_addr().port());

        let started = std::time::Instant::now();
        let result = client.call(silent_address, ping_request());

        assert!(matches!(result, Err(CallError::Timeout(2))));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn routes_error_replies_to_the_caller() {
        let server = RpcSocket::new(&test_config()).unwrap();
        let server_address = SocketAddrV4::new([127, 0, 0, 1].into(), server.local_addr().port());

        let server_thread = thread::spawn(move || loop {
            if let Some((message, from)) = server.recv_from() {
                server.error(
                    from,
                    message.transaction_id,
                    ErrorSpecific {
                        code: 201,
                        description: "Generic Error".to_string(),
                    },
                );
                break;
            }
        });

        let client = std::sync::Arc::new(RpcSocket::new(&test_config()).unwrap());

        let listener = client.clone();
        let listener_thread = thread::spawn(move || loop {
            if let Some((message, from)) = listener.recv_from() {
                listener.route_response(message, from);
                break;
            }
        });

        let result = client.call(server_address, ping_request());

        assert!(matches!(result, Err(CallError::Remote { code: 201, .. })));

        server_thread.join().unwrap();
        listener_thread.join().unwrap();
    }

    #[test]
    fn ignore_response_from_wrong_address() {
        let socket = RpcSocket::new(&test_config()).unwrap();

        let (sender, receiver) = flume::bounded(1);
        let expected_from = SocketAddrV4::new([127, 0, 0, 1].into(), 7000);
        let tid = socket.register(expected_from, sender);

        let pong = Message {
            transaction_id: tid,
            version: None,
            message_type: MessageType::Response(ResponseSpecific::Ping(PingResponseArguments {
                responder_id: Id::random(),
            })),
        };

        let wrong_from = SocketAddrV4::new([127, 0, 0, 1].into(), 7001);
        socket.route_response(pong.clone(), wrong_from);

        assert!(receiver.try_recv().is_err());
        assert!(socket.inflight(tid), "the waiter is kept for the real node");

        socket.route_response(pong.clone(), expected_from);

        assert_eq!(receiver.try_recv().unwrap(), pong);
        assert!(!socket.inflight(tid));
    }
}
