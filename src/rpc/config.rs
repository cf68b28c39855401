use std::time::Duration;

use crate::common::Node;

use super::socket::{DEFAULT_MAX_RETRIES, DEFAULT_REQUEST_TIMEOUT};

#[derive(Debug, Clone)]
/// Dht Configurations
pub struct Config {
    /// Bootstrap nodes
    ///
    /// Defaults to an empty list, where this node starts a new network
    /// that others can bootstrap from.
    pub bootstrap: Vec<Node>,
    /// Explicit port to listen on.
    ///
    /// Defaults to None
    pub port: Option<u16>,
    /// UDP socket request timeout duration.
    ///
    /// The longer this duration is, the longer queries take until they are deemed "done".
    /// The shorter this duration is, the more responses from busy nodes we miss out on,
    /// which affects the accuracy of queries trying to find closest nodes to a target.
    ///
    /// Defaults to [DEFAULT_REQUEST_TIMEOUT]
    pub request_timeout: Duration,
    /// How many times an unanswered request is resent before the node
    /// is considered unresponsive.
    ///
    /// Defaults to [DEFAULT_MAX_RETRIES]
    pub max_retries: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bootstrap: vec![],
            port: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}
