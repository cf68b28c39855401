//! Struct and implementation of the Node entry in the Kademlia routing table

use std::net::SocketAddrV4;

use crate::common::Id;

/// Node entry in the Kademlia routing table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub id: Id,
    pub address: SocketAddrV4,
}

impl Node {
    /// Creates a new Node from an id and socket address.
    pub fn new(id: Id, address: SocketAddrV4) -> Node {
        Node { id, address }
    }

    /// Creates a node with a random Id, useful for tests and simulations.
    pub fn random() -> Node {
        Node {
            id: Id::random(),
            address: SocketAddrV4::new([0, 0, 0, 0].into(), 0),
        }
    }

    /// Creates a node with a port and the last Id byte set to `i`, so
    /// repeated calls produce distinct, reproducible nodes.
    pub fn unique(i: usize) -> Node {
        let mut id = Id([0_u8; crate::common::ID_SIZE]);
        id.0[crate::common::ID_SIZE - 1] = i as u8;

        Node {
            id,
            address: SocketAddrV4::new([0, 0, 0, 0].into(), i as u16),
        }
    }
}
