//! Kademlia routing table of shared-prefix buckets with per-bucket locking.

use std::fmt::{self, Debug, Formatter};
use std::net::SocketAddrV4;
use std::slice::Iter;

use parking_lot::Mutex;

use crate::common::{Id, Node, MAX_DISTANCE};
use crate::rpc::ClosestNodes;

/// K = the default maximum size of a k-bucket.
pub const MAX_BUCKET_SIZE_K: usize = 20;

/// Kademlia routing table of [MAX_DISTANCE] buckets, indexed by the length of
/// the prefix a node's id shares with ours.
///
/// Every bucket has its own lock, so updates to different buckets never
/// contend, and the whole check-probe-evict sequence on one bucket is atomic.
pub struct RoutingTable {
    id: Id,
    buckets: Vec<Mutex<KBucket>>,
}

impl RoutingTable {
    /// Create a new [RoutingTable] with a given id.
    pub fn new(id: Id) -> Self {
        let buckets = (0..MAX_DISTANCE)
            .map(|_| Mutex::new(KBucket::new()))
            .collect();

        RoutingTable { id, buckets }
    }

    // === Getters ===

    /// Returns the [Id] of this node, where the distance is measured from.
    pub fn id(&self) -> &Id {
        &self.id
    }

    // === Public Methods ===

    /// Records a contact in its bucket, calling `probe` on the least recently
    /// seen entry's address when the bucket is full.
    ///
    /// A node already present under the same id is moved to the back of its
    /// bucket and its stored address is replaced with the incoming one. In a
    /// full bucket, an unresponsive front entry is evicted for the incoming
    /// node, while a responsive one is kept and rotated to the back.
    ///
    /// Returns `true` if the node was stored or refreshed, `false` if it was
    /// our own id or lost to a responsive incumbent.
    pub fn add(&self, node: Node, probe: impl FnOnce(SocketAddrV4) -> bool) -> bool {
        let index = self.id.shared_prefix_length(&node.id);

        if index == MAX_DISTANCE {
            // Do not add self to the routing_table
            return false;
        }

        // An id determines its bucket, so uniqueness per bucket is uniqueness
        // across the table.
        self.buckets[index].lock().add(node, probe)
    }

    /// Returns up to `count` nodes closest to `target`, sorted by ascending
    /// distance.
    ///
    /// Buckets are visited starting from the target's ideal bucket, then
    /// through the higher indexes, then back down from below the ideal one,
    /// stopping at the first bucket boundary where `count` candidates have
    /// been gathered. Each bucket is only locked while it is scanned.
    pub fn closest(&self, count: usize, target: Id) -> ClosestNodes {
        let mut closest = ClosestNodes::new(target);

        // A target equal to our own id maps to the last bucket.
        let ideal = self
            .id
            .shared_prefix_length(&target)
            .min(MAX_DISTANCE - 1);

        for index in (ideal..MAX_DISTANCE).chain((0..ideal).rev()) {
            if closest.len() >= count {
                break;
            }

            for node in self.buckets[index].lock().iter() {
                closest.add(node.clone());
            }
        }

        closest.truncate(count);

        closest
    }

    /// Returns `true` if this routing table is empty.
    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|bucket| bucket.lock().is_empty())
    }

    /// Return the number of nodes in this routing table.
    pub fn size(&self) -> usize {
        self.buckets
            .iter()
            .fold(0, |acc, bucket| acc + bucket.lock().len())
    }

    /// Export an owned snapshot of the nodes in this routing table, in bucket
    /// order.
    pub fn to_vec(&self) -> Vec<Node> {
        self.buckets
            .iter()
            .flat_map(|bucket| bucket.lock().nodes.clone())
            .collect()
    }

    // === Private Methods ===

    #[cfg(test)]
    pub(crate) fn contains(&self, node_id: &Id) -> bool {
        let index = self.id.shared_prefix_length(node_id);

        index < MAX_DISTANCE && self.buckets[index].lock().contains(node_id)
    }
}

impl Debug for RoutingTable {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "RoutingTable({}, {} nodes)", self.id, self.size())
    }
}

/// KBuckets are similar to LRU caches that check and evict unresponsive
/// nodes, without dropping any responsive nodes in the process.
#[derive(Debug, Clone)]
pub struct KBucket {
    /// Nodes in the k-bucket, sorted by the least recently seen.
    nodes: Vec<Node>,
}

impl KBucket {
    pub fn new() -> Self {
        KBucket {
            nodes: Vec::with_capacity(MAX_BUCKET_SIZE_K),
        }
    }

    // === Public Methods ===

    pub fn add(&mut self, incoming: Node, probe: impl FnOnce(SocketAddrV4) -> bool) -> bool {
        if let Some(index) = self.iter().position(|n| n.id == incoming.id) {
            // The node is already here, move it to the end of the bucket and
            // adopt its latest advertised address. Updating a changed port
            // right away beats waiting for the old one to stop answering
            // pings.
            self.nodes.remove(index);
            self.nodes.push(incoming);

            true
        } else if self.nodes.len() < MAX_BUCKET_SIZE_K {
            self.nodes.push(incoming);

            true
        } else if probe(self.nodes[0].address) {
            // The least recently seen node answered, keep it and refresh its
            // recency. The incoming node is dropped.
            let front = self.nodes.remove(0);
            self.nodes.push(front);

            false
        } else {
            // Remove the unresponsive least recently seen node and add the
            // new one.
            self.nodes.remove(0);
            self.nodes.push(incoming);

            true
        }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn iter(&self) -> Iter<'_, Node> {
        self.nodes.iter()
    }

    #[cfg(test)]
    fn contains(&self, id: &Id) -> bool {
        self.iter().any(|node| node.id == *id)
    }
}
