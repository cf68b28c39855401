//! Set of nodes ordered by their distance to a target.

use std::vec::IntoIter;

use crate::common::MAX_BUCKET_SIZE_K;
use crate::{Id, Node};

#[derive(Debug, Clone)]
pub struct ClosestNodes {
    target: Id,
    nodes: Vec<Node>,
}

impl ClosestNodes {
    pub fn new(target: Id) -> Self {
        Self {
            target,
            nodes: Vec::with_capacity(MAX_BUCKET_SIZE_K * 2),
        }
    }

    // === Getters ===

    pub fn target(&self) -> Id {
        self.target
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The member ids in ascending distance order, the set identity used by
    /// lookup convergence checks.
    pub fn ids(&self) -> Vec<Id> {
        self.nodes.iter().map(|node| node.id).collect()
    }

    // === Public Methods ===

    /// Inserts a node in its distance sorted position, ignoring ids already
    /// present.
    pub fn add(&mut self, node: Node) {
        let seek = node.id.xor(&self.target);

        match self.nodes.binary_search_by(|prope| {
            if prope.id == node.id {
                std::cmp::Ordering::Equal
            } else {
                prope.id.xor(&self.target).cmp(&seek)
            }
        }) {
            Err(pos) => self.nodes.insert(pos, node),
            _ => {}
        }
    }

    /// Drops all but the `count` closest nodes.
    pub fn truncate(&mut self, count: usize) {
        self.nodes.truncate(count);
    }
}

impl IntoIterator for ClosestNodes {
    type Item = Node;
    type IntoIter = IntoIter<Node>;

    fn into_iter(self) -> Self::IntoIter {
        self.nodes.into_iter()
    }
}

impl<'a> IntoIterator for &'a ClosestNodes {
    type Item = &'a Node;
    type IntoIter = std::slice::Iter<'a, Node>;

    fn into_iter(self) -> Self::IntoIter {
        self.nodes.iter()
    }
}
