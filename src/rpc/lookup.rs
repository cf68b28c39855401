//! Iterative find-node lookup converging on the closest nodes to a target.

use std::collections::HashSet;
use std::thread;

use tracing::debug;

use crate::common::{
    FindNodeRequestArguments, Id, Node, RequestSpecific, RequestTypeSpecific, MAX_BUCKET_SIZE_K,
};

use super::closest_nodes::ClosestNodes;
use super::{Rpc, ALPHA};

/// Finds the closest reachable nodes to the target by visiting ever closer
/// nodes until no response improves the set.
///
/// Runs on the calling thread, which owns all lookup state, keeping up to
/// [ALPHA] concurrent find-node queries in flight. Returns when a merged
/// response leaves the closest set unchanged (convergence), or when every
/// known candidate has been tried (exhaustion). An exhausted lookup returns
/// whatever was found, possibly nothing.
pub(crate) fn lookup(rpc: &Rpc, target: Id) -> ClosestNodes {
    let mut closest = rpc.routing_table.closest(ALPHA, target);

    let mut tried = HashSet::new();
    // Self is a valid member of the closest set but is never queried.
    tried.insert(rpc.id);

    let (results_sender, results_receiver) = flume::bounded::<Option<Vec<Node>>>(ALPHA);
    let mut inflight: usize = 0;

    debug!(?target, candidates = closest.len(), "Starting lookup");

    loop {
        let untried = closest
            .nodes()
            .iter()
            .filter(|node| !tried.contains(&node.id))
            .cloned()
            .collect::<Vec<_>>();

        for node in untried {
            if inflight == ALPHA {
                break;
            }

            tried.insert(node.id);
            inflight += 1;

            visit(rpc, target, node, results_sender.clone());
        }

        if inflight == 0 {
            debug!(
                ?target,
                closest_nodes = closest.len(),
                "Lookup exhausted all candidates"
            );
            break;
        }

        let reply = match results_receiver.recv() {
            Ok(reply) => reply,
            Err(_) => break,
        };

        inflight -= 1;

        // A failed query merges nothing and can not converge the lookup.
        if let Some(nodes) = reply {
            let before = closest.ids();

            for node in nodes {
                closest.add(node);
            }
            closest.truncate(MAX_BUCKET_SIZE_K);

            if closest.ids() == before {
                debug!(?target, closest_nodes = closest.len(), "Lookup converged");
                break;
            }
        }
    }

    closest
}

/// Sends a find-node query to the node from a short lived worker thread,
/// reporting back the closer nodes it returned, or None if it failed.
fn visit(rpc: &Rpc, target: Id, node: Node, results_sender: flume::Sender<Option<Vec<Node>>>) {
    let socket = rpc.socket.clone();
    let request = RequestSpecific {
        requester_id: rpc.id,
        requester_address: rpc.address,
        request_type: RequestTypeSpecific::FindNode(FindNodeRequestArguments { target }),
    };

    thread::spawn(move || {
        let reply = match socket.call(node.address, request) {
            Ok(response) => response.get_closer_nodes(),
            Err(_) => None,
        };

        // The lookup may have returned already.
        let _ = results_sender.send(reply);
    });
}
