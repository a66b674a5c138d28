use std::sync::Arc;

use hashbrown::{hash_map::Entry, HashMap};
use tracing::{debug, warn};

use super::{
    error::Error,
    node::{Edge, Neighbour, Node, NodeId},
    topology::Topology,
};

/// Everything a run needs, built from a validated topology.
#[derive(Debug)]
pub struct Graph {
    /// One singleton fragment per vertex, sorted by id.
    pub nodes: Vec<Node>,
    /// Each undirected edge once, shared with both endpoints.
    pub edges: Vec<Arc<Edge>>,
    /// Node id and opaque address, for the transport directory.
    pub endpoints: Vec<(NodeId, String)>,
}

impl Graph {
    /// Both directions of every edge. These are the only channels the
    /// protocol ever uses besides the bootstrap signal.
    pub fn links(&self) -> Vec<(NodeId, NodeId)> {
        self.edges
            .iter()
            .flat_map(|edge| {
                let (a, b) = edge.endpoints();
                [(a, b), (b, a)]
            })
            .collect()
    }
}

/// Validates a topology and builds the per-vertex state from it.
///
/// Both endpoints of an edge must list it with the same weight, weights must
/// be positive and no vertex may list itself or a neighbour twice.
pub fn build(topology: &Topology) -> Result<Graph, Error> {
    if topology.is_empty() {
        Err(Error::EmptyTopology)?
    }

    let mut records = HashMap::with_capacity(topology.len());
    for record in &topology.nodes {
        let id = NodeId(record.id);
        if id == NodeId::BOOTSTRAP {
            Err(Error::ReservedNodeId)?
        }
        if records.insert(id, record).is_some() {
            Err(Error::DuplicateNode(id))?
        }
    }

    // (listed by, neighbour) -> weight
    let mut listed: HashMap<(NodeId, NodeId), u64> = HashMap::new();
    for record in &topology.nodes {
        let node = NodeId(record.id);
        for n in &record.neighbours {
            let neighbour = NodeId(n.id);
            if neighbour == node {
                Err(Error::SelfLoop(node))?
            }
            if !records.contains_key(&neighbour) {
                Err(Error::UnknownNeighbour { node, neighbour })?
            }
            if n.edge_weight == 0 {
                Err(Error::ZeroWeight {
                    a: node,
                    b: neighbour,
                })?
            }
            if listed.insert((node, neighbour), n.edge_weight).is_some() {
                Err(Error::DuplicateEdge {
                    a: node,
                    b: neighbour,
                })?
            }
        }
    }

    let mut shared: HashMap<(NodeId, NodeId), Arc<Edge>> = HashMap::new();
    let mut edges = Vec::new();
    let mut neighbours: HashMap<NodeId, Vec<Neighbour>> = HashMap::new();
    for record in &topology.nodes {
        let node = NodeId(record.id);
        for n in &record.neighbours {
            let neighbour = NodeId(n.id);
            let Some(&back) = listed.get(&(neighbour, node)) else {
                return Err(Error::AsymmetricEdge {
                    listed_by: node,
                    missing_from: neighbour,
                });
            };
            if back != n.edge_weight {
                Err(Error::WeightMismatch {
                    a: node,
                    b: neighbour,
                    weights: (n.edge_weight, back),
                })?
            }

            let key = (node.min(neighbour), node.max(neighbour));
            let edge = match shared.entry(key) {
                Entry::Occupied(e) => e.get().clone(),
                Entry::Vacant(e) => {
                    let edge =
                        Arc::new(Edge::new(node, neighbour, n.edge_weight));
                    edges.push(edge.clone());
                    e.insert(edge).clone()
                }
            };
            neighbours.entry(node).or_default().push(Neighbour {
                node: neighbour,
                edge,
            });
        }
    }

    let mut nodes: Vec<Node> = topology
        .nodes
        .iter()
        .map(|record| {
            let id = NodeId(record.id);
            Node::new(id, neighbours.remove(&id).unwrap_or_default())
        })
        .collect();
    nodes.sort_by_key(|n| n.id());
    edges.sort_by_key(|e| e.rank());

    let mut endpoints: Vec<(NodeId, String)> = topology
        .nodes
        .iter()
        .map(|record| (NodeId(record.id), record.address.clone()))
        .collect();
    endpoints.sort_by_key(|(id, _)| *id);

    let components = topology.component_count();
    if components > 1 {
        warn!(
            "topology is disconnected ({} components), \
             each one will end with its own tree",
            components
        );
    }
    debug!(
        "bootstrapped {} nodes and {} edges",
        nodes.len(),
        edges.len()
    );

    Ok(Graph {
        nodes,
        edges,
        endpoints,
    })
}
