use std::{fmt, sync::Arc};

use chrono::{DateTime, Duration, Utc};
use hashbrown::HashMap;

use super::node::{Edge, EdgeState, Node, NodeId};

/// Final state of one vertex.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeSummary {
    pub id: NodeId,
    pub fragment: NodeId,
    pub parent: NodeId,
    /// Sorted.
    pub children: Vec<NodeId>,
    pub terminated: bool,
    pub rounds: u32,
    pub relabels: u32,
}

impl From<&Node> for NodeSummary {
    fn from(node: &Node) -> Self {
        let mut children: Vec<NodeId> =
            node.children().iter().copied().collect();
        children.sort();
        Self {
            id: node.id(),
            fragment: node.fragment(),
            parent: node.parent(),
            children,
            terminated: node.is_terminated(),
            rounds: node.rounds(),
            relabels: node.relabels(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EdgeSummary {
    pub low: NodeId,
    pub high: NodeId,
    pub weight: u64,
    pub state: EdgeState,
}

impl From<&Edge> for EdgeSummary {
    fn from(edge: &Edge) -> Self {
        let (low, high) = edge.endpoints();
        Self {
            low,
            high,
            weight: edge.weight(),
            state: edge.state(),
        }
    }
}

/// Ways a finished run can disagree with a spanning forest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Violation {
    NotTerminated(NodeId),
    UnknownParent { node: NodeId, parent: NodeId },
    /// Following parents from this node never reaches a root.
    ParentCycle(NodeId),
    /// A node carries a fragment id other than its root's id.
    FragmentMismatch { node: NodeId, root: NodeId, fragment: NodeId },
    /// A parent link travels over an edge that is not a tree edge.
    ParentEdgeNotMember { node: NodeId, parent: NodeId },
    /// A tree with `n` nodes must have `n - 1` edges.
    TreeEdgeCount { expected: usize, found: usize },
    /// An edge never classified even though the run completed.
    UnclassifiedEdge { low: NodeId, high: NodeId },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::NotTerminated(id) => {
                write!(f, "node {} did not terminate", id)
            }
            Violation::UnknownParent { node, parent } => {
                write!(f, "node {} has unknown parent {}", node, parent)
            }
            Violation::ParentCycle(id) => {
                write!(f, "parent chain from node {} never reaches a root", id)
            }
            Violation::FragmentMismatch {
                node,
                root,
                fragment,
            } => write!(
                f,
                "node {} is in fragment {} but its root is {}",
                node, fragment, root
            ),
            Violation::ParentEdgeNotMember { node, parent } => write!(
                f,
                "edge from node {} to its parent {} is not a tree edge",
                node, parent
            ),
            Violation::TreeEdgeCount { expected, found } => write!(
                f,
                "expected {} tree edges, found {}",
                expected, found
            ),
            Violation::UnclassifiedEdge { low, high } => {
                write!(f, "edge {}-{} was never classified", low, high)
            }
        }
    }
}

/// What a run produced: per-node fragment structure and the classification
/// of every edge.
#[derive(Clone, Debug)]
pub struct Outcome {
    /// Sorted by id.
    pub nodes: Vec<NodeSummary>,
    /// Sorted by rank.
    pub edges: Vec<EdgeSummary>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl Outcome {
    pub fn new(
        nodes: &[Node],
        edges: &[Arc<Edge>],
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) -> Self {
        let mut nodes: Vec<NodeSummary> =
            nodes.iter().map(NodeSummary::from).collect();
        nodes.sort_by_key(|n| n.id);
        let edges = edges
            .iter()
            .map(|e| EdgeSummary::from(e.as_ref()))
            .collect();
        Self {
            nodes,
            edges,
            started_at,
            finished_at,
        }
    }

    pub fn node(&self, id: NodeId) -> Option<&NodeSummary> {
        self.nodes
            .binary_search_by_key(&id, |n| n.id)
            .ok()
            .map(|i| &self.nodes[i])
    }

    /// Looks up an edge by its endpoints, in either order.
    pub fn edge(&self, a: NodeId, b: NodeId) -> Option<&EdgeSummary> {
        let (low, high) = (a.min(b), a.max(b));
        self.edges.iter().find(|e| e.low == low && e.high == high)
    }

    pub fn tree_edges(&self) -> impl Iterator<Item = &EdgeSummary> {
        self.edges.iter().filter(|e| e.state == EdgeState::Member)
    }

    pub fn total_weight(&self) -> u64 {
        self.tree_edges().map(|e| e.weight).sum()
    }

    /// Ids of the final fragments, one per connected component. Sorted.
    pub fn fragments(&self) -> Vec<NodeId> {
        let mut fragments: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|n| n.parent == n.id)
            .map(|n| n.fragment)
            .collect();
        fragments.sort();
        fragments
    }

    pub fn elapsed(&self) -> Duration {
        self.finished_at - self.started_at
    }

    /// Checks that the final state is a spanning forest: every node stopped,
    /// parent links follow tree edges up to a root whose id names the
    /// fragment, and there are exactly `n - roots` tree edges.
    pub fn check_invariants(&self) -> Result<(), Violation> {
        let by_id: HashMap<NodeId, &NodeSummary> =
            self.nodes.iter().map(|n| (n.id, n)).collect();

        for node in &self.nodes {
            if !node.terminated {
                return Err(Violation::NotTerminated(node.id));
            }

            let mut current = node;
            let mut hops = 0;
            while current.parent != current.id {
                let parent = current.parent;
                let edge_is_member = self
                    .edge(current.id, parent)
                    .map_or(false, |e| e.state == EdgeState::Member);
                if !edge_is_member {
                    return Err(Violation::ParentEdgeNotMember {
                        node: current.id,
                        parent,
                    });
                }
                current = by_id.get(&parent).copied().ok_or(
                    Violation::UnknownParent {
                        node: current.id,
                        parent,
                    },
                )?;
                hops += 1;
                if hops > self.nodes.len() {
                    return Err(Violation::ParentCycle(node.id));
                }
            }

            if node.fragment != current.id {
                return Err(Violation::FragmentMismatch {
                    node: node.id,
                    root: current.id,
                    fragment: node.fragment,
                });
            }
        }

        let expected = self.nodes.len() - self.fragments().len();
        let found = self.tree_edges().count();
        if expected != found {
            return Err(Violation::TreeEdgeCount { expected, found });
        }

        let basic = self.edges.iter().find(|e| e.state == EdgeState::Basic);
        if let Some(e) = basic {
            return Err(Violation::UnclassifiedEdge {
                low: e.low,
                high: e.high,
            });
        }
        Ok(())
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} nodes, {} fragment(s), tree weight {}, took {}ms",
            self.nodes.len(),
            self.fragments().len(),
            self.total_weight(),
            self.elapsed().num_milliseconds()
        )?;
        for e in self.tree_edges() {
            writeln!(f, "  {}-{} ({})", e.low, e.high, e.weight)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(id: u32, parent: u32, fragment: u32) -> NodeSummary {
        NodeSummary {
            id: NodeId(id),
            fragment: NodeId(fragment),
            parent: NodeId(parent),
            children: vec![],
            terminated: true,
            rounds: 1,
            relabels: 1,
        }
    }

    fn edge(low: u32, high: u32, weight: u64, state: EdgeState) -> EdgeSummary {
        EdgeSummary {
            low: NodeId(low),
            high: NodeId(high),
            weight,
            state,
        }
    }

    fn outcome(nodes: Vec<NodeSummary>, edges: Vec<EdgeSummary>) -> Outcome {
        let now = Utc::now();
        Outcome {
            nodes,
            edges,
            started_at: now,
            finished_at: now,
        }
    }

    #[test]
    fn accepts_a_spanning_tree() {
        let o = outcome(
            vec![summary(0, 2, 2), summary(1, 2, 2), summary(2, 2, 2)],
            vec![
                edge(0, 2, 2, EdgeState::Member),
                edge(1, 2, 2, EdgeState::Member),
                edge(0, 1, 3, EdgeState::NonMember),
            ],
        );
        assert_eq!(o.check_invariants(), Ok(()));
        assert_eq!(o.total_weight(), 4);
        assert_eq!(o.fragments(), vec![NodeId(2)]);
        assert_eq!(o.edge(NodeId(2), NodeId(1)).unwrap().weight, 2);
        assert!(o
            .to_string()
            .starts_with("3 nodes, 1 fragment(s), tree weight 4"));
    }

    #[test]
    fn flags_a_wrong_fragment_label() {
        let o = outcome(
            vec![summary(0, 1, 0), summary(1, 1, 1)],
            vec![edge(0, 1, 5, EdgeState::Member)],
        );
        assert_eq!(
            o.check_invariants(),
            Err(Violation::FragmentMismatch {
                node: NodeId(0),
                root: NodeId(1),
                fragment: NodeId(0)
            })
        );
    }

    #[test]
    fn flags_a_parent_cycle() {
        let o = outcome(
            vec![summary(0, 1, 1), summary(1, 0, 1)],
            vec![edge(0, 1, 5, EdgeState::Member)],
        );
        assert_eq!(
            o.check_invariants(),
            Err(Violation::ParentCycle(NodeId(0)))
        );
    }

    #[test]
    fn flags_missing_tree_edges_and_stragglers() {
        let o = outcome(
            vec![summary(0, 1, 1), summary(1, 1, 1)],
            vec![edge(0, 1, 5, EdgeState::NonMember)],
        );
        assert_eq!(
            o.check_invariants(),
            Err(Violation::ParentEdgeNotMember {
                node: NodeId(0),
                parent: NodeId(1)
            })
        );

        let mut straggler = summary(3, 3, 3);
        straggler.terminated = false;
        let o = outcome(vec![straggler], vec![]);
        assert_eq!(
            o.check_invariants(),
            Err(Violation::NotTerminated(NodeId(3)))
        );
    }

    #[test]
    fn forest_has_one_fragment_per_component() {
        let o = outcome(
            vec![
                summary(0, 1, 1),
                summary(1, 1, 1),
                summary(2, 2, 2),
            ],
            vec![edge(0, 1, 1, EdgeState::Member)],
        );
        assert_eq!(o.check_invariants(), Ok(()));
        assert_eq!(o.fragments(), vec![NodeId(1), NodeId(2)]);
    }
}
