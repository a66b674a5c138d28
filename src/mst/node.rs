use std::{
    fmt,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
};

use hashbrown::HashSet;
use rkyv::{Archive, Deserialize, Serialize};

/// A graph vertex identity. Only used for tie-breaks, routing through the
/// transport directory and logging.
#[derive(
    Archive,
    Serialize,
    Deserialize,
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
)]
#[archive(check_bytes)]
pub struct NodeId(pub u32);

impl NodeId {
    /// The virtual zero node that kicks off every run with `INIT`. No real
    /// vertex may use this id.
    pub const BOOTSTRAP: NodeId = NodeId(u32::MAX);
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::BOOTSTRAP {
            write!(f, "zero")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl From<u32> for NodeId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// Total order over edges. Weights come first, the endpoints break ties so
/// that no two edges of a graph ever compare equal.
#[derive(
    Archive,
    Serialize,
    Deserialize,
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
)]
#[archive(check_bytes)]
pub struct Rank {
    pub weight: u64,
    pub low: NodeId,
    pub high: NodeId,
}

impl fmt::Display for Rank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}-{})", self.weight, self.low, self.high)
    }
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EdgeState {
    /// Not yet known to cross a fragment boundary.
    Basic = 0,
    /// Part of the spanning tree.
    Member = 1,
    /// Internal to a fragment, never a merge candidate.
    NonMember = 2,
}

impl EdgeState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => EdgeState::Basic,
            1 => EdgeState::Member,
            _ => EdgeState::NonMember,
        }
    }
}

impl fmt::Display for EdgeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EdgeState::Basic => write!(f, "BASIC"),
            EdgeState::Member => write!(f, "MEMBER"),
            EdgeState::NonMember => write!(f, "NON_MEMBER"),
        }
    }
}

/// An undirected graph edge. Both endpoints hold the same instance, so a
/// classification made by either side is seen by the other.
///
/// The state only ever leaves `Basic`; it never moves between `Member` and
/// `NonMember` and never returns to `Basic`.
#[derive(Debug)]
pub struct Edge {
    rank: Rank,
    state: AtomicU8,
}

impl Edge {
    pub fn new(a: NodeId, b: NodeId, weight: u64) -> Self {
        Self {
            rank: Rank {
                weight,
                low: a.min(b),
                high: a.max(b),
            },
            state: AtomicU8::new(EdgeState::Basic as u8),
        }
    }

    pub fn weight(&self) -> u64 {
        self.rank.weight
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    /// Both endpoints, lower id first.
    pub fn endpoints(&self) -> (NodeId, NodeId) {
        (self.rank.low, self.rank.high)
    }

    pub fn state(&self) -> EdgeState {
        EdgeState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_basic(&self) -> bool {
        self.state() == EdgeState::Basic
    }

    /// Moves the edge from `Basic` to `Member`. Returns false if the edge
    /// had already been classified.
    pub fn mark_member(&self) -> bool {
        self.classify(EdgeState::Member)
    }

    /// Moves the edge from `Basic` to `NonMember`. Returns false if the edge
    /// had already been classified.
    pub fn mark_non_member(&self) -> bool {
        self.classify(EdgeState::NonMember)
    }

    fn classify(&self, to: EdgeState) -> bool {
        self.state
            .compare_exchange(
                EdgeState::Basic as u8,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

/// One incident edge as seen from a node.
#[derive(Clone, Debug)]
pub struct Neighbour {
    pub node: NodeId,
    pub edge: Arc<Edge>,
}

/// All state local to one graph vertex. Owned by exactly one event loop; the
/// only thing shared with other nodes is the state of incident edges.
#[derive(Debug)]
pub struct Node {
    pub(super) id: NodeId,
    pub(super) fragment: NodeId,
    /// Equal to `id` at the fragment root.
    pub(super) parent: NodeId,
    pub(super) children: HashSet<NodeId>,
    /// Sorted by neighbour id, fixed at bootstrap.
    pub(super) neighbours: Vec<Neighbour>,
    /// Where the fragment's best outgoing edge was last seen this round:
    /// this node itself or one of its children.
    pub(super) best_candidate: Option<NodeId>,
    /// Smallest outgoing edge found this round. `None` is infinity.
    pub(super) min_weight: Option<Rank>,
    /// Outstanding relabel acknowledgements.
    pub(super) acks: usize,
    /// Outstanding test replies and child reports. `None` outside of a round.
    pub(super) barrier: Option<usize>,
    pub(super) sent_connect: HashSet<NodeId>,
    pub(super) received_connect: HashSet<NodeId>,
    pub(super) terminated: bool,
    pub(super) rounds: u32,
    pub(super) relabels: u32,
}

impl Node {
    /// Creates a singleton fragment rooted at `id`. `neighbours` is sorted by
    /// neighbour id so iteration order is stable.
    pub fn new(id: NodeId, mut neighbours: Vec<Neighbour>) -> Self {
        neighbours.sort_by_key(|n| n.node);
        Self {
            id,
            fragment: id,
            parent: id,
            children: HashSet::new(),
            neighbours,
            best_candidate: None,
            min_weight: None,
            acks: 0,
            barrier: None,
            sent_connect: HashSet::new(),
            received_connect: HashSet::new(),
            terminated: false,
            rounds: 0,
            relabels: 0,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn fragment(&self) -> NodeId {
        self.fragment
    }

    pub fn parent(&self) -> NodeId {
        self.parent
    }

    pub fn children(&self) -> &HashSet<NodeId> {
        &self.children
    }

    pub fn neighbours(&self) -> &[Neighbour] {
        &self.neighbours
    }

    pub fn degree(&self) -> usize {
        self.neighbours.len()
    }

    pub fn is_root(&self) -> bool {
        self.parent == self.id
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub fn min_weight(&self) -> Option<Rank> {
        self.min_weight
    }

    pub fn best_candidate(&self) -> Option<NodeId> {
        self.best_candidate
    }

    pub fn rounds(&self) -> u32 {
        self.rounds
    }

    pub fn relabels(&self) -> u32 {
        self.relabels
    }

    /// Looks up the incident edge towards `node`.
    pub fn neighbour(&self, node: NodeId) -> Option<&Neighbour> {
        self.neighbours
            .binary_search_by_key(&node, |n| n.node)
            .ok()
            .map(|i| &self.neighbours[i])
    }
}
