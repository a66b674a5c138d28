use std::{fmt, io};

use super::{
    net::wire::{MessageType, MAX_BODY_LEN},
    node::NodeId,
};

/// Which round-local counter an underflow was detected on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Counter {
    Barrier,
    Ack,
}

#[derive(Debug)]
pub enum Error {
    // TOPOLOGY
    Io(io::Error),
    Json(serde_json::Error),
    Yaml(serde_yaml::Error),
    EmptyTopology,
    DuplicateNode(NodeId),
    ReservedNodeId,
    UnknownNeighbour { node: NodeId, neighbour: NodeId },
    SelfLoop(NodeId),
    ZeroWeight { a: NodeId, b: NodeId },
    DuplicateEdge { a: NodeId, b: NodeId },
    AsymmetricEdge { listed_by: NodeId, missing_from: NodeId },
    WeightMismatch { a: NodeId, b: NodeId, weights: (u64, u64) },

    // PROTOCOL
    NotANeighbour { node: NodeId, from: NodeId, kind: MessageType },
    UnexpectedMessage { node: NodeId, from: NodeId, kind: MessageType },

    // INVARIANTS
    CounterUnderflow { node: NodeId, counter: Counter, kind: MessageType },

    // TRANSPORT
    UnknownEndpoint(NodeId),
    EndpointClosed(NodeId),
    InvalidAddress { node: NodeId, address: String },
    NoLink { from: NodeId, to: NodeId },
    FrameTooLarge(usize),
    CouldNotEncodeMessage,
    CouldNotDecodeMessage,
    TruncatedFrame,
    UnknownMessageType(u8),

    // HARNESS
    NodeTaskPanicked,
    DeadlineElapsed,
}

impl Error {
    /// Protocol violations are logged and the offending message dropped.
    /// Everything else stops the run.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Error::NotANeighbour { .. } | Error::UnexpectedMessage { .. }
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "could not read topology: {}", e),
            Error::Json(e) => write!(f, "could not parse topology: {}", e),
            Error::Yaml(e) => write!(f, "could not parse topology: {}", e),
            Error::EmptyTopology => write!(f, "topology has no nodes"),
            Error::DuplicateNode(id) => {
                write!(f, "node {} is described more than once", id)
            }
            Error::ReservedNodeId => {
                write!(f, "node id {} is reserved", u32::MAX)
            }
            Error::UnknownNeighbour { node, neighbour } => write!(
                f,
                "node {} lists neighbour {} which has no record",
                node, neighbour
            ),
            Error::SelfLoop(id) => write!(f, "node {} lists itself", id),
            Error::ZeroWeight { a, b } => {
                write!(f, "edge {}-{} has a zero weight", a, b)
            }
            Error::DuplicateEdge { a, b } => {
                write!(f, "node {} lists neighbour {} twice", a, b)
            }
            Error::AsymmetricEdge {
                listed_by,
                missing_from,
            } => write!(
                f,
                "node {} lists neighbour {} but not the other way around",
                listed_by, missing_from
            ),
            Error::WeightMismatch { a, b, weights } => write!(
                f,
                "edge {}-{} has weight {} on one side and {} on the other",
                a, b, weights.0, weights.1
            ),
            Error::NotANeighbour { node, from, kind } => write!(
                f,
                "node {} received {} from {} which is not a neighbour",
                node, kind, from
            ),
            Error::UnexpectedMessage { node, from, kind } => write!(
                f,
                "node {} received {} from {} in a state that cannot use it",
                node, kind, from
            ),
            Error::CounterUnderflow {
                node,
                counter,
                kind,
            } => write!(
                f,
                "node {} received {} with its {:?} counter already at zero",
                node, kind, counter
            ),
            Error::UnknownEndpoint(id) => {
                write!(f, "no endpoint registered for node {}", id)
            }
            Error::EndpointClosed(id) => {
                write!(f, "endpoint of node {} is closed", id)
            }
            Error::InvalidAddress { node, address } => write!(
                f,
                "node {} has address {:?}, expected an ip or ip:port",
                node, address
            ),
            Error::NoLink { from, to } => {
                write!(f, "no link from node {} to node {}", from, to)
            }
            Error::FrameTooLarge(len) => write!(
                f,
                "frame body of {} bytes exceeds {} bytes",
                len, MAX_BODY_LEN
            ),
            Error::CouldNotEncodeMessage => {
                write!(f, "could not encode message")
            }
            Error::CouldNotDecodeMessage => {
                write!(f, "could not decode message")
            }
            Error::TruncatedFrame => {
                write!(f, "frame is shorter than its header")
            }
            Error::UnknownMessageType(byte) => {
                write!(f, "unknown message type {:#04x}", byte)
            }
            Error::NodeTaskPanicked => write!(f, "a node task panicked"),
            Error::DeadlineElapsed => {
                write!(f, "run did not terminate before the deadline")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Json(e) => Some(e),
            Error::Yaml(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e)
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Yaml(e)
    }
}
