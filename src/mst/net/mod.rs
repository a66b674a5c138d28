use super::{error::Error, node::NodeId};

pub mod memory;
pub mod tcp;
pub mod wire;

use wire::Message;

/// Reliable, FIFO-per-channel delivery of protocol messages between node
/// identities. Many senders may deliver into the same node concurrently.
///
/// Endpoint addressing is the transport's business: the state machine only
/// ever names logical node ids.
pub trait Transport: Send + Sync + 'static {
    fn send(&self, to: NodeId, msg: Message) -> Result<(), Error>;
}
