pub mod bootstrap;
pub mod error;
pub mod event_loop;
pub mod harness;
mod machine;
pub mod net;
pub mod node;
pub mod outcome;
pub mod topology;

pub use error::Error;
pub use harness::{run, HarnessConfig, TransportKind};
pub use net::memory::TransportConfig;
pub use outcome::Outcome;
pub use topology::Topology;

// Each vertex of the graph gets its own task. That task exclusively owns the
// vertex's state machine and handles every message addressed to it, one at a
// time, so no locks are taken around node state. The only thing two tasks
// share is the classification of the edge between them, which is an atomic
// that only ever moves away from BASIC.

// The state machine itself performs no IO. It takes one message and appends
// whatever it wants to send to an outbox, which the event loop then hands to
// the transport. Node identities are the only addresses it knows about; the
// transport owns the mapping from identity to endpoint.

// Delivery is reliable and FIFO per ordered pair of nodes, and nothing else is
// assumed about ordering. A virtual zero node, never part of the graph,
// starts every run by sending INIT to every vertex once all of them are
// listening.
