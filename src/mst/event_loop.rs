use std::sync::Arc;

use tokio::sync::Barrier;
use tracing::{debug, debug_span, error, trace, warn, Instrument};

use super::{
    error::Error,
    net::{memory::Inbox, wire::Envelope, Transport},
    node::Node,
};

/// Drives one node: pulls messages off its inbox one at a time, runs them
/// through the state machine and hands the produced messages to the
/// transport. Owns the node exclusively until it terminates.
pub struct EventLoop<T: Transport> {
    node: Node,
    inbox: Inbox,
    transport: Arc<T>,
    start: Arc<Barrier>,
}

impl<T: Transport> EventLoop<T> {
    pub fn new(
        node: Node,
        inbox: Inbox,
        transport: Arc<T>,
        start: Arc<Barrier>,
    ) -> Self {
        Self {
            node,
            inbox,
            transport,
            start,
        }
    }

    /// Runs until the node terminates and gives back its final state.
    ///
    /// Waits on the start barrier first so that no message is processed
    /// before every receiver is in place.
    pub async fn run(self) -> Result<Node, Error> {
        let span = debug_span!("node", id = %self.node.id());
        self.process().instrument(span).await
    }

    async fn process(mut self) -> Result<Node, Error> {
        self.start.wait().await;
        debug!("receiver ready");

        let mut out: Vec<Envelope> = Vec::new();
        while !self.node.is_terminated() {
            let msg = self
                .inbox
                .recv()
                .await
                .ok_or(Error::EndpointClosed(self.node.id()))?;
            trace!("received {}", msg);

            if let Err(e) = self.node.handle(msg, &mut out) {
                if e.is_fatal() {
                    error!("{}", e);
                    return Err(e);
                }
                warn!("dropping {}: {}", msg, e);
            }

            for envelope in out.drain(..) {
                trace!("sending {} to {}", envelope.message, envelope.to);
                self.transport.send(envelope.to, envelope.message)?;
            }
        }

        debug!(
            "terminated in fragment {} after {} rounds",
            self.node.fragment(),
            self.node.rounds()
        );
        Ok(self.node)
    }
}
