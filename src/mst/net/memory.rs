use std::time::Duration;

use hashbrown::HashMap;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tokio::sync::mpsc;
use tracing::{trace, warn};
use typed_builder::TypedBuilder;

use super::{
    wire::{self, Message},
    Transport,
};
use crate::mst::{error::Error, node::NodeId};

pub type Inbox = mpsc::UnboundedReceiver<Message>;

#[derive(Clone, Debug, TypedBuilder)]
pub struct TransportConfig {
    /// Upper bound of a random delay applied to every message on a link.
    /// Messages on the same link keep their order.
    #[builder(default, setter(strip_option))]
    pub jitter: Option<Duration>,
    /// Seed for the jitter of every link.
    #[builder(default = 0)]
    pub seed: u64,
    /// Pushes every message through the wire codec before delivery.
    #[builder(default = false)]
    pub codec_roundtrip: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// A registered node: its opaque network address and the sender half of
/// its inbound queue.
struct Endpoint {
    address: String,
    inbox: mpsc::UnboundedSender<Message>,
}

/// In-process transport. Owns the identity -> endpoint directory; nodes only
/// ever address each other by id.
pub struct MemoryTransport {
    directory: HashMap<NodeId, Endpoint>,
    /// Jittered links keyed by (from, to). Empty when jitter is off.
    links: HashMap<(NodeId, NodeId), mpsc::UnboundedSender<Message>>,
    codec_roundtrip: bool,
}

impl MemoryTransport {
    /// Registers every endpoint and returns the inbound queue of each one.
    /// With jitter configured, one link task is spawned per entry of `links`,
    /// so this must be called from inside a tokio runtime.
    pub fn new(
        endpoints: impl IntoIterator<Item = (NodeId, String)>,
        links: impl IntoIterator<Item = (NodeId, NodeId)>,
        config: &TransportConfig,
    ) -> (Self, HashMap<NodeId, Inbox>) {
        let mut directory = HashMap::new();
        let mut inboxes = HashMap::new();
        for (id, address) in endpoints {
            let (tx, rx) = mpsc::unbounded_channel();
            directory.insert(id, Endpoint { address, inbox: tx });
            inboxes.insert(id, rx);
        }

        let mut link_senders = HashMap::new();
        if let Some(jitter) = config.jitter {
            for (from, to) in links {
                let Some(endpoint) = directory.get(&to) else {
                    continue;
                };
                let (tx, rx) = mpsc::unbounded_channel();
                let seed = config.seed ^ ((from.0 as u64) << 32 | to.0 as u64);
                tokio::spawn(Self::carry(
                    rx,
                    endpoint.inbox.clone(),
                    jitter,
                    StdRng::seed_from_u64(seed),
                ));
                link_senders.insert((from, to), tx);
            }
        }

        (
            Self {
                directory,
                links: link_senders,
                codec_roundtrip: config.codec_roundtrip,
            },
            inboxes,
        )
    }

    /// Returns the opaque address registered for a node.
    pub fn address(&self, id: NodeId) -> Option<&str> {
        self.directory.get(&id).map(|e| e.address.as_str())
    }

    /// Forwards one link's messages in order, each after a random delay.
    /// Runs until either side of the link goes away.
    async fn carry(
        mut rx: mpsc::UnboundedReceiver<Message>,
        inbox: mpsc::UnboundedSender<Message>,
        jitter: Duration,
        mut rng: StdRng,
    ) {
        let max = jitter.as_micros() as u64;
        while let Some(msg) = rx.recv().await {
            let delay = rng.gen_range(0..=max);
            if delay > 0 {
                tokio::time::sleep(Duration::from_micros(delay)).await;
            }
            if inbox.send(msg).is_err() {
                trace!("link closed, dropping {}", msg);
                break;
            }
        }
    }
}

impl Transport for MemoryTransport {
    fn send(&self, to: NodeId, msg: Message) -> Result<(), Error> {
        let msg = if self.codec_roundtrip {
            let (_, decoded) = wire::decode(&wire::encode(&msg)?)?;
            decoded
        } else {
            msg
        };

        if let Some(link) = self.links.get(&(msg.from, to)) {
            if link.send(msg).is_ok() {
                return Ok(());
            }
            warn!("link {}->{} is gone, delivering directly", msg.from, to);
        }

        let endpoint =
            self.directory.get(&to).ok_or(Error::UnknownEndpoint(to))?;
        endpoint
            .inbox
            .send(msg)
            .map_err(|_| Error::EndpointClosed(to))
    }
}
