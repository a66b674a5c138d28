use std::{
    io,
    net::{IpAddr, SocketAddr},
};

use hashbrown::HashMap;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::mpsc,
    task::{AbortHandle, JoinSet},
};
use tracing::{debug, debug_span, trace, warn, Instrument};

use super::{
    memory::Inbox,
    wire::{self, Message, HEADER_LEN},
    Transport,
};
use crate::mst::{error::Error, node::NodeId};

/// Parses a topology address. A bare ip gets an ephemeral port.
fn socket_addr(node: NodeId, address: &str) -> Result<SocketAddr, Error> {
    if let Ok(addr) = address.parse::<SocketAddr>() {
        return Ok(addr);
    }
    address
        .parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, 0))
        .map_err(|_| Error::InvalidAddress {
            node,
            address: address.to_string(),
        })
}

/// TCP transport. Every node listens on its own address; every
/// ordered pair of nodes that may talk gets one connection, opened on first
/// use and kept for the whole run, which keeps the pair's messages in order.
pub struct TcpTransport {
    directory: HashMap<NodeId, SocketAddr>,
    /// Frame queues of the writer task of each link, keyed by (from, to).
    links: HashMap<(NodeId, NodeId), mpsc::UnboundedSender<Vec<u8>>>,
    tasks: Vec<AbortHandle>,
}

impl TcpTransport {
    /// Binds a listener per endpoint and prepares a writer for each link,
    /// plus one from the virtual zero node to every endpoint.
    pub async fn bind(
        endpoints: impl IntoIterator<Item = (NodeId, String)>,
        links: impl IntoIterator<Item = (NodeId, NodeId)>,
    ) -> Result<(Self, HashMap<NodeId, Inbox>), Error> {
        let mut transport = Self {
            directory: HashMap::new(),
            links: HashMap::new(),
            tasks: Vec::new(),
        };
        let mut inboxes = HashMap::new();

        for (id, address) in endpoints {
            let listener = TcpListener::bind(socket_addr(id, &address)?).await?;
            let local = listener.local_addr()?;
            debug!("node {} listening on {}", id, local);

            let (tx, rx) = mpsc::unbounded_channel();
            let span = debug_span!("listener", id = %id);
            let accept =
                tokio::spawn(Self::accept(listener, tx).instrument(span));
            transport.tasks.push(accept.abort_handle());
            transport.directory.insert(id, local);
            inboxes.insert(id, rx);
        }

        let kickoff: Vec<(NodeId, NodeId)> = transport
            .directory
            .keys()
            .map(|id| (NodeId::BOOTSTRAP, *id))
            .collect();
        for (from, to) in links.into_iter().chain(kickoff) {
            let addr = *transport
                .directory
                .get(&to)
                .ok_or(Error::UnknownEndpoint(to))?;
            if transport.links.contains_key(&(from, to)) {
                continue;
            }
            let (tx, rx) = mpsc::unbounded_channel();
            let write = tokio::spawn(Self::write(from, to, addr, rx));
            transport.tasks.push(write.abort_handle());
            transport.links.insert((from, to), tx);
        }

        Ok((transport, inboxes))
    }

    /// Returns the address a node's listener is bound to.
    pub fn address(&self, id: NodeId) -> Option<SocketAddr> {
        self.directory.get(&id).copied()
    }

    /// Accepts connections for one node. Runs until aborted, which also
    /// aborts every reader it started.
    async fn accept(
        listener: TcpListener,
        inbox: mpsc::UnboundedSender<Message>,
    ) {
        let mut readers = JoinSet::new();
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(connection) => connection,
                Err(e) => {
                    warn!("could not accept connection: {}", e);
                    continue;
                }
            };
            trace!("accepted connection from {}", peer);
            let inbox = inbox.clone();
            readers.spawn(async move {
                if let Err(e) = Self::read(stream, inbox).await {
                    warn!("connection from {} failed: {}", peer, e);
                }
            });
        }
    }

    /// Reads frames off one connection until the peer closes it.
    async fn read(
        mut stream: TcpStream,
        inbox: mpsc::UnboundedSender<Message>,
    ) -> Result<(), Error> {
        let mut frame = vec![0u8; HEADER_LEN];
        loop {
            frame.resize(HEADER_LEN, 0);
            match stream.read_exact(&mut frame[..HEADER_LEN]).await {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    return Ok(())
                }
                Err(e) => Err(e)?,
            }
            let len = wire::body_len(&frame)?;
            frame.resize(HEADER_LEN + len, 0);
            stream.read_exact(&mut frame[HEADER_LEN..]).await?;

            let (_, msg) = wire::decode(&frame)?;
            if inbox.send(msg).is_err() {
                trace!("inbox closed, dropping {}", msg);
                return Ok(());
            }
        }
    }

    /// Connects on the first frame and writes every frame of the link to the
    /// same stream. Dropping the queue closes the link.
    async fn write(
        from: NodeId,
        to: NodeId,
        addr: SocketAddr,
        mut frames: mpsc::UnboundedReceiver<Vec<u8>>,
    ) {
        let Some(first) = frames.recv().await else {
            return;
        };
        let mut stream = match TcpStream::connect(addr).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("link {}->{} could not reach {}: {}", from, to, addr, e);
                return;
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            trace!("link {}->{} keeps nagle on: {}", from, to, e);
        }

        let mut next = Some(first);
        while let Some(frame) = next {
            if let Err(e) = stream.write_all(&frame).await {
                warn!("link {}->{} failed: {}", from, to, e);
                return;
            }
            next = frames.recv().await;
        }
    }
}

impl Transport for TcpTransport {
    fn send(&self, to: NodeId, msg: Message) -> Result<(), Error> {
        if !self.directory.contains_key(&to) {
            Err(Error::UnknownEndpoint(to))?
        }
        let link = self.links.get(&(msg.from, to)).ok_or(Error::NoLink {
            from: msg.from,
            to,
        })?;
        link.send(wire::encode(&msg)?)
            .map_err(|_| Error::EndpointClosed(to))
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
