//! The fragment-merging state machine.
//!
//! Every node starts as a singleton fragment. In each round a fragment finds
//! its minimum-weight outgoing edge: the root broadcasts `DOTEST` down its
//! sub-tree, every node `TEST`s its unclassified edges, and replies plus
//! child `REPORT`s are folded back up to the root. The root then routes a
//! `MERGE` down to the node holding the winning edge, which sends `CONNECT`
//! across it.
//!
//! Two fragments that `CONNECT` over the same edge unify. The endpoint with
//! the larger id becomes the new root and relabels everything reachable over
//! tree edges with `NEW_FRAGMENT`. Any `CONNECT` held at a node when the
//! relabel passes through it is absorbed as a new child, so fragments that
//! picked this one join the same wave. `ACK`s flow back up and the root
//! starts the next round once the whole fragment is relabelled.
//!
//! A root whose round finds no outgoing edge spans its component and shuts
//! the tree down with `TERMINATE`.

use tracing::{debug, trace};

use super::{
    error::{
        Counter,
        Error::{self, *},
    },
    net::wire::{Envelope, Message, MessageType, Payload},
    node::{Node, NodeId, Rank},
};

impl Node {
    /// Dispatches one inbound message, then runs the post-dispatch barrier
    /// check. Outbound messages are appended to `out`.
    ///
    /// Non-fatal protocol violations come back as errors too; see
    /// [`Error::is_fatal`].
    pub fn handle(
        &mut self,
        msg: Message,
        out: &mut Vec<Envelope>,
    ) -> Result<(), Error> {
        self.dispatch(msg, out)?;
        self.complete_barrier(out)
    }

    fn dispatch(
        &mut self,
        msg: Message,
        out: &mut Vec<Envelope>,
    ) -> Result<(), Error> {
        if self.terminated {
            trace!("terminated, ignoring {}", msg);
            return Ok(());
        }

        let from = msg.from;
        if let Payload::Init = msg.payload {
            return self.on_init(from, out);
        }
        if self.neighbour(from).is_none() {
            Err(NotANeighbour {
                node: self.id,
                from,
                kind: msg.kind(),
            })?
        }

        match msg.payload {
            Payload::Init => Ok(()),
            Payload::Test { fragment } => {
                self.on_test(from, fragment, out);
                Ok(())
            }
            Payload::Accept => self.on_accept(from),
            Payload::Reject => self.on_reject(from),
            Payload::Report { min_weight } => self.on_report(from, min_weight),
            Payload::Merge => self.route_merge(from, out),
            Payload::Connect => {
                self.received_connect.insert(from);
                self.resolve_connect(from, out);
                Ok(())
            }
            Payload::NewFragment { fragment } => {
                self.relabel(fragment, from, out);
                Ok(())
            }
            Payload::Ack => self.on_ack(from, out),
            Payload::DoTest => {
                if from != self.parent {
                    Err(self.unexpected(from, MessageType::DoTest))?
                }
                self.begin_round(out);
                Ok(())
            }
            Payload::Terminate => {
                if from != self.parent {
                    Err(self.unexpected(from, MessageType::Terminate))?
                }
                self.terminate(out);
                Ok(())
            }
        }
    }

    /// Fires once per round, when every test reply and child report owed to
    /// this node has arrived.
    fn complete_barrier(
        &mut self,
        out: &mut Vec<Envelope>,
    ) -> Result<(), Error> {
        if self.terminated || self.barrier != Some(0) {
            return Ok(());
        }
        self.barrier = None;

        if !self.is_root() {
            trace!("reporting {:?} to {}", self.min_weight, self.parent);
            let min_weight = self.min_weight;
            self.send(out, self.parent, Payload::Report { min_weight });
            return Ok(());
        }

        match self.min_weight {
            None => {
                debug!(
                    "fragment {} has no outgoing edge left, terminating",
                    self.fragment
                );
                self.terminate(out);
                Ok(())
            }
            Some(rank) => {
                debug!(
                    "fragment {} merges over {} held by {:?}",
                    self.fragment, rank, self.best_candidate
                );
                self.route_merge(self.id, out)
            }
        }
    }

    fn on_init(
        &mut self,
        from: NodeId,
        out: &mut Vec<Envelope>,
    ) -> Result<(), Error> {
        if from != NodeId::BOOTSTRAP || self.rounds > 0 {
            Err(self.unexpected(from, MessageType::Init))?
        }
        self.begin_round(out);
        Ok(())
    }

    /// Replies from current fragment membership alone.
    fn on_test(
        &mut self,
        from: NodeId,
        fragment: NodeId,
        out: &mut Vec<Envelope>,
    ) {
        let reply = if fragment != self.fragment {
            Payload::Accept
        } else {
            Payload::Reject
        };
        self.send(out, from, reply);
    }

    fn on_accept(&mut self, from: NodeId) -> Result<(), Error> {
        self.owe_one_less(MessageType::Accept)?;
        let rank = match self.neighbour(from) {
            Some(n) => n.edge.rank(),
            None => Err(self.unexpected(from, MessageType::Accept))?,
        };
        if self.improves(rank) {
            self.min_weight = Some(rank);
            self.best_candidate = Some(self.id);
        }
        Ok(())
    }

    fn on_reject(&mut self, from: NodeId) -> Result<(), Error> {
        self.owe_one_less(MessageType::Reject)?;
        if let Some(n) = self.neighbour(from) {
            if n.edge.mark_non_member() {
                trace!("edge to {} is internal", from);
            }
        }
        Ok(())
    }

    fn on_report(
        &mut self,
        from: NodeId,
        min_weight: Option<Rank>,
    ) -> Result<(), Error> {
        if !self.children.contains(&from) {
            Err(self.unexpected(from, MessageType::Report))?
        }
        self.owe_one_less(MessageType::Report)?;
        if let Some(rank) = min_weight {
            if self.improves(rank) {
                self.min_weight = Some(rank);
                self.best_candidate = Some(from);
            }
        }
        Ok(())
    }

    /// Moves the merge one hop closer to the node holding the best edge, or
    /// connects across it if that node is this one.
    fn route_merge(
        &mut self,
        from: NodeId,
        out: &mut Vec<Envelope>,
    ) -> Result<(), Error> {
        match self.best_candidate {
            Some(candidate) if candidate == self.id => self.connect(from, out),
            Some(next) => {
                self.send(out, next, Payload::Merge);
                Ok(())
            }
            None => Err(self.unexpected(from, MessageType::Merge)),
        }
    }

    fn connect(
        &mut self,
        from: NodeId,
        out: &mut Vec<Envelope>,
    ) -> Result<(), Error> {
        let target = self
            .neighbours
            .iter()
            .filter(|n| n.edge.is_basic())
            .min_by_key(|n| n.edge.rank())
            .map(|n| n.node);
        let Some(target) = target else {
            return Err(self.unexpected(from, MessageType::Merge));
        };

        debug!("connecting to {}", target);
        self.sent_connect.insert(target);
        self.send(out, target, Payload::Connect);
        self.resolve_connect(target, out);
        Ok(())
    }

    /// Unifies with `peer` once both sides have asked. The larger id leads;
    /// the other side waits for its `NEW_FRAGMENT`. A one-sided request is
    /// held until a relabel absorbs it.
    fn resolve_connect(&mut self, peer: NodeId, out: &mut Vec<Envelope>) {
        if !self.sent_connect.contains(&peer)
            || !self.received_connect.contains(&peer)
        {
            trace!("holding connect with {}", peer);
            return;
        }

        if self.id > peer {
            debug!("merged with {}, leading fragment {}", peer, self.id);
            self.relabel(self.id, self.id, out);
        } else {
            debug!("merged with {}, waiting for it to relabel", peer);
        }
    }

    /// Joins `fragment` with `parent` as the new parent (itself for a new
    /// root), turns the old parent and every held connect into children and
    /// passes the relabel on.
    fn relabel(
        &mut self,
        fragment: NodeId,
        parent: NodeId,
        out: &mut Vec<Envelope>,
    ) {
        trace!("relabelling to fragment {} under {}", fragment, parent);
        self.fragment = fragment;
        self.min_weight = None;
        self.best_candidate = None;
        self.barrier = None;
        self.acks = 0;
        self.relabels += 1;

        let previous = self.parent;
        if previous != self.id && previous != parent {
            self.children.insert(previous);
        }
        self.parent = parent;
        self.children.remove(&parent);
        if let Some(n) = self.neighbour(parent) {
            n.edge.mark_member();
        }

        let held: Vec<NodeId> = self.received_connect.drain().collect();
        for peer in held.into_iter().filter(|p| *p != parent) {
            if let Some(n) = self.neighbour(peer) {
                n.edge.mark_member();
            }
            self.children.insert(peer);
        }
        self.sent_connect.clear();

        let mut children: Vec<NodeId> = self.children.iter().copied().collect();
        children.sort();
        for child in children {
            self.send(out, child, Payload::NewFragment { fragment });
            self.acks += 1;
        }

        if self.acks == 0 {
            self.relabel_done(out);
        }
    }

    fn on_ack(
        &mut self,
        from: NodeId,
        out: &mut Vec<Envelope>,
    ) -> Result<(), Error> {
        if !self.children.contains(&from) {
            Err(self.unexpected(from, MessageType::Ack))?
        }
        self.acks = self.acks.checked_sub(1).ok_or(CounterUnderflow {
            node: self.id,
            counter: Counter::Ack,
            kind: MessageType::Ack,
        })?;
        if self.acks == 0 {
            self.relabel_done(out);
        }
        Ok(())
    }

    /// The whole sub-tree below this node carries the new label.
    fn relabel_done(&mut self, out: &mut Vec<Envelope>) {
        if self.is_root() {
            debug!("fragment {} relabelled", self.fragment);
            self.begin_round(out);
        } else {
            self.send(out, self.parent, Payload::Ack);
        }
    }

    /// Tests every unclassified edge and hands the round down to every
    /// child. The barrier counts each reply and report still owed.
    fn begin_round(&mut self, out: &mut Vec<Envelope>) {
        self.rounds += 1;
        self.min_weight = None;
        self.best_candidate = None;

        let mut owed = 0;
        for n in &self.neighbours {
            let payload = if n.edge.is_basic() {
                Payload::Test {
                    fragment: self.fragment,
                }
            } else if self.children.contains(&n.node) {
                Payload::DoTest
            } else {
                continue;
            };
            out.push(Envelope {
                to: n.node,
                message: Message::new(self.id, payload),
            });
            owed += 1;
        }
        self.barrier = Some(owed);
        debug!(
            "round {} of fragment {} started, {} replies owed",
            self.rounds, self.fragment, owed
        );
    }

    fn terminate(&mut self, out: &mut Vec<Envelope>) {
        self.terminated = true;
        let mut children: Vec<NodeId> = self.children.iter().copied().collect();
        children.sort();
        for child in children {
            self.send(out, child, Payload::Terminate);
        }
        debug!("terminated in fragment {}", self.fragment);
    }

    fn owe_one_less(&mut self, kind: MessageType) -> Result<(), Error> {
        match self.barrier {
            Some(owed) if owed > 0 => {
                self.barrier = Some(owed - 1);
                Ok(())
            }
            _ => Err(CounterUnderflow {
                node: self.id,
                counter: Counter::Barrier,
                kind,
            }),
        }
    }

    fn improves(&self, rank: Rank) -> bool {
        self.min_weight.map_or(true, |current| rank < current)
    }

    fn send(&self, out: &mut Vec<Envelope>, to: NodeId, payload: Payload) {
        out.push(Envelope {
            to,
            message: Message::new(self.id, payload),
        });
    }

    fn unexpected(&self, from: NodeId, kind: MessageType) -> Error {
        UnexpectedMessage {
            node: self.id,
            from,
            kind,
        }
    }
}
