use std::{sync::Arc, time::Duration};

use chrono::Utc;
use hashbrown::HashMap;
use tokio::{sync::Barrier, task::JoinSet, time::timeout};
use tracing::{debug, info, warn};
use typed_builder::TypedBuilder;

use super::{
    bootstrap,
    error::Error,
    event_loop::EventLoop,
    net::{
        memory::{Inbox, MemoryTransport, TransportConfig},
        tcp::TcpTransport,
        wire::{Message, Payload},
        Transport,
    },
    node::{Node, NodeId},
    outcome::Outcome,
    topology::Topology,
};

/// Which transport carries the run's messages.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TransportKind {
    /// In-process channels, optionally jittered.
    #[default]
    Memory,
    /// One listener per node address, one connection per ordered pair.
    Tcp,
}

#[derive(Clone, Debug, TypedBuilder)]
pub struct HarnessConfig {
    #[builder(default)]
    pub kind: TransportKind,
    /// Settings of the memory transport. Only `codec_roundtrip` has a
    /// counterpart over TCP, where every message is framed anyway.
    #[builder(default)]
    pub transport: TransportConfig,
    /// Give up and abort every node if the run has not finished by then.
    #[builder(default, setter(strip_option))]
    pub deadline: Option<Duration>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Runs the protocol over `topology` until every node has terminated.
///
/// One task per node is spawned, all of them are released together, and the
/// virtual zero node then sends `INIT` to each one.
pub async fn run(
    topology: &Topology,
    config: HarnessConfig,
) -> Result<Outcome, Error> {
    let graph = bootstrap::build(topology)?;
    let started_at = Utc::now();
    let endpoints = graph.endpoints.iter().cloned();
    let links = graph.links();

    let nodes = match config.kind {
        TransportKind::Memory => {
            let (transport, inboxes) =
                MemoryTransport::new(endpoints, links, &config.transport);
            drive(graph.nodes, transport, inboxes, config.deadline).await?
        }
        TransportKind::Tcp => {
            if config.transport.jitter.is_some() {
                warn!("jitter only applies to the memory transport");
            }
            let (transport, inboxes) =
                TcpTransport::bind(endpoints, links).await?;
            drive(graph.nodes, transport, inboxes, config.deadline).await?
        }
    };

    let outcome = Outcome::new(&nodes, &graph.edges, started_at, Utc::now());
    info!(
        "{} nodes terminated in {} fragment(s), tree weight {}",
        outcome.nodes.len(),
        outcome.fragments().len(),
        outcome.total_weight()
    );
    Ok(outcome)
}

/// Spawns an event loop per node, releases them together, kicks them off
/// with `INIT` and waits for every one of them to terminate.
async fn drive<T: Transport>(
    nodes: Vec<Node>,
    transport: T,
    mut inboxes: HashMap<NodeId, Inbox>,
    deadline: Option<Duration>,
) -> Result<Vec<Node>, Error> {
    let transport = Arc::new(transport);
    let start = Arc::new(Barrier::new(nodes.len() + 1));
    let ids: Vec<NodeId> = nodes.iter().map(|n| n.id()).collect();

    let mut tasks = JoinSet::new();
    for node in nodes {
        let inbox = inboxes
            .remove(&node.id())
            .ok_or(Error::UnknownEndpoint(node.id()))?;
        let event_loop =
            EventLoop::new(node, inbox, transport.clone(), start.clone());
        tasks.spawn(event_loop.run());
    }

    start.wait().await;
    debug!("all {} nodes ready, sending INIT", ids.len());
    for id in &ids {
        let init = Message::new(NodeId::BOOTSTRAP, Payload::Init);
        transport.send(*id, init)?;
    }

    match deadline {
        Some(deadline) => match timeout(deadline, join_all(&mut tasks)).await {
            Ok(joined) => joined,
            Err(_) => {
                tasks.abort_all();
                Err(Error::DeadlineElapsed)
            }
        },
        None => join_all(&mut tasks).await,
    }
}

/// Collects every node's final state. The first failure wins; dropping the
/// set aborts whatever is still running.
async fn join_all(
    tasks: &mut JoinSet<Result<Node, Error>>,
) -> Result<Vec<Node>, Error> {
    let mut nodes = Vec::with_capacity(tasks.len());
    while let Some(joined) = tasks.join_next().await {
        let node = joined.map_err(|_| Error::NodeTaskPanicked)??;
        nodes.push(node);
    }
    nodes.sort_by_key(|n| n.id());
    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::*;
    use crate::mst::node::EdgeState;

    const FOUR_NODES: &[(u32, u32, u64)] =
        &[(0, 1, 3), (0, 2, 2), (1, 2, 2), (1, 3, 3)];

    fn config() -> HarnessConfig {
        HarnessConfig::builder()
            .deadline(Duration::from_secs(10))
            .build()
    }

    fn jittered(seed: u64) -> HarnessConfig {
        HarnessConfig::builder()
            .transport(
                TransportConfig::builder()
                    .jitter(Duration::from_micros(300))
                    .seed(seed)
                    .codec_roundtrip(true)
                    .build(),
            )
            .deadline(Duration::from_secs(10))
            .build()
    }

    fn over_tcp() -> HarnessConfig {
        HarnessConfig::builder()
            .kind(TransportKind::Tcp)
            .deadline(Duration::from_secs(20))
            .build()
    }

    /// Every node on 127.0.0.1 with an ephemeral port.
    fn on_loopback(mut topology: Topology) -> Topology {
        for record in &mut topology.nodes {
            record.address = "127.0.0.1".to_string();
        }
        topology
    }

    /// A random tree over `n` vertices plus some extra edges, with weights
    /// from a small range so that ties are common.
    fn random_connected(rng: &mut StdRng, n: u32) -> Topology {
        let mut edges: Vec<(u32, u32, u64)> = Vec::new();
        for v in 1..n {
            edges.push((rng.gen_range(0..v), v, rng.gen_range(1..=5)));
        }
        for _ in 0..n {
            let a = rng.gen_range(0..n);
            let b = rng.gen_range(0..n);
            let taken = edges
                .iter()
                .any(|&(x, y, _)| (x, y) == (a, b) || (x, y) == (b, a));
            if a != b && !taken {
                edges.push((a, b, rng.gen_range(1..=5)));
            }
        }
        Topology::from_edges(&edges)
    }

    fn assert_spanning(outcome: &Outcome, topology: &Topology) {
        assert_eq!(outcome.check_invariants(), Ok(()));
        assert_eq!(outcome.total_weight(), topology.reference_mst_weight());
        assert_eq!(outcome.fragments().len(), topology.component_count());
    }

    fn assert_four_node_tree(outcome: &Outcome) {
        assert_eq!(outcome.total_weight(), 7);
        let state = |a, b| outcome.edge(NodeId(a), NodeId(b)).unwrap().state;
        assert_eq!(state(0, 2), EdgeState::Member);
        assert_eq!(state(1, 2), EdgeState::Member);
        assert_eq!(state(1, 3), EdgeState::Member);
        assert_eq!(state(0, 1), EdgeState::NonMember);

        let fragment = outcome.fragments()[0];
        assert!(outcome.nodes.iter().all(|n| n.fragment == fragment));
    }

    #[tokio::test]
    async fn four_node_scenario() {
        let topology = Topology::from_edges(FOUR_NODES);
        let outcome = run(&topology, config()).await.unwrap();
        assert_spanning(&outcome, &topology);
        assert_four_node_tree(&outcome);
    }

    #[tokio::test]
    async fn four_node_scenario_over_tcp() {
        let topology = on_loopback(Topology::from_edges(FOUR_NODES));
        let outcome = run(&topology, over_tcp()).await.unwrap();
        assert_spanning(&outcome, &topology);
        assert_four_node_tree(&outcome);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn demo_graph_over_tcp() {
        let topology = on_loopback(Topology::demo());
        let outcome = run(&topology, over_tcp()).await.unwrap();
        assert_spanning(&outcome, &topology);
        assert_eq!(outcome.total_weight(), 19);
    }

    #[tokio::test]
    async fn single_edge_merges_once() {
        let topology = Topology::from_edges(&[(1, 2, 9)]);
        let outcome = run(&topology, config()).await.unwrap();
        assert_spanning(&outcome, &topology);

        // the larger id wins the connect race
        assert_eq!(outcome.fragments(), vec![NodeId(2)]);
        let one = outcome.node(NodeId(1)).unwrap();
        assert_eq!(one.parent, NodeId(2));
        assert_eq!(one.relabels, 1);
        let two = outcome.node(NodeId(2)).unwrap();
        assert_eq!(two.children, vec![NodeId(1)]);
        assert_eq!(two.relabels, 1);
        // the singleton round, then one round that finds nothing left
        assert_eq!(two.rounds, 2);
        assert_eq!(
            outcome.edge(NodeId(1), NodeId(2)).unwrap().state,
            EdgeState::Member
        );
    }

    #[tokio::test]
    async fn single_node_terminates_alone() {
        let topology = Topology::from_edges(&[]);
        assert!(matches!(
            run(&topology, config()).await,
            Err(Error::EmptyTopology)
        ));

        let topology = Topology::from_json(
            r#"{"nodes": [{"id": 7, "address": "127.0.0.7"}]}"#,
        )
        .unwrap();
        let outcome = run(&topology, config()).await.unwrap();
        assert_spanning(&outcome, &topology);
        assert_eq!(outcome.fragments(), vec![NodeId(7)]);
        assert_eq!(outcome.tree_edges().count(), 0);
    }

    #[tokio::test]
    async fn demo_graph_matches_reference() {
        let topology = Topology::demo();
        let outcome = run(&topology, config()).await.unwrap();
        assert_spanning(&outcome, &topology);
        assert_eq!(outcome.total_weight(), 19);
    }

    #[tokio::test]
    async fn disconnected_graph_ends_with_a_forest() {
        let topology = Topology::from_edges(&[
            (0, 1, 4),
            (1, 2, 1),
            (5, 6, 2),
            (6, 7, 2),
            (5, 7, 2),
        ]);
        let outcome = run(&topology, config()).await.unwrap();
        assert_spanning(&outcome, &topology);
        assert_eq!(outcome.fragments().len(), 2);

        let fragment = |id| outcome.node(NodeId(id)).unwrap().fragment;
        assert_eq!(fragment(0), fragment(2));
        assert_eq!(fragment(5), fragment(7));
        assert_ne!(fragment(0), fragment(5));
        assert_eq!(
            outcome.edge(NodeId(0), NodeId(1)).unwrap().state,
            EdgeState::Member
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn random_graphs_under_jitter_match_reference() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for seed in 0..20 {
            let n = rng.gen_range(2..=16);
            let topology = random_connected(&mut rng, n);
            let outcome = run(&topology, jittered(seed)).await.unwrap();
            assert_spanning(&outcome, &topology);
            assert_eq!(outcome.fragments().len(), 1);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn four_node_scenario_under_jitter() {
        let topology = Topology::from_edges(FOUR_NODES);
        for seed in 0..10 {
            let outcome = run(&topology, jittered(seed)).await.unwrap();
            assert_spanning(&outcome, &topology);
            assert_four_node_tree(&outcome);
        }
    }

    #[tokio::test]
    async fn deadline_aborts_the_run() {
        let config = HarnessConfig::builder()
            .transport(
                TransportConfig::builder()
                    .jitter(Duration::from_millis(50))
                    .seed(3)
                    .build(),
            )
            .deadline(Duration::from_millis(1))
            .build();
        assert!(matches!(
            run(&Topology::demo(), config).await,
            Err(Error::DeadlineElapsed)
        ));
    }

    #[tokio::test]
    async fn invalid_topology_never_starts() {
        let mut topology = Topology::from_edges(&[(0, 1, 3)]);
        topology.nodes[1].neighbours[0].edge_weight = 4;
        assert!(matches!(
            run(&topology, config()).await,
            Err(Error::WeightMismatch { .. })
        ));

        let mut topology = Topology::from_edges(FOUR_NODES);
        topology.nodes[2].address = "somewhere".to_string();
        assert!(matches!(
            run(&topology, over_tcp()).await,
            Err(Error::InvalidAddress { node: NodeId(2), .. })
        ));
    }
}
