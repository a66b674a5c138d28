use std::{path::PathBuf, process::ExitCode, time::Duration};

use clap::{Parser, ValueEnum};
use fragmerge::mst::{
    run, Error, HarnessConfig, Topology, TransportConfig, TransportKind,
};
use tracing::{error, info};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Network {
    /// In-process channels
    Memory,
    /// A loopback or LAN listener per node address
    Tcp,
}

impl From<Network> for TransportKind {
    fn from(network: Network) -> Self {
        match network {
            Network::Memory => TransportKind::Memory,
            Network::Tcp => TransportKind::Tcp,
        }
    }
}

/// Builds a minimum spanning tree of a weighted graph, one task per vertex.
#[derive(Parser, Debug)]
#[command(name = "fragmerge")]
#[command(version, about, long_about = None)]
struct Args {
    /// Topology file, JSON or YAML. Given once, it holds the whole graph;
    /// given several times, each file holds a single node record.
    #[arg(short, long, required_unless_present = "demo")]
    topology: Vec<PathBuf>,

    /// Run the built-in 8 node graph instead of reading a topology
    #[arg(long, conflicts_with = "topology")]
    demo: bool,

    /// Transport carrying the messages
    #[arg(long, value_enum, default_value_t = Network::Memory)]
    transport: Network,

    /// Upper bound of a random per-message delay on every link
    #[arg(long)]
    jitter_ms: Option<u64>,

    /// Seed for link jitter
    #[arg(long, default_value = "0")]
    seed: u64,

    /// Push every message through the wire codec
    #[arg(long)]
    codec_roundtrip: bool,

    /// Abort if the run has not finished after this many seconds
    #[arg(long)]
    deadline_secs: Option<u64>,
}

fn load(args: &Args) -> Result<Topology, Error> {
    if args.demo {
        return Ok(Topology::demo());
    }
    match args.topology.as_slice() {
        [path] => Topology::from_file(path),
        paths => Topology::from_record_files(paths),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let topology = match load(&args) {
        Ok(topology) => topology,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let config = HarnessConfig {
        kind: args.transport.into(),
        transport: TransportConfig {
            jitter: args.jitter_ms.map(Duration::from_millis),
            seed: args.seed,
            codec_roundtrip: args.codec_roundtrip,
        },
        deadline: args.deadline_secs.map(Duration::from_secs),
    };
    info!(
        "running over {} nodes on {:?} transport",
        topology.len(),
        args.transport
    );

    let outcome = match run(&topology, config).await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    print!("{}", outcome);
    if let Err(violation) = outcome.check_invariants() {
        error!("{}", violation);
        return ExitCode::FAILURE;
    }
    let reference = topology.reference_mst_weight();
    if outcome.total_weight() != reference {
        error!(
            "tree weight {} differs from the reference {}",
            outcome.total_weight(),
            reference
        );
        return ExitCode::FAILURE;
    }
    info!("tree weight matches the reference");
    ExitCode::SUCCESS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn a_topology_or_the_demo_is_required() {
        assert!(Args::try_parse_from(["fragmerge"]).is_err());
        assert!(Args::try_parse_from([
            "fragmerge",
            "--demo",
            "--topology",
            "graph.json"
        ])
        .is_err());

        let demo = Args::try_parse_from(["fragmerge", "--demo"]).unwrap();
        assert!(matches!(load(&demo), Ok(t) if t == Topology::demo()));
        assert!(matches!(demo.transport, Network::Memory));
    }

    #[test]
    fn transport_is_selectable() {
        let args =
            Args::try_parse_from(["fragmerge", "--demo", "--transport", "tcp"])
                .unwrap();
        assert_eq!(TransportKind::from(args.transport), TransportKind::Tcp);
        assert!(Args::try_parse_from([
            "fragmerge",
            "--demo",
            "--transport",
            "quic"
        ])
        .is_err());
    }
}
