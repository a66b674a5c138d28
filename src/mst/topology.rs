//! Declarative description of the graph a run starts from.
//!
//! A description is one record per vertex, each listing the vertex's
//! neighbours and the weight of the edge to each of them. Both endpoints of
//! an edge list it; [`bootstrap`](super::bootstrap) checks that they agree.
//!
//! Files are JSON or YAML, told apart by their extension.

use std::{collections::BTreeMap, fs, path::Path};

use petgraph::{
    algo::{connected_components, min_spanning_tree},
    data::Element,
    graphmap::UnGraphMap,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::error::Error;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NeighbourRecord {
    pub id: u32,
    pub edge_weight: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: u32,
    /// Opaque network identity, handed to the transport as is.
    pub address: String,
    #[serde(default)]
    pub neighbours: Vec<NeighbourRecord>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    pub nodes: Vec<NodeRecord>,
}

impl Topology {
    pub fn new(nodes: Vec<NodeRecord>) -> Self {
        Self { nodes }
    }

    /// Parses a whole description: `{"nodes": [...]}`.
    pub fn from_json(json: &str) -> Result<Self, Error> {
        Ok(serde_json::from_str(json)?)
    }

    /// Reads a whole description from one file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        read(path.as_ref())
    }

    /// Reads one node record per file, e.g. `node-0.yaml`, `node-1.yaml`.
    pub fn from_record_files<P: AsRef<Path>>(
        paths: impl IntoIterator<Item = P>,
    ) -> Result<Self, Error> {
        let nodes = paths
            .into_iter()
            .map(|path| read(path.as_ref()))
            .collect::<Result<_, _>>()?;
        Ok(Self { nodes })
    }

    /// Builds a symmetric description from `(a, b, weight)` triples, with
    /// loopback addresses derived from the ids.
    pub fn from_edges(edges: &[(u32, u32, u64)]) -> Self {
        fn record(
            records: &mut BTreeMap<u32, NodeRecord>,
            id: u32,
        ) -> &mut NodeRecord {
            records.entry(id).or_insert_with(|| NodeRecord {
                id,
                address: format!("127.0.{}.{}", (id >> 8) & 0xff, id & 0xff),
                neighbours: Vec::new(),
            })
        }

        let mut records = BTreeMap::new();
        for &(a, b, edge_weight) in edges {
            record(&mut records, a)
                .neighbours
                .push(NeighbourRecord { id: b, edge_weight });
            record(&mut records, b)
                .neighbours
                .push(NeighbourRecord { id: a, edge_weight });
        }
        Self {
            nodes: records.into_values().collect(),
        }
    }

    /// An 8 vertex graph with repeated weights.
    pub fn demo() -> Self {
        Self::from_edges(&[
            (0, 1, 3),
            (0, 2, 2),
            (1, 2, 2),
            (1, 3, 3),
            (1, 4, 4),
            (2, 5, 4),
            (4, 5, 3),
            (4, 6, 2),
            (4, 7, 4),
            (5, 7, 3),
            (6, 7, 3),
        ])
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The described graph, one edge per listed pair.
    pub fn graph(&self) -> UnGraphMap<u32, u64> {
        let mut graph = UnGraphMap::new();
        for record in &self.nodes {
            graph.add_node(record.id);
        }
        for record in &self.nodes {
            for n in &record.neighbours {
                graph.add_edge(record.id, n.id, n.edge_weight);
            }
        }
        graph
    }

    /// Total weight of a minimum spanning forest, computed centrally.
    pub fn reference_mst_weight(&self) -> u64 {
        let graph = self.graph();
        min_spanning_tree(&graph)
            .filter_map(|element| match element {
                Element::Edge { weight, .. } => Some(weight),
                _ => None,
            })
            .sum()
    }

    pub fn component_count(&self) -> usize {
        connected_components(&self.graph())
    }
}

fn read<T: DeserializeOwned>(path: &Path) -> Result<T, Error> {
    let text = fs::read_to_string(path)?;
    let yaml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map_or(false, |ext| {
            ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml")
        });
    if yaml {
        Ok(serde_yaml::from_str(&text)?)
    } else {
        Ok(serde_json::from_str(&text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_description() {
        let json = r#"{
            "nodes": [
                {"id": 1, "address": "10.0.0.1",
                 "neighbours": [{"id": 2, "edge_weight": 4}]},
                {"id": 2, "address": "10.0.0.2",
                 "neighbours": [{"id": 1, "edge_weight": 4}]},
                {"id": 3, "address": "10.0.0.3"}
            ]
        }"#;
        let topology = Topology::from_json(json).unwrap();
        assert_eq!(topology.len(), 3);
        assert_eq!(topology.nodes[0].neighbours[0].edge_weight, 4);
        assert!(topology.nodes[2].neighbours.is_empty());
        assert_eq!(topology.component_count(), 2);
    }

    #[test]
    fn bad_json_is_an_error() {
        assert!(matches!(
            Topology::from_json("{\"nodes\": [{\"id\": \"x\"}]}"),
            Err(Error::Json(_))
        ));
        assert!(matches!(
            Topology::from_file("/definitely/not/here.json"),
            Err(Error::Io(_))
        ));
    }

    fn scratch_dir(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "fragmerge-{}-{}",
            name,
            std::process::id()
        ));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn reads_one_record_per_file() {
        let dir = scratch_dir("json-records");
        let topology = Topology::from_edges(&[(1, 2, 6)]);
        let paths: Vec<_> = topology
            .nodes
            .iter()
            .map(|record| {
                let path = dir.join(format!("node-{}.json", record.id));
                let json = serde_json::to_string(record).unwrap();
                fs::write(&path, json).unwrap();
                path
            })
            .collect();

        let read = Topology::from_record_files(&paths).unwrap();
        assert_eq!(read, topology);
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn reads_yaml_node_records() {
        let dir = scratch_dir("yaml-records");
        let one = dir.join("node-1.yaml");
        let two = dir.join("node-2.yml");
        fs::write(
            &one,
            "id: 1\n\
             address: 127.0.0.1\n\
             neighbours:\n\
             \x20 - id: 2\n\
             \x20   edge_weight: 6\n",
        )
        .unwrap();
        fs::write(
            &two,
            "id: 2\n\
             address: 127.0.0.2\n\
             neighbours:\n\
             \x20 - id: 1\n\
             \x20   edge_weight: 6\n",
        )
        .unwrap();

        let read = Topology::from_record_files([&one, &two]).unwrap();
        assert_eq!(read, Topology::from_edges(&[(1, 2, 6)]));
        assert_eq!(read.reference_mst_weight(), 6);

        let whole = dir.join("graph.YAML");
        fs::write(&whole, serde_yaml::to_string(&Topology::demo()).unwrap())
            .unwrap();
        assert_eq!(Topology::from_file(&whole).unwrap(), Topology::demo());
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn bad_yaml_is_an_error() {
        let dir = scratch_dir("bad-yaml");
        let path = dir.join("node-1.yaml");
        fs::write(&path, "id: [1\naddress: 127.0.0.1\n").unwrap();
        assert!(matches!(
            Topology::from_record_files([&path]),
            Err(Error::Yaml(_))
        ));

        // JSON is only assumed for other extensions.
        let json = dir.join("node-1.json");
        fs::write(&json, "id: 1\naddress: 127.0.0.1\n").unwrap();
        assert!(matches!(
            Topology::from_record_files([&json]),
            Err(Error::Json(_))
        ));
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn edges_are_listed_by_both_endpoints() {
        let topology = Topology::from_edges(&[(0, 1, 3), (1, 2, 5)]);
        assert_eq!(topology.len(), 3);
        let middle = &topology.nodes[1];
        assert_eq!(middle.id, 1);
        assert_eq!(middle.address, "127.0.0.1");
        assert_eq!(
            middle.neighbours,
            vec![
                NeighbourRecord {
                    id: 0,
                    edge_weight: 3
                },
                NeighbourRecord {
                    id: 2,
                    edge_weight: 5
                },
            ]
        );
    }

    #[test]
    fn reference_weight_of_the_demo_graph() {
        let demo = Topology::demo();
        assert_eq!(demo.len(), 8);
        assert_eq!(demo.component_count(), 1);
        assert_eq!(demo.reference_mst_weight(), 19);
    }
}
