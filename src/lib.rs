pub mod mst;
