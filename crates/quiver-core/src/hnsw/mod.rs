//! HNSW (Hierarchical Navigable Small World) graph.
//!
//! A multi-layer proximity graph: layer 0 holds every node, higher layers
//! hold exponentially fewer nodes and act as express lanes for the greedy
//! descent. Search zooms in from the top layer, then beam-searches layer 0.

mod graph;
mod node;
mod visited;

pub use graph::HnswGraph;
pub use node::Node;
