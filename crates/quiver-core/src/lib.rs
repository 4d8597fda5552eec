//! Quiver Core – vector math and the HNSW graph backing quiver-db's
//! default ANN index.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     HNSW Graph                              │
//! │     layered insert · beam search · tombstoned removal       │
//! ├─────────────────────────────────────────────────────────────┤
//! │                 Metric kernels (dot / l2)                   │
//! │              L2 normalization · score mapping               │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod hnsw;
pub mod metric;

pub use hnsw::HnswGraph;
pub use metric::{dot_product, l2_distance, l2_normalized, Metric};
