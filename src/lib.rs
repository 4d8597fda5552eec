//! Quiver-DB: an embeddable vector database.
//!
//! Stores f32 vectors with JSON metadata, keeps a persistent HNSW index in
//! agreement with durable storage, and answers top-k similarity queries
//! under a composable metadata filter language.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    VectorDb (coordinator)                    │
//! │      lifecycle · write ordering · import/export · rebuild    │
//! ├───────────────┬──────────────┬───────────────┬───────────────┤
//! │ BatchCoalescer│   AnnIndex   │  VectorCache  │ EmbeddingCache│
//! │ timed flushes │  HNSW graph  │  byte-bounded │  sha256 → vec │
//! ├───────────────┴──────────────┴───────────────┴───────────────┤
//! │              Storage (log-structured file / memory)          │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use quiver_db::{DbConfig, InsertData, SearchQuery, VectorDb};
//!
//! # async fn run() -> Result<(), quiver_db::DbError> {
//! let db = VectorDb::new(DbConfig::in_memory("demo", 3))?;
//! db.initialize().await?;
//!
//! let id = db.insert(InsertData::from_vector(vec![1.0, 0.0, 0.0])).await?;
//! let hits = db.search(SearchQuery::from_vector(vec![1.0, 0.0, 0.0]).with_k(1)).await?;
//! assert_eq!(hits[0].id, id);
//! # Ok(())
//! # }
//! ```
//!
//! Exactly one logical writer may mutate a `VectorDb` at a time; concurrent
//! reads against a quiescent writer are safe.

pub mod cache;
pub mod coalescer;
pub mod config;
pub mod db;
pub mod embedding;
pub mod envelope;
pub mod error;
pub mod filter;
pub mod index;
pub mod loader;
pub mod record;
pub mod storage;

pub use config::{
    DbConfig, Device, EmbeddingConfig, IndexConfig, MetricKind, PerformanceConfig, StorageConfig,
};
pub use db::{
    ExportOptions, ExportStream, ImportOptions, InsertData, SearchMatch, SearchQuery, UpdatePatch,
    VectorDb,
};
pub use embedding::{EmbeddingCache, EmbeddingGenerator};
pub use envelope::{EnvelopeMetadata, ExportChunk, ExportEnvelope};
pub use error::{DbError, EmbeddingError, IndexError, StorageError};
pub use filter::{CompoundOp, FilterOp, QueryFilter};
pub use index::{AnnIndex, HnswIndex, IndexStats, SearchHit};
pub use record::VectorRecord;
pub use storage::{FileStorage, MemoryStorage, Storage};

pub use quiver_core::Metric;
