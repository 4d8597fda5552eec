//! Database configuration.
//!
//! Serde-deserializable with per-field defaults so callers can write a
//! minimal JSON document and get sane tuning knobs everywhere else.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::DbError;
use quiver_core::Metric;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbConfig {
    pub storage: StorageConfig,
    pub index: IndexConfig,
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub performance: PerformanceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Logical database name; the file backend stores `<dir>/<db_name>.qdb`.
    pub db_name: String,
    /// Data directory. `None` selects the in-memory backend.
    #[serde(default)]
    pub dir: Option<PathBuf>,
    /// Caller-managed schema version, carried through the export envelope.
    #[serde(default)]
    pub version: Option<u32>,
    /// Optional hard cap on the data file size.
    #[serde(default)]
    pub max_bytes: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    #[default]
    Cosine,
    L2,
    Dot,
}

impl From<MetricKind> for Metric {
    fn from(kind: MetricKind) -> Self {
        match kind {
            MetricKind::Cosine => Metric::Cosine,
            MetricKind::L2 => Metric::L2,
            MetricKind::Dot => Metric::Dot,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Fixed dimensionality `D` of every stored and queried vector.
    pub dimensions: usize,
    #[serde(default)]
    pub metric: MetricKind,
    /// Index backend selector; only `"hnsw"` ships today.
    #[serde(default)]
    pub index_type: Option<String>,
    #[serde(default = "default_hnsw_m")]
    pub hnsw_m: usize,
    #[serde(default = "default_hnsw_ef_construction")]
    pub hnsw_ef_construction: usize,
    #[serde(default = "default_hnsw_ef_search")]
    pub hnsw_ef_search: usize,
}

fn default_hnsw_m() -> usize {
    16
}

fn default_hnsw_ef_construction() -> usize {
    100
}

fn default_hnsw_ef_search() -> usize {
    50
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    #[default]
    Cpu,
    Gpu,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Model identifier handed to the embedding generator.
    pub model: String,
    #[serde(default)]
    pub device: Device,
    /// Whether text embeddings are memoized in the embedding cache.
    #[serde(default = "default_true")]
    pub cache: bool,
    #[serde(default)]
    pub quantized: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    250
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    /// Byte budget of the record cache.
    #[serde(default = "default_cache_bytes")]
    pub cache_bytes: usize,
    #[serde(default = "default_embedding_cache_entries")]
    pub embedding_cache_entries: usize,
    /// Optional TTL for memoized embeddings.
    #[serde(default)]
    pub embedding_cache_ttl_ms: Option<u64>,
    #[serde(default = "default_batch_max_size")]
    pub batch_max_size: usize,
    #[serde(default = "default_batch_flush_ms")]
    pub batch_flush_ms: u64,
    /// Chunk size for streaming import/export.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Defer embedding model load to the first text operation.
    #[serde(default)]
    pub lazy_load_models: bool,
}

fn default_cache_bytes() -> usize {
    32 * 1024 * 1024
}

fn default_embedding_cache_entries() -> usize {
    512
}

fn default_batch_max_size() -> usize {
    64
}

fn default_batch_flush_ms() -> u64 {
    50
}

fn default_chunk_size() -> usize {
    100
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            cache_bytes: default_cache_bytes(),
            embedding_cache_entries: default_embedding_cache_entries(),
            embedding_cache_ttl_ms: None,
            batch_max_size: default_batch_max_size(),
            batch_flush_ms: default_batch_flush_ms(),
            chunk_size: default_chunk_size(),
            lazy_load_models: false,
        }
    }
}

impl DbConfig {
    /// Minimal in-memory configuration.
    pub fn in_memory(db_name: impl Into<String>, dimensions: usize) -> Self {
        Self {
            storage: StorageConfig {
                db_name: db_name.into(),
                dir: None,
                version: None,
                max_bytes: None,
            },
            index: IndexConfig {
                dimensions,
                metric: MetricKind::Cosine,
                index_type: None,
                hnsw_m: default_hnsw_m(),
                hnsw_ef_construction: default_hnsw_ef_construction(),
                hnsw_ef_search: default_hnsw_ef_search(),
            },
            embedding: EmbeddingConfig {
                model: "external".to_string(),
                device: Device::Cpu,
                cache: true,
                quantized: false,
                max_retries: default_max_retries(),
                retry_delay_ms: default_retry_delay_ms(),
            },
            performance: PerformanceConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<(), DbError> {
        if self.storage.db_name.trim().is_empty() {
            return Err(DbError::InvalidConfig("storage.db_name is required".into()));
        }
        if self.index.dimensions == 0 {
            return Err(DbError::InvalidConfig(
                "index.dimensions must be positive".into(),
            ));
        }
        if self.embedding.model.trim().is_empty() {
            return Err(DbError::InvalidConfig("embedding.model is required".into()));
        }
        if let Some(kind) = self.index.index_type.as_deref() {
            if !kind.eq_ignore_ascii_case("hnsw") {
                return Err(DbError::InvalidConfig(format!(
                    "unknown index_type '{kind}'"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn minimal_json_gets_defaults() {
        let config: DbConfig = serde_json::from_value(json!({
            "storage": {"db_name": "test"},
            "index": {"dimensions": 3},
            "embedding": {"model": "all-MiniLM-L6-v2"}
        }))
        .unwrap();

        assert!(config.validate().is_ok());
        assert_eq!(config.index.metric, MetricKind::Cosine);
        assert_eq!(config.index.hnsw_m, 16);
        assert_eq!(config.embedding.device, Device::Cpu);
        assert!(config.embedding.cache);
        assert_eq!(config.performance.chunk_size, 100);
        assert!(config.storage.dir.is_none());
    }

    #[test]
    fn validation_rejects_bad_configs() {
        let mut config = DbConfig::in_memory("db", 3);
        config.storage.db_name = " ".into();
        assert!(matches!(config.validate(), Err(DbError::InvalidConfig(_))));

        let mut config = DbConfig::in_memory("db", 3);
        config.index.dimensions = 0;
        assert!(matches!(config.validate(), Err(DbError::InvalidConfig(_))));

        let mut config = DbConfig::in_memory("db", 3);
        config.embedding.model = "".into();
        assert!(matches!(config.validate(), Err(DbError::InvalidConfig(_))));

        let mut config = DbConfig::in_memory("db", 3);
        config.index.index_type = Some("ivf".into());
        assert!(matches!(config.validate(), Err(DbError::InvalidConfig(_))));
    }

    #[test]
    fn metric_names_parse_lowercase() {
        let config: DbConfig = serde_json::from_value(json!({
            "storage": {"db_name": "t"},
            "index": {"dimensions": 2, "metric": "l2"},
            "embedding": {"model": "m"}
        }))
        .unwrap();
        assert_eq!(config.index.metric, MetricKind::L2);
    }
}
