//! Error taxonomy.
//!
//! Leaf layers raise their own typed errors (`StorageError`, `IndexError`,
//! `EmbeddingError`); the `VectorDb` façade passes domain errors through and
//! wraps initialization failures in [`DbError::Init`].

use thiserror::Error;

/// Errors raised by a [`crate::storage::Storage`] backend.
///
/// Cloneable so a failed coalescer flush can deliver the same error to every
/// caller whose operation rode in that batch.
#[derive(Error, Debug, Clone)]
pub enum StorageError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("storage quota exceeded: {needed} bytes needed, {limit} byte limit")]
    Quota { needed: u64, limit: u64 },

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Errors raised by an [`crate::index::AnnIndex`] backend.
#[derive(Error, Debug)]
pub enum IndexError {
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("corrupted index data: {0}")]
    Corrupted(String),
}

/// Errors raised by an [`crate::embedding::EmbeddingGenerator`].
#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("model load failed: {0}")]
    ModelLoad(String),

    #[error("inference failed: {0}")]
    Inference(String),
}

/// Public error surface of the database façade.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("database is not initialized; call initialize() first")]
    NotInitialized,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("invalid insert data: {0}")]
    InvalidInsertData(String),

    #[error("invalid export data: {0}")]
    InvalidExportData(String),

    #[error("incompatible export version {found}: supported major version is {supported}")]
    VersionIncompatible { found: String, supported: u64 },

    #[error("corrupted index data: {0}")]
    IndexCorrupted(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("embedding model unavailable: {0}")]
    ModelLoad(String),

    #[error("initialization failed: {0}")]
    Init(#[source] Box<DbError>),
}

impl From<IndexError> for DbError {
    fn from(err: IndexError) -> Self {
        match err {
            IndexError::DimensionMismatch { expected, actual } => {
                DbError::DimensionMismatch { expected, actual }
            }
            IndexError::Corrupted(msg) => DbError::IndexCorrupted(msg),
        }
    }
}

impl From<EmbeddingError> for DbError {
    fn from(err: EmbeddingError) -> Self {
        DbError::ModelLoad(err.to_string())
    }
}
