//! The versioned export/import envelope.

use serde::{Deserialize, Serialize};

use crate::config::DbConfig;
use crate::error::DbError;
use crate::record::VectorRecord;

/// Version written by `export`.
pub const ENVELOPE_VERSION: &str = "1.0.0";
/// Major version this build can import.
pub const SUPPORTED_MAJOR: u64 = 1;
const CURRENT_MINOR: u64 = 0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportEnvelope {
    pub version: String,
    pub config: DbConfig,
    pub vectors: Vec<VectorRecord>,
    /// Base64 of the serialized index; empty when the index was omitted.
    #[serde(default)]
    pub index: String,
    pub metadata: EnvelopeMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeMetadata {
    pub exported_at: i64,
    pub vector_count: usize,
    pub dimensions: usize,
}

/// One step of the streaming export, in envelope order:
/// metadata → N× vectors → optional index.
#[derive(Debug, Clone)]
pub enum ExportChunk {
    Metadata {
        version: String,
        config: DbConfig,
        metadata: EnvelopeMetadata,
    },
    Vectors(Vec<VectorRecord>),
    Index(String),
}

impl ExportEnvelope {
    /// Parse a JSON document, mapping shape violations to
    /// [`DbError::InvalidExportData`].
    pub fn from_value(value: serde_json::Value) -> Result<Self, DbError> {
        serde_json::from_value(value).map_err(|err| DbError::InvalidExportData(err.to_string()))
    }

    /// Enforce the compatibility rule: major must match, a newer minor is
    /// accepted with a warning, anything unparsable is invalid.
    pub fn check_version(&self) -> Result<(), DbError> {
        let (major, minor, _) = parse_version(&self.version)?;
        if major != SUPPORTED_MAJOR {
            return Err(DbError::VersionIncompatible {
                found: self.version.clone(),
                supported: SUPPORTED_MAJOR,
            });
        }
        if minor > CURRENT_MINOR {
            tracing::warn!(
                version = %self.version,
                "importing envelope from a newer minor version"
            );
        }
        Ok(())
    }
}

fn parse_version(version: &str) -> Result<(u64, u64, u64), DbError> {
    let mut parts = version.split('.');
    let mut next = |name: &str| -> Result<u64, DbError> {
        parts
            .next()
            .and_then(|p| p.parse::<u64>().ok())
            .ok_or_else(|| {
                DbError::InvalidExportData(format!("malformed version '{version}': bad {name}"))
            })
    };
    let major = next("major")?;
    let minor = next("minor")?;
    let patch = next("patch")?;
    if parts.next().is_some() {
        return Err(DbError::InvalidExportData(format!(
            "malformed version '{version}': too many components"
        )));
    }
    Ok((major, minor, patch))
}
