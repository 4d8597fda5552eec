//! The canonical persistent entity and id generation.

use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Reserved metadata field holding the original text of a text-path insert.
pub const META_CONTENT: &str = "content";
/// Reserved metadata field holding the insertion time in milliseconds.
pub const META_TIMESTAMP: &str = "timestamp";

/// A stored vector with its metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    /// Opaque unique identifier, lexicographically ordered by creation time.
    pub id: String,
    /// Dense f32 vector of the database's configured dimensionality.
    pub vector: Vec<f32>,
    /// Arbitrary JSON metadata. See [`META_CONTENT`] and [`META_TIMESTAMP`].
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Last-mutation time in milliseconds since the Unix epoch.
    pub timestamp: i64,
}

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Id generator: 13-digit zero-padded millisecond prefix plus an 8-hex
/// random suffix. The prefix is driven by a logical clock that never
/// repeats, so ids sort lexicographically by creation order even when
/// several are issued within one millisecond.
#[derive(Debug, Default)]
pub struct IdGenerator {
    last: Mutex<i64>,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> String {
        let mut last = self.last.lock();
        let now = now_millis();
        let ts = if now > *last { now } else { *last + 1 };
        *last = ts;
        let suffix: u32 = rand::random();
        format!("{ts:013}-{suffix:08x}")
    }
}

/// Sanitize caller metadata and stamp the reserved fields.
///
/// Null values are dropped (they carry no filterable information and the
/// export envelope should not grow them), `content` is set from the text
/// path when present, and `timestamp` records the mutation time.
pub fn sanitize_metadata(
    metadata: Option<Map<String, Value>>,
    text: Option<&str>,
    timestamp: i64,
) -> Map<String, Value> {
    let mut out = metadata.unwrap_or_default();
    out.retain(|_, value| !value.is_null());
    if let Some(text) = text {
        out.insert(META_CONTENT.to_string(), Value::from(text));
    }
    out.insert(META_TIMESTAMP.to_string(), Value::from(timestamp));
    out
}
