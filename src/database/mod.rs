// Database module
// Vector index (LanceDB locally, an HTTP vector service remotely) plus the SQLite metadata store

pub mod index;
pub mod lancedb;
pub mod remote;
pub mod sqlite;


use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use index::{PLACEHOLDER_ID, SYSTEM_NAMESPACE, VectorBackend, VectorIndex};
pub use sqlite::Database;

/// Arbitrary tags attached to an entry
pub type Metadata = serde_json::Map<String, Value>;

/// One embedded chunk as stored in the vector index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorEntry {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub metadata: Metadata,
    pub embedding: Vec<f32>,
}

/// A scored hit returned by a similarity search
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub id: String,
    pub text: String,
    pub metadata: Metadata,
    /// Similarity in `[0, 1]`, higher is closer
    pub score: f32,
}

/// True when every key in `filter` is present in `metadata` with an equal value
#[inline]
pub fn matches_filter(metadata: &Metadata, filter: &Metadata) -> bool {
    filter
        .iter()
        .all(|(key, expected)| metadata.get(key) == Some(expected))
}

/// Quote a string literal for a LanceDB SQL predicate
#[inline]
pub(crate) fn sql_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
