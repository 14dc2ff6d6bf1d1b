
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::BTreeMap;

use crate::database::{Metadata, VectorEntry};

/// Raw `vector_records` row; metadata is still JSON text
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct VectorRecordRow {
    pub id: String,
    pub namespace: String,
    pub text: String,
    pub metadata: String,
    pub created_at: NaiveDateTime,
}

/// Durable record of one indexed chunk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    pub id: String,
    pub namespace: String,
    pub text: String,
    pub metadata: Metadata,
    pub created_at: NaiveDateTime,
}

impl TryFrom<VectorRecordRow> for VectorRecord {
    type Error = serde_json::Error;

    #[inline]
    fn try_from(row: VectorRecordRow) -> Result<Self, Self::Error> {
        Ok(Self {
            metadata: serde_json::from_str(&row.metadata)?,
            id: row.id,
            namespace: row.namespace,
            text: row.text,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewVectorRecord {
    pub id: String,
    pub namespace: String,
    pub text: String,
    pub metadata: Metadata,
}

impl NewVectorRecord {
    #[inline]
    pub fn from_entry(entry: &VectorEntry, namespace: &str) -> Self {
        Self {
            id: entry.id.clone(),
            namespace: namespace.to_string(),
            text: entry.text.clone(),
            metadata: entry.metadata.clone(),
        }
    }
}

/// Aggregates over a namespace's current rows
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceStats {
    pub namespace: String,
    pub total_vectors: i64,
    pub first_created: Option<NaiveDateTime>,
    pub last_updated: Option<NaiveDateTime>,
    /// Number of distinct values seen for each metadata key
    pub distinct_tag_counts: BTreeMap<String, i64>,
}

impl NamespaceStats {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.total_vectors == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct NamespaceSummary {
    pub namespace: String,
    pub total_vectors: i64,
    pub last_updated: Option<NaiveDateTime>,
}
