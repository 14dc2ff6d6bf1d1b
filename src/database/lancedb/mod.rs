// LanceDB vector database module
// Local persisted backend for the vector index

#[cfg(test)]
mod tests;

pub mod vector_store;

use arrow::array::{Array, FixedSizeListArray, Float32Array, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use std::sync::Arc;

use super::{Metadata, SearchResult};
use crate::{KbError, Result};

/// Name of the single table holding every namespace
pub const TABLE_NAME: &str = "vectors";

/// One row of the vectors table
#[derive(Debug, Clone, PartialEq)]
pub struct VectorRow {
    pub id: String,
    pub namespace: String,
    pub text: String,
    pub metadata: Metadata,
    pub vector: Vec<f32>,
    /// Monotonic write sequence, used to order equal scores
    pub inserted_at: i64,
}

/// A search hit together with the sequence it was written at
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredRow {
    pub result: SearchResult,
    pub inserted_at: i64,
}

/// Schema of the vectors table for a given embedding dimension
#[inline]
pub fn vector_schema(vector_dim: usize) -> Result<Arc<Schema>> {
    let width = list_width(vector_dim)?;
    Ok(Arc::new(Schema::new(vec![
        Field::new("id", DataType::Utf8, false),
        Field::new("namespace", DataType::Utf8, false),
        Field::new(
            "vector",
            DataType::FixedSizeList(Arc::new(Field::new("item", DataType::Float32, false)), width),
            false,
        ),
        Field::new("text", DataType::Utf8, false),
        Field::new("metadata", DataType::Utf8, false),
        Field::new("inserted_at", DataType::Int64, false),
    ])))
}

/// Dimension of the `vector` column in `schema`, if there is one
#[inline]
pub fn schema_dimension(schema: &Schema) -> Option<usize> {
    schema
        .fields()
        .iter()
        .find(|field| field.name() == "vector")
        .and_then(|field| match field.data_type() {
            DataType::FixedSizeList(_, size) => usize::try_from(*size).ok(),
            _ => None,
        })
}

fn list_width(vector_dim: usize) -> Result<i32> {
    i32::try_from(vector_dim)
        .map_err(|_| KbError::IndexInit(format!("vector dimension {} is too large", vector_dim)))
}

/// Convert rows into a record batch matching [`vector_schema`]
#[inline]
pub fn rows_to_batch(rows: &[VectorRow], vector_dim: usize) -> Result<RecordBatch> {
    let len = rows.len();
    let width = list_width(vector_dim)?;

    let mut ids = Vec::with_capacity(len);
    let mut namespaces = Vec::with_capacity(len);
    let mut texts = Vec::with_capacity(len);
    let mut metadata = Vec::with_capacity(len);
    let mut inserted = Vec::with_capacity(len);
    let mut flat_values = Vec::with_capacity(len * vector_dim);

    for row in rows {
        if row.vector.len() != vector_dim {
            return Err(KbError::IndexWrite(format!(
                "entry '{}' has {} dimensions, table expects {}",
                row.id,
                row.vector.len(),
                vector_dim
            )));
        }
        ids.push(row.id.as_str());
        namespaces.push(row.namespace.as_str());
        texts.push(row.text.as_str());
        metadata.push(
            serde_json::to_string(&row.metadata)
                .map_err(|e| KbError::IndexWrite(format!("Failed to encode metadata: {}", e)))?,
        );
        inserted.push(row.inserted_at);
        flat_values.extend_from_slice(&row.vector);
    }

    let field = Arc::new(Field::new("item", DataType::Float32, false));
    let vector_array = FixedSizeListArray::try_new(
        field,
        width,
        Arc::new(Float32Array::from(flat_values)),
        None,
    )
    .map_err(|e| KbError::IndexWrite(format!("Failed to create vector array: {}", e)))?;

    let arrays: Vec<Arc<dyn Array>> = vec![
        Arc::new(StringArray::from(ids)),
        Arc::new(StringArray::from(namespaces)),
        Arc::new(vector_array),
        Arc::new(StringArray::from(texts)),
        Arc::new(StringArray::from(metadata)),
        Arc::new(Int64Array::from(inserted)),
    ];

    RecordBatch::try_new(vector_schema(vector_dim)?, arrays)
        .map_err(|e| KbError::IndexWrite(format!("Failed to create record batch: {}", e)))
}

fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
    batch
        .column_by_name(name)
        .ok_or_else(|| KbError::IndexSearch(format!("Missing {} column", name)))?
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| KbError::IndexSearch(format!("Invalid {} column type", name)))
}

/// Parse a vector search batch. Cosine distance in `_distance` becomes a `[0, 1]` similarity.
#[inline]
pub fn parse_search_batch(batch: &RecordBatch) -> Result<Vec<ScoredRow>> {
    let ids = string_column(batch, "id")?;
    let texts = string_column(batch, "text")?;
    let metadata = string_column(batch, "metadata")?;

    let inserted = batch
        .column_by_name("inserted_at")
        .ok_or_else(|| KbError::IndexSearch("Missing inserted_at column".to_string()))?
        .as_any()
        .downcast_ref::<Int64Array>()
        .ok_or_else(|| KbError::IndexSearch("Invalid inserted_at column type".to_string()))?;

    let distances = batch
        .column_by_name("_distance")
        .and_then(|col| col.as_any().downcast_ref::<Float32Array>());

    let mut rows = Vec::with_capacity(batch.num_rows());
    for row in 0..batch.num_rows() {
        let tags: Metadata = serde_json::from_str(metadata.value(row)).map_err(|e| {
            KbError::IndexSearch(format!(
                "Corrupt metadata for entry '{}': {}",
                ids.value(row),
                e
            ))
        })?;

        let distance = distances.map_or(0.0, |d| if d.is_null(row) { 0.0 } else { d.value(row) });

        rows.push(ScoredRow {
            result: SearchResult {
                id: ids.value(row).to_string(),
                text: texts.value(row).to_string(),
                metadata: tags,
                score: similarity_from_distance(distance),
            },
            inserted_at: inserted.value(row),
        });
    }

    Ok(rows)
}

/// Cosine distance lies in `[0, 2]`; map it to a similarity clamped to `[0, 1]`
#[inline]
pub fn similarity_from_distance(distance: f32) -> f32 {
    (1.0 - distance).clamp(0.0, 1.0)
}
