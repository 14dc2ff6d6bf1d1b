use super::*;
use serde_json::json;

fn row(id: &str, inserted_at: i64) -> VectorRow {
    let mut metadata = Metadata::new();
    metadata.insert("source_id".to_string(), json!("doc"));

    VectorRow {
        id: id.to_string(),
        namespace: "ns1".to_string(),
        text: format!("text of {}", id),
        metadata,
        vector: vec![0.1, 0.2, 0.3],
        inserted_at,
    }
}

#[test]
fn schema_has_expected_columns() {
    let schema = vector_schema(3).expect("should build schema");
    let names: Vec<&str> = schema.fields().iter().map(|f| f.name().as_str()).collect();
    assert_eq!(
        names,
        vec!["id", "namespace", "vector", "text", "metadata", "inserted_at"]
    );
    assert_eq!(schema_dimension(&schema), Some(3));
}

#[test]
fn schema_dimension_missing_vector_column() {
    let schema = Schema::new(vec![Field::new("id", DataType::Utf8, false)]);
    assert_eq!(schema_dimension(&schema), None);
}

#[test]
fn rows_to_batch_builds_all_rows() {
    let batch = rows_to_batch(&[row("a", 1), row("b", 2)], 3).expect("should build batch");
    assert_eq!(batch.num_rows(), 2);
    assert_eq!(batch.num_columns(), 6);
}

#[test]
fn rows_to_batch_rejects_wrong_dimension() {
    let mut bad = row("a", 1);
    bad.vector.push(0.4);

    let result = rows_to_batch(&[bad], 3);
    assert!(matches!(result, Err(KbError::IndexWrite(_))));
}

#[test]
fn parse_search_batch_converts_distance() {
    let batch = rows_to_batch(&[row("a", 7), row("b", 9)], 3).expect("should build batch");

    let mut fields: Vec<Field> = batch
        .schema()
        .fields()
        .iter()
        .map(|f| f.as_ref().clone())
        .collect();
    fields.push(Field::new("_distance", DataType::Float32, true));
    let mut columns = batch.columns().to_vec();
    columns.push(Arc::new(Float32Array::from(vec![0.25, 1.5])));
    let with_distance =
        RecordBatch::try_new(Arc::new(Schema::new(fields)), columns).expect("should build batch");

    let rows = parse_search_batch(&with_distance).expect("should parse batch");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].result.id, "a");
    assert_eq!(rows[0].inserted_at, 7);
    assert!((rows[0].result.score - 0.75).abs() < f32::EPSILON);
    assert_eq!(rows[0].result.metadata.get("source_id"), Some(&json!("doc")));
    assert!(rows[1].result.score.abs() < f32::EPSILON);
}

#[test]
fn similarity_is_clamped() {
    assert!((similarity_from_distance(0.0) - 1.0).abs() < f32::EPSILON);
    assert!(similarity_from_distance(2.0).abs() < f32::EPSILON);
    assert!((similarity_from_distance(-0.0001) - 1.0).abs() < f32::EPSILON);
}
