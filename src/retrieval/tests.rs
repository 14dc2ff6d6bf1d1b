use super::*;
use crate::config::IndexConfig;
use crate::embeddings::testing::HashEmbedder;
use serde_json::json;
use tempfile::TempDir;

const DIM: usize = 256;

fn sample_document() -> String {
    let first = "Ownership is the set of rules that govern how a Rust program manages memory. \
                 Each value has a single owner at any time. When the owner goes out of scope the value is dropped. \
                 Moving a value transfers ownership to the new binding. Borrowing lets code use a value without taking ownership. \
                 References must always be valid while they are in use.";
    let second = "Tokio is an asynchronous runtime for the Rust programming language. \
                  It provides the building blocks needed for writing network applications. \
                  Tasks are lightweight and scheduled cooperatively by the runtime. \
                  Channels let tasks communicate by sending messages to each other. \
                  Timers and IO resources integrate with the same scheduler.";
    let third = "Sourdough bread relies on wild yeast and lactic acid bacteria. \
                 The starter must be fed regularly with flour and water. \
                 Long fermentation develops flavour and an open crumb. \
                 Bakers shape the dough gently to keep the gas inside. \
                 A hot oven and steam produce a crisp crust.";
    format!("{}\n\n{}\n\n{}", first, second, third)
}

async fn create_pipeline(
    embedder: HashEmbedder,
    max_tokens: usize,
) -> (RetrievalPipeline, TempDir) {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let config = Config {
        base_dir: temp_dir.path().to_path_buf(),
        index: IndexConfig {
            namespace: "docs".to_string(),
            dimensions: DIM,
            ..IndexConfig::default()
        },
        chunking: ChunkingConfig { max_tokens },
        ..Config::default()
    };

    let pipeline = RetrievalPipeline::open(&config, Arc::new(embedder))
        .await
        .expect("should open pipeline");
    (pipeline, temp_dir)
}

fn result(id: &str, source: Option<&str>, score: f32, text: &str) -> SearchResult {
    let mut metadata = Metadata::new();
    if let Some(source) = source {
        metadata.insert("source_id".to_string(), json!(source));
    }
    SearchResult {
        id: id.to_string(),
        text: text.to_string(),
        metadata,
        score,
    }
}

#[test]
fn assemble_context_annotates_sources_in_order() {
    let context = assemble_context(&[
        result("book:0", Some("book"), 0.91, "first text"),
        result("loose", None, 0.5, "second text"),
    ]);

    assert_eq!(
        context,
        "[1] source: book (score 0.910)\nfirst text\n\n[2] source: loose (score 0.500)\nsecond text"
    );
}

#[test]
fn assemble_context_of_nothing_is_empty() {
    assert_eq!(assemble_context(&[]), "");
}

#[test]
fn builders_fill_fields() {
    let source = SourceMetadata::new()
        .with_source_id("book")
        .with_namespace("ns1")
        .with_tag("lang", "en");
    assert_eq!(source.source_id.as_deref(), Some("book"));
    assert_eq!(source.namespace.as_deref(), Some("ns1"));
    assert_eq!(source.tags.get("lang"), Some(&json!("en")));

    let request = QueryRequest::new("hello")
        .with_namespace("ns1")
        .with_top_k(2)
        .with_threshold(0.3)
        .with_filter("lang", "en");
    assert_eq!(request.top_k, Some(2));
    assert_eq!(request.filter.get("lang"), Some(&json!("en")));
}

#[tokio::test]
async fn ingest_writes_every_chunk() {
    let (pipeline, _temp_dir) = create_pipeline(HashEmbedder::new(DIM), 100).await;

    let source = SourceMetadata::new()
        .with_source_id("guide")
        .with_tag("lang", "en");
    let summary = pipeline.ingest(&sample_document(), &source).await;

    assert!(summary.is_success(), "ingest failed: {:?}", summary.error);
    assert_eq!(summary.namespace, "docs");
    assert!(summary.chunk_count >= 3);
    assert_eq!(summary.vector_count, summary.chunk_count);
    assert!(summary.error.is_none());

    let stats = pipeline.stats("docs").await.expect("should get stats");
    assert_eq!(stats.total_vectors as usize, summary.chunk_count);
    assert_eq!(stats.distinct_tag_counts.get("lang"), Some(&1));
    assert_eq!(
        pipeline.index().count("docs").await.expect("should count") as usize,
        summary.chunk_count
    );

    let record = pipeline
        .database()
        .get_record("guide:0")
        .await
        .expect("should read record")
        .expect("first chunk recorded");
    assert_eq!(record.metadata.get("chunk_index"), Some(&json!(0)));
    assert_eq!(record.metadata.get("source_id"), Some(&json!("guide")));
    assert_eq!(
        record.metadata.get("total_chunks"),
        Some(&json!(summary.chunk_count))
    );
}

#[tokio::test]
async fn ingest_empty_text_is_a_successful_no_op() {
    let (pipeline, _temp_dir) = create_pipeline(HashEmbedder::new(DIM), 100).await;

    let summary = pipeline.ingest("  \n\n  ", &SourceMetadata::new()).await;
    assert!(summary.is_success());
    assert_eq!(summary.chunk_count, 0);
    assert_eq!(summary.vector_count, 0);
}

#[tokio::test]
async fn ingest_generates_source_id() {
    let (pipeline, _temp_dir) = create_pipeline(HashEmbedder::new(DIM), 100).await;

    let summary = pipeline
        .ingest("A short note.", &SourceMetadata::new())
        .await;
    assert!(summary.is_success());
    assert!(Uuid::parse_str(&summary.source_id).is_ok());
}

#[tokio::test]
async fn ingest_failure_keeps_earlier_chunks() {
    let (pipeline, _temp_dir) = create_pipeline(HashEmbedder::new(DIM).failing_after(2), 100).await;

    let summary = pipeline
        .ingest(&sample_document(), &SourceMetadata::new().with_source_id("guide"))
        .await;

    assert_eq!(summary.status, IngestStatus::Failed);
    assert!(summary.chunk_count > 2);
    assert_eq!(summary.vector_count, 2);
    assert!(
        summary
            .error
            .as_deref()
            .is_some_and(|e| e.contains("Embedding"))
    );

    let stats = pipeline.stats("docs").await.expect("should get stats");
    assert_eq!(stats.total_vectors, 2);
}

#[tokio::test]
async fn ingest_into_reserved_namespace_fails() {
    let (pipeline, _temp_dir) = create_pipeline(HashEmbedder::new(DIM), 100).await;

    let summary = pipeline
        .ingest(
            "Some text.",
            &SourceMetadata::new().with_namespace(crate::database::SYSTEM_NAMESPACE),
        )
        .await;
    assert_eq!(summary.status, IngestStatus::Failed);
    assert_eq!(summary.vector_count, 0);
}

#[tokio::test]
async fn reingesting_a_source_replaces_its_chunks() {
    let (pipeline, _temp_dir) = create_pipeline(HashEmbedder::new(DIM), 100).await;
    let source = SourceMetadata::new().with_source_id("guide");

    let first = pipeline.ingest(&sample_document(), &source).await;
    let second = pipeline.ingest(&sample_document(), &source).await;
    assert!(first.is_success() && second.is_success());

    let stats = pipeline.stats("docs").await.expect("should get stats");
    assert_eq!(stats.total_vectors as usize, second.chunk_count);
    assert_eq!(
        pipeline.index().count("docs").await.expect("should count") as usize,
        second.chunk_count
    );
}

#[tokio::test]
async fn reingesting_a_shorter_version_drops_stale_chunks() {
    let (pipeline, _temp_dir) = create_pipeline(HashEmbedder::new(DIM), 100).await;
    let source = SourceMetadata::new().with_source_id("guide");

    let first = pipeline.ingest(&sample_document(), &source).await;
    assert!(first.is_success());
    assert!(first.chunk_count >= 3);
    pipeline
        .ingest(
            "Tokio tasks are scheduled cooperatively.",
            &SourceMetadata::new().with_source_id("runtime"),
        )
        .await;

    let second = pipeline
        .ingest("Sourdough starter needs flour and water.", &source)
        .await;
    assert!(second.is_success(), "ingest failed: {:?}", second.error);
    assert_eq!(second.chunk_count, 1);

    let stats = pipeline.stats("docs").await.expect("should get stats");
    assert_eq!(stats.total_vectors, 2);
    assert_eq!(pipeline.index().count("docs").await.expect("should count"), 2);
    assert!(
        pipeline
            .database()
            .get_record("guide:1")
            .await
            .expect("should read")
            .is_none()
    );

    let response = pipeline
        .query(&QueryRequest::new("ownership rules memory").with_top_k(10))
        .await
        .expect("should query");
    let ids: Vec<&str> = response.results.iter().map(|r| r.id.as_str()).collect();
    assert!(ids.iter().all(|id| *id == "guide:0" || *id == "runtime:0"));
}

#[tokio::test]
async fn reingest_into_another_namespace_keeps_stores_in_step() {
    let (pipeline, _temp_dir) = create_pipeline(HashEmbedder::new(DIM), 100).await;

    let archived = pipeline
        .ingest(
            &sample_document(),
            &SourceMetadata::new()
                .with_source_id("guide")
                .with_namespace("archive"),
        )
        .await;
    assert!(archived.chunk_count >= 3);

    // Ids are global, so guide:0 moves while the rest of the old version stays archived
    let moved = pipeline
        .ingest(
            "Sourdough starter needs flour and water.",
            &SourceMetadata::new().with_source_id("guide"),
        )
        .await;
    assert!(moved.is_success(), "ingest failed: {:?}", moved.error);

    for (namespace, expected) in [("docs", 1), ("archive", archived.chunk_count - 1)] {
        let stats = pipeline.stats(namespace).await.expect("should get stats");
        assert_eq!(stats.total_vectors as usize, expected);
        assert_eq!(
            pipeline.index().count(namespace).await.expect("should count") as usize,
            expected
        );
    }
}

#[tokio::test]
async fn query_returns_ranked_context() {
    let (pipeline, _temp_dir) = create_pipeline(HashEmbedder::new(DIM), 100).await;
    pipeline
        .ingest(&sample_document(), &SourceMetadata::new().with_source_id("guide"))
        .await;

    let response = pipeline
        .query(&QueryRequest::new("sourdough starter flour and water").with_top_k(2))
        .await
        .expect("should query");

    assert_eq!(response.namespace, "docs");
    assert!(!response.is_empty());
    assert!(response.results.len() <= 2);
    let best = &response.results[0].text;
    assert!(best.contains("Sourdough") || best.contains("starter"));
    assert!(response.context.starts_with("[1] source: guide"));
    assert!(
        response
            .results
            .windows(2)
            .all(|pair| pair[0].score >= pair[1].score)
    );
}

#[tokio::test]
async fn query_with_nothing_above_threshold_is_empty() {
    let (pipeline, _temp_dir) = create_pipeline(HashEmbedder::new(DIM), 100).await;
    pipeline
        .ingest(&sample_document(), &SourceMetadata::new())
        .await;

    let response = pipeline
        .query(&QueryRequest::new("quantum chromodynamics").with_threshold(0.95))
        .await
        .expect("zero results is not an error");
    assert!(response.is_empty());
    assert!(response.context.is_empty());
}

#[tokio::test]
async fn query_rejects_blank_text() {
    let (pipeline, _temp_dir) = create_pipeline(HashEmbedder::new(DIM), 100).await;

    let result = pipeline.query(&QueryRequest::new("   ")).await;
    assert!(matches!(result, Err(KbError::IndexSearch(_))));
}

#[tokio::test]
async fn query_filter_limits_sources() {
    let (pipeline, _temp_dir) = create_pipeline(HashEmbedder::new(DIM), 100).await;
    pipeline
        .ingest(
            "Rust ownership rules keep memory safe.",
            &SourceMetadata::new().with_source_id("en").with_tag("lang", "en"),
        )
        .await;
    pipeline
        .ingest(
            "Rust ownership regeln halten speicher sicher.",
            &SourceMetadata::new().with_source_id("de").with_tag("lang", "de"),
        )
        .await;

    let response = pipeline
        .query(&QueryRequest::new("rust ownership rules").with_filter("lang", "de"))
        .await
        .expect("should query");

    assert_eq!(response.results.len(), 1);
    assert_eq!(response.results[0].id, "de:0");
}

#[tokio::test]
async fn namespaces_do_not_leak() {
    let (pipeline, _temp_dir) = create_pipeline(HashEmbedder::new(DIM), 100).await;
    pipeline
        .ingest(
            "Tokio tasks and channels.",
            &SourceMetadata::new().with_namespace("runtime"),
        )
        .await;

    let response = pipeline
        .query(&QueryRequest::new("tokio tasks").with_namespace("other"))
        .await
        .expect("should query");
    assert!(response.is_empty());

    let summaries = pipeline.list_namespaces().await.expect("should list");
    let names: Vec<&str> = summaries.iter().map(|s| s.namespace.as_str()).collect();
    assert_eq!(names, vec!["runtime"]);
}

#[tokio::test]
async fn clear_then_stats_reports_zero() {
    let (pipeline, _temp_dir) = create_pipeline(HashEmbedder::new(DIM), 100).await;
    let summary = pipeline
        .ingest(&sample_document(), &SourceMetadata::new())
        .await;

    let removed = pipeline
        .clear_namespace("docs")
        .await
        .expect("should clear");
    assert_eq!(removed as usize, summary.chunk_count);

    let stats = pipeline.stats("docs").await.expect("should get stats");
    assert_eq!(stats.total_vectors, 0);
    assert_eq!(pipeline.index().count("docs").await.expect("should count"), 0);
}

#[tokio::test]
async fn concurrent_clear_and_ingest_keep_stores_in_step() {
    let (pipeline, _temp_dir) = create_pipeline(HashEmbedder::new(DIM), 100).await;
    pipeline
        .ingest(&sample_document(), &SourceMetadata::new().with_source_id("old"))
        .await;

    let (cleared, summary) = tokio::join!(
        pipeline.clear_namespace("docs"),
        pipeline.ingest(&sample_document(), &SourceMetadata::new().with_source_id("new")),
    );
    cleared.expect("should clear");
    assert!(summary.is_success(), "ingest failed: {:?}", summary.error);

    let stats = pipeline.stats("docs").await.expect("should get stats");
    assert_eq!(
        pipeline.index().count("docs").await.expect("should count"),
        stats.total_vectors
    );
}

#[tokio::test]
async fn concurrent_writes_of_one_id_agree_across_stores() {
    let (pipeline, _temp_dir) = create_pipeline(HashEmbedder::new(DIM), 100).await;
    let embedder = HashEmbedder::new(DIM);
    let version = |text: &str| VectorEntry {
        id: "shared".to_string(),
        text: text.to_string(),
        metadata: Metadata::new(),
        embedding: embedder.vector_for(text),
    };
    let first = version("first version of the shared entry");
    let second = version("second version of the shared entry");

    let (left, right) = tokio::join!(
        pipeline.record_entry(&first, "docs"),
        pipeline.record_entry(&second, "docs"),
    );
    left.expect("first write should succeed");
    right.expect("second write should succeed");

    let indexed = pipeline
        .index()
        .search("shared entry", "docs", 10, 0.0, &Metadata::new())
        .await
        .expect("should search");
    let recorded = pipeline
        .database()
        .get_record("shared")
        .await
        .expect("should read")
        .expect("record should exist");
    assert_eq!(indexed.len(), 1);
    assert_eq!(indexed[0].text, recorded.text);
}

#[tokio::test]
async fn metadata_failure_leaves_index_entry_orphaned() {
    let (pipeline, _temp_dir) = create_pipeline(HashEmbedder::new(DIM), 100).await;
    pipeline.database().close().await;

    let entry = VectorEntry {
        id: "orphan".to_string(),
        text: "orphaned text".to_string(),
        metadata: Metadata::new(),
        embedding: HashEmbedder::new(DIM).vector_for("orphaned text"),
    };
    let result = pipeline.record_entry(&entry, "docs").await;

    assert!(matches!(result, Err(KbError::MetadataWrite(_))));
    assert_eq!(pipeline.index().count("docs").await.expect("should count"), 1);
}

#[tokio::test]
async fn closed_pipeline_reports_not_initialized() {
    let (pipeline, _temp_dir) = create_pipeline(HashEmbedder::new(DIM), 100).await;
    pipeline.close().await.expect("should close");

    let result = pipeline.query(&QueryRequest::new("anything")).await;
    assert!(matches!(result, Err(KbError::NotInitialized)));

    let summary = pipeline
        .ingest("Some text.", &SourceMetadata::new())
        .await;
    assert_eq!(summary.status, IngestStatus::Failed);
}
