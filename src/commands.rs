use anyhow::{Context, Result, bail};
use dialoguer::Confirm;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

use crate::config::{Config, get_config_dir, run_interactive_config, show_config};
use crate::database::Metadata;
use crate::embeddings::OllamaClient;
use crate::retrieval::{QueryRequest, RetrievalPipeline, SourceMetadata};

/// Resolve the base directory: the explicit one, else the default
#[inline]
pub fn resolve_config_dir(config_dir: Option<PathBuf>) -> Result<PathBuf> {
    match config_dir {
        Some(dir) => Ok(dir),
        None => get_config_dir().context("Failed to resolve configuration directory"),
    }
}

/// Parse a `key=value` pair. The value is read as JSON when it parses (numbers,
/// booleans, quoted strings) and taken as a plain string otherwise.
#[inline]
pub fn parse_key_value(input: &str) -> std::result::Result<(String, Value), String> {
    let (key, raw) = input
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", input))?;

    let key = key.trim();
    if key.is_empty() {
        return Err(format!("missing key in '{}'", input));
    }

    let value = serde_json::from_str::<Value>(raw)
        .ok()
        .filter(|v| !v.is_object() && !v.is_array())
        .unwrap_or_else(|| Value::String(raw.to_string()));

    Ok((key.to_string(), value))
}

fn to_metadata(pairs: Vec<(String, Value)>) -> Metadata {
    pairs.into_iter().collect()
}

async fn open_pipeline(config: &Config) -> Result<RetrievalPipeline> {
    let embedder = OllamaClient::new(&config.ollama).context("Failed to create Ollama client")?;
    let pipeline = RetrievalPipeline::open(config, Arc::new(embedder))
        .await
        .context("Failed to open retrieval pipeline")?;

    if pipeline.index().fell_back() {
        eprintln!("⚠️  Remote vector service unreachable, using the local index");
    }
    Ok(pipeline)
}

/// Configure interactively, or print the current configuration
#[inline]
pub fn configure(config_dir: &Path, show: bool) -> Result<()> {
    if show {
        let config = Config::load(config_dir)?;
        show_config(&config);
        return Ok(());
    }
    run_interactive_config(config_dir)
}

/// Ingest a UTF-8 text file. The source id defaults to the file stem so
/// re-ingesting a file replaces its earlier chunks.
#[inline]
pub async fn ingest_file(
    config_dir: &Path,
    file: &Path,
    namespace: Option<String>,
    source_id: Option<String>,
    tags: Vec<(String, Value)>,
) -> Result<()> {
    let config = Config::load(config_dir)?;
    let raw_text = fs::read_to_string(file)
        .with_context(|| format!("Failed to read document: {}", file.display()))?;

    let source_id = source_id.or_else(|| {
        file.file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
    });
    let source = SourceMetadata {
        source_id,
        namespace,
        tags: to_metadata(tags),
    };

    info!("Ingesting {}", file.display());
    let pipeline = open_pipeline(&config).await?;
    let summary = pipeline.ingest(&raw_text, &source).await;
    pipeline.close().await?;

    println!("Source: {}", summary.source_id);
    println!("Namespace: {}", summary.namespace);
    println!("Chunks: {}", summary.chunk_count);
    println!("Vectors written: {}", summary.vector_count);
    println!("Status: {}", summary.status);

    if let Some(message) = &summary.error {
        error!("Ingest failed: {}", message);
        bail!("Ingest of {} failed: {}", file.display(), message);
    }

    Ok(())
}

/// Retrieve the chunks most relevant to `text` and print the assembled context
#[inline]
pub async fn run_query(
    config_dir: &Path,
    text: String,
    namespace: Option<String>,
    top_k: Option<usize>,
    threshold: Option<f32>,
    filter: Vec<(String, Value)>,
) -> Result<()> {
    let config = Config::load(config_dir)?;
    let pipeline = open_pipeline(&config).await?;

    let request = QueryRequest {
        text,
        namespace,
        top_k,
        threshold,
        filter: to_metadata(filter),
    };
    let response = pipeline.query(&request).await;
    pipeline.close().await?;
    let response = response?;

    if response.is_empty() {
        println!(
            "No relevant results found in namespace '{}'.",
            response.namespace
        );
        return Ok(());
    }

    println!(
        "Results from namespace '{}' ({} total):",
        response.namespace,
        response.results.len()
    );
    println!();
    println!("{}", response.context);

    Ok(())
}

/// Show per-namespace statistics from the metadata store
#[inline]
pub async fn show_stats(config_dir: &Path, namespace: Option<String>) -> Result<()> {
    let config = Config::load(config_dir)?;
    let namespace = namespace.unwrap_or_else(|| config.index.namespace.clone());
    let pipeline = open_pipeline(&config).await?;

    let stats = pipeline.stats(&namespace).await;
    let indexed = pipeline.index().count(&namespace).await;
    pipeline.close().await?;
    let stats = stats?;

    println!("📊 Namespace '{}'", stats.namespace);
    println!("   Records: {}", stats.total_vectors);
    if let Ok(indexed) = indexed {
        println!("   Indexed vectors: {}", indexed);
    }
    if let Some(first) = stats.first_created {
        println!("   First added: {}", first.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(last) = stats.last_updated {
        println!("   Last updated: {}", last.format("%Y-%m-%d %H:%M:%S"));
    }
    if !stats.distinct_tag_counts.is_empty() {
        println!("   Distinct tag values:");
        for (tag, count) in &stats.distinct_tag_counts {
            println!("     {}: {}", tag, count);
        }
    }

    Ok(())
}

/// Remove every vector and record of a namespace, asking first unless `yes`
#[inline]
pub async fn clear_namespace(
    config_dir: &Path,
    namespace: Option<String>,
    yes: bool,
) -> Result<()> {
    let config = Config::load(config_dir)?;
    let namespace = namespace.unwrap_or_else(|| config.index.namespace.clone());

    if !yes
        && !Confirm::new()
            .with_prompt(format!(
                "Delete everything in namespace '{}'? This cannot be undone.",
                namespace
            ))
            .default(false)
            .interact()?
    {
        println!("Nothing deleted.");
        return Ok(());
    }

    let pipeline = open_pipeline(&config).await?;
    let removed = pipeline.clear_namespace(&namespace).await;
    pipeline.close().await?;

    println!("✓ Removed {} vectors from '{}'", removed?, namespace);
    Ok(())
}

/// List namespaces known to the metadata store
#[inline]
pub async fn list_namespaces(config_dir: &Path) -> Result<()> {
    let config = Config::load(config_dir)?;
    let pipeline = open_pipeline(&config).await?;
    let summaries = pipeline.list_namespaces().await;
    pipeline.close().await?;
    let summaries = summaries?;

    if summaries.is_empty() {
        println!("No namespaces yet.");
        println!("Use 'kb-retrieval ingest <file>' to add a document.");
        return Ok(());
    }

    println!("Namespaces ({} total):", summaries.len());
    for summary in &summaries {
        let updated = summary
            .last_updated
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "never".to_string());
        println!(
            "  {} - {} vectors (updated {})",
            summary.namespace, summary.total_vectors, updated
        );
    }

    Ok(())
}

/// Report whether each collaborator is reachable
#[inline]
pub async fn show_status(config_dir: &Path) -> Result<()> {
    let config = Config::load(config_dir).unwrap_or_default();

    println!("📊 Knowledge Base Status");
    println!("{}", "=".repeat(50));
    println!();

    println!("🤖 Ollama:");
    match OllamaClient::new(&config.ollama) {
        Ok(client) => match client.health_check() {
            Ok(()) => {
                println!(
                    "   ✅ Connected ({}:{})",
                    config.ollama.host, config.ollama.port
                );
                println!("   📋 Model: {}", config.ollama.model);
            }
            Err(e) => println!("   ⚠️  Unhealthy - {:#}", e),
        },
        Err(e) => println!("   ❌ Failed to create client - {:#}", e),
    }

    println!("🔍 Vector index:");
    match open_pipeline(&config).await {
        Ok(pipeline) => {
            if let Some(backend) = pipeline.index().active_backend().await {
                println!("   ✅ Backend: {}", backend);
            }
            if pipeline.index().fell_back() {
                println!("   ⚠️  Configured backend was {}", config.index.backend);
            }
            match pipeline.list_namespaces().await {
                Ok(summaries) => println!("   🗄️  Namespaces: {}", summaries.len()),
                Err(e) => println!("   ❌ Metadata store - {}", e),
            }
            pipeline.close().await?;
        }
        Err(e) => println!("   ❌ Unavailable - {:#}", e),
    }

    Ok(())
}
