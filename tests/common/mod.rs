// Shared helpers for the integration tests

use async_trait::async_trait;
use kb_retrieval::Result;
use kb_retrieval::config::{Config, IndexConfig};
use kb_retrieval::embeddings::EmbeddingProvider;
use kb_retrieval::embeddings::chunking::ChunkingConfig;
use tempfile::TempDir;

pub const DIMENSIONS: usize = 256;

/// Deterministic bag-of-words embedder: shared words mean closer vectors
pub struct WordEmbedder {
    dimensions: usize,
}

impl WordEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }

    pub fn vector_for(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0_f32; self.dimensions];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let hash = word
                .to_lowercase()
                .bytes()
                .fold(0xcbf2_9ce4_8422_2325_u64, |h, b| {
                    (h ^ u64::from(b)).wrapping_mul(0x0100_0000_01b3)
                });
            vector[(hash % self.dimensions as u64) as usize] += 1.0;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm == 0.0 {
            vector[0] = 1.0;
        } else {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for WordEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.vector_for(text))
    }
}

/// A local-backend configuration rooted in a fresh temp directory
pub fn local_config(max_tokens: usize) -> (Config, TempDir) {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let config = Config {
        base_dir: temp_dir.path().to_path_buf(),
        index: IndexConfig {
            namespace: "kb".to_string(),
            dimensions: DIMENSIONS,
            ..IndexConfig::default()
        },
        chunking: ChunkingConfig { max_tokens },
        ..Config::default()
    };
    (config, temp_dir)
}
