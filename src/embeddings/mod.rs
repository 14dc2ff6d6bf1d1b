// Embeddings module
// Content chunking and the embedding capability the index and pipeline consume

pub mod chunking;
pub mod ollama;

#[cfg(test)]
pub(crate) mod testing;

use async_trait::async_trait;

use crate::Result;

pub use chunking::{Chunk, ChunkingConfig, chunk_document, chunk_text, estimate_token_count};
pub use ollama::OllamaClient;

/// Maps text to a fixed-length vector.
///
/// Identical text must yield comparable vectors across calls within a session.
/// Failures are reported as [`crate::KbError::Embedding`].
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single piece of text
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed several texts, preserving input order
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            vectors.push(self.embed(text).await?);
        }
        Ok(vectors)
    }
}
