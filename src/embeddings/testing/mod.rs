// Deterministic embedder for unit tests

use async_trait::async_trait;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::EmbeddingProvider;
use crate::{KbError, Result};

/// Bag-of-words embedder: every word bumps one hashed dimension, then the vector is normalized.
/// Texts sharing words are therefore more similar than texts that do not.
pub struct HashEmbedder {
    dimensions: usize,
    fail_after: Option<usize>,
    calls: AtomicUsize,
    inputs: Mutex<Vec<String>>,
}

impl HashEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            fail_after: None,
            calls: AtomicUsize::new(0),
            inputs: Mutex::new(Vec::new()),
        }
    }

    /// Succeed for the first `calls` requests, then fail every request
    pub fn failing_after(mut self, calls: usize) -> Self {
        self.fail_after = Some(calls);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn inputs(&self) -> Vec<String> {
        self.inputs.lock().expect("inputs lock").clone()
    }

    pub fn vector_for(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0_f32; self.dimensions];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let slot = fnv1a(&word.to_lowercase()) % self.dimensions as u64;
            vector[slot as usize] += 1.0;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm == 0.0 {
            vector[0] = 1.0;
        } else {
            for value in &mut vector {
                *value /= norm;
            }
        }
        vector
    }
}

fn fnv1a(word: &str) -> u64 {
    word.bytes().fold(0xcbf2_9ce4_8422_2325, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(0x0100_0000_01b3)
    })
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.inputs
            .lock()
            .expect("inputs lock")
            .push(text.to_string());

        if self.fail_after.is_some_and(|limit| call >= limit) {
            return Err(KbError::Embedding("embedding service unavailable".to_string()));
        }
        Ok(self.vector_for(text))
    }
}
