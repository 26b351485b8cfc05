// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Embedding-model abstraction.

use crate::error::Result;
use sha2::{Digest, Sha256};

/// A text-embedding provider.
#[async_trait::async_trait]
pub trait Embeddings: Send + Sync {
    /// Embed a batch of documents.
    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Embed a single query.
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_documents(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| crate::error::Error::internal("embedding batch returned no vectors"))
    }
}

/// Deterministic hash-based embeddings for tests and offline development.
///
/// The vector for a given text is stable across runs and processes, and
/// identical texts embed identically, which is all similarity tests need.
pub struct MockEmbeddings {
    dimension: usize,
}

impl MockEmbeddings {
    #[must_use]
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = Vec::with_capacity(self.dimension);
        let mut counter: u32 = 0;
        while vector.len() < self.dimension {
            let mut hasher = Sha256::new();
            hasher.update(text.as_bytes());
            hasher.update(counter.to_le_bytes());
            let digest = hasher.finalize();
            for chunk in digest.chunks(4) {
                if vector.len() == self.dimension {
                    break;
                }
                let mut bytes = [0u8; 4];
                bytes.copy_from_slice(chunk);
                // Map to [-1, 1].
                let raw = u32::from_le_bytes(bytes) as f64 / f64::from(u32::MAX);
                vector.push((raw * 2.0 - 1.0) as f32);
            }
            counter += 1;
        }

        // Normalise so cosine similarity behaves.
        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

#[async_trait::async_trait]
impl Embeddings for MockEmbeddings {
    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_embeddings_are_deterministic() {
        let embeddings = MockEmbeddings::new(64);
        let a = embeddings.embed_query("hello world").await.unwrap();
        let b = embeddings.embed_query("hello world").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[tokio::test]
    async fn different_texts_embed_differently() {
        let embeddings = MockEmbeddings::new(64);
        let a = embeddings.embed_query("alpha").await.unwrap();
        let b = embeddings.embed_query("beta").await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn vectors_are_unit_length() {
        let embeddings = MockEmbeddings::new(32);
        let v = embeddings.embed_query("normalise me").await.unwrap();
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }
}
