// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Knowledge retrieval over a vector index.
//!
//! [`KnowledgeStore`] is the storage seam (in-memory here, pgvector in
//! `aura-pgvector`); [`KnowledgeRetriever`] is the workflow-facing API. The
//! retriever is advisory by design: an unavailable index yields an empty
//! context and a warning, never a workflow failure.

use crate::embeddings::Embeddings;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

/// One chunk of ingested knowledge.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeChunk {
    pub id: String,
    pub content: String,
    pub embedding: Vec<f32>,
    pub metadata: ChunkMetadata,
}

/// Descriptive metadata for a chunk.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub difficulty: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    pub path: String,
    pub chunk_ix: usize,
}

/// A chunk with its similarity score against a query.
#[derive(Clone, Debug)]
pub struct ScoredChunk {
    pub chunk: KnowledgeChunk,
    pub score: f32,
}

/// Source attribution for retrieved context.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub path: String,
    pub chunk_ix: usize,
    pub score: f32,
    #[serde(default)]
    pub language: Option<String>,
}

/// Result of a retrieval query.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RetrievedContext {
    /// Concatenated chunk contents, hard-capped in bytes.
    pub context: String,
    /// One citation per included chunk, for transparency.
    pub citations: Vec<Citation>,
}

/// Vector-index storage seam.
#[async_trait::async_trait]
pub trait KnowledgeStore: Send + Sync {
    /// Top-k most similar chunks by cosine similarity, best first.
    async fn similarity_search(&self, query: &str, top_k: usize) -> Result<Vec<ScoredChunk>>;

    /// Insert chunks into the index (ingestion-side writer path).
    async fn add_chunks(&self, chunks: Vec<KnowledgeChunk>) -> Result<()>;
}

/// Cosine similarity between two vectors; 0.0 for mismatched or zero-norm
/// inputs.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Workflow-facing retrieval API.
///
/// Error patterns are appended to the query with a separator rather than
/// preprocessed away - stopword removal is deliberately skipped because
/// error tokens carry most of the signal.
pub struct KnowledgeRetriever {
    store: Arc<dyn KnowledgeStore>,
    top_k: usize,
    max_context_bytes: usize,
}

impl KnowledgeRetriever {
    /// Default `top_k` of 3 and a 4 KiB context cap.
    pub fn new(store: Arc<dyn KnowledgeStore>) -> Self {
        Self {
            store,
            top_k: 3,
            max_context_bytes: 4096,
        }
    }

    #[must_use]
    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k.max(1);
        self
    }

    #[must_use]
    pub fn with_max_context_bytes(mut self, max_context_bytes: usize) -> Self {
        self.max_context_bytes = max_context_bytes;
        self
    }

    /// Build the effective query string.
    fn build_query(query: &str, error_patterns: &[String]) -> String {
        if error_patterns.is_empty() {
            return query.to_string();
        }
        let mut combined = String::from(query);
        combined.push_str(" | ");
        combined.push_str(&error_patterns.join(" | "));
        combined
    }

    /// Retrieve context for a query, optionally enriched with error
    /// patterns. Infallible by contract: index failures degrade to an empty
    /// context.
    pub async fn query(&self, query: &str, error_patterns: &[String]) -> RetrievedContext {
        let combined = Self::build_query(query, error_patterns);

        let scored = match self.store.similarity_search(&combined, self.top_k).await {
            Ok(scored) => scored,
            Err(e) => {
                warn!(error = %e, "Knowledge index unavailable; continuing without context");
                return RetrievedContext::default();
            }
        };

        let mut context = String::new();
        let mut citations = Vec::new();
        for ScoredChunk { chunk, score } in scored {
            let remaining = self.max_context_bytes.saturating_sub(context.len());
            if remaining == 0 {
                break;
            }
            let mut piece = chunk.content.clone();
            if piece.len() > remaining {
                // Truncate on a char boundary to respect the byte cap.
                let mut cut = remaining;
                while cut > 0 && !piece.is_char_boundary(cut) {
                    cut -= 1;
                }
                piece.truncate(cut);
            }
            if piece.is_empty() {
                break;
            }
            if !context.is_empty() {
                context.push_str("\n\n");
            }
            context.push_str(&piece);
            citations.push(Citation {
                path: chunk.metadata.path.clone(),
                chunk_ix: chunk.metadata.chunk_ix,
                score,
                language: chunk.metadata.language.clone(),
            });
        }

        // The join separators can nudge past the cap; enforce it exactly.
        if context.len() > self.max_context_bytes {
            let mut cut = self.max_context_bytes;
            while cut > 0 && !context.is_char_boundary(cut) {
                cut -= 1;
            }
            context.truncate(cut);
        }

        RetrievedContext { context, citations }
    }
}

/// Embedding-backed in-memory vector index.
///
/// Brute-force cosine scan; fine for test corpora and small deployments.
pub struct InMemoryKnowledgeStore {
    embeddings: Arc<dyn Embeddings>,
    chunks: parking_lot::RwLock<Vec<KnowledgeChunk>>,
}

impl InMemoryKnowledgeStore {
    pub fn new(embeddings: Arc<dyn Embeddings>) -> Self {
        Self {
            embeddings,
            chunks: parking_lot::RwLock::new(Vec::new()),
        }
    }

    /// Embed and insert raw texts; convenience for tests and seeding.
    pub async fn add_texts(
        &self,
        texts: Vec<(String, ChunkMetadata)>,
    ) -> Result<()> {
        let contents: Vec<String> = texts.iter().map(|(content, _)| content.clone()).collect();
        let vectors = self.embeddings.embed_documents(&contents).await?;
        let chunks = texts
            .into_iter()
            .zip(vectors)
            .map(|((content, metadata), embedding)| KnowledgeChunk {
                id: uuid::Uuid::new_v4().to_string(),
                content,
                embedding,
                metadata,
            })
            .collect();
        self.add_chunks(chunks).await
    }
}

#[async_trait::async_trait]
impl KnowledgeStore for InMemoryKnowledgeStore {
    async fn similarity_search(&self, query: &str, top_k: usize) -> Result<Vec<ScoredChunk>> {
        let query_vector = self.embeddings.embed_query(query).await?;
        let chunks = self.chunks.read();
        let mut scored: Vec<ScoredChunk> = chunks
            .iter()
            .map(|chunk| ScoredChunk {
                score: cosine_similarity(&query_vector, &chunk.embedding),
                chunk: chunk.clone(),
            })
            .collect();
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(top_k);
        Ok(scored)
    }

    async fn add_chunks(&self, new_chunks: Vec<KnowledgeChunk>) -> Result<()> {
        self.chunks.write().extend(new_chunks);
        Ok(())
    }
}
