//! `PostgreSQL` pgvector knowledge store for Aura retrieval.
//!
//! Implements the core [`KnowledgeStore`] trait over a pgvector-enabled
//! `PostgreSQL` instance. Queries embed through the configured
//! [`Embeddings`] model and rank by cosine distance (`<=>`); scores are
//! returned as `1 - distance` so higher is more similar, matching the
//! in-memory store.

use aura::embeddings::Embeddings;
use aura::retrieval::{ChunkMetadata, KnowledgeChunk, KnowledgeStore, ScoredChunk};
use aura::{Error as AuraError, Result as AuraResult};
use pgvector::Vector;
use std::sync::Arc;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, error, info};

/// Validate a `PostgreSQL` identifier (collection/table name).
fn validate_identifier(name: &str) -> AuraResult<()> {
    if name.is_empty() {
        return Err(AuraError::invalid_input("identifier cannot be empty"));
    }
    if name.len() > 63 {
        return Err(AuraError::invalid_input(format!(
            "identifier '{name}' exceeds maximum length of 63 characters"
        )));
    }
    let mut chars = name.chars();
    #[allow(clippy::unwrap_used)] // SAFETY: non-empty checked above
    let first = chars.next().unwrap();
    if !first.is_ascii_alphabetic() && first != '_' {
        return Err(AuraError::invalid_input(format!(
            "identifier '{name}' must start with a letter or underscore"
        )));
    }
    for c in chars {
        if !c.is_ascii_alphanumeric() && c != '_' {
            return Err(AuraError::invalid_input(format!(
                "identifier '{name}' contains invalid character '{c}'"
            )));
        }
    }
    Ok(())
}

/// pgvector-backed knowledge store.
pub struct PgVectorStore {
    client: Arc<tokio::sync::Mutex<Client>>,
    collection_name: String,
    embeddings: Arc<dyn Embeddings>,
    dimension: usize,
}

impl PgVectorStore {
    /// Connect, verify the pgvector extension, and create the collection
    /// table if missing.
    ///
    /// `dimension` must match the embedding model's output width.
    pub async fn new(
        connection_string: &str,
        collection_name: &str,
        embeddings: Arc<dyn Embeddings>,
        dimension: usize,
    ) -> AuraResult<Self> {
        validate_identifier(collection_name)?;
        if dimension == 0 {
            return Err(AuraError::invalid_input("embedding dimension must be > 0"));
        }

        info!(collection = collection_name, "Connecting to pgvector store");
        let (client, connection) = tokio_postgres::connect(connection_string, NoTls)
            .await
            .map_err(|e| AuraError::unavailable(format!("Failed to connect to PostgreSQL: {e}")))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("PostgreSQL connection error: {}", e);
            }
        });

        let store = Self {
            client: Arc::new(tokio::sync::Mutex::new(client)),
            collection_name: collection_name.to_string(),
            embeddings,
            dimension,
        };
        store.initialize_schema().await?;
        Ok(store)
    }

    async fn initialize_schema(&self) -> AuraResult<()> {
        let client = self.client.lock().await;
        client
            .batch_execute("CREATE EXTENSION IF NOT EXISTS vector")
            .await
            .map_err(|e| {
                AuraError::unavailable(format!("pgvector extension unavailable: {e}"))
            })?;

        let create_sql = format!(
            r"
            CREATE TABLE IF NOT EXISTS {table} (
                id TEXT PRIMARY KEY,
                content TEXT NOT NULL,
                embedding vector({dimension}),
                metadata JSONB NOT NULL DEFAULT '{{}}'
            );
            ",
            table = self.collection_name,
            dimension = self.dimension,
        );
        client
            .batch_execute(&create_sql)
            .await
            .map_err(|e| AuraError::unavailable(format!("collection create failed: {e}")))?;

        debug!(collection = %self.collection_name, "pgvector schema initialized");
        Ok(())
    }
}

#[async_trait::async_trait]
impl KnowledgeStore for PgVectorStore {
    async fn similarity_search(&self, query: &str, top_k: usize) -> AuraResult<Vec<ScoredChunk>> {
        let query_vector = self.embeddings.embed_query(query).await?;
        if query_vector.len() != self.dimension {
            return Err(AuraError::invalid_input(format!(
                "query embedding has dimension {}, collection expects {}",
                query_vector.len(),
                self.dimension
            )));
        }

        let select_sql = format!(
            "SELECT id, content, embedding, metadata, 1 - (embedding <=> $1) AS score
             FROM {}
             ORDER BY embedding <=> $1
             LIMIT $2",
            self.collection_name
        );

        let client = self.client.lock().await;
        let rows = client
            .query(
                &select_sql,
                &[&Vector::from(query_vector), &(top_k as i64)],
            )
            .await
            .map_err(|e| AuraError::unavailable(format!("similarity search failed: {e}")))?;

        let mut scored = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.get(0);
            let content: String = row.get(1);
            let embedding: Vector = row.get(2);
            let metadata_json: serde_json::Value = row.get(3);
            let score: f64 = row.get(4);

            let metadata: ChunkMetadata =
                serde_json::from_value(metadata_json).unwrap_or_default();

            scored.push(ScoredChunk {
                chunk: KnowledgeChunk {
                    id,
                    content,
                    embedding: embedding.to_vec(),
                    metadata,
                },
                score: score as f32,
            });
        }
        Ok(scored)
    }

    async fn add_chunks(&self, chunks: Vec<KnowledgeChunk>) -> AuraResult<()> {
        if chunks.is_empty() {
            return Ok(());
        }

        let insert_sql = format!(
            "INSERT INTO {} (id, content, embedding, metadata)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (id) DO UPDATE SET
                 content = EXCLUDED.content,
                 embedding = EXCLUDED.embedding,
                 metadata = EXCLUDED.metadata",
            self.collection_name
        );

        let client = self.client.lock().await;
        for chunk in chunks {
            if chunk.embedding.len() != self.dimension {
                return Err(AuraError::invalid_input(format!(
                    "chunk '{}' has embedding dimension {}, collection expects {}",
                    chunk.id,
                    chunk.embedding.len(),
                    self.dimension
                )));
            }
            let id = if chunk.id.is_empty() {
                uuid::Uuid::new_v4().to_string()
            } else {
                chunk.id
            };
            let metadata_json = serde_json::to_value(&chunk.metadata)
                .map_err(|e| AuraError::internal(format!("metadata serialization failed: {e}")))?;

            client
                .execute(
                    &insert_sql,
                    &[
                        &id,
                        &chunk.content,
                        &Vector::from(chunk.embedding),
                        &metadata_json,
                    ],
                )
                .await
                .map_err(|e| AuraError::unavailable(format!("chunk insert failed: {e}")))?;
        }
        Ok(())
    }
}
