//! `PostgreSQL` checkpoint store for Aura workflow threads.
//!
//! Three tables per the checkpoint store contract:
//!
//! - `checkpoints(thread_id, ns, checkpoint_id, parent_checkpoint_id, type,
//!   payload, metadata)` - one row per superstep; `payload` carries the
//!   node, superstep number, and timestamp.
//! - `checkpoint_blobs(thread_id, ns, channel, version, type, blob)` - the
//!   thread state, one row per state channel (top-level state field) per
//!   superstep version.
//! - `checkpoint_writes(thread_id, ns, checkpoint_id, task_id, task_path,
//!   idx, channel, type, blob)` - pending writes for completed tasks whose
//!   checkpoint has not landed yet; indexed by `thread_id` for fast
//!   enumeration.
//!
//! Each superstep is written in a single transaction: the checkpoint row,
//! all channel blobs, and the deletion of folded writes commit atomically.
//!
//! # Example
//!
//! ```rust,ignore
//! use aura_postgres_checkpointer::PostgresCheckpointer;
//!
//! let checkpointer: PostgresCheckpointer<LessonState> =
//!     PostgresCheckpointer::new("host=localhost user=aura dbname=aura").await?;
//! let app = graph.compile()?
//!     .with_checkpointer(checkpointer)
//!     .with_thread_id("src/main.rs:42");
//! ```

use aura::checkpoint::{
    Checkpoint, CheckpointMetadata, Checkpointer, PendingWrite, ThreadInfo,
};
use aura::{Error as AuraError, GraphState, Result as AuraResult};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio_postgres::{Client, NoTls};
use tracing::{debug, error, info};

/// Channel name used when the state does not serialise to a JSON object.
const ROOT_CHANNEL: &str = "__root__";

/// Serialisation format tag stored in `type` columns.
const BLOB_TYPE_JSON: &str = "json";

/// Validate a `PostgreSQL` identifier (prefix for the three table names).
///
/// Identifiers must start with a letter or underscore, contain only
/// letters, digits, and underscores, and fit the 63-char limit (minus the
/// longest suffix added here).
fn validate_identifier(name: &str) -> Result<(), PostgresCheckpointerError> {
    if name.is_empty() {
        return Err(PostgresCheckpointerError::InvalidIdentifier(
            "identifier cannot be empty".to_string(),
        ));
    }
    if name.len() > 40 {
        return Err(PostgresCheckpointerError::InvalidIdentifier(format!(
            "identifier '{name}' exceeds maximum length of 40 characters"
        )));
    }

    let mut chars = name.chars();
    #[allow(clippy::unwrap_used)] // SAFETY: non-empty checked above
    let first = chars.next().unwrap();
    if !first.is_ascii_alphabetic() && first != '_' {
        return Err(PostgresCheckpointerError::InvalidIdentifier(format!(
            "identifier '{name}' must start with a letter or underscore"
        )));
    }
    for c in chars {
        if !c.is_ascii_alphanumeric() && c != '_' {
            return Err(PostgresCheckpointerError::InvalidIdentifier(format!(
                "identifier '{name}' contains invalid character '{c}'"
            )));
        }
    }
    Ok(())
}

fn timestamp_to_nanos(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

fn nanos_to_timestamp(nanos: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_nanos(nanos.max(0) as u64)
}

/// PostgreSQL-backed checkpoint store.
pub struct PostgresCheckpointer<S: GraphState> {
    client: Arc<tokio::sync::Mutex<Client>>,
    table_prefix: String,
    ns: String,
    _phantom: PhantomData<S>,
}

impl<S: GraphState> PostgresCheckpointer<S> {
    /// Connect with the default `aura` table prefix and root namespace.
    pub async fn new(connection_string: &str) -> Result<Self, PostgresCheckpointerError> {
        Self::with_table_prefix(connection_string, "aura").await
    }

    /// Connect with a custom table prefix (tables become
    /// `{prefix}_checkpoints`, `{prefix}_checkpoint_blobs`,
    /// `{prefix}_checkpoint_writes`).
    pub async fn with_table_prefix(
        connection_string: &str,
        table_prefix: &str,
    ) -> Result<Self, PostgresCheckpointerError> {
        validate_identifier(table_prefix)?;

        info!("Connecting to PostgreSQL checkpoint store");
        let (client, connection) = tokio_postgres::connect(connection_string, NoTls)
            .await
            .map_err(|e| {
                error!("Failed to connect to PostgreSQL: {}", e);
                PostgresCheckpointerError::Connection(e.to_string())
            })?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("PostgreSQL connection error: {}", e);
            }
        });

        let checkpointer = Self {
            client: Arc::new(tokio::sync::Mutex::new(client)),
            table_prefix: table_prefix.to_string(),
            ns: String::new(),
            _phantom: PhantomData,
        };
        checkpointer.initialize_schema().await?;
        Ok(checkpointer)
    }

    /// Scope this store to a checkpoint namespace (sub-graph executions).
    #[must_use]
    pub fn with_namespace(mut self, ns: impl Into<String>) -> Self {
        self.ns = ns.into();
        self
    }

    fn checkpoints_table(&self) -> String {
        format!("{}_checkpoints", self.table_prefix)
    }

    fn blobs_table(&self) -> String {
        format!("{}_checkpoint_blobs", self.table_prefix)
    }

    fn writes_table(&self) -> String {
        format!("{}_checkpoint_writes", self.table_prefix)
    }

    async fn initialize_schema(&self) -> Result<(), PostgresCheckpointerError> {
        let create_sql = format!(
            r"
            CREATE TABLE IF NOT EXISTS {checkpoints} (
                thread_id TEXT NOT NULL,
                ns TEXT NOT NULL DEFAULT '',
                checkpoint_id TEXT NOT NULL,
                parent_checkpoint_id TEXT,
                type TEXT NOT NULL,
                payload JSONB NOT NULL,
                metadata JSONB NOT NULL DEFAULT '{{}}',
                PRIMARY KEY (thread_id, ns, checkpoint_id)
            );
            CREATE TABLE IF NOT EXISTS {blobs} (
                thread_id TEXT NOT NULL,
                ns TEXT NOT NULL DEFAULT '',
                channel TEXT NOT NULL,
                version BIGINT NOT NULL,
                type TEXT NOT NULL,
                blob BYTEA,
                PRIMARY KEY (thread_id, ns, channel, version)
            );
            CREATE TABLE IF NOT EXISTS {writes} (
                thread_id TEXT NOT NULL,
                ns TEXT NOT NULL DEFAULT '',
                checkpoint_id TEXT NOT NULL,
                task_id TEXT NOT NULL,
                task_path TEXT NOT NULL DEFAULT '',
                idx INTEGER NOT NULL,
                channel TEXT NOT NULL,
                type TEXT,
                blob BYTEA NOT NULL,
                PRIMARY KEY (thread_id, ns, checkpoint_id, task_id, idx, channel)
            );
            CREATE INDEX IF NOT EXISTS idx_{writes}_thread_id ON {writes} (thread_id);
            CREATE INDEX IF NOT EXISTS idx_{checkpoints}_thread_id ON {checkpoints} (thread_id);
            ",
            checkpoints = self.checkpoints_table(),
            blobs = self.blobs_table(),
            writes = self.writes_table(),
        );

        self.client
            .lock()
            .await
            .batch_execute(&create_sql)
            .await
            .map_err(|e| {
                error!("Failed to create checkpoint tables: {}", e);
                PostgresCheckpointerError::Query(e.to_string())
            })?;

        debug!(prefix = %self.table_prefix, "PostgreSQL checkpoint schema initialized");
        Ok(())
    }

    /// Split a state into `(channel, blob)` pairs. Object states get one
    /// channel per top-level field; anything else goes under `__root__`.
    fn state_to_blobs(state: &S) -> AuraResult<Vec<(String, Vec<u8>)>> {
        let value = serde_json::to_value(state)
            .map_err(|e| AuraError::internal(format!("state serialization failed: {e}")))?;
        match value {
            serde_json::Value::Object(fields) => fields
                .into_iter()
                .map(|(channel, field)| {
                    let blob = serde_json::to_vec(&field).map_err(|e| {
                        AuraError::internal(format!("channel '{channel}' serialization failed: {e}"))
                    })?;
                    Ok((channel, blob))
                })
                .collect(),
            other => {
                let blob = serde_json::to_vec(&other)
                    .map_err(|e| AuraError::internal(format!("state serialization failed: {e}")))?;
                Ok(vec![(ROOT_CHANNEL.to_string(), blob)])
            }
        }
    }

    /// Reassemble a state from its channel blobs.
    fn blobs_to_state(blobs: Vec<(String, Vec<u8>)>) -> AuraResult<S> {
        let value = if blobs.len() == 1 && blobs[0].0 == ROOT_CHANNEL {
            serde_json::from_slice(&blobs[0].1)
                .map_err(|e| AuraError::internal(format!("state deserialization failed: {e}")))?
        } else {
            let mut object = serde_json::Map::new();
            for (channel, blob) in blobs {
                let field = serde_json::from_slice(&blob).map_err(|e| {
                    AuraError::internal(format!("channel '{channel}' deserialization failed: {e}"))
                })?;
                object.insert(channel, field);
            }
            serde_json::Value::Object(object)
        };
        serde_json::from_value(value)
            .map_err(|e| AuraError::internal(format!("state deserialization failed: {e}")))
    }

    fn row_to_metadata(&self, row: &tokio_postgres::Row) -> AuraResult<CheckpointMetadata> {
        let checkpoint_id: String = row.get(0);
        let thread_id: String = row.get(1);
        let parent_id: Option<String> = row.get(2);
        let payload: serde_json::Value = row.get(3);
        let metadata_json: serde_json::Value = row.get(4);

        let node = payload
            .get("node")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let superstep = payload
            .get("superstep")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0);
        let timestamp_nanos = payload
            .get("timestamp_nanos")
            .and_then(serde_json::Value::as_i64)
            .unwrap_or(0);

        let metadata: HashMap<String, String> = serde_json::from_value(metadata_json)
            .map_err(|e| AuraError::internal(format!("metadata deserialization failed: {e}")))?;

        Ok(CheckpointMetadata {
            id: checkpoint_id,
            thread_id,
            node,
            superstep,
            timestamp: nanos_to_timestamp(timestamp_nanos),
            parent_id,
            metadata,
        })
    }

    async fn load_in(
        &self,
        client: &Client,
        checkpoint_id: &str,
    ) -> AuraResult<Option<Checkpoint<S>>> {
        let select_sql = format!(
            "SELECT checkpoint_id, thread_id, parent_checkpoint_id, payload, metadata
             FROM {} WHERE checkpoint_id = $1 AND ns = $2",
            self.checkpoints_table()
        );
        let rows = client
            .query(&select_sql, &[&checkpoint_id, &self.ns])
            .await
            .map_err(|e| AuraError::unavailable(format!("checkpoint load failed: {e}")))?;

        let Some(row) = rows.first() else {
            return Ok(None);
        };
        let meta = self.row_to_metadata(row)?;

        let blob_sql = format!(
            "SELECT channel, blob FROM {}
             WHERE thread_id = $1 AND ns = $2 AND version = $3",
            self.blobs_table()
        );
        let blob_rows = client
            .query(
                &blob_sql,
                &[&meta.thread_id, &self.ns, &(meta.superstep as i64)],
            )
            .await
            .map_err(|e| AuraError::unavailable(format!("checkpoint blob load failed: {e}")))?;

        let blobs: Vec<(String, Vec<u8>)> = blob_rows
            .iter()
            .map(|row| (row.get::<_, String>(0), row.get::<_, Vec<u8>>(1)))
            .collect();
        if blobs.is_empty() {
            return Err(AuraError::internal(format!(
                "checkpoint '{checkpoint_id}' has no channel blobs at version {}",
                meta.superstep
            )));
        }
        let state = Self::blobs_to_state(blobs)?;

        Ok(Some(Checkpoint {
            id: meta.id,
            thread_id: meta.thread_id,
            state,
            node: meta.node,
            superstep: meta.superstep,
            timestamp: meta.timestamp,
            parent_id: meta.parent_id,
            metadata: meta.metadata,
        }))
    }
}

#[async_trait::async_trait]
impl<S: GraphState> Checkpointer<S> for PostgresCheckpointer<S> {
    /// Atomic per-superstep write: checkpoint row + channel blobs + folding
    /// away any pending writes for the thread, in one transaction.
    async fn save(&self, checkpoint: Checkpoint<S>) -> AuraResult<()> {
        let blobs = Self::state_to_blobs(&checkpoint.state)?;
        let payload = serde_json::json!({
            "node": checkpoint.node,
            "superstep": checkpoint.superstep,
            "timestamp_nanos": timestamp_to_nanos(checkpoint.timestamp),
        });
        let metadata_json = serde_json::to_value(&checkpoint.metadata)
            .map_err(|e| AuraError::internal(format!("metadata serialization failed: {e}")))?;

        let mut client = self.client.lock().await;
        let tx = client
            .transaction()
            .await
            .map_err(|e| AuraError::unavailable(format!("transaction begin failed: {e}")))?;

        let insert_sql = format!(
            "INSERT INTO {} (thread_id, ns, checkpoint_id, parent_checkpoint_id, type, payload, metadata)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (thread_id, ns, checkpoint_id) DO UPDATE SET
                 parent_checkpoint_id = EXCLUDED.parent_checkpoint_id,
                 payload = EXCLUDED.payload,
                 metadata = EXCLUDED.metadata",
            self.checkpoints_table()
        );
        tx.execute(
            &insert_sql,
            &[
                &checkpoint.thread_id,
                &self.ns,
                &checkpoint.id,
                &checkpoint.parent_id,
                &BLOB_TYPE_JSON,
                &payload,
                &metadata_json,
            ],
        )
        .await
        .map_err(|e| AuraError::unavailable(format!("checkpoint insert failed: {e}")))?;

        let blob_sql = format!(
            "INSERT INTO {} (thread_id, ns, channel, version, type, blob)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (thread_id, ns, channel, version) DO UPDATE SET
                 type = EXCLUDED.type,
                 blob = EXCLUDED.blob",
            self.blobs_table()
        );
        for (channel, blob) in &blobs {
            tx.execute(
                &blob_sql,
                &[
                    &checkpoint.thread_id,
                    &self.ns,
                    channel,
                    &(checkpoint.superstep as i64),
                    &BLOB_TYPE_JSON,
                    blob,
                ],
            )
            .await
            .map_err(|e| AuraError::unavailable(format!("checkpoint blob insert failed: {e}")))?;
        }

        // Fold: a landed checkpoint absorbs every outstanding write for the
        // thread.
        let fold_sql = format!(
            "DELETE FROM {} WHERE thread_id = $1 AND ns = $2",
            self.writes_table()
        );
        tx.execute(&fold_sql, &[&checkpoint.thread_id, &self.ns])
            .await
            .map_err(|e| AuraError::unavailable(format!("pending-write fold failed: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| AuraError::unavailable(format!("transaction commit failed: {e}")))?;

        debug!(
            checkpoint_id = %checkpoint.id,
            superstep = checkpoint.superstep,
            channels = blobs.len(),
            "Saved checkpoint"
        );
        Ok(())
    }

    async fn load(&self, checkpoint_id: &str) -> AuraResult<Option<Checkpoint<S>>> {
        let client = self.client.lock().await;
        self.load_in(&client, checkpoint_id).await
    }

    async fn get_latest(&self, thread_id: &str) -> AuraResult<Option<Checkpoint<S>>> {
        let client = self.client.lock().await;
        let select_sql = format!(
            "SELECT checkpoint_id FROM {}
             WHERE thread_id = $1 AND ns = $2
             ORDER BY (payload->>'superstep')::bigint DESC, checkpoint_id DESC
             LIMIT 1",
            self.checkpoints_table()
        );
        let rows = client
            .query(&select_sql, &[&thread_id, &self.ns])
            .await
            .map_err(|e| AuraError::unavailable(format!("latest-checkpoint query failed: {e}")))?;

        let Some(row) = rows.first() else {
            return Ok(None);
        };
        let checkpoint_id: String = row.get(0);
        self.load_in(&client, &checkpoint_id).await
    }

    async fn list(&self, thread_id: &str) -> AuraResult<Vec<CheckpointMetadata>> {
        let client = self.client.lock().await;
        let select_sql = format!(
            "SELECT checkpoint_id, thread_id, parent_checkpoint_id, payload, metadata
             FROM {}
             WHERE thread_id = $1 AND ns = $2
             ORDER BY (payload->>'superstep')::bigint DESC, checkpoint_id DESC",
            self.checkpoints_table()
        );
        let rows = client
            .query(&select_sql, &[&thread_id, &self.ns])
            .await
            .map_err(|e| AuraError::unavailable(format!("checkpoint list failed: {e}")))?;

        rows.iter().map(|row| self.row_to_metadata(row)).collect()
    }

    async fn delete(&self, checkpoint_id: &str) -> AuraResult<()> {
        let mut client = self.client.lock().await;
        let tx = client
            .transaction()
            .await
            .map_err(|e| AuraError::unavailable(format!("transaction begin failed: {e}")))?;

        let delete_sql = format!(
            "DELETE FROM {} WHERE checkpoint_id = $1 AND ns = $2",
            self.checkpoints_table()
        );
        tx.execute(&delete_sql, &[&checkpoint_id, &self.ns])
            .await
            .map_err(|e| AuraError::unavailable(format!("checkpoint delete failed: {e}")))?;

        let writes_sql = format!(
            "DELETE FROM {} WHERE checkpoint_id = $1 AND ns = $2",
            self.writes_table()
        );
        tx.execute(&writes_sql, &[&checkpoint_id, &self.ns])
            .await
            .map_err(|e| AuraError::unavailable(format!("write delete failed: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| AuraError::unavailable(format!("transaction commit failed: {e}")))?;
        Ok(())
    }

    async fn delete_thread(&self, thread_id: &str) -> AuraResult<()> {
        let mut client = self.client.lock().await;
        let tx = client
            .transaction()
            .await
            .map_err(|e| AuraError::unavailable(format!("transaction begin failed: {e}")))?;

        for table in [
            self.checkpoints_table(),
            self.blobs_table(),
            self.writes_table(),
        ] {
            let delete_sql = format!("DELETE FROM {table} WHERE thread_id = $1 AND ns = $2");
            tx.execute(&delete_sql, &[&thread_id, &self.ns])
                .await
                .map_err(|e| AuraError::unavailable(format!("thread delete failed: {e}")))?;
        }

        tx.commit()
            .await
            .map_err(|e| AuraError::unavailable(format!("transaction commit failed: {e}")))?;
        debug!(thread_id, "Deleted thread checkpoints");
        Ok(())
    }

    async fn put_writes(&self, writes: Vec<PendingWrite>) -> AuraResult<()> {
        if writes.is_empty() {
            return Ok(());
        }
        let client = self.client.lock().await;
        let insert_sql = format!(
            "INSERT INTO {} (thread_id, ns, checkpoint_id, task_id, task_path, idx, channel, type, blob)
             VALUES ($1, $2, $3, $4, '', $5, $6, $7, $8)
             ON CONFLICT (thread_id, ns, checkpoint_id, task_id, idx, channel) DO UPDATE SET
                 blob = EXCLUDED.blob",
            self.writes_table()
        );
        for write in &writes {
            client
                .execute(
                    &insert_sql,
                    &[
                        &write.thread_id,
                        &self.ns,
                        &write.checkpoint_id,
                        &write.task_id,
                        &(write.idx as i32),
                        &write.channel,
                        &BLOB_TYPE_JSON,
                        &write.payload,
                    ],
                )
                .await
                .map_err(|e| AuraError::unavailable(format!("pending-write insert failed: {e}")))?;
        }
        Ok(())
    }

    async fn get_writes(&self, thread_id: &str) -> AuraResult<Vec<PendingWrite>> {
        let client = self.client.lock().await;
        let select_sql = format!(
            "SELECT checkpoint_id, task_id, idx, channel, blob FROM {}
             WHERE thread_id = $1 AND ns = $2
             ORDER BY task_id, idx",
            self.writes_table()
        );
        let rows = client
            .query(&select_sql, &[&thread_id, &self.ns])
            .await
            .map_err(|e| AuraError::unavailable(format!("pending-write query failed: {e}")))?;

        Ok(rows
            .iter()
            .map(|row| PendingWrite {
                thread_id: thread_id.to_string(),
                checkpoint_id: row.get(0),
                task_id: row.get(1),
                idx: row.get::<_, i32>(2) as u32,
                channel: row.get(3),
                payload: row.get(4),
            })
            .collect())
    }

    async fn clear_writes(&self, thread_id: &str) -> AuraResult<()> {
        let client = self.client.lock().await;
        let delete_sql = format!(
            "DELETE FROM {} WHERE thread_id = $1 AND ns = $2",
            self.writes_table()
        );
        client
            .execute(&delete_sql, &[&thread_id, &self.ns])
            .await
            .map_err(|e| AuraError::unavailable(format!("pending-write clear failed: {e}")))?;
        Ok(())
    }

    async fn list_threads(&self) -> AuraResult<Vec<ThreadInfo>> {
        let client = self.client.lock().await;
        let select_sql = format!(
            r"
            SELECT DISTINCT ON (thread_id)
                   thread_id, checkpoint_id, (payload->>'timestamp_nanos')::bigint
            FROM {}
            WHERE ns = $1
            ORDER BY thread_id, (payload->>'superstep')::bigint DESC, checkpoint_id DESC
            ",
            self.checkpoints_table()
        );
        let rows = client
            .query(&select_sql, &[&self.ns])
            .await
            .map_err(|e| AuraError::unavailable(format!("thread list failed: {e}")))?;

        let mut threads: Vec<ThreadInfo> = rows
            .iter()
            .map(|row| ThreadInfo {
                thread_id: row.get(0),
                latest_checkpoint_id: row.get(1),
                updated_at: nanos_to_timestamp(row.get::<_, Option<i64>>(2).unwrap_or(0)),
                checkpoint_count: None,
            })
            .collect();
        threads.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(threads)
    }
}

/// Errors raised while setting up the `PostgreSQL` checkpoint store.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum PostgresCheckpointerError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),
}

impl From<PostgresCheckpointerError> for AuraError {
    fn from(err: PostgresCheckpointerError) -> Self {
        use aura::CheckpointError;
        let checkpoint_err = match err {
            PostgresCheckpointerError::Connection(msg) => CheckpointError::ConnectionLost {
                backend: "postgres".to_string(),
                reason: msg,
            },
            PostgresCheckpointerError::Query(msg) => {
                CheckpointError::Other(format!("Query error: {msg}"))
            }
            PostgresCheckpointerError::InvalidIdentifier(msg) => {
                CheckpointError::Other(format!("Invalid identifier: {msg}"))
            }
        };
        AuraError::Checkpoint(checkpoint_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_identifiers_pass() {
        assert!(validate_identifier("aura").is_ok());
        assert!(validate_identifier("_internal").is_ok());
        assert!(validate_identifier("aura_v2").is_ok());
    }

    #[test]
    fn invalid_identifiers_fail() {
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("1aura").is_err());
        assert!(validate_identifier("aura-prod").is_err());
        assert!(validate_identifier("aura; DROP TABLE users").is_err());
        assert!(validate_identifier(&"x".repeat(64)).is_err());
    }

    #[test]
    fn timestamp_round_trip() {
        let now = SystemTime::now();
        let nanos = timestamp_to_nanos(now);
        let back = nanos_to_timestamp(nanos);
        let drift = now
            .duration_since(back)
            .unwrap_or_else(|e| e.duration());
        assert!(drift < Duration::from_micros(1));
    }

    #[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
    struct ObjectState {
        count: u32,
        note: Option<String>,
    }

    #[test]
    fn object_state_splits_into_channels() {
        let state = ObjectState {
            count: 3,
            note: Some("hi".to_string()),
        };
        let blobs = PostgresCheckpointer::<ObjectState>::state_to_blobs(&state).unwrap();
        assert_eq!(blobs.len(), 2);
        let channels: Vec<&str> = blobs.iter().map(|(c, _)| c.as_str()).collect();
        assert!(channels.contains(&"count"));
        assert!(channels.contains(&"note"));

        let restored = PostgresCheckpointer::<ObjectState>::blobs_to_state(blobs).unwrap();
        assert_eq!(restored, state);
    }

    #[test]
    fn scalar_state_uses_root_channel() {
        let blobs = PostgresCheckpointer::<u32>::state_to_blobs(&42).unwrap();
        assert_eq!(blobs.len(), 1);
        assert_eq!(blobs[0].0, ROOT_CHANNEL);
        let restored = PostgresCheckpointer::<u32>::blobs_to_state(blobs).unwrap();
        assert_eq!(restored, 42);
    }

    #[test]
    fn error_display_shapes() {
        assert_eq!(
            PostgresCheckpointerError::Connection("refused".to_string()).to_string(),
            "Connection error: refused"
        );
        assert_eq!(
            PostgresCheckpointerError::Query("syntax".to_string()).to_string(),
            "Query error: syntax"
        );
    }
}
