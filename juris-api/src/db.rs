//! PostgreSQL store driver and chat document store.
//!
//! [`PostgresDriver`] plugs a single `tokio-postgres` client into the
//! connection lifecycle manager. The connection future runs on its own task;
//! when it ends without being asked to, the driver reports a drop so the
//! manager can reconnect. [`PgChatStore`] keeps one row per user with the
//! messages as JSONB.

use async_trait::async_trait;
use juris_core::{ConnectOptions, ConnectionError, StorageError, Timestamp};
use juris_storage::{connection::redact_uri, ChatDocument, ChatMessage, ChatStore, DriverEvent, StoreDriver};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::AbortHandle;
use tokio_postgres::{Client, NoTls};

const DRIVER_EVENT_CAPACITY: usize = 16;

// ============================================================================
// DRIVER
// ============================================================================

/// Handle to one open Postgres session. Clones share the session.
#[derive(Clone)]
pub struct PgConnection {
    client: Arc<Client>,
    connection_task: AbortHandle,
}

impl PgConnection {
    pub fn client(&self) -> &Client {
        &self.client
    }
}

impl std::fmt::Debug for PgConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgConnection")
            .field("closed", &self.client.is_closed())
            .finish()
    }
}

/// `tokio-postgres` implementation of [`StoreDriver`]. TLS is left to the
/// network layer (sidecar or private network).
#[derive(Debug)]
pub struct PostgresDriver {
    events: broadcast::Sender<DriverEvent>,
}

impl PostgresDriver {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(DRIVER_EVENT_CAPACITY);
        Self { events }
    }
}

impl Default for PostgresDriver {
    fn default() -> Self {
        Self::new()
    }
}

fn connect_failed(uri: &str, reason: impl ToString) -> ConnectionError {
    ConnectionError::ConnectFailed {
        uri: redact_uri(uri),
        reason: reason.to_string(),
    }
}

#[async_trait]
impl StoreDriver for PostgresDriver {
    type Handle = PgConnection;

    fn name(&self) -> &str {
        "postgres"
    }

    async fn connect(
        &self,
        uri: &str,
        options: &ConnectOptions,
    ) -> Result<PgConnection, ConnectionError> {
        let mut config: tokio_postgres::Config =
            uri.parse().map_err(|e| connect_failed(uri, e))?;
        config
            .connect_timeout(options.connect_timeout)
            .tcp_user_timeout(options.socket_timeout)
            .keepalives(true);
        if let Some(name) = &options.application_name {
            config.application_name(name);
        }

        let (client, connection) = config
            .connect(NoTls)
            .await
            .map_err(|e| connect_failed(uri, e))?;

        let events = self.events.clone();
        let task = tokio::spawn(async move {
            let event = match connection.await {
                Ok(()) => DriverEvent::Disconnected {
                    reason: "server closed the connection".to_string(),
                },
                Err(e) => DriverEvent::Error {
                    reason: e.to_string(),
                },
            };
            tracing::debug!(?event, "Postgres connection task ended");
            // No receivers just means nobody is watching yet.
            let _ = events.send(event);
        });

        tracing::debug!(uri = %redact_uri(uri), "Postgres session opened");
        Ok(PgConnection {
            client: Arc::new(client),
            connection_task: task.abort_handle(),
        })
    }

    async fn ping(&self, handle: &PgConnection) -> Result<(), ConnectionError> {
        handle
            .client
            .simple_query("SELECT 1")
            .await
            .map(|_| ())
            .map_err(|e| ConnectionError::PingFailed {
                reason: e.to_string(),
            })
    }

    async fn disconnect(&self, handle: PgConnection) -> Result<(), ConnectionError> {
        // Aborting drops the socket without the task reporting a drop.
        handle.connection_task.abort();
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<DriverEvent> {
        self.events.subscribe()
    }
}

// ============================================================================
// CHAT STORE
// ============================================================================

pub const CHAT_SCHEMA: &str = "\
CREATE TABLE IF NOT EXISTS chat_documents (
    user_id    TEXT PRIMARY KEY,
    messages   JSONB NOT NULL,
    summary    TEXT NOT NULL DEFAULT '',
    version    BIGINT NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
);
ALTER TABLE chat_documents ADD COLUMN IF NOT EXISTS summary TEXT NOT NULL DEFAULT '';";

const SELECT_DOCUMENT: &str =
    "SELECT messages, summary, version, updated_at FROM chat_documents WHERE user_id = $1";

// The version guard turns a lost update into zero affected rows.
const UPSERT_DOCUMENT: &str = "\
INSERT INTO chat_documents (user_id, messages, summary, version, updated_at)
VALUES ($1, $2, $3, $4, $5)
ON CONFLICT (user_id) DO UPDATE
SET messages = EXCLUDED.messages, summary = EXCLUDED.summary,
    version = EXCLUDED.version, updated_at = EXCLUDED.updated_at
WHERE chat_documents.version < EXCLUDED.version";

const DELETE_DOCUMENT: &str = "DELETE FROM chat_documents WHERE user_id = $1";

const DELETE_EMPTY_DOCUMENTS: &str =
    "DELETE FROM chat_documents WHERE jsonb_array_length(messages) = 0";

/// [`ChatStore`] over a [`PgConnection`].
#[derive(Debug, Default, Clone, Copy)]
pub struct PgChatStore;

impl PgChatStore {
    pub fn new() -> Self {
        Self
    }

    /// Create the table if it does not exist.
    pub async fn ensure_schema(&self, conn: &PgConnection) -> Result<(), StorageError> {
        conn.client
            .batch_execute(CHAT_SCHEMA)
            .await
            .map_err(|e| StorageError::WriteFailed {
                id: "chat_documents".to_string(),
                reason: e.to_string(),
            })
    }
}

fn read_failed(user_id: &str, e: impl ToString) -> StorageError {
    StorageError::ReadFailed {
        id: user_id.to_string(),
        reason: e.to_string(),
    }
}

fn write_failed(user_id: &str, e: impl ToString) -> StorageError {
    StorageError::WriteFailed {
        id: user_id.to_string(),
        reason: e.to_string(),
    }
}

fn serialization(e: impl ToString) -> StorageError {
    StorageError::Serialization {
        reason: e.to_string(),
    }
}

#[async_trait]
impl ChatStore<PgConnection> for PgChatStore {
    async fn load(
        &self,
        conn: &PgConnection,
        user_id: &str,
    ) -> Result<Option<ChatDocument>, StorageError> {
        let Some(row) = conn
            .client
            .query_opt(SELECT_DOCUMENT, &[&user_id])
            .await
            .map_err(|e| read_failed(user_id, e))?
        else {
            return Ok(None);
        };

        let messages: serde_json::Value =
            row.try_get("messages").map_err(|e| read_failed(user_id, e))?;
        let summary: String = row.try_get("summary").map_err(|e| read_failed(user_id, e))?;
        let version: i64 = row.try_get("version").map_err(|e| read_failed(user_id, e))?;
        let updated_at: Timestamp = row
            .try_get("updated_at")
            .map_err(|e| read_failed(user_id, e))?;

        Ok(Some(ChatDocument {
            user_id: user_id.to_string(),
            messages: serde_json::from_value::<Vec<ChatMessage>>(messages).map_err(serialization)?,
            summary,
            version: u64::try_from(version).map_err(serialization)?,
            updated_at,
        }))
    }

    async fn save(&self, conn: &PgConnection, document: &ChatDocument) -> Result<(), StorageError> {
        let messages = serde_json::to_value(&document.messages).map_err(serialization)?;
        let version = i64::try_from(document.version).map_err(serialization)?;

        let updated = conn
            .client
            .execute(
                UPSERT_DOCUMENT,
                &[
                    &document.user_id,
                    &messages,
                    &document.summary,
                    &version,
                    &document.updated_at,
                ],
            )
            .await
            .map_err(|e| write_failed(&document.user_id, e))?;

        if updated == 0 {
            tracing::warn!(
                user_id = %document.user_id,
                version = document.version,
                "Rejected stale chat document write"
            );
            return Err(write_failed(&document.user_id, "stale version"));
        }
        Ok(())
    }

    async fn delete(&self, conn: &PgConnection, user_id: &str) -> Result<bool, StorageError> {
        let deleted = conn
            .client
            .execute(DELETE_DOCUMENT, &[&user_id])
            .await
            .map_err(|e| write_failed(user_id, e))?;
        Ok(deleted > 0)
    }

    async fn delete_empty(&self, conn: &PgConnection) -> Result<u64, StorageError> {
        conn.client
            .execute(DELETE_EMPTY_DOCUMENTS, &[])
            .await
            .map_err(|e| write_failed("chat_documents", e))
    }
}
