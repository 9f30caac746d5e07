//! Durable Mirror: persists the Shared Document to a local SQLite file so
//! state survives restarts and is available before any network activity.
//!
//! Idempotent additive migrations (`CREATE TABLE IF NOT EXISTS`) and a
//! `SqlitePool` owned alongside a lifecycle-ready signal.

use std::sync::Arc;
use std::time::Duration;

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tokio::sync::watch;

use crate::doc::SharedDocument;

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error(transparent)]
    Db(#[from] sqlx::Error),
    #[error("stored update log entry is not valid CRDT update data: {0}")]
    CorruptUpdate(String),
}

/// Each connection opened against `sqlite::memory:` gets its own private,
/// unshared database, so a pool with more than one connection would let a
/// second connection see an empty, table-less database. Cap the pool at one
/// connection for in-memory URLs; file-backed databases can share a pool.
fn sqlite_pool_options(url: &str) -> SqlitePoolOptions {
    let max_connections = if url.contains(":memory:") { 1 } else { 4 };
    SqlitePoolOptions::new().max_connections(max_connections)
}

/// Persists every update the Shared Document produces into an append-only
/// log table, and rebuilds the document from that log at startup.
pub struct DurableMirror {
    pool: SqlitePool,
    ready_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
    ready_timeout: Duration,
}

impl DurableMirror {
    /// Open (creating if necessary) the mirror database at `url`, e.g.
    /// `sqlite://path/to/mirror.db?mode=rwc` or `sqlite::memory:` for tests.
    /// Uses `SyncConfig::default()`'s ready timeout; use `open_with_timeout`
    /// to match a host's own `SyncConfig`.
    pub async fn open(url: &str) -> Result<Self, MirrorError> {
        Self::open_with_timeout(url, crate::config::SyncConfig::default().mirror_ready_timeout).await
    }

    pub async fn open_with_timeout(url: &str, ready_timeout: Duration) -> Result<Self, MirrorError> {
        let pool = sqlite_pool_options(url).connect(url).await?;
        run_migrations(&pool).await?;
        let (ready_tx, ready_rx) = watch::channel(false);
        Ok(Self {
            pool,
            ready_tx,
            ready_rx,
            ready_timeout,
        })
    }

    /// Rebuild `doc` from the persisted update log, then subscribe it to
    /// future updates so every later mutation is appended automatically.
    /// Bounded by `timeout`: if persistence is slow or unavailable, the
    /// mirror declares itself ready in degraded mode with whatever loaded.
    pub async fn init(self: &Arc<Self>, doc: Arc<SharedDocument>) {
        let load = self.load_into(&doc);
        match tokio::time::timeout(self.degraded_mode_timeout(), load).await {
            Ok(Ok(())) => {
                tracing::debug!("durable mirror loaded cleanly");
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "durable mirror load failed, proceeding without persistence");
            }
            Err(_) => {
                tracing::warn!("durable mirror load exceeded timeout, proceeding in degraded mode");
            }
        }

        let mirror = self.clone();
        doc.observe_updates(move |update| {
            let mirror = mirror.clone();
            let update = update.to_vec();
            tokio::spawn(async move {
                if let Err(e) = mirror.append_update(&update).await {
                    tracing::warn!(error = %e, "failed to persist update to durable mirror");
                }
            });
        });

        let _ = self.ready_tx.send(true);
    }

    fn degraded_mode_timeout(&self) -> Duration {
        self.ready_timeout
    }

    async fn load_into(&self, doc: &SharedDocument) -> Result<(), MirrorError> {
        let rows = sqlx::query("SELECT update_blob FROM mirror_update_log ORDER BY seq ASC")
            .fetch_all(&self.pool)
            .await?;
        for row in rows {
            let blob: Vec<u8> = row.try_get("update_blob")?;
            doc.apply_remote_update(&blob)
                .map_err(|e| MirrorError::CorruptUpdate(e.to_string()))?;
        }
        Ok(())
    }

    async fn append_update(&self, update: &[u8]) -> Result<(), MirrorError> {
        sqlx::query("INSERT INTO mirror_update_log (update_blob) VALUES (?1)")
            .bind(update)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        *self.ready_rx.borrow()
    }

    /// A receiver that resolves once `init` has either loaded cleanly or hit
    /// its degraded-mode timeout. Mirrors the `ready` promise DM exposes.
    pub fn ready_signal(&self) -> watch::Receiver<bool> {
        self.ready_rx.clone()
    }

    pub async fn wait_ready(&self) {
        let mut rx = self.ready_rx.clone();
        if *rx.borrow() {
            return;
        }
        let _ = rx.changed().await;
    }

    /// Discard the mirror's persisted state. Does not touch the in-memory document.
    pub async fn clear(&self) -> Result<(), MirrorError> {
        sqlx::query("DELETE FROM mirror_update_log").execute(&self.pool).await?;
        Ok(())
    }
}

async fn run_migrations(pool: &SqlitePool) -> Result<(), MirrorError> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS mirror_update_log (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            update_blob BLOB NOT NULL,
            created_at_unixepoch INTEGER NOT NULL DEFAULT (unixepoch())
        )",
    )
    .execute(pool)
    .await?;
    Ok(())
}
