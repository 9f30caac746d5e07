//! The "older record-oriented local database" the Sync Bridge reconciles
//! against: one table per synced kind plus a preferences table, each row
//! keyed by record id with an indexed effective-timestamp column so the
//! timestamp merge rule is a plain SQL comparison. Row structs plus
//! per-kind upsert/get/list functions, idempotent `CREATE TABLE IF NOT
//! EXISTS` migrations.

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use thiserror::Error;

use crate::codec::{Kind, PreferenceEntry, Record};

#[derive(Debug, Error)]
pub enum LegacyDbError {
    #[error(transparent)]
    Db(#[from] sqlx::Error),
    #[error("stored row for {0} is not valid JSON: {1}")]
    CorruptRow(String, serde_json::Error),
}

/// Each connection opened against `sqlite::memory:` gets its own private,
/// unshared database, so a pool with more than one connection would let a
/// second connection see an empty, table-less database. Cap the pool at one
/// connection for in-memory URLs; file-backed databases can share a pool.
fn sqlite_pool_options(url: &str) -> SqlitePoolOptions {
    let max_connections = if url.contains(":memory:") { 1 } else { 4 };
    SqlitePoolOptions::new().max_connections(max_connections)
}

pub struct LegacyDb {
    pool: SqlitePool,
}

impl LegacyDb {
    pub async fn open(url: &str) -> Result<Self, LegacyDbError> {
        let pool = sqlite_pool_options(url).connect(url).await?;
        run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn upsert(&self, kind: Kind, record: &Record) -> Result<(), LegacyDbError> {
        let payload = serde_json::to_string(record)
            .map_err(|e| LegacyDbError::CorruptRow(record.id.clone(), e))?;
        let timestamp = record.effective_timestamp_millis();
        let table = kind.table_name();
        sqlx::query(&format!(
            "INSERT INTO {table} (id, payload, effective_timestamp_millis)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET payload = excluded.payload,
                 effective_timestamp_millis = excluded.effective_timestamp_millis"
        ))
        .bind(&record.id)
        .bind(&payload)
        .bind(timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete(&self, kind: Kind, id: &str) -> Result<(), LegacyDbError> {
        let table = kind.table_name();
        sqlx::query(&format!("DELETE FROM {table} WHERE id = ?1"))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get(&self, kind: Kind, id: &str) -> Result<Option<Record>, LegacyDbError> {
        let table = kind.table_name();
        let row = sqlx::query(&format!("SELECT payload FROM {table} WHERE id = ?1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| decode_row(id, r)).transpose()
    }

    pub async fn list(&self, kind: Kind) -> Result<Vec<Record>, LegacyDbError> {
        let table = kind.table_name();
        let rows = sqlx::query(&format!("SELECT id, payload FROM {table}"))
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|r| {
                let id: String = r.try_get("id")?;
                decode_row(&id, r)
            })
            .collect()
    }

    pub async fn is_empty(&self, kind: Kind) -> Result<bool, LegacyDbError> {
        let table = kind.table_name();
        let row = sqlx::query(&format!("SELECT COUNT(*) as n FROM {table}"))
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n == 0)
    }

    pub async fn get_preference(&self, key: &str) -> Result<Option<PreferenceEntry>, LegacyDbError> {
        let row = sqlx::query("SELECT value_json, updated_at FROM preferences WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            None => Ok(None),
            Some(r) => {
                let value_json: String = r.try_get("value_json")?;
                let updated_at: String = r.try_get("updated_at")?;
                let value = serde_json::from_str(&value_json)
                    .map_err(|e| LegacyDbError::CorruptRow(key.to_string(), e))?;
                Ok(Some(PreferenceEntry { value, updated_at }))
            }
        }
    }

    pub async fn set_preference(&self, key: &str, entry: &PreferenceEntry) -> Result<(), LegacyDbError> {
        let value_json = serde_json::to_string(&entry.value)
            .map_err(|e| LegacyDbError::CorruptRow(key.to_string(), e))?;
        sqlx::query(
            "INSERT INTO preferences (key, value_json, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(&value_json)
        .bind(&entry.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_preferences(&self) -> Result<Vec<(String, PreferenceEntry)>, LegacyDbError> {
        let rows = sqlx::query("SELECT key, value_json, updated_at FROM preferences")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|r| {
                let key: String = r.try_get("key")?;
                let value_json: String = r.try_get("value_json")?;
                let updated_at: String = r.try_get("updated_at")?;
                let value = serde_json::from_str(&value_json)
                    .map_err(|e| LegacyDbError::CorruptRow(key.clone(), e))?;
                Ok((key, PreferenceEntry { value, updated_at }))
            })
            .collect()
    }
}

fn decode_row(id: &str, row: sqlx::sqlite::SqliteRow) -> Result<Record, LegacyDbError> {
    let payload: String = row.try_get("payload")?;
    serde_json::from_str(&payload).map_err(|e| LegacyDbError::CorruptRow(id.to_string(), e))
}

async fn run_migrations(pool: &SqlitePool) -> Result<(), LegacyDbError> {
    for kind in Kind::RECORD_KINDS {
        let table = kind.table_name();
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id TEXT PRIMARY KEY,
                payload TEXT NOT NULL,
                effective_timestamp_millis INTEGER
            )"
        ))
        .execute(pool)
        .await?;
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{table}_ts ON {table} (effective_timestamp_millis)"
        ))
        .execute(pool)
        .await?;
    }
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS preferences (
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;
    Ok(())
}
