use crate::error::{OfflineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqlitePoolOptions, sqlite::SqliteRow, Row, SqlitePool};
use std::path::{Path, PathBuf};
use strum::{Display, EnumString};
use tracing::{debug, info};

/// Tables holding encrypted entity caches
pub const CACHE_TABLES: [&str; 4] = ["users", "events", "tasks", "messages"];

/// One cached entity row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheRecord {
    pub id: String,
    pub encrypted_payload: String,
    pub checksum: String,
    pub synced_at: DateTime<Utc>,
    pub is_modified: bool,
    /// Key version the payload was encrypted with (0 = unencrypted fallback)
    pub version: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MutationType {
    Create,
    Update,
    Delete,
}

/// A write waiting for the remote authority
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationQueueItem {
    pub id: i64,
    pub mutation_type: MutationType,
    pub entity: String,
    pub entity_id: Option<String>,
    pub data: Option<String>,
    pub original_checksum: Option<String>,
    pub endpoint: String,
    pub method: String,
    pub retry_count: u32,
    /// Epoch milliseconds
    pub next_retry_at: i64,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewMutation {
    pub mutation_type: MutationType,
    pub entity: String,
    pub entity_id: Option<String>,
    pub data: Option<String>,
    pub original_checksum: Option<String>,
    pub endpoint: String,
    pub method: String,
}

/// Local attempt and server state captured on a 409
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub id: i64,
    pub entity: String,
    pub entity_id: Option<String>,
    pub endpoint: String,
    pub method: String,
    pub local_data: Option<serde_json::Value>,
    pub server_data: serde_json::Value,
    pub detected_at: DateTime<Utc>,
}

/// Queue item that ran out of attempts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: i64,
    pub queue_id: i64,
    pub mutation_type: MutationType,
    pub entity: String,
    pub entity_id: Option<String>,
    pub data: Option<String>,
    pub endpoint: String,
    pub method: String,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub dropped_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DatabaseStats {
    pub cached: Vec<(String, i64)>,
    pub queued: i64,
    pub conflicts: i64,
    pub dead_letters: i64,
}

pub struct Database {
    pool: SqlitePool,
    db_path: PathBuf,
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn checked_table(table: &str) -> Result<&str> {
    if CACHE_TABLES.contains(&table) {
        Ok(table)
    } else {
        Err(OfflineError::InvalidRequest(format!("unknown cache table: {}", table)))
    }
}

impl Database {
    /// Create a new database connection
    pub async fn new(db_path: Option<PathBuf>) -> Result<Self> {
        let db_path = db_path.unwrap_or_else(|| {
            crate::config::OfflineConfig::default_data_dir().join("flocksync.db")
        });

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                OfflineError::Config(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }

        info!("Opening cache database at: {:?}", db_path);

        let db_url = format!("sqlite:{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        let db = Self { pool, db_path };
        db.migrate().await?;

        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    /// Run database migrations
    async fn migrate(&self) -> Result<()> {
        info!("Running database migrations");

        for table in CACHE_TABLES {
            sqlx::query(&format!(
                r#"
                CREATE TABLE IF NOT EXISTS {table} (
                    id TEXT PRIMARY KEY,
                    encrypted_payload TEXT NOT NULL,
                    checksum TEXT NOT NULL,
                    synced_at INTEGER NOT NULL,
                    is_modified INTEGER NOT NULL DEFAULT 0,
                    version INTEGER NOT NULL
                )
                "#
            ))
            .execute(&self.pool)
            .await?;

            sqlx::query(&format!(
                "CREATE INDEX IF NOT EXISTS idx_{table}_synced_at ON {table}(synced_at)"
            ))
            .execute(&self.pool)
            .await?;
        }

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                mutation_type TEXT NOT NULL,
                entity TEXT NOT NULL,
                entity_id TEXT,
                data TEXT,
                original_checksum TEXT,
                endpoint TEXT NOT NULL,
                method TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                next_retry_at INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS conflicts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                entity TEXT NOT NULL,
                entity_id TEXT,
                endpoint TEXT NOT NULL,
                method TEXT NOT NULL,
                local_data TEXT,
                server_data TEXT NOT NULL,
                detected_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS dead_letters (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                queue_id INTEGER NOT NULL,
                mutation_type TEXT NOT NULL,
                entity TEXT NOT NULL,
                entity_id TEXT,
                data TEXT,
                endpoint TEXT NOT NULL,
                method TEXT NOT NULL,
                retry_count INTEGER NOT NULL,
                last_error TEXT,
                created_at INTEGER NOT NULL,
                dropped_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        debug!("Database migrations completed");
        Ok(())
    }

    // ── Meta ──

    pub async fn get_meta(&self, key: &str) -> Result<Option<String>> {
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM meta WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(value)
    }

    pub async fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO meta (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn delete_meta(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM meta WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ── Cache records ──

    /// Insert or fully replace a cached record
    pub async fn upsert_cache_record(&self, table: &str, record: &CacheRecord) -> Result<()> {
        let table = checked_table(table)?;
        sqlx::query(&format!(
            r#"
            INSERT INTO {table} (id, encrypted_payload, checksum, synced_at, is_modified, version)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                encrypted_payload = excluded.encrypted_payload,
                checksum = excluded.checksum,
                synced_at = excluded.synced_at,
                is_modified = excluded.is_modified,
                version = excluded.version
            "#
        ))
        .bind(&record.id)
        .bind(&record.encrypted_payload)
        .bind(&record.checksum)
        .bind(record.synced_at.timestamp_millis())
        .bind(record.is_modified)
        .bind(record.version)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_cache_records(&self, table: &str) -> Result<Vec<CacheRecord>> {
        let table = checked_table(table)?;
        let records = sqlx::query(&format!(
            "SELECT id, encrypted_payload, checksum, synced_at, is_modified, version
             FROM {table} ORDER BY synced_at DESC, id"
        ))
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|row| CacheRecord {
            id: row.get(0),
            encrypted_payload: row.get(1),
            checksum: row.get(2),
            synced_at: from_millis(row.get(3)),
            is_modified: row.get(4),
            version: row.get(5),
        })
        .collect();

        Ok(records)
    }

    pub async fn get_cache_record(&self, table: &str, id: &str) -> Result<Option<CacheRecord>> {
        let table = checked_table(table)?;
        let record = sqlx::query(&format!(
            "SELECT id, encrypted_payload, checksum, synced_at, is_modified, version
             FROM {table} WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .map(|row| CacheRecord {
            id: row.get(0),
            encrypted_payload: row.get(1),
            checksum: row.get(2),
            synced_at: from_millis(row.get(3)),
            is_modified: row.get(4),
            version: row.get(5),
        });

        Ok(record)
    }

    pub async fn clear_cache_table(&self, table: &str) -> Result<u64> {
        let table = checked_table(table)?;
        let removed = sqlx::query(&format!("DELETE FROM {table}"))
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(removed)
    }

    /// Wipe every entity cache, returning the number of rows removed
    pub async fn purge_all_cache(&self) -> Result<u64> {
        let mut removed = 0;
        for table in CACHE_TABLES {
            removed += self.clear_cache_table(table).await?;
        }
        Ok(removed)
    }

    /// Remove records last synced before `cutoff`
    pub async fn delete_expired(&self, table: &str, cutoff: DateTime<Utc>) -> Result<u64> {
        let table = checked_table(table)?;
        let removed = sqlx::query(&format!("DELETE FROM {table} WHERE synced_at < ?"))
            .bind(cutoff.timestamp_millis())
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(removed)
    }

    pub async fn count_cache(&self, table: &str) -> Result<i64> {
        let table = checked_table(table)?;
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    // ── Mutation queue ──

    pub async fn insert_queue_item(&self, item: &NewMutation) -> Result<i64> {
        let now = Utc::now().timestamp_millis();
        let id = sqlx::query(
            r#"
            INSERT INTO sync_queue
                (mutation_type, entity, entity_id, data, original_checksum, endpoint, method,
                 retry_count, next_retry_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?, ?)
            "#,
        )
        .bind(item.mutation_type.to_string())
        .bind(&item.entity)
        .bind(&item.entity_id)
        .bind(&item.data)
        .bind(&item.original_checksum)
        .bind(&item.endpoint)
        .bind(&item.method)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        Ok(id)
    }

    /// All pending items in enqueue order
    pub async fn list_queue(&self) -> Result<Vec<MutationQueueItem>> {
        sqlx::query(
            "SELECT id, mutation_type, entity, entity_id, data, original_checksum, endpoint, method,
                    retry_count, next_retry_at, last_error, created_at
             FROM sync_queue ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|row| queue_item_from_row(&row))
        .collect()
    }

    pub async fn get_queue_item(&self, id: i64) -> Result<Option<MutationQueueItem>> {
        sqlx::query(
            "SELECT id, mutation_type, entity, entity_id, data, original_checksum, endpoint, method,
                    retry_count, next_retry_at, last_error, created_at
             FROM sync_queue WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .map(|row| queue_item_from_row(&row))
        .transpose()
    }

    pub async fn update_queue_retry(
        &self,
        id: i64,
        retry_count: u32,
        next_retry_at: i64,
        last_error: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE sync_queue SET retry_count = ?, next_retry_at = ?, last_error = ? WHERE id = ?",
        )
        .bind(i64::from(retry_count))
        .bind(next_retry_at)
        .bind(last_error)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_queue_item(&self, id: i64) -> Result<bool> {
        let removed = sqlx::query("DELETE FROM sync_queue WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(removed > 0)
    }

    pub async fn count_queue(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sync_queue")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    // ── Dead letters ──

    /// Archive a queue item and remove it from the active queue
    pub async fn move_to_dead_letters(&self, item: &MutationQueueItem) -> Result<i64> {
        let mut tx = self.pool.begin().await?;

        let id = sqlx::query(
            r#"
            INSERT INTO dead_letters
                (queue_id, mutation_type, entity, entity_id, data, endpoint, method,
                 retry_count, last_error, created_at, dropped_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(item.id)
        .bind(item.mutation_type.to_string())
        .bind(&item.entity)
        .bind(&item.entity_id)
        .bind(&item.data)
        .bind(&item.endpoint)
        .bind(&item.method)
        .bind(i64::from(item.retry_count))
        .bind(&item.last_error)
        .bind(item.created_at.timestamp_millis())
        .bind(Utc::now().timestamp_millis())
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        sqlx::query("DELETE FROM sync_queue WHERE id = ?")
            .bind(item.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(id)
    }

    pub async fn list_dead_letters(&self) -> Result<Vec<DeadLetter>> {
        sqlx::query(
            "SELECT id, queue_id, mutation_type, entity, entity_id, data, endpoint, method,
                    retry_count, last_error, created_at, dropped_at
             FROM dead_letters ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|row| {
            Ok(DeadLetter {
                id: row.get(0),
                queue_id: row.get(1),
                mutation_type: parse_mutation_type(row.get(2))?,
                entity: row.get(3),
                entity_id: row.get(4),
                data: row.get(5),
                endpoint: row.get(6),
                method: row.get(7),
                retry_count: u32::try_from(row.get::<i64, _>(8)).unwrap_or(u32::MAX),
                last_error: row.get(9),
                created_at: from_millis(row.get(10)),
                dropped_at: from_millis(row.get(11)),
            })
        })
        .collect()
    }

    pub async fn purge_dead_letters(&self) -> Result<u64> {
        let removed = sqlx::query("DELETE FROM dead_letters")
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(removed)
    }

    // ── Conflicts ──

    pub async fn insert_conflict(
        &self,
        item: &MutationQueueItem,
        server_data: &serde_json::Value,
    ) -> Result<i64> {
        let id = sqlx::query(
            r#"
            INSERT INTO conflicts (entity, entity_id, endpoint, method, local_data, server_data, detected_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&item.entity)
        .bind(&item.entity_id)
        .bind(&item.endpoint)
        .bind(&item.method)
        .bind(&item.data)
        .bind(serde_json::to_string(server_data)?)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        Ok(id)
    }

    pub async fn list_conflicts(&self) -> Result<Vec<ConflictRecord>> {
        sqlx::query(
            "SELECT id, entity, entity_id, endpoint, method, local_data, server_data, detected_at
             FROM conflicts ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|row| {
            let local_data: Option<String> = row.get(5);
            let server_data: String = row.get(6);
            Ok(ConflictRecord {
                id: row.get(0),
                entity: row.get(1),
                entity_id: row.get(2),
                endpoint: row.get(3),
                method: row.get(4),
                local_data: local_data
                    .map(|raw| {
                        serde_json::from_str(&raw).unwrap_or(serde_json::Value::String(raw))
                    }),
                server_data: serde_json::from_str(&server_data)?,
                detected_at: from_millis(row.get(7)),
            })
        })
        .collect()
    }

    pub async fn delete_conflict(&self, id: i64) -> Result<bool> {
        let removed = sqlx::query("DELETE FROM conflicts WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(removed > 0)
    }

    /// Get database statistics
    pub async fn get_stats(&self) -> Result<DatabaseStats> {
        let mut cached = Vec::with_capacity(CACHE_TABLES.len());
        for table in CACHE_TABLES {
            cached.push((table.to_string(), self.count_cache(table).await?));
        }

        let conflicts: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM conflicts")
            .fetch_one(&self.pool)
            .await?;
        let dead_letters: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM dead_letters")
            .fetch_one(&self.pool)
            .await?;

        Ok(DatabaseStats {
            cached,
            queued: self.count_queue().await?,
            conflicts,
            dead_letters,
        })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn parse_mutation_type(raw: String) -> Result<MutationType> {
    raw.parse()
        .map_err(|_| OfflineError::InvalidRequest(format!("unknown mutation type: {}", raw)))
}

fn queue_item_from_row(row: &SqliteRow) -> Result<MutationQueueItem> {
    Ok(MutationQueueItem {
        id: row.get(0),
        mutation_type: parse_mutation_type(row.get(1))?,
        entity: row.get(2),
        entity_id: row.get(3),
        data: row.get(4),
        original_checksum: row.get(5),
        endpoint: row.get(6),
        method: row.get(7),
        retry_count: u32::try_from(row.get::<i64, _>(8)).unwrap_or(u32::MAX),
        next_retry_at: row.get(9),
        last_error: row.get(10),
        created_at: from_millis(row.get(11)),
    })
}
