//! SQLite-backed store.
//!
//! Tables are created on open. Rows owned by a connection reference it with
//! `ON DELETE CASCADE`, and connection names carry a unique constraint, so the
//! database itself enforces cascade completeness and name uniqueness.

use crate::error::{DbError, DbResult};
use crate::models::{
    ConnectionDescriptor, Dialect, ExecutionRecord, ExecutionStatus, MetadataEntry, ObjectType,
    Snapshot,
};
use crate::store::Store;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, Transaction};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

const MAX_STORE_CONNECTIONS: u32 = 4;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS connections (
        id TEXT PRIMARY KEY NOT NULL,
        name TEXT NOT NULL UNIQUE,
        url TEXT NOT NULL,
        description TEXT,
        is_active INTEGER NOT NULL DEFAULT 1,
        dialect TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS metadata_snapshots (
        connection_id TEXT PRIMARY KEY NOT NULL
            REFERENCES connections(id) ON DELETE CASCADE,
        extracted_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS metadata_entries (
        connection_id TEXT NOT NULL
            REFERENCES metadata_snapshots(connection_id) ON DELETE CASCADE,
        position INTEGER NOT NULL,
        object_type TEXT NOT NULL,
        schema_name TEXT,
        object_name TEXT NOT NULL,
        attributes TEXT NOT NULL,
        extracted_at TEXT NOT NULL,
        PRIMARY KEY (connection_id, position)
    );

    CREATE TABLE IF NOT EXISTS execution_records (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        connection_id TEXT NOT NULL
            REFERENCES connections(id) ON DELETE CASCADE,
        query_text TEXT NOT NULL,
        statement_kind TEXT,
        status TEXT NOT NULL,
        row_count INTEGER,
        rows_affected INTEGER,
        duration_ms INTEGER NOT NULL,
        error_detail TEXT,
        executed_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_execution_records_connection
        ON execution_records(connection_id, seq);
";

fn storage_error(err: sqlx::Error) -> DbError {
    DbError::storage(err.to_string())
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
}

fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.is_foreign_key_violation())
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn decode_connection(row: &SqliteRow) -> DbResult<ConnectionDescriptor> {
    let dialect: String = row.try_get("dialect").map_err(storage_error)?;
    let dialect = Dialect::parse(&dialect)
        .ok_or_else(|| DbError::storage(format!("Unknown dialect in store: {}", dialect)))?;
    Ok(ConnectionDescriptor {
        id: row.try_get("id").map_err(storage_error)?,
        name: row.try_get("name").map_err(storage_error)?,
        url: row.try_get("url").map_err(storage_error)?,
        description: row.try_get("description").map_err(storage_error)?,
        is_active: row.try_get("is_active").map_err(storage_error)?,
        dialect,
        created_at: row.try_get("created_at").map_err(storage_error)?,
        updated_at: row.try_get("updated_at").map_err(storage_error)?,
    })
}

fn decode_entry(row: &SqliteRow) -> DbResult<MetadataEntry> {
    let object_type: String = row.try_get("object_type").map_err(storage_error)?;
    let object_type = ObjectType::parse(&object_type)
        .ok_or_else(|| DbError::storage(format!("Unknown object type: {}", object_type)))?;
    let attributes: String = row.try_get("attributes").map_err(storage_error)?;
    let attributes = serde_json::from_str(&attributes)
        .map_err(|e| DbError::storage(format!("Corrupt metadata attributes: {}", e)))?;
    Ok(MetadataEntry {
        connection_id: row.try_get("connection_id").map_err(storage_error)?,
        object_type,
        schema_name: row.try_get("schema_name").map_err(storage_error)?,
        object_name: row.try_get("object_name").map_err(storage_error)?,
        attributes,
        extracted_at: row.try_get("extracted_at").map_err(storage_error)?,
    })
}

fn decode_execution(row: &SqliteRow) -> DbResult<ExecutionRecord> {
    let status: String = row.try_get("status").map_err(storage_error)?;
    let status = ExecutionStatus::parse(&status)
        .ok_or_else(|| DbError::storage(format!("Unknown execution status: {}", status)))?;
    let row_count: Option<i64> = row.try_get("row_count").map_err(storage_error)?;
    let rows_affected: Option<i64> = row.try_get("rows_affected").map_err(storage_error)?;
    let duration_ms: i64 = row.try_get("duration_ms").map_err(storage_error)?;
    Ok(ExecutionRecord {
        id: row.try_get("id").map_err(storage_error)?,
        connection_id: row.try_get("connection_id").map_err(storage_error)?,
        query_text: row.try_get("query_text").map_err(storage_error)?,
        statement_kind: row.try_get("statement_kind").map_err(storage_error)?,
        status,
        row_count: row_count.map(|n| n.max(0) as u64),
        rows_affected: rows_affected.map(|n| n.max(0) as u64),
        duration_ms: duration_ms.max(0) as u64,
        error_detail: row.try_get("error_detail").map_err(storage_error)?,
        executed_at: row.try_get("executed_at").map_err(storage_error)?,
    })
}

/// Store persisted in a SQLite database file.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) the database at `url` and ensure the schema.
    pub async fn open(url: &str) -> DbResult<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| DbError::invalid_url(format!("Invalid store URL: {}", e)))?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_STORE_CONNECTIONS)
            .connect_with(options)
            .await
            .map_err(storage_error)?;

        let store = Self { pool };
        store.init_schema().await?;
        info!("Opened record store");
        Ok(store)
    }

    /// A private in-memory database. Everything is lost when the store is dropped.
    pub async fn in_memory() -> DbResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(storage_error)?
            .foreign_keys(true);

        // Every in-memory connection is its own database, so keep exactly one alive
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(storage_error)?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> DbResult<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(storage_error)?;
        debug!("Record store schema ready");
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn insert_entries(
        tx: &mut Transaction<'_, Sqlite>,
        snapshot: &Snapshot,
    ) -> DbResult<()> {
        for (position, entry) in snapshot.entries.iter().enumerate() {
            let attributes = serde_json::to_string(&entry.attributes)
                .map_err(|e| DbError::internal(format!("Failed to encode attributes: {}", e)))?;
            sqlx::query(
                "INSERT INTO metadata_entries \
                 (connection_id, position, object_type, schema_name, object_name, attributes, extracted_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&snapshot.connection_id)
            .bind(position as i64)
            .bind(entry.object_type.as_str())
            .bind(&entry.schema_name)
            .bind(&entry.object_name)
            .bind(attributes)
            .bind(entry.extracted_at)
            .execute(&mut **tx)
            .await
            .map_err(storage_error)?;
        }
        Ok(())
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn insert_connection(&self, descriptor: &ConnectionDescriptor) -> DbResult<()> {
        sqlx::query(
            "INSERT INTO connections \
             (id, name, url, description, is_active, dialect, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&descriptor.id)
        .bind(&descriptor.name)
        .bind(&descriptor.url)
        .bind(&descriptor.description)
        .bind(descriptor.is_active)
        .bind(descriptor.dialect.as_str())
        .bind(descriptor.created_at)
        .bind(descriptor.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                DbError::duplicate_name(&descriptor.name)
            } else {
                storage_error(e)
            }
        })?;
        Ok(())
    }

    async fn update_connection(&self, descriptor: &ConnectionDescriptor) -> DbResult<()> {
        let result = sqlx::query(
            "UPDATE connections \
             SET name = ?, url = ?, description = ?, is_active = ?, dialect = ?, updated_at = ? \
             WHERE id = ?",
        )
        .bind(&descriptor.name)
        .bind(&descriptor.url)
        .bind(&descriptor.description)
        .bind(descriptor.is_active)
        .bind(descriptor.dialect.as_str())
        .bind(descriptor.updated_at)
        .bind(&descriptor.id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                DbError::duplicate_name(&descriptor.name)
            } else {
                storage_error(e)
            }
        })?;

        if result.rows_affected() == 0 {
            return Err(DbError::connection_not_found(&descriptor.id));
        }
        Ok(())
    }

    async fn get_connection(&self, id: &str) -> DbResult<Option<ConnectionDescriptor>> {
        let row = sqlx::query("SELECT * FROM connections WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_error)?;
        row.as_ref().map(decode_connection).transpose()
    }

    async fn find_connection_by_name(
        &self,
        name: &str,
    ) -> DbResult<Option<ConnectionDescriptor>> {
        let row = sqlx::query("SELECT * FROM connections WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_error)?;
        row.as_ref().map(decode_connection).transpose()
    }

    async fn list_connections(&self, active_only: bool) -> DbResult<Vec<ConnectionDescriptor>> {
        let sql = if active_only {
            "SELECT * FROM connections WHERE is_active = 1 ORDER BY name"
        } else {
            "SELECT * FROM connections ORDER BY name"
        };
        let rows = sqlx::query(sql)
            .fetch_all(&self.pool)
            .await
            .map_err(storage_error)?;
        rows.iter().map(decode_connection).collect()
    }

    async fn delete_connection(&self, id: &str) -> DbResult<bool> {
        let result = sqlx::query("DELETE FROM connections WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(storage_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn load_snapshot(&self, connection_id: &str) -> DbResult<Option<Arc<Snapshot>>> {
        // Header and entries are read in one transaction so a concurrent
        // replace is never observed half-applied
        let mut tx = self.pool.begin().await.map_err(storage_error)?;

        let header = sqlx::query("SELECT extracted_at FROM metadata_snapshots WHERE connection_id = ?")
            .bind(connection_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(storage_error)?;
        let Some(header) = header else {
            tx.commit().await.map_err(storage_error)?;
            return Ok(None);
        };
        let extracted_at: DateTime<Utc> = header.try_get("extracted_at").map_err(storage_error)?;

        let rows = sqlx::query(
            "SELECT * FROM metadata_entries WHERE connection_id = ? ORDER BY position",
        )
        .bind(connection_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(storage_error)?;
        tx.commit().await.map_err(storage_error)?;

        let entries = rows.iter().map(decode_entry).collect::<DbResult<Vec<_>>>()?;
        Ok(Some(Arc::new(Snapshot {
            connection_id: connection_id.to_string(),
            extracted_at,
            entries,
        })))
    }

    async fn replace_snapshot(&self, snapshot: Snapshot) -> DbResult<Arc<Snapshot>> {
        let mut tx = self.pool.begin().await.map_err(storage_error)?;

        sqlx::query("DELETE FROM metadata_snapshots WHERE connection_id = ?")
            .bind(&snapshot.connection_id)
            .execute(&mut *tx)
            .await
            .map_err(storage_error)?;

        sqlx::query("INSERT INTO metadata_snapshots (connection_id, extracted_at) VALUES (?, ?)")
            .bind(&snapshot.connection_id)
            .bind(snapshot.extracted_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                if is_foreign_key_violation(&e) {
                    DbError::connection_not_found(&snapshot.connection_id)
                } else {
                    storage_error(e)
                }
            })?;

        Self::insert_entries(&mut tx, &snapshot).await?;
        tx.commit().await.map_err(storage_error)?;

        debug!(
            connection_id = %snapshot.connection_id,
            entries = snapshot.entries.len(),
            "Replaced metadata snapshot"
        );
        Ok(Arc::new(snapshot))
    }

    async fn append_execution(&self, record: &ExecutionRecord) -> DbResult<()> {
        sqlx::query(
            "INSERT INTO execution_records \
             (id, connection_id, query_text, statement_kind, status, row_count, rows_affected, \
              duration_ms, error_detail, executed_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.id)
        .bind(&record.connection_id)
        .bind(&record.query_text)
        .bind(&record.statement_kind)
        .bind(record.status.as_str())
        .bind(record.row_count.map(to_i64))
        .bind(record.rows_affected.map(to_i64))
        .bind(to_i64(record.duration_ms))
        .bind(&record.error_detail)
        .bind(record.executed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_foreign_key_violation(&e) {
                DbError::connection_not_found(&record.connection_id)
            } else {
                storage_error(e)
            }
        })?;
        Ok(())
    }

    async fn list_executions(
        &self,
        connection_id: &str,
        limit: usize,
    ) -> DbResult<Vec<ExecutionRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM execution_records WHERE connection_id = ? ORDER BY seq DESC LIMIT ?",
        )
        .bind(connection_id)
        .bind(to_i64(limit as u64))
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error)?;
        rows.iter().map(decode_execution).collect()
    }
}
