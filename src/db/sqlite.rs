//! SQLite adapter.
//!
//! SQLite runs in-process, so there is no server to send a cancel to. Each
//! session installs a progress handler that aborts the running statement once
//! its interrupt flag is set. An interrupted session is marked broken and the
//! pool discards it.

use crate::db::adapter::{Adapter, Deadline, Session};
use crate::db::types::{
    self, StatementPlan, describe_columns, fetch_tabular, normalize_type_name,
};
use crate::error::{DbError, DbResult};
use crate::models::{Dialect, ObjectAttributes, ObjectType, StructuralFact, TabularResult};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteQueryResult};
use sqlx::{ConnectOptions, Connection, Row};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

const SCHEMA_NAME: &str = "main";

/// Virtual machine steps between interrupt checks
const PROGRESS_CHECK_OPS: i32 = 1_000;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

const LIST_TABLES: &str = r#"
    SELECT name, type FROM sqlite_master
    WHERE type IN ('table', 'view')
    AND name NOT LIKE 'sqlite_%'
    ORDER BY name
    "#;

/// Quote a name for use inside a single-quoted PRAGMA argument.
fn quote_literal(name: &str) -> String {
    format!("'{}'", name.replace('\'', "''"))
}

/// Opens [`SqliteSession`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteAdapter;

#[async_trait]
impl Adapter for SqliteAdapter {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    async fn connect(&self, url: &str, connect_timeout: Duration) -> DbResult<Box<dyn Session>> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| DbError::invalid_url(e.to_string()))?;

        let mut conn = tokio::time::timeout(connect_timeout, options.connect())
            .await
            .map_err(|_| {
                DbError::connection(
                    format!("open timed out after {}ms", connect_timeout.as_millis()),
                    "Check that the database file is not locked",
                )
            })?
            .map_err(|e| {
                DbError::connection(
                    e.to_string(),
                    "Check that the database file exists and is readable",
                )
            })?;

        let interrupt = Arc::new(AtomicBool::new(false));
        {
            let mut handle = conn.lock_handle().await.map_err(|e| {
                DbError::connection(e.to_string(), "Reopen the database file")
            })?;
            let flag = Arc::clone(&interrupt);
            handle.set_progress_handler(PROGRESS_CHECK_OPS, move || {
                !flag.load(Ordering::Relaxed)
            });
        }

        debug!("SQLite session opened");
        Ok(Box::new(SqliteSession {
            conn,
            interrupt,
            broken: false,
        }))
    }
}

/// One SQLite session.
pub struct SqliteSession {
    conn: SqliteConnection,
    /// Set to abort whatever statement the worker is running
    interrupt: Arc<AtomicBool>,
    broken: bool,
}

impl SqliteSession {
    fn settle<T>(&mut self, outcome: DbResult<T>) -> DbResult<T> {
        if let Err(err) = &outcome {
            if err.is_interruption() {
                debug!("Interrupting SQLite statement");
                self.interrupt.store(true, Ordering::Relaxed);
            }
            if err.is_connection_broken() {
                self.broken = true;
            }
        }
        outcome
    }
}

#[async_trait]
impl Session for SqliteSession {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    async fn introspect(&mut self, deadline: &Deadline) -> DbResult<Vec<StructuralFact>> {
        let outcome = deadline
            .run("schema introspection", load_facts(&mut self.conn))
            .await;
        self.settle(outcome)
    }

    async fn execute(
        &mut self,
        sql: &str,
        deadline: &Deadline,
        max_rows: usize,
    ) -> DbResult<TabularResult> {
        let plan = StatementPlan::new(sql, Dialect::Sqlite);
        let conn = &mut self.conn;
        let outcome = deadline
            .run("query execution", async {
                let mut result = fetch_tabular(
                    &mut *conn,
                    sql,
                    max_rows,
                    &plan,
                    types::sqlite::decode_cell,
                    SqliteQueryResult::rows_affected,
                )
                .await?;
                if plan.needs_describe(&result) {
                    describe_columns(&mut *conn, sql, &mut result).await;
                }
                Ok(result)
            })
            .await;
        self.settle(outcome)
    }

    async fn ping(&mut self) -> DbResult<()> {
        let outcome = self.conn.ping().await.map_err(|e| {
            DbError::connection(e.to_string(), "Reopen the database file")
        });
        self.settle(outcome)
    }

    fn is_broken(&self) -> bool {
        self.broken
    }

    async fn close(self: Box<Self>) {
        match tokio::time::timeout(CLOSE_TIMEOUT, self.conn.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(error = %e, "Error closing SQLite session"),
            Err(_) => warn!("Timed out closing SQLite session"),
        }
    }
}

async fn load_facts(conn: &mut SqliteConnection) -> DbResult<Vec<StructuralFact>> {
    let schema = || Some(SCHEMA_NAME.to_string());
    let mut facts = vec![StructuralFact::new(ObjectType::Schema, None, SCHEMA_NAME)];

    let objects = sqlx::query(LIST_TABLES).fetch_all(&mut *conn).await?;
    for object in &objects {
        let table: String = object.get("name");
        let kind: String = object.get("type");
        let object_type = if kind == "view" {
            ObjectType::View
        } else {
            ObjectType::Table
        };
        facts.push(StructuralFact::new(object_type, schema(), table.as_str()));

        let pragma = format!("PRAGMA table_info({})", quote_literal(&table));
        for row in sqlx::query(&pragma).fetch_all(&mut *conn).await? {
            let name: String = row.get("name");
            let data_type: String = row.try_get("type").unwrap_or_default();
            let cid: i64 = row.get("cid");
            let notnull: i64 = row.get("notnull");
            let pk: i64 = row.get("pk");

            facts.push(
                StructuralFact::table_child(ObjectType::Column, schema(), &table, &name)
                    .with_attributes(ObjectAttributes {
                        normalized_type: Some(normalize_type_name(&data_type)),
                        data_type: Some(data_type),
                        nullable: Some(notnull == 0 && pk == 0),
                        ordinal_position: Some(cid + 1),
                        primary_key: Some(pk > 0),
                        default_value: row.try_get("dflt_value").ok().flatten(),
                        ..Default::default()
                    }),
            );
        }

        if object_type == ObjectType::View {
            continue;
        }

        let pragma = format!("PRAGMA index_list({})", quote_literal(&table));
        let indexes = sqlx::query(&pragma).fetch_all(&mut *conn).await?;
        for index in &indexes {
            let name: String = index.get("name");
            let unique: i64 = index.get("unique");
            let origin: String = index.try_get("origin").unwrap_or_default();

            let pragma = format!("PRAGMA index_info({})", quote_literal(&name));
            let columns: Vec<String> = sqlx::query(&pragma)
                .fetch_all(&mut *conn)
                .await?
                .iter()
                .filter_map(|row| row.try_get::<Option<String>, _>("name").ok().flatten())
                .collect();
            if columns.is_empty() {
                continue;
            }

            facts.push(
                StructuralFact::table_child(ObjectType::Index, schema(), &table, &name)
                    .with_attributes(ObjectAttributes {
                        unique: Some(unique != 0),
                        primary_key: Some(origin == "pk"),
                        columns,
                        ..Default::default()
                    }),
            );
        }

        // SQLite foreign keys are unnamed; rows sharing an id form one constraint.
        let pragma = format!("PRAGMA foreign_key_list({})", quote_literal(&table));
        let mut foreign_keys: BTreeMap<i64, (String, Vec<String>, Vec<String>)> = BTreeMap::new();
        for row in sqlx::query(&pragma).fetch_all(&mut *conn).await? {
            let id: i64 = row.get("id");
            let ref_table: String = row.get("table");
            let from: String = row.get("from");
            let to: Option<String> = row.try_get("to").ok().flatten();

            let entry = foreign_keys
                .entry(id)
                .or_insert_with(|| (ref_table, Vec::new(), Vec::new()));
            entry.1.push(from);
            entry.2.extend(to);
        }
        for (id, (ref_table, columns, ref_columns)) in foreign_keys {
            facts.push(
                StructuralFact::table_child(
                    ObjectType::ForeignKey,
                    schema(),
                    &table,
                    &format!("fk_{}", id),
                )
                .with_attributes(ObjectAttributes {
                    columns,
                    references: Some(format!("{}({})", ref_table, ref_columns.join(", "))),
                    ..Default::default()
                }),
            );
        }
    }

    debug!(facts = facts.len(), "SQLite introspection complete");
    Ok(facts)
}
