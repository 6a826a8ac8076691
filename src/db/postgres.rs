//! PostgreSQL adapter.
//!
//! Sessions wrap a single `PgConnection`. The backend pid is captured at
//! connect time so an interrupted statement can be cancelled with
//! `pg_cancel_backend` over a short-lived side connection.

use crate::db::adapter::{Adapter, Deadline, Session};
use crate::db::types::{
    self, StatementPlan, describe_columns, fetch_tabular, normalize_type_name,
};
use crate::error::{DbError, DbResult};
use crate::models::{Dialect, ObjectAttributes, ObjectType, StructuralFact, TabularResult};
use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgQueryResult};
use sqlx::{ConnectOptions, Connection, Row};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

const CANCEL_TIMEOUT: Duration = Duration::from_secs(5);

// Whole-database catalog queries. System schemas are excluded everywhere.
mod queries {
    pub const SCHEMAS: &str = r#"
        SELECT nspname::text AS schema_name
        FROM pg_namespace
        WHERE nspname NOT IN ('pg_catalog', 'information_schema')
        AND nspname NOT LIKE 'pg\_toast%'
        AND nspname NOT LIKE 'pg\_temp%'
        ORDER BY nspname
        "#;

    pub const TABLES: &str = r#"
        SELECT
            t.table_schema::text AS table_schema,
            t.table_name::text AS table_name,
            t.table_type::text AS table_type,
            obj_description(format('%I.%I', t.table_schema, t.table_name)::regclass) AS comment
        FROM information_schema.tables t
        WHERE t.table_schema NOT IN ('pg_catalog', 'information_schema')
        AND t.table_type IN ('BASE TABLE', 'VIEW')
        ORDER BY t.table_schema, t.table_name
        "#;

    pub const COLUMNS: &str = r#"
        SELECT
            c.table_schema::text AS table_schema,
            c.table_name::text AS table_name,
            c.column_name::text AS column_name,
            c.ordinal_position::int8 AS ordinal_position,
            format_type(a.atttypid, a.atttypmod) AS column_type,
            c.is_nullable::text AS is_nullable,
            c.column_default::text AS column_default,
            EXISTS (
                SELECT 1
                FROM information_schema.table_constraints tc
                JOIN information_schema.key_column_usage kcu
                    ON tc.constraint_name = kcu.constraint_name
                    AND tc.table_schema = kcu.table_schema
                    AND tc.table_name = kcu.table_name
                WHERE tc.constraint_type = 'PRIMARY KEY'
                AND tc.table_schema = c.table_schema
                AND tc.table_name = c.table_name
                AND kcu.column_name = c.column_name
            ) AS is_primary_key,
            col_description(t.oid, a.attnum) AS column_comment
        FROM information_schema.columns c
        JOIN pg_namespace n ON n.nspname = c.table_schema
        JOIN pg_class t ON t.relname = c.table_name AND t.relnamespace = n.oid
        JOIN pg_attribute a ON a.attrelid = t.oid AND a.attname = c.column_name
        WHERE c.table_schema NOT IN ('pg_catalog', 'information_schema')
        ORDER BY c.table_schema, c.table_name, c.ordinal_position
        "#;

    pub const INDEXES: &str = r#"
        SELECT
            n.nspname::text AS schema_name,
            t.relname::text AS table_name,
            i.relname::text AS index_name,
            array_agg(a.attname::text ORDER BY array_position(ix.indkey, a.attnum)) AS column_names,
            ix.indisunique AS is_unique,
            ix.indisprimary AS is_primary
        FROM pg_index ix
        JOIN pg_class i ON i.oid = ix.indexrelid
        JOIN pg_class t ON t.oid = ix.indrelid
        JOIN pg_namespace n ON n.oid = t.relnamespace
        JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = ANY(ix.indkey)
        WHERE n.nspname NOT IN ('pg_catalog', 'information_schema')
        AND n.nspname NOT LIKE 'pg\_toast%'
        GROUP BY n.nspname, t.relname, i.relname, ix.indisunique, ix.indisprimary
        ORDER BY n.nspname, t.relname, i.relname
        "#;

    pub const FOREIGN_KEYS: &str = r#"
        SELECT
            n.nspname::text AS schema_name,
            t.relname::text AS table_name,
            c.conname::text AS constraint_name,
            ARRAY(
                SELECT a.attname::text
                FROM unnest(c.conkey) WITH ORDINALITY AS k(attnum, ord)
                JOIN pg_attribute a ON a.attrelid = c.conrelid AND a.attnum = k.attnum
                ORDER BY k.ord
            ) AS column_names,
            rt.relname::text AS foreign_table_name,
            ARRAY(
                SELECT a.attname::text
                FROM unnest(c.confkey) WITH ORDINALITY AS k(attnum, ord)
                JOIN pg_attribute a ON a.attrelid = c.confrelid AND a.attnum = k.attnum
                ORDER BY k.ord
            ) AS foreign_column_names
        FROM pg_constraint c
        JOIN pg_class t ON t.oid = c.conrelid
        JOIN pg_namespace n ON n.oid = t.relnamespace
        JOIN pg_class rt ON rt.oid = c.confrelid
        WHERE c.contype = 'f'
        AND n.nspname NOT IN ('pg_catalog', 'information_schema')
        ORDER BY n.nspname, t.relname, c.conname
        "#;
}

fn connect_error(err: sqlx::Error) -> DbError {
    DbError::connection(
        err.to_string(),
        "Check credentials, host and that the PostgreSQL server is reachable",
    )
}

/// Opens [`PostgresSession`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresAdapter;

#[async_trait]
impl Adapter for PostgresAdapter {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    async fn connect(&self, url: &str, connect_timeout: Duration) -> DbResult<Box<dyn Session>> {
        let options = PgConnectOptions::from_str(url)
            .map_err(|e| DbError::invalid_url(e.to_string()))?;

        let mut conn = tokio::time::timeout(connect_timeout, options.connect())
            .await
            .map_err(|_| {
                DbError::connection(
                    format!("connect timed out after {}ms", connect_timeout.as_millis()),
                    "Check that the PostgreSQL server is reachable",
                )
            })?
            .map_err(connect_error)?;

        let backend_pid: i32 = sqlx::query_scalar("SELECT pg_backend_pid()")
            .fetch_one(&mut conn)
            .await
            .map_err(connect_error)?;

        debug!(backend_pid, "PostgreSQL session opened");
        Ok(Box::new(PostgresSession {
            conn,
            options,
            backend_pid,
            broken: false,
        }))
    }
}

/// One PostgreSQL session.
pub struct PostgresSession {
    conn: PgConnection,
    options: PgConnectOptions,
    backend_pid: i32,
    broken: bool,
}

impl PostgresSession {
    /// Mark the session broken on connection-class failures and cancel the
    /// running statement server-side on interruption.
    fn settle<T>(&mut self, outcome: DbResult<T>) -> DbResult<T> {
        if let Err(err) = &outcome {
            if err.is_connection_broken() {
                self.broken = true;
            }
            if err.is_interruption() {
                spawn_cancel(self.options.clone(), self.backend_pid);
            }
        }
        outcome
    }
}

/// Ask the server to cancel whatever `backend_pid` is running.
fn spawn_cancel(options: PgConnectOptions, backend_pid: i32) {
    tokio::spawn(async move {
        let cancel = async {
            let mut side = options.connect().await?;
            let cancelled: bool = sqlx::query_scalar("SELECT pg_cancel_backend($1)")
                .bind(backend_pid)
                .fetch_one(&mut side)
                .await?;
            side.close().await?;
            Ok::<_, sqlx::Error>(cancelled)
        };
        match tokio::time::timeout(CANCEL_TIMEOUT, cancel).await {
            Ok(Ok(cancelled)) => debug!(backend_pid, cancelled, "Sent pg_cancel_backend"),
            Ok(Err(e)) => warn!(backend_pid, error = %e, "Failed to cancel backend"),
            Err(_) => warn!(backend_pid, "Timed out cancelling backend"),
        }
    });
}

#[async_trait]
impl Session for PostgresSession {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
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
        let plan = StatementPlan::new(sql, Dialect::Postgres);
        let conn = &mut self.conn;
        let outcome = deadline
            .run("query execution", async {
                let mut result = fetch_tabular(
                    &mut *conn,
                    sql,
                    max_rows,
                    &plan,
                    types::postgres::decode_cell,
                    PgQueryResult::rows_affected,
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
        let outcome = self.conn.ping().await.map_err(connect_error);
        self.settle(outcome)
    }

    fn is_broken(&self) -> bool {
        self.broken
    }

    async fn close(self: Box<Self>) {
        if let Err(e) = self.conn.close().await {
            debug!(error = %e, "Error closing PostgreSQL session");
        }
    }
}

async fn load_facts(conn: &mut PgConnection) -> DbResult<Vec<StructuralFact>> {
    let mut facts = Vec::new();

    for row in sqlx::query(queries::SCHEMAS).fetch_all(&mut *conn).await? {
        let name: String = row.get("schema_name");
        facts.push(StructuralFact::new(ObjectType::Schema, None, name));
    }

    for row in sqlx::query(queries::TABLES).fetch_all(&mut *conn).await? {
        let schema: String = row.get("table_schema");
        let name: String = row.get("table_name");
        let table_type: String = row.get("table_type");
        let comment: Option<String> = row.try_get("comment").ok().flatten();

        let object_type = if table_type == "VIEW" {
            ObjectType::View
        } else {
            ObjectType::Table
        };
        facts.push(
            StructuralFact::new(object_type, Some(schema), name).with_attributes(
                ObjectAttributes {
                    comment: comment.filter(|c| !c.is_empty()),
                    ..Default::default()
                },
            ),
        );
    }

    for row in sqlx::query(queries::COLUMNS).fetch_all(&mut *conn).await? {
        let schema: String = row.get("table_schema");
        let table: String = row.get("table_name");
        let name: String = row.get("column_name");
        let column_type: String = row.get("column_type");
        let nullable: String = row.get("is_nullable");
        let comment: Option<String> = row.try_get("column_comment").ok().flatten();

        facts.push(
            StructuralFact::table_child(ObjectType::Column, Some(schema), &table, &name)
                .with_attributes(ObjectAttributes {
                    normalized_type: Some(normalize_type_name(&column_type)),
                    data_type: Some(column_type),
                    nullable: Some(nullable == "YES"),
                    ordinal_position: Some(row.get("ordinal_position")),
                    primary_key: Some(row.get("is_primary_key")),
                    default_value: row.try_get("column_default").ok().flatten(),
                    comment: comment.filter(|c| !c.is_empty()),
                    ..Default::default()
                }),
        );
    }

    for row in sqlx::query(queries::INDEXES).fetch_all(&mut *conn).await? {
        let schema: String = row.get("schema_name");
        let table: String = row.get("table_name");
        let name: String = row.get("index_name");
        let columns: Vec<String> = row.get("column_names");
        if columns.is_empty() {
            continue;
        }

        facts.push(
            StructuralFact::table_child(ObjectType::Index, Some(schema), &table, &name)
                .with_attributes(ObjectAttributes {
                    unique: Some(row.get("is_unique")),
                    primary_key: Some(row.get("is_primary")),
                    columns,
                    ..Default::default()
                }),
        );
    }

    for row in sqlx::query(queries::FOREIGN_KEYS)
        .fetch_all(&mut *conn)
        .await?
    {
        let schema: String = row.get("schema_name");
        let table: String = row.get("table_name");
        let name: String = row.get("constraint_name");
        let columns: Vec<String> = row.get("column_names");
        let foreign_table: String = row.get("foreign_table_name");
        let foreign_columns: Vec<String> = row.get("foreign_column_names");

        facts.push(
            StructuralFact::table_child(ObjectType::ForeignKey, Some(schema), &table, &name)
                .with_attributes(ObjectAttributes {
                    columns,
                    references: Some(format!(
                        "{}({})",
                        foreign_table,
                        foreign_columns.join(", ")
                    )),
                    ..Default::default()
                }),
        );
    }

    debug!(facts = facts.len(), "PostgreSQL introspection complete");
    Ok(facts)
}
