//! MySQL / MariaDB adapter.
//!
//! Sessions wrap a single `MySqlConnection`. Interrupted statements are
//! stopped with `KILL QUERY <connection id>` from a side connection.

use crate::db::adapter::{Adapter, Deadline, Session};
use crate::db::types::{
    self, StatementPlan, describe_columns, fetch_tabular, normalize_type_name,
};
use crate::error::{DbError, DbResult};
use crate::models::{Dialect, ObjectAttributes, ObjectType, StructuralFact, TabularResult};
use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection, MySqlQueryResult, MySqlRow};
use sqlx::{ConnectOptions, Connection, Row};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

const CANCEL_TIMEOUT: Duration = Duration::from_secs(5);

mod queries {
    pub const SCHEMAS: &str = r#"
        SELECT CONVERT(SCHEMA_NAME USING utf8) AS SCHEMA_NAME
        FROM information_schema.SCHEMATA
        WHERE SCHEMA_NAME NOT IN ('mysql', 'information_schema', 'performance_schema', 'sys')
        ORDER BY SCHEMA_NAME
        "#;

    pub const TABLES: &str = r#"
        SELECT
            CONVERT(TABLE_SCHEMA USING utf8) AS TABLE_SCHEMA,
            CONVERT(TABLE_NAME USING utf8) AS TABLE_NAME,
            CONVERT(TABLE_TYPE USING utf8) AS TABLE_TYPE,
            CONVERT(TABLE_COMMENT USING utf8) AS TABLE_COMMENT
        FROM information_schema.TABLES
        WHERE TABLE_SCHEMA NOT IN ('mysql', 'information_schema', 'performance_schema', 'sys')
        AND TABLE_TYPE IN ('BASE TABLE', 'VIEW')
        ORDER BY TABLE_SCHEMA, TABLE_NAME
        "#;

    pub const COLUMNS: &str = r#"
        SELECT
            CONVERT(TABLE_SCHEMA USING utf8) AS TABLE_SCHEMA,
            CONVERT(TABLE_NAME USING utf8) AS TABLE_NAME,
            CONVERT(COLUMN_NAME USING utf8) AS COLUMN_NAME,
            ORDINAL_POSITION,
            CONVERT(COLUMN_TYPE USING utf8) AS COLUMN_TYPE,
            CONVERT(IS_NULLABLE USING utf8) AS IS_NULLABLE,
            CONVERT(COLUMN_DEFAULT USING utf8) AS COLUMN_DEFAULT,
            CONVERT(COLUMN_KEY USING utf8) AS COLUMN_KEY,
            CONVERT(COLUMN_COMMENT USING utf8) AS COLUMN_COMMENT
        FROM information_schema.COLUMNS
        WHERE TABLE_SCHEMA NOT IN ('mysql', 'information_schema', 'performance_schema', 'sys')
        ORDER BY TABLE_SCHEMA, TABLE_NAME, ORDINAL_POSITION
        "#;

    pub const INDEXES: &str = r#"
        SELECT
            CONVERT(TABLE_SCHEMA USING utf8) AS TABLE_SCHEMA,
            CONVERT(TABLE_NAME USING utf8) AS TABLE_NAME,
            CONVERT(INDEX_NAME USING utf8) AS INDEX_NAME,
            CONVERT(GROUP_CONCAT(COLUMN_NAME ORDER BY SEQ_IN_INDEX) USING utf8) AS COLUMN_NAMES,
            NOT NON_UNIQUE AS IS_UNIQUE
        FROM information_schema.STATISTICS
        WHERE TABLE_SCHEMA NOT IN ('mysql', 'information_schema', 'performance_schema', 'sys')
        GROUP BY TABLE_SCHEMA, TABLE_NAME, INDEX_NAME, NON_UNIQUE
        ORDER BY TABLE_SCHEMA, TABLE_NAME, INDEX_NAME
        "#;

    pub const FOREIGN_KEYS: &str = r#"
        SELECT
            CONVERT(TABLE_SCHEMA USING utf8) AS TABLE_SCHEMA,
            CONVERT(TABLE_NAME USING utf8) AS TABLE_NAME,
            CONVERT(CONSTRAINT_NAME USING utf8) AS CONSTRAINT_NAME,
            CONVERT(COLUMN_NAME USING utf8) AS COLUMN_NAME,
            CONVERT(REFERENCED_TABLE_NAME USING utf8) AS REFERENCED_TABLE_NAME,
            CONVERT(REFERENCED_COLUMN_NAME USING utf8) AS REFERENCED_COLUMN_NAME
        FROM information_schema.KEY_COLUMN_USAGE
        WHERE TABLE_SCHEMA NOT IN ('mysql', 'information_schema', 'performance_schema', 'sys')
        AND REFERENCED_TABLE_NAME IS NOT NULL
        ORDER BY TABLE_SCHEMA, TABLE_NAME, CONSTRAINT_NAME, ORDINAL_POSITION
        "#;
}

fn connect_error(err: sqlx::Error) -> DbError {
    DbError::connection(
        err.to_string(),
        "Check credentials, host and that the MySQL server is reachable",
    )
}

/// Opens [`MySqlSession`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlAdapter;

#[async_trait]
impl Adapter for MySqlAdapter {
    fn dialect(&self) -> Dialect {
        Dialect::MySql
    }

    async fn connect(&self, url: &str, connect_timeout: Duration) -> DbResult<Box<dyn Session>> {
        // sqlx only understands the mysql scheme
        let url = match url.strip_prefix("mariadb:") {
            Some(rest) => format!("mysql:{}", rest),
            None => url.to_string(),
        };
        let options = MySqlConnectOptions::from_str(&url)
            .map_err(|e| DbError::invalid_url(e.to_string()))?;

        let mut conn = tokio::time::timeout(connect_timeout, options.connect())
            .await
            .map_err(|_| {
                DbError::connection(
                    format!("connect timed out after {}ms", connect_timeout.as_millis()),
                    "Check that the MySQL server is reachable",
                )
            })?
            .map_err(connect_error)?;

        let row = sqlx::query("SELECT CONNECTION_ID() AS connection_id")
            .fetch_one(&mut conn)
            .await
            .map_err(connect_error)?;
        let connection_id = try_get_u64(&row, "connection_id").ok_or_else(|| {
            DbError::connection(
                "server returned no usable CONNECTION_ID()",
                "Check the MySQL server version",
            )
        })?;

        debug!(connection_id, "MySQL session opened");
        Ok(Box::new(MySqlSession {
            conn,
            options,
            connection_id,
            broken: false,
        }))
    }
}

/// One MySQL session.
pub struct MySqlSession {
    conn: MySqlConnection,
    options: MySqlConnectOptions,
    connection_id: u64,
    broken: bool,
}

impl MySqlSession {
    fn settle<T>(&mut self, outcome: DbResult<T>) -> DbResult<T> {
        if let Err(err) = &outcome {
            if err.is_connection_broken() {
                self.broken = true;
            }
            if err.is_interruption() {
                spawn_kill_query(self.options.clone(), self.connection_id);
            }
        }
        outcome
    }
}

fn spawn_kill_query(options: MySqlConnectOptions, connection_id: u64) {
    tokio::spawn(async move {
        let kill = async {
            let mut side = options.connect().await?;
            sqlx::query(&format!("KILL QUERY {}", connection_id))
                .execute(&mut side)
                .await?;
            side.close().await
        };
        match tokio::time::timeout(CANCEL_TIMEOUT, kill).await {
            Ok(Ok(())) => debug!(connection_id, "Sent KILL QUERY"),
            Ok(Err(e)) => warn!(connection_id, error = %e, "Failed to kill query"),
            Err(_) => warn!(connection_id, "Timed out killing query"),
        }
    });
}

#[async_trait]
impl Session for MySqlSession {
    fn dialect(&self) -> Dialect {
        Dialect::MySql
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
        let plan = StatementPlan::new(sql, Dialect::MySql);
        let conn = &mut self.conn;
        let outcome = deadline
            .run("query execution", async {
                let mut result = fetch_tabular(
                    &mut *conn,
                    sql,
                    max_rows,
                    &plan,
                    types::mysql::decode_cell,
                    MySqlQueryResult::rows_affected,
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
            debug!(error = %e, "Error closing MySQL session");
        }
    }
}

/// Try to get a u64 value from a row, handling MySQL version differences.
/// MySQL 5.x may return BIGINT (i64), MySQL 8.x returns BIGINT UNSIGNED (u64).
fn try_get_u64(row: &MySqlRow, column: &str) -> Option<u64> {
    if let Ok(Some(v)) = row.try_get::<Option<u64>, _>(column) {
        return Some(v);
    }
    if let Ok(Some(v)) = row.try_get::<Option<u32>, _>(column) {
        return Some(v.into());
    }
    if let Ok(Some(v)) = row.try_get::<Option<i64>, _>(column) {
        return u64::try_from(v).ok();
    }
    None
}

/// MySQL may return VARBINARY instead of VARCHAR depending on charset configuration.
fn get_string(row: &MySqlRow, column: &str) -> String {
    get_optional_string(row, column).unwrap_or_default()
}

fn get_optional_string(row: &MySqlRow, column: &str) -> Option<String> {
    row.try_get::<Option<String>, _>(column)
        .ok()
        .flatten()
        .or_else(|| {
            row.try_get::<Option<Vec<u8>>, _>(column)
                .ok()
                .flatten()
                .and_then(|bytes| String::from_utf8(bytes).ok())
        })
}

async fn load_facts(conn: &mut MySqlConnection) -> DbResult<Vec<StructuralFact>> {
    let mut facts = Vec::new();

    for row in sqlx::query(queries::SCHEMAS).fetch_all(&mut *conn).await? {
        facts.push(StructuralFact::new(
            ObjectType::Schema,
            None,
            get_string(&row, "SCHEMA_NAME"),
        ));
    }

    for row in sqlx::query(queries::TABLES).fetch_all(&mut *conn).await? {
        let object_type = if get_string(&row, "TABLE_TYPE") == "VIEW" {
            ObjectType::View
        } else {
            ObjectType::Table
        };
        facts.push(
            StructuralFact::new(
                object_type,
                Some(get_string(&row, "TABLE_SCHEMA")),
                get_string(&row, "TABLE_NAME"),
            )
            .with_attributes(ObjectAttributes {
                comment: get_optional_string(&row, "TABLE_COMMENT").filter(|c| !c.is_empty()),
                ..Default::default()
            }),
        );
    }

    for row in sqlx::query(queries::COLUMNS).fetch_all(&mut *conn).await? {
        let table = get_string(&row, "TABLE_NAME");
        let name = get_string(&row, "COLUMN_NAME");
        let column_type = get_string(&row, "COLUMN_TYPE");
        let column_key = get_string(&row, "COLUMN_KEY");

        facts.push(
            StructuralFact::table_child(
                ObjectType::Column,
                Some(get_string(&row, "TABLE_SCHEMA")),
                &table,
                &name,
            )
            .with_attributes(ObjectAttributes {
                normalized_type: Some(normalize_type_name(&column_type)),
                data_type: Some(column_type),
                nullable: Some(get_string(&row, "IS_NULLABLE") == "YES"),
                ordinal_position: try_get_u64(&row, "ORDINAL_POSITION")
                    .and_then(|v| i64::try_from(v).ok()),
                primary_key: Some(column_key == "PRI"),
                unique: Some(column_key == "PRI" || column_key == "UNI"),
                default_value: get_optional_string(&row, "COLUMN_DEFAULT"),
                comment: get_optional_string(&row, "COLUMN_COMMENT").filter(|c| !c.is_empty()),
                ..Default::default()
            }),
        );
    }

    for row in sqlx::query(queries::INDEXES).fetch_all(&mut *conn).await? {
        let table = get_string(&row, "TABLE_NAME");
        let name = get_string(&row, "INDEX_NAME");
        let columns: Vec<String> = get_string(&row, "COLUMN_NAMES")
            .split(',')
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect();
        if columns.is_empty() {
            continue;
        }

        facts.push(
            StructuralFact::table_child(
                ObjectType::Index,
                Some(get_string(&row, "TABLE_SCHEMA")),
                &table,
                &name,
            )
            .with_attributes(ObjectAttributes {
                unique: Some(try_get_u64(&row, "IS_UNIQUE").unwrap_or(0) > 0),
                primary_key: Some(name == "PRIMARY"),
                columns,
                ..Default::default()
            }),
        );
    }

    // One row per referencing column; rows of a constraint are adjacent.
    let mut pending: Option<PendingForeignKey> = None;
    let rows = sqlx::query(queries::FOREIGN_KEYS)
        .fetch_all(&mut *conn)
        .await?;
    for row in rows {
        let schema = get_string(&row, "TABLE_SCHEMA");
        let table = get_string(&row, "TABLE_NAME");
        let name = get_string(&row, "CONSTRAINT_NAME");
        let column = get_string(&row, "COLUMN_NAME");
        let ref_column = get_string(&row, "REFERENCED_COLUMN_NAME");

        match pending.as_mut() {
            Some(fk) if fk.schema == schema && fk.table == table && fk.name == name => {
                fk.columns.push(column);
                fk.ref_columns.push(ref_column);
            }
            _ => {
                facts.extend(pending.take().map(PendingForeignKey::into_fact));
                pending = Some(PendingForeignKey {
                    schema,
                    table,
                    name,
                    columns: vec![column],
                    ref_table: get_string(&row, "REFERENCED_TABLE_NAME"),
                    ref_columns: vec![ref_column],
                });
            }
        }
    }
    facts.extend(pending.take().map(PendingForeignKey::into_fact));

    debug!(facts = facts.len(), "MySQL introspection complete");
    Ok(facts)
}

struct PendingForeignKey {
    schema: String,
    table: String,
    name: String,
    columns: Vec<String>,
    ref_table: String,
    ref_columns: Vec<String>,
}

impl PendingForeignKey {
    fn into_fact(self) -> StructuralFact {
        StructuralFact::table_child(
            ObjectType::ForeignKey,
            Some(self.schema),
            &self.table,
            &self.name,
        )
        .with_attributes(ObjectAttributes {
            columns: self.columns,
            references: Some(format!(
                "{}({})",
                self.ref_table,
                self.ref_columns.join(", ")
            )),
            ..Default::default()
        })
    }
}
