//! Native column types and how their values become [`Cell`]s.
//!
//! Every native type name is first reduced to a dialect-neutral name by
//! [`normalize_type_name`]; [`categorize_type`] maps that name onto a
//! [`TypeCategory`], and the per-dialect `decode_cell` functions pick a
//! decoder by category.
//!
//! NULL is detected once from the raw value, so decoders only see non-NULL
//! values. A decoder that cannot read a value falls back to text and finally
//! to `Cell::Null`.

use crate::error::DbResult;
use crate::models::{Cell, Dialect, TabularResult};
use crate::sql_validator::{self, StatementCategory};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use futures_util::TryStreamExt;
use serde_json::Value as JsonValue;
use sqlx::mysql::{MySqlRow, MySqlTypeInfo, MySqlValueRef};
use sqlx::postgres::{PgRow, PgTypeInfo, PgValueRef};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, ColumnIndex, Decode, Either, Row, Type, TypeInfo, ValueRef};
use tracing::debug;

/// How a column's values are decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Integer,
    Float,
    Decimal,
    Boolean,
    Text,
    Binary,
    Json,
    Uuid,
    Timestamp,
    Date,
    Time,
    Unknown,
}

/// Pick the decoder category for a native type name.
pub fn categorize_type(type_name: &str, dialect: Dialect) -> TypeCategory {
    let normalized = normalize_type_name(type_name);
    match normalized.as_str() {
        "tinyint" | "smallint" | "integer" | "bigint" => TypeCategory::Integer,
        "real" | "double" => TypeCategory::Float,
        // NUMERIC is an affinity in SQLite, not an exact type
        "decimal" if dialect == Dialect::Sqlite && type_name.eq_ignore_ascii_case("numeric") => {
            TypeCategory::Float
        }
        "decimal" => TypeCategory::Decimal,
        "boolean" => TypeCategory::Boolean,
        "text" | "char" => TypeCategory::Text,
        "binary" => TypeCategory::Binary,
        "json" => TypeCategory::Json,
        "uuid" => TypeCategory::Uuid,
        "timestamp" => TypeCategory::Timestamp,
        "date" => TypeCategory::Date,
        "time" => TypeCategory::Time,
        _ => TypeCategory::Unknown,
    }
}

/// Exact DECIMAL/NUMERIC text as the server sent it.
#[derive(Debug)]
pub struct ExactDecimal(pub String);

impl Type<sqlx::MySql> for ExactDecimal {
    fn type_info() -> MySqlTypeInfo {
        <String as Type<sqlx::MySql>>::type_info()
    }

    fn compatible(ty: &MySqlTypeInfo) -> bool {
        ty.name().eq_ignore_ascii_case("decimal")
    }
}

impl<'r> Decode<'r, sqlx::MySql> for ExactDecimal {
    fn decode(value: MySqlValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let text = <&str as Decode<sqlx::MySql>>::decode(value)?;
        Ok(ExactDecimal(text.to_owned()))
    }
}

impl Type<sqlx::Postgres> for ExactDecimal {
    fn type_info() -> PgTypeInfo {
        <String as Type<sqlx::Postgres>>::type_info()
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        ty.name().eq_ignore_ascii_case("numeric")
    }
}

impl<'r> Decode<'r, sqlx::Postgres> for ExactDecimal {
    fn decode(value: PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        // Ad-hoc statements run over the simple protocol, so NUMERIC arrives as text
        Ok(ExactDecimal(value.as_str()?.to_string()))
    }
}

/// Encode binary data as base64 text.
pub fn encode_binary(bytes: &[u8]) -> String {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    STANDARD.encode(bytes)
}

fn float_cell(v: f64) -> Cell {
    if v.is_finite() {
        Cell::Float(v)
    } else {
        Cell::Text(v.to_string())
    }
}

/// Dates are reported as midnight UTC.
fn date_cell(d: NaiveDate) -> Cell {
    Cell::Timestamp(d.and_time(NaiveTime::MIN).and_utc())
}

fn is_null<R>(row: &R, idx: usize) -> bool
where
    R: Row,
    usize: ColumnIndex<R>,
{
    row.try_get_raw(idx).map(|v| v.is_null()).unwrap_or(true)
}

fn unsupported(idx: usize, type_name: &str) -> Cell {
    tracing::debug!(column = idx, type_name, "Could not decode column value, returning NULL");
    Cell::Null
}

/// Statement categories of a script, known before it runs.
///
/// Text the parser rejects is still sent to the server; the plan then falls
/// back to judging the result by whether any row came back.
#[derive(Debug, Clone)]
pub struct StatementPlan {
    categories: Option<Vec<StatementCategory>>,
}

impl StatementPlan {
    pub fn new(sql: &str, dialect: Dialect) -> Self {
        let categories = sql_validator::classify(sql, dialect)
            .ok()
            .map(|classified| classified.into_iter().map(|c| c.category).collect());
        Self { categories }
    }

    fn returns_rows(&self, saw_columns: bool) -> bool {
        match &self.categories {
            Some(categories) => categories.iter().any(|c| c.is_read_only()),
            None => saw_columns,
        }
    }

    /// Whether the `index`th completed statement counts toward `rows_affected`.
    /// SQLite repeats the last change count for statements that change nothing.
    fn counts_affected(&self, index: usize) -> bool {
        self.categories
            .as_ref()
            .and_then(|categories| categories.get(index))
            .is_none_or(|c| *c == StatementCategory::Write)
    }

    /// A single query that returned no rows still has to name its columns.
    pub fn needs_describe(&self, result: &TabularResult) -> bool {
        result.columns.is_empty()
            && matches!(self.categories.as_deref(), Some([only]) if only.is_read_only())
    }
}

/// Run `sql` on `executor` and collect at most `max_rows` normalized rows.
///
/// Statements run unprepared so multi-statement scripts are accepted. Column
/// names come from the first returned row; an empty query result gets them
/// from [`describe_columns`]. `rows_affected` is reported only for scripts
/// with no query in them.
#[allow(deprecated)]
pub async fn fetch_tabular<'e, DB, E, D, A>(
    executor: E,
    sql: &'e str,
    max_rows: usize,
    plan: &StatementPlan,
    decode: D,
    affected: A,
) -> DbResult<TabularResult>
where
    DB: sqlx::Database,
    E: sqlx::Executor<'e, Database = DB>,
    D: Fn(&DB::Row, usize, &str) -> Cell,
    A: Fn(&DB::QueryResult) -> u64,
{
    let mut stream = executor.fetch_many(sql);
    let mut result = TabularResult::default();
    let mut affected_total = 0u64;
    let mut completed = 0usize;

    while let Some(step) = stream.try_next().await? {
        match step {
            Either::Left(done) => {
                if plan.counts_affected(completed) {
                    affected_total += affected(&done);
                }
                completed += 1;
            }
            Either::Right(row) => {
                if result.columns.is_empty() {
                    for column in row.columns() {
                        result.columns.push(column.name().to_string());
                        result
                            .column_types
                            .push(column.type_info().name().to_string());
                    }
                }
                if result.rows.len() >= max_rows {
                    result.truncated = true;
                    break;
                }
                let cells = row
                    .columns()
                    .iter()
                    .enumerate()
                    .map(|(idx, column)| decode(&row, idx, column.type_info().name()))
                    .collect();
                result.rows.push(cells);
            }
        }
    }

    if !plan.returns_rows(!result.columns.is_empty()) {
        result.rows_affected = Some(affected_total);
    }
    Ok(result)
}

/// Fill in the columns of a query that returned no rows from the server's
/// description of the statement. Failure leaves the result as it was.
pub async fn describe_columns<'e, DB, E>(executor: E, sql: &'e str, result: &mut TabularResult)
where
    DB: sqlx::Database,
    E: sqlx::Executor<'e, Database = DB>,
{
    match executor.describe(sql).await {
        Ok(described) => {
            for column in described.columns() {
                result.columns.push(column.name().to_string());
                result
                    .column_types
                    .push(column.type_info().name().to_string());
            }
        }
        Err(e) => debug!(error = %e, "Could not describe empty result"),
    }
}

pub mod postgres {
    use super::*;

    pub fn decode_cell(row: &PgRow, idx: usize, type_name: &str) -> Cell {
        if is_null(row, idx) {
            return Cell::Null;
        }
        let cell = match categorize_type(type_name, Dialect::Postgres) {
            TypeCategory::Integer => decode_integer(row, idx),
            TypeCategory::Decimal => row
                .try_get::<ExactDecimal, _>(idx)
                .ok()
                .map(|v| Cell::Text(v.0)),
            TypeCategory::Boolean => row.try_get::<bool, _>(idx).ok().map(Cell::Bool),
            TypeCategory::Float => decode_float(row, idx),
            TypeCategory::Binary => row
                .try_get::<Vec<u8>, _>(idx)
                .ok()
                .map(|v| Cell::Text(encode_binary(&v))),
            TypeCategory::Json => row
                .try_get::<JsonValue, _>(idx)
                .ok()
                .map(|v| Cell::Text(v.to_string())),
            TypeCategory::Uuid => row
                .try_get::<uuid::Uuid, _>(idx)
                .ok()
                .map(|v| Cell::Text(v.to_string())),
            TypeCategory::Timestamp => decode_timestamp(row, idx),
            TypeCategory::Date => row.try_get::<NaiveDate, _>(idx).ok().map(date_cell),
            TypeCategory::Time => row
                .try_get::<NaiveTime, _>(idx)
                .ok()
                .map(|v| Cell::Text(v.to_string())),
            TypeCategory::Text | TypeCategory::Unknown => None,
        };
        cell.or_else(|| decode_text(row, idx))
            .unwrap_or_else(|| unsupported(idx, type_name))
    }

    fn decode_integer(row: &PgRow, idx: usize) -> Option<Cell> {
        if let Ok(v) = row.try_get::<i16, _>(idx) {
            return Some(Cell::Integer(v.into()));
        }
        if let Ok(v) = row.try_get::<i32, _>(idx) {
            return Some(Cell::Integer(v.into()));
        }
        row.try_get::<i64, _>(idx).ok().map(Cell::Integer)
    }

    fn decode_float(row: &PgRow, idx: usize) -> Option<Cell> {
        if let Ok(v) = row.try_get::<f64, _>(idx) {
            return Some(float_cell(v));
        }
        row.try_get::<f32, _>(idx)
            .ok()
            .map(|v| float_cell(f64::from(v)))
    }

    fn decode_timestamp(row: &PgRow, idx: usize) -> Option<Cell> {
        if let Ok(v) = row.try_get::<DateTime<Utc>, _>(idx) {
            return Some(Cell::Timestamp(v));
        }
        row.try_get::<NaiveDateTime, _>(idx)
            .ok()
            .map(|v| Cell::Timestamp(v.and_utc()))
    }

    /// Enums, intervals, network and range types come back as their text form.
    fn decode_text(row: &PgRow, idx: usize) -> Option<Cell> {
        if let Ok(v) = row.try_get::<String, _>(idx) {
            return Some(Cell::Text(v));
        }
        let raw = row.try_get_raw(idx).ok()?;
        raw.as_str().ok().map(|s| Cell::Text(s.to_string()))
    }
}

pub mod mysql {
    use super::*;

    pub fn decode_cell(row: &MySqlRow, idx: usize, type_name: &str) -> Cell {
        if is_null(row, idx) {
            return Cell::Null;
        }
        let cell = match categorize_type(type_name, Dialect::MySql) {
            TypeCategory::Integer => decode_integer(row, idx),
            TypeCategory::Decimal => row
                .try_get::<ExactDecimal, _>(idx)
                .ok()
                .map(|v| Cell::Text(v.0)),
            TypeCategory::Boolean => row.try_get::<bool, _>(idx).ok().map(Cell::Bool),
            TypeCategory::Float => decode_float(row, idx),
            TypeCategory::Binary => row
                .try_get::<Vec<u8>, _>(idx)
                .ok()
                .map(|v| Cell::Text(encode_binary(&v))),
            TypeCategory::Json => row
                .try_get::<JsonValue, _>(idx)
                .ok()
                .map(|v| Cell::Text(v.to_string())),
            TypeCategory::Timestamp => decode_timestamp(row, idx),
            TypeCategory::Date => row.try_get::<NaiveDate, _>(idx).ok().map(date_cell),
            TypeCategory::Time => row
                .try_get::<NaiveTime, _>(idx)
                .ok()
                .map(|v| Cell::Text(v.to_string())),
            TypeCategory::Uuid | TypeCategory::Text | TypeCategory::Unknown => None,
        };
        cell.or_else(|| decode_text(row, idx))
            .unwrap_or_else(|| unsupported(idx, type_name))
    }

    fn decode_integer(row: &MySqlRow, idx: usize) -> Option<Cell> {
        // Try signed types
        if let Ok(v) = row.try_get::<i8, _>(idx) {
            return Some(Cell::Integer(v.into()));
        }
        if let Ok(v) = row.try_get::<i16, _>(idx) {
            return Some(Cell::Integer(v.into()));
        }
        if let Ok(v) = row.try_get::<i32, _>(idx) {
            return Some(Cell::Integer(v.into()));
        }
        if let Ok(v) = row.try_get::<i64, _>(idx) {
            return Some(Cell::Integer(v));
        }
        // Try unsigned types
        if let Ok(v) = row.try_get::<u8, _>(idx) {
            return Some(Cell::Integer(v.into()));
        }
        if let Ok(v) = row.try_get::<u16, _>(idx) {
            return Some(Cell::Integer(v.into()));
        }
        if let Ok(v) = row.try_get::<u32, _>(idx) {
            return Some(Cell::Integer(v.into()));
        }
        // BIGINT UNSIGNED above i64::MAX stays exact as text
        row.try_get::<u64, _>(idx).ok().map(|v| match i64::try_from(v) {
            Ok(v) => Cell::Integer(v),
            Err(_) => Cell::Text(v.to_string()),
        })
    }

    fn decode_float(row: &MySqlRow, idx: usize) -> Option<Cell> {
        if let Ok(v) = row.try_get::<f64, _>(idx) {
            return Some(float_cell(v));
        }
        row.try_get::<f32, _>(idx)
            .ok()
            .map(|v| float_cell(f64::from(v)))
    }

    fn decode_timestamp(row: &MySqlRow, idx: usize) -> Option<Cell> {
        if let Ok(v) = row.try_get::<DateTime<Utc>, _>(idx) {
            return Some(Cell::Timestamp(v));
        }
        row.try_get::<NaiveDateTime, _>(idx)
            .ok()
            .map(|v| Cell::Timestamp(v.and_utc()))
    }

    /// MySQL reports some text columns as VARBINARY depending on collation.
    fn decode_text(row: &MySqlRow, idx: usize) -> Option<Cell> {
        if let Ok(v) = row.try_get::<String, _>(idx) {
            return Some(Cell::Text(v));
        }
        row.try_get::<Vec<u8>, _>(idx)
            .ok()
            .map(|bytes| match String::from_utf8(bytes) {
                Ok(s) => Cell::Text(s),
                Err(e) => Cell::Text(encode_binary(e.as_bytes())),
            })
    }
}

pub mod sqlite {
    use super::*;

    /// SQLite is dynamically typed: the declared type only decides booleans and
    /// date/time values, everything else follows the stored value's class.
    pub fn decode_cell(row: &SqliteRow, idx: usize, type_name: &str) -> Cell {
        if is_null(row, idx) {
            return Cell::Null;
        }
        let declared = match categorize_type(type_name, Dialect::Sqlite) {
            TypeCategory::Boolean => row.try_get::<bool, _>(idx).ok().map(Cell::Bool),
            TypeCategory::Timestamp => decode_timestamp(row, idx),
            TypeCategory::Date => row.try_get::<NaiveDate, _>(idx).ok().map(date_cell),
            _ => None,
        };
        if let Some(cell) = declared {
            return cell;
        }

        let storage_class = match row.try_get_raw(idx) {
            Ok(raw) => raw.type_info().name().to_string(),
            Err(_) => return unsupported(idx, type_name),
        };
        let cell = match storage_class.as_str() {
            "INTEGER" => row.try_get::<i64, _>(idx).ok().map(Cell::Integer),
            "REAL" => row.try_get::<f64, _>(idx).ok().map(float_cell),
            "BLOB" => row
                .try_get::<Vec<u8>, _>(idx)
                .ok()
                .map(|v| Cell::Text(encode_binary(&v))),
            _ => row.try_get::<String, _>(idx).ok().map(Cell::Text),
        };
        cell.unwrap_or_else(|| unsupported(idx, type_name))
    }

    fn decode_timestamp(row: &SqliteRow, idx: usize) -> Option<Cell> {
        if let Ok(v) = row.try_get::<DateTime<Utc>, _>(idx) {
            return Some(Cell::Timestamp(v));
        }
        row.try_get::<NaiveDateTime, _>(idx)
            .ok()
            .map(|v| Cell::Timestamp(v.and_utc()))
    }
}

/// Native spellings of each dialect-neutral type name.
const TYPE_ALIASES: &[(&str, &[&str])] = &[
    ("tinyint", &["tinyint", "tiny"]),
    ("smallint", &["smallint", "int2", "smallserial"]),
    ("integer", &["integer", "int", "int4", "mediumint", "serial"]),
    ("bigint", &["bigint", "int8", "bigserial"]),
    ("real", &["real", "float", "float4"]),
    ("double", &["double", "double precision", "float8"]),
    ("decimal", &["decimal", "numeric"]),
    ("boolean", &["boolean", "bool"]),
    ("char", &["char", "character", "bpchar"]),
    (
        "text",
        &[
            "text",
            "varchar",
            "character varying",
            "string",
            "tinytext",
            "mediumtext",
            "longtext",
            "name",
            "citext",
        ],
    ),
    (
        "binary",
        &["binary", "varbinary", "bytea", "blob", "tinyblob", "mediumblob", "longblob"],
    ),
    (
        "timestamp",
        &[
            "timestamp",
            "timestamptz",
            "datetime",
            "timestamp without time zone",
            "timestamp with time zone",
        ],
    ),
    ("date", &["date"]),
    ("time", &["time", "timetz", "time without time zone", "time with time zone"]),
    ("json", &["json", "jsonb"]),
    ("uuid", &["uuid"]),
];

/// Reduce a native type name to its dialect-neutral form.
///
/// Modifiers are dropped (`varchar(255)` becomes `text`, `int(10) unsigned`
/// becomes `integer`). Unknown types keep their lowercased base name.
pub fn normalize_type_name(type_name: &str) -> String {
    let lower = type_name.to_lowercase();
    let without_modifier = match lower.split_once('(') {
        Some((head, tail)) => {
            let rest = tail.split_once(')').map(|(_, rest)| rest).unwrap_or_default();
            format!("{}{}", head.trim_end(), rest)
        }
        None => lower,
    };
    let base = without_modifier.trim();
    let base = base.strip_suffix(" unsigned").unwrap_or(base).trim();

    TYPE_ALIASES
        .iter()
        .find(|(_, aliases)| aliases.contains(&base))
        .map(|(normalized, _)| normalized.to_string())
        .unwrap_or_else(|| base.to_string())
}
