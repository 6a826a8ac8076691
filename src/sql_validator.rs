//! Coarse SQL statement classification.
//!
//! Query text always runs verbatim. Parsing here only serves two purposes:
//! labelling execution records with a statement kind, and enforcing the
//! optional read-only policy.
//!
//! Uses [sqlparser](https://docs.rs/sqlparser/) with the dialect of the target
//! connection, so formatting tricks such as comments or odd casing cannot
//! disguise a write as a read.

use crate::error::{DbError, DbResult};
use crate::models::Dialect;
use sqlparser::ast::Statement;
use sqlparser::dialect::{self, MySqlDialect, PostgreSqlDialect, SQLiteDialect};
use sqlparser::parser::Parser;

/// Broad category of a SQL statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementCategory {
    /// SELECT, SHOW, EXPLAIN of a read
    Read,
    /// INSERT, UPDATE, DELETE, MERGE, COPY
    Write,
    /// CREATE, ALTER, DROP, TRUNCATE
    Ddl,
    /// BEGIN, COMMIT, ROLLBACK, SAVEPOINT
    Transaction,
    /// CALL, EXECUTE, PREPARE
    ProcedureCall,
    /// GRANT, SET, VACUUM, PRAGMA and similar
    Administrative,
    Unknown,
}

impl StatementCategory {
    pub fn is_read_only(&self) -> bool {
        matches!(self, Self::Read)
    }

    fn denial(&self) -> &'static str {
        match self {
            Self::Read => "",
            Self::Write => "Data modification is disabled in read-only mode.",
            Self::Ddl => "Schema changes are disabled in read-only mode.",
            Self::Transaction => "Transaction control is disabled in read-only mode.",
            Self::ProcedureCall => {
                "Procedure calls are disabled in read-only mode because their effects cannot be verified."
            }
            Self::Administrative => "Administrative statements are disabled in read-only mode.",
            Self::Unknown => "Unrecognized statement. Only reads are allowed in read-only mode.",
        }
    }
}

/// One classified statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classified {
    pub category: StatementCategory,
    /// Uppercase label such as `SELECT` or `CREATE TABLE`
    pub label: &'static str,
}

fn parser_dialect(dialect: Dialect) -> Box<dyn dialect::Dialect> {
    match dialect {
        Dialect::Postgres => Box::new(PostgreSqlDialect {}),
        Dialect::MySql => Box::new(MySqlDialect {}),
        Dialect::Sqlite => Box::new(SQLiteDialect {}),
    }
}

/// Parse `sql` and classify each statement.
///
/// Fails with `InvalidInput` when the text does not parse or holds no statement.
pub fn classify(sql: &str, dialect: Dialect) -> DbResult<Vec<Classified>> {
    let parser_dialect = parser_dialect(dialect);
    let statements = Parser::parse_sql(parser_dialect.as_ref(), sql)
        .map_err(|e| DbError::invalid_input(format!("Failed to parse SQL statement: {}", e)))?;

    if statements.is_empty() {
        return Err(DbError::invalid_input("Empty SQL statement"));
    }

    Ok(statements.iter().map(classify_statement).collect())
}

/// Best-effort statement kind for audit records.
///
/// Multiple statements are joined with `; `. Returns `None` when the text does
/// not parse; the database is the authority on whether it is valid.
pub fn statement_kind(sql: &str, dialect: Dialect) -> Option<String> {
    let classified = classify(sql, dialect).ok()?;
    let labels: Vec<&str> = classified.iter().map(|c| c.label).collect();
    Some(labels.join("; "))
}

/// Reject anything but reads.
///
/// Returns `Err(DbError::Permission)` naming the first offending statement, or
/// `Err(DbError::InvalidInput)` if the text does not parse.
pub fn validate_read_only(sql: &str, dialect: Dialect) -> DbResult<()> {
    for classified in classify(sql, dialect)? {
        if !classified.category.is_read_only() {
            return Err(DbError::permission(
                classified.label,
                classified.category.denial(),
            ));
        }
    }
    Ok(())
}

fn classify_statement(stmt: &Statement) -> Classified {
    use StatementCategory::*;

    let (category, label) = match stmt {
        Statement::Query(_) => (Read, "SELECT"),
        Statement::ShowTables { .. } => (Read, "SHOW TABLES"),
        Statement::ShowColumns { .. } => (Read, "SHOW COLUMNS"),
        Statement::ShowDatabases { .. } => (Read, "SHOW DATABASES"),
        Statement::ShowSchemas { .. } => (Read, "SHOW SCHEMAS"),
        Statement::ShowCreate { .. } => (Read, "SHOW CREATE"),
        Statement::ShowFunctions { .. } => (Read, "SHOW FUNCTIONS"),
        Statement::ShowVariable { .. } => (Read, "SHOW"),
        Statement::ShowVariables { .. } => (Read, "SHOW VARIABLES"),
        Statement::ShowStatus { .. } => (Read, "SHOW STATUS"),
        Statement::ShowCollation { .. } => (Read, "SHOW COLLATION"),
        Statement::ExplainTable { .. } => (Read, "DESCRIBE"),

        // EXPLAIN takes the category of what it explains; EXPLAIN ANALYZE runs it
        Statement::Explain { statement, .. } => {
            let inner = classify_statement(statement);
            if inner.category == Read {
                (Read, "EXPLAIN")
            } else {
                (inner.category, inner.label)
            }
        }

        Statement::Insert(_) => (Write, "INSERT"),
        Statement::Update { .. } => (Write, "UPDATE"),
        Statement::Delete(_) => (Write, "DELETE"),
        Statement::Merge { .. } => (Write, "MERGE"),
        Statement::Copy { .. } => (Write, "COPY"),

        Statement::CreateTable { .. } => (Ddl, "CREATE TABLE"),
        Statement::CreateView { .. } => (Ddl, "CREATE VIEW"),
        Statement::CreateIndex(_) => (Ddl, "CREATE INDEX"),
        Statement::CreateSchema { .. } => (Ddl, "CREATE SCHEMA"),
        Statement::CreateDatabase { .. } => (Ddl, "CREATE DATABASE"),
        Statement::CreateSequence { .. } => (Ddl, "CREATE SEQUENCE"),
        Statement::CreateType { .. } => (Ddl, "CREATE TYPE"),
        Statement::CreateFunction { .. } => (Ddl, "CREATE FUNCTION"),
        Statement::CreateProcedure { .. } => (Ddl, "CREATE PROCEDURE"),
        Statement::CreateTrigger { .. } => (Ddl, "CREATE TRIGGER"),
        Statement::CreateRole { .. } => (Ddl, "CREATE ROLE"),
        Statement::CreateVirtualTable { .. } => (Ddl, "CREATE VIRTUAL TABLE"),
        Statement::CreateExtension { .. } => (Ddl, "CREATE EXTENSION"),
        Statement::CreatePolicy { .. } => (Ddl, "CREATE POLICY"),
        Statement::AlterTable { .. } => (Ddl, "ALTER TABLE"),
        Statement::AlterView { .. } => (Ddl, "ALTER VIEW"),
        Statement::AlterIndex { .. } => (Ddl, "ALTER INDEX"),
        Statement::AlterSchema { .. } => (Ddl, "ALTER SCHEMA"),
        Statement::AlterRole { .. } => (Ddl, "ALTER ROLE"),
        Statement::AlterPolicy { .. } => (Ddl, "ALTER POLICY"),
        Statement::AlterType { .. } => (Ddl, "ALTER TYPE"),
        Statement::Drop { .. } => (Ddl, "DROP"),
        Statement::DropFunction { .. } => (Ddl, "DROP FUNCTION"),
        Statement::DropProcedure { .. } => (Ddl, "DROP PROCEDURE"),
        Statement::DropTrigger { .. } => (Ddl, "DROP TRIGGER"),
        Statement::DropPolicy { .. } => (Ddl, "DROP POLICY"),
        Statement::Truncate { .. } => (Ddl, "TRUNCATE"),
        Statement::Comment { .. } => (Ddl, "COMMENT"),

        Statement::StartTransaction { .. } => (Transaction, "BEGIN"),
        Statement::Commit { .. } => (Transaction, "COMMIT"),
        Statement::Rollback { .. } => (Transaction, "ROLLBACK"),
        Statement::Savepoint { .. } => (Transaction, "SAVEPOINT"),
        Statement::ReleaseSavepoint { .. } => (Transaction, "RELEASE SAVEPOINT"),

        Statement::Call { .. } => (ProcedureCall, "CALL"),
        Statement::Execute { .. } => (ProcedureCall, "EXECUTE"),
        Statement::Prepare { .. } => (ProcedureCall, "PREPARE"),
        Statement::Deallocate { .. } => (ProcedureCall, "DEALLOCATE"),

        Statement::Grant { .. } => (Administrative, "GRANT"),
        Statement::Revoke { .. } => (Administrative, "REVOKE"),
        Statement::Set(_) => (Administrative, "SET"),
        Statement::Use(_) => (Administrative, "USE"),
        Statement::Kill { .. } => (Administrative, "KILL"),
        Statement::Vacuum { .. } => (Administrative, "VACUUM"),
        Statement::Analyze { .. } => (Administrative, "ANALYZE"),
        Statement::Discard { .. } => (Administrative, "DISCARD"),
        Statement::LockTables { .. } => (Administrative, "LOCK"),
        Statement::UnlockTables => (Administrative, "UNLOCK"),
        Statement::Flush { .. } => (Administrative, "FLUSH"),
        Statement::Pragma { .. } => (Administrative, "PRAGMA"),
        Statement::OptimizeTable { .. } => (Administrative, "OPTIMIZE"),
        Statement::AttachDatabase { .. } => (Administrative, "ATTACH"),
        Statement::LISTEN { .. } => (Administrative, "LISTEN"),
        Statement::UNLISTEN { .. } => (Administrative, "UNLISTEN"),
        Statement::NOTIFY { .. } => (Administrative, "NOTIFY"),

        _ => (Unknown, "UNKNOWN"),
    };

    Classified { category, label }
}
