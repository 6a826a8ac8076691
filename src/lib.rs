//! DB Query Engine Library
//!
//! A multi-database connection registry, schema metadata cache and ad-hoc
//! query engine for SQL databases (PostgreSQL, MySQL, SQLite), with an
//! append-only audit history of every execution.

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod executor;
pub mod metadata;
pub mod models;
pub mod registry;
pub mod sql_validator;
pub mod store;

pub use config::Config;
pub use engine::Engine;
pub use error::{DbError, DbResult};
