//! Database abstraction layer.
//!
//! This module provides database access functionality:
//! - Adapter and session interfaces with one implementation per dialect
//! - Session pool management per registered connection
//! - Result cell normalization and type mappings

pub mod adapter;
pub mod mysql;
pub mod pool;
pub mod postgres;
pub mod sqlite;
pub mod types;

pub use adapter::{Adapter, AdapterSet, Deadline, Session};
pub use mysql::MySqlAdapter;
pub use pool::{PoolManager, PoolStats, SessionHandle};
pub use postgres::PostgresAdapter;
pub use sqlite::SqliteAdapter;
pub use types::TypeCategory;
