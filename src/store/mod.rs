//! Durable record store.
//!
//! The engine reads and writes connection descriptors, metadata snapshots and
//! execution records only through the [`Store`] trait. Two implementations
//! ship with the crate:
//! - [`MemoryStore`] for tests and embedding
//! - [`SqliteStore`] for stand-alone use (the CLI)

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::error::DbResult;
use crate::models::{ConnectionDescriptor, ExecutionRecord, Snapshot};
use async_trait::async_trait;
use std::sync::Arc;

/// Narrow CRUD interface over descriptors, snapshots and execution records.
///
/// Rows owned by a connection are scoped by its id and removed with it.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Insert a new descriptor. Fails with `DuplicateName` if the name is taken.
    async fn insert_connection(&self, descriptor: &ConnectionDescriptor) -> DbResult<()>;

    /// Overwrite an existing descriptor.
    ///
    /// Fails with `NotFound` if the id is unknown and `DuplicateName` if the new
    /// name belongs to another descriptor.
    async fn update_connection(&self, descriptor: &ConnectionDescriptor) -> DbResult<()>;

    async fn get_connection(&self, id: &str) -> DbResult<Option<ConnectionDescriptor>>;

    async fn find_connection_by_name(&self, name: &str)
    -> DbResult<Option<ConnectionDescriptor>>;

    /// All descriptors ordered by name.
    async fn list_connections(&self, active_only: bool) -> DbResult<Vec<ConnectionDescriptor>>;

    /// Remove a descriptor with its snapshot and execution records.
    ///
    /// Returns false if the id was unknown.
    async fn delete_connection(&self, id: &str) -> DbResult<bool>;

    async fn load_snapshot(&self, connection_id: &str) -> DbResult<Option<Arc<Snapshot>>>;

    /// Replace the connection's snapshot as one atomic step.
    ///
    /// Readers see either the previous snapshot or the new one, never a mix.
    /// Fails with `NotFound` if the connection no longer exists.
    async fn replace_snapshot(&self, snapshot: Snapshot) -> DbResult<Arc<Snapshot>>;

    /// Append an execution record. Fails with `NotFound` if the connection no
    /// longer exists.
    async fn append_execution(&self, record: &ExecutionRecord) -> DbResult<()>;

    /// Most recent records first.
    async fn list_executions(
        &self,
        connection_id: &str,
        limit: usize,
    ) -> DbResult<Vec<ExecutionRecord>>;
}
