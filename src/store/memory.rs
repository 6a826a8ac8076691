//! In-memory store.
//!
//! All tables sit behind a single `tokio::sync::RwLock`, so every trait method
//! is atomic. Snapshots are shared as `Arc<Snapshot>` and replaced by swapping
//! the pointer.

use crate::error::{DbError, DbResult};
use crate::models::{ConnectionDescriptor, ExecutionRecord, Snapshot};
use crate::store::Store;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Default)]
struct Tables {
    connections: HashMap<String, ConnectionDescriptor>,
    snapshots: HashMap<String, Arc<Snapshot>>,
    executions: HashMap<String, Vec<ExecutionRecord>>,
}

impl Tables {
    fn name_taken(&self, name: &str, except_id: Option<&str>) -> bool {
        self.connections
            .values()
            .any(|c| c.name == name && Some(c.id.as_str()) != except_id)
    }
}

/// Store backed by process memory. Contents are lost on drop.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of execution records across all connections.
    pub async fn execution_count(&self) -> usize {
        self.tables
            .read()
            .await
            .executions
            .values()
            .map(Vec::len)
            .sum()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_connection(&self, descriptor: &ConnectionDescriptor) -> DbResult<()> {
        let mut tables = self.tables.write().await;
        if tables.name_taken(&descriptor.name, None) {
            return Err(DbError::duplicate_name(&descriptor.name));
        }
        if tables.connections.contains_key(&descriptor.id) {
            return Err(DbError::internal(format!(
                "Connection id {} already exists",
                descriptor.id
            )));
        }
        tables
            .connections
            .insert(descriptor.id.clone(), descriptor.clone());
        Ok(())
    }

    async fn update_connection(&self, descriptor: &ConnectionDescriptor) -> DbResult<()> {
        let mut tables = self.tables.write().await;
        if !tables.connections.contains_key(&descriptor.id) {
            return Err(DbError::connection_not_found(&descriptor.id));
        }
        if tables.name_taken(&descriptor.name, Some(&descriptor.id)) {
            return Err(DbError::duplicate_name(&descriptor.name));
        }
        tables
            .connections
            .insert(descriptor.id.clone(), descriptor.clone());
        Ok(())
    }

    async fn get_connection(&self, id: &str) -> DbResult<Option<ConnectionDescriptor>> {
        Ok(self.tables.read().await.connections.get(id).cloned())
    }

    async fn find_connection_by_name(
        &self,
        name: &str,
    ) -> DbResult<Option<ConnectionDescriptor>> {
        let tables = self.tables.read().await;
        Ok(tables.connections.values().find(|c| c.name == name).cloned())
    }

    async fn list_connections(&self, active_only: bool) -> DbResult<Vec<ConnectionDescriptor>> {
        let tables = self.tables.read().await;
        let mut connections: Vec<_> = tables
            .connections
            .values()
            .filter(|c| !active_only || c.is_active)
            .cloned()
            .collect();
        connections.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(connections)
    }

    async fn delete_connection(&self, id: &str) -> DbResult<bool> {
        let mut tables = self.tables.write().await;
        if tables.connections.remove(id).is_none() {
            return Ok(false);
        }
        tables.snapshots.remove(id);
        tables.executions.remove(id);
        Ok(true)
    }

    async fn load_snapshot(&self, connection_id: &str) -> DbResult<Option<Arc<Snapshot>>> {
        Ok(self.tables.read().await.snapshots.get(connection_id).cloned())
    }

    async fn replace_snapshot(&self, snapshot: Snapshot) -> DbResult<Arc<Snapshot>> {
        let mut tables = self.tables.write().await;
        if !tables.connections.contains_key(&snapshot.connection_id) {
            return Err(DbError::connection_not_found(&snapshot.connection_id));
        }
        let snapshot = Arc::new(snapshot);
        tables
            .snapshots
            .insert(snapshot.connection_id.clone(), Arc::clone(&snapshot));
        Ok(snapshot)
    }

    async fn append_execution(&self, record: &ExecutionRecord) -> DbResult<()> {
        let mut tables = self.tables.write().await;
        if !tables.connections.contains_key(&record.connection_id) {
            return Err(DbError::connection_not_found(&record.connection_id));
        }
        tables
            .executions
            .entry(record.connection_id.clone())
            .or_default()
            .push(record.clone());
        Ok(())
    }

    async fn list_executions(
        &self,
        connection_id: &str,
        limit: usize,
    ) -> DbResult<Vec<ExecutionRecord>> {
        let tables = self.tables.read().await;
        Ok(tables
            .executions
            .get(connection_id)
            .map(|records| records.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExecutionStatus, NewConnection, ObjectType, StructuralFact};
    use chrono::Utc;

    fn descriptor(name: &str) -> ConnectionDescriptor {
        ConnectionDescriptor::new(NewConnection::new(name, "sqlite::memory:")).unwrap()
    }

    fn failed_record(connection_id: &str, sql: &str) -> ExecutionRecord {
        ExecutionRecord::unsuccessful(
            connection_id,
            sql,
            None,
            ExecutionStatus::Failed,
            "boom".to_string(),
            3,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_duplicate_name_leaves_store_unchanged() {
        let store = MemoryStore::new();
        let first = descriptor("analytics");
        store.insert_connection(&first).await.unwrap();

        let err = store
            .insert_connection(&descriptor("analytics"))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::DuplicateName { .. }));

        let all = store.list_connections(false).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, first.id);
    }

    #[tokio::test]
    async fn test_update_rejects_taken_name() {
        let store = MemoryStore::new();
        let a = descriptor("a");
        let mut b = descriptor("b");
        store.insert_connection(&a).await.unwrap();
        store.insert_connection(&b).await.unwrap();

        b.name = "a".to_string();
        let err = store.update_connection(&b).await.unwrap_err();
        assert!(matches!(err, DbError::DuplicateName { .. }));

        // Renaming to its own name is fine
        b.name = "b".to_string();
        b.is_active = false;
        store.update_connection(&b).await.unwrap();
        assert_eq!(store.list_connections(true).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_cascades() {
        let store = MemoryStore::new();
        let conn = descriptor("cascade");
        store.insert_connection(&conn).await.unwrap();
        let facts = vec![StructuralFact::new(
            ObjectType::Table,
            Some("main".to_string()),
            "orders",
        )];
        store
            .replace_snapshot(Snapshot::from_facts(&conn.id, facts, Utc::now()))
            .await
            .unwrap();
        store
            .append_execution(&failed_record(&conn.id, "SELEC 1"))
            .await
            .unwrap();

        assert!(store.delete_connection(&conn.id).await.unwrap());
        assert!(store.load_snapshot(&conn.id).await.unwrap().is_none());
        assert!(store.list_executions(&conn.id, 10).await.unwrap().is_empty());
        assert!(!store.delete_connection(&conn.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_orphan_rows_rejected() {
        let store = MemoryStore::new();
        let err = store
            .append_execution(&failed_record("missing", "SELECT 1"))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::NotFound { .. }));

        let err = store
            .replace_snapshot(Snapshot::from_facts("missing", vec![], Utc::now()))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_executions_newest_first() {
        let store = MemoryStore::new();
        let conn = descriptor("history");
        store.insert_connection(&conn).await.unwrap();
        for sql in ["SELECT 1", "SELECT 2", "SELECT 3"] {
            store
                .append_execution(&failed_record(&conn.id, sql))
                .await
                .unwrap();
        }

        let recent = store.list_executions(&conn.id, 2).await.unwrap();
        let texts: Vec<_> = recent.iter().map(|r| r.query_text.as_str()).collect();
        assert_eq!(texts, vec!["SELECT 3", "SELECT 2"]);
        assert_eq!(store.execution_count().await, 3);
    }
}
