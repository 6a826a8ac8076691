//! Engine against real SQLite databases, with the SQLite-backed store.

use db_query_engine::models::{
    Cell, ConnectionUpdate, ExecuteRequest, ExecutionStatus, NewConnection, ObjectType,
};
use db_query_engine::store::{SqliteStore, Store};
use db_query_engine::{Config, DbError, Engine};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn sqlite_url(path: &Path) -> String {
    format!("sqlite://{}?mode=rwc", path.display())
}

async fn setup(dir: &TempDir) -> (Engine, Arc<SqliteStore>) {
    let store_url = sqlite_url(&dir.path().join("engine.db"));
    let store = Arc::new(SqliteStore::open(&store_url).await.unwrap());
    let config = Config {
        store_url,
        ..Config::default_config()
    };
    let engine = Engine::new(store.clone(), config).unwrap();
    (engine, store)
}

async fn seed(engine: &Engine, name: &str) {
    engine
        .execute(
            name,
            "CREATE TABLE customers (id INTEGER PRIMARY KEY, email TEXT NOT NULL UNIQUE);
             CREATE TABLE orders (
                 id INTEGER PRIMARY KEY,
                 customer_id INTEGER NOT NULL REFERENCES customers(id),
                 total REAL,
                 placed_at TIMESTAMP
             );
             INSERT INTO customers (id, email) VALUES (1, 'a@example.com');
             INSERT INTO orders (customer_id, total, placed_at)
                 VALUES (1, 10.5, '2024-05-01 12:00:00'), (1, 99.0, NULL);",
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_sqlite_round_trip() {
    let dir = TempDir::new().unwrap();
    let (engine, _store) = setup(&dir).await;
    let db_url = sqlite_url(&dir.path().join("shop.db"));

    let descriptor = engine
        .register(NewConnection::new("shop", &db_url).with_description("test shop"))
        .await
        .unwrap();
    seed(&engine, "shop").await;

    let snapshot = engine.introspect("shop", false).await.unwrap();
    assert!(snapshot.find(ObjectType::Table, Some("main"), "orders").is_some());
    let total = snapshot
        .find(ObjectType::Column, Some("main"), "orders.total")
        .unwrap();
    assert_eq!(total.attributes.nullable, Some(true));

    let result = engine
        .execute("shop", "SELECT count(*) AS count FROM orders")
        .await
        .unwrap();
    assert_eq!(result.columns, vec!["count"]);
    assert_eq!(result.rows, vec![vec![Cell::Integer(2)]]);

    let result = engine
        .execute("shop", "SELECT placed_at FROM orders ORDER BY id")
        .await
        .unwrap();
    assert!(matches!(result.rows[0][0], Cell::Timestamp(_)));
    assert_eq!(result.rows[1][0], Cell::Null);

    let history = engine.history(&descriptor.id, 10).await.unwrap();
    assert_eq!(history.len(), 3);
    assert!(history.iter().all(|r| r.status == ExecutionStatus::Succeeded));
    assert_eq!(history[2].statement_kind.as_deref(), Some("CREATE TABLE; CREATE TABLE; INSERT; INSERT"));

    engine.shutdown().await;
}

#[tokio::test]
async fn test_sqlite_empty_select_reports_columns_not_changes() {
    let dir = TempDir::new().unwrap();
    let (engine, _store) = setup(&dir).await;
    let db_url = sqlite_url(&dir.path().join("shop.db"));
    let descriptor = engine
        .register(NewConnection::new("shop", &db_url))
        .await
        .unwrap();
    seed(&engine, "shop").await;

    let result = engine
        .execute("shop", "SELECT id, email FROM customers WHERE id = 999")
        .await
        .unwrap();
    assert_eq!(result.columns, vec!["id", "email"]);
    assert!(result.rows.is_empty());
    assert_eq!(result.rows_affected, None);

    let history = engine.history(&descriptor.id, 1).await.unwrap();
    assert_eq!(history[0].row_count, Some(0));
    assert_eq!(history[0].rows_affected, None);

    let updated = engine
        .execute("shop", "UPDATE orders SET total = total + 1 WHERE customer_id = 1")
        .await
        .unwrap();
    assert_eq!(updated.rows_affected, Some(2));
    assert!(updated.columns.is_empty());
}

#[tokio::test]
async fn test_sqlite_schema_change_visible_after_forced_refresh() {
    let dir = TempDir::new().unwrap();
    let (engine, _store) = setup(&dir).await;
    engine
        .register(NewConnection::new(
            "shop",
            sqlite_url(&dir.path().join("shop.db")),
        ))
        .await
        .unwrap();
    seed(&engine, "shop").await;

    let before = engine.introspect("shop", false).await.unwrap();
    engine
        .execute("shop", "CREATE TABLE invoices (id INTEGER PRIMARY KEY)")
        .await
        .unwrap();

    let cached = engine.introspect("shop", false).await.unwrap();
    assert_eq!(*cached, *before);
    assert!(cached.find(ObjectType::Table, Some("main"), "invoices").is_none());

    let refreshed = engine.introspect("shop", true).await.unwrap();
    assert!(refreshed.find(ObjectType::Table, Some("main"), "invoices").is_some());

    engine.shutdown().await;
}

#[tokio::test]
async fn test_sqlite_failure_recorded() {
    let dir = TempDir::new().unwrap();
    let (engine, store) = setup(&dir).await;
    let descriptor = engine
        .register(NewConnection::new(
            "shop",
            sqlite_url(&dir.path().join("shop.db")),
        ))
        .await
        .unwrap();

    let err = engine
        .execute("shop", "SELECT * FROM no_such_table")
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Execution { .. }));

    let history = store.list_executions(&descriptor.id, 10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, ExecutionStatus::Failed);
    assert!(history[0]
        .error_detail
        .as_deref()
        .unwrap()
        .contains("no_such_table"));

    // The session survived the error and is pooled again
    let stats = engine.pool_stats("shop").await.unwrap().unwrap();
    assert_eq!(stats.idle, 1);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_sqlite_timeout_evicts_session() {
    let dir = TempDir::new().unwrap();
    let (engine, _store) = setup(&dir).await;
    let descriptor = engine
        .register(NewConnection::new(
            "shop",
            sqlite_url(&dir.path().join("shop.db")),
        ))
        .await
        .unwrap();

    let slow = "WITH RECURSIVE n(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM n) \
                SELECT count(*) FROM n";
    let err = engine
        .execute_with(
            "shop",
            ExecuteRequest::new(slow).with_timeout(Duration::from_millis(100)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Timeout { .. }));

    let history = engine.history(&descriptor.id, 1).await.unwrap();
    assert_eq!(history[0].status, ExecutionStatus::TimedOut);
    let stats = engine.pool_stats("shop").await.unwrap().unwrap();
    assert_eq!(stats.idle, 0);

    let result = engine.execute("shop", "SELECT 1 AS one").await.unwrap();
    assert_eq!(result.rows, vec![vec![Cell::Integer(1)]]);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_sqlite_store_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let store_url = sqlite_url(&dir.path().join("engine.db"));
    let id = {
        let (engine, store) = setup(&dir).await;
        let descriptor = engine
            .register(NewConnection::new(
                "shop",
                sqlite_url(&dir.path().join("shop.db")),
            ))
            .await
            .unwrap();
        seed(&engine, "shop").await;
        engine.introspect("shop", false).await.unwrap();
        engine
            .update(
                "shop",
                ConnectionUpdate {
                    name: Some("store-front".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        engine.shutdown().await;
        store.close().await;
        descriptor.id
    };

    let store = Arc::new(SqliteStore::open(&store_url).await.unwrap());
    let engine = Engine::new(store.clone(), Config::default_config()).unwrap();

    let descriptor = engine.get("store-front").await.unwrap();
    assert_eq!(descriptor.id, id);
    assert!(descriptor.url.ends_with("shop.db?mode=rwc"));
    assert_eq!(engine.history(&id, 10).await.unwrap().len(), 1);
    assert!(engine.cached_snapshot(&id).await.unwrap().is_some());

    engine.delete("store-front").await.unwrap();
    assert!(store.load_snapshot(&id).await.unwrap().is_none());
    assert!(store.list_executions(&id, 10).await.unwrap().is_empty());
    engine.shutdown().await;
}
