//! Adapter checks against live servers.
//!
//! Set TEST_MYSQL_URL or TEST_POSTGRES_URL to run them.

use db_query_engine::db::{Adapter, Deadline, MySqlAdapter, PostgresAdapter, Session};
use db_query_engine::models::Cell;
use std::time::Duration;

async fn check_session(mut session: Box<dyn Session>, empty_query: &str) {
    let deadline = Deadline::new(Duration::from_secs(10));

    let result = session.execute("SELECT 1 AS one", &deadline, 10).await.unwrap();
    assert_eq!(result.columns, vec!["one"]);
    assert_eq!(result.rows, vec![vec![Cell::Integer(1)]]);
    assert_eq!(result.rows_affected, None);

    let empty = session.execute(empty_query, &deadline, 10).await.unwrap();
    assert_eq!(empty.columns, vec!["one"]);
    assert_eq!(empty.column_types.len(), 1);
    assert!(empty.rows.is_empty());
    assert_eq!(empty.rows_affected, None);

    assert!(!session.is_broken());
    session.close().await;
}

#[tokio::test]
async fn test_mysql_session_reads_connection_id_and_describes_empty_result() {
    let mysql_url = match std::env::var("TEST_MYSQL_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!("Skipping test: TEST_MYSQL_URL not set");
            return;
        }
    };

    // Connect fails unless CONNECTION_ID() decodes on this server version
    let session = MySqlAdapter
        .connect(&mysql_url, Duration::from_secs(10))
        .await
        .unwrap();
    check_session(session, "SELECT 1 AS one FROM DUAL WHERE 1 = 0").await;
}

#[tokio::test]
async fn test_mysql_timeout_keeps_session_usable() {
    let mysql_url = match std::env::var("TEST_MYSQL_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!("Skipping test: TEST_MYSQL_URL not set");
            return;
        }
    };

    let mut session = MySqlAdapter
        .connect(&mysql_url, Duration::from_secs(10))
        .await
        .unwrap();
    let err = session
        .execute("SELECT SLEEP(5)", &Deadline::new(Duration::from_millis(200)), 10)
        .await
        .unwrap_err();
    assert!(err.is_interruption());
    session.close().await;
}

#[tokio::test]
async fn test_postgres_session_describes_empty_result() {
    let postgres_url = match std::env::var("TEST_POSTGRES_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!("Skipping test: TEST_POSTGRES_URL not set");
            return;
        }
    };

    let session = PostgresAdapter
        .connect(&postgres_url, Duration::from_secs(10))
        .await
        .unwrap();
    check_session(session, "SELECT 1 AS one WHERE false").await;
}
