//! Runs against a live server when `DATABASE_URL` is set, otherwise each test
//! returns early.
#![cfg(feature = "postgres")]

use dbmanager::{DatabaseManager, DbError, PoolOptions, QueryDescriptor, RowMode, Value};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

fn options() -> Option<PoolOptions> {
    let url = std::env::var("DATABASE_URL").ok()?;
    Some(PoolOptions::from_url(url).max(2).connection_timeout_millis(5_000))
}

#[tokio::test]
async fn test_round_trip_parameters() {
    let Some(options) = options() else { return };
    let manager = DatabaseManager::new(options).unwrap();
    let result = manager
        .raw_query(
            "SELECT $1::int8 AS id, $2::text AS name, $3::bool AS ok, NULL::text AS missing",
            &(42, "alice", true),
        )
        .await
        .unwrap();
    assert_eq!(result.command, "SELECT");
    assert_eq!(result.row_count, 1);
    assert_eq!(result.get(0, "id"), Some(&Value::I64(42)));
    assert_eq!(result.get(0, "name"), Some(&Value::Str("alice".into())));
    assert_eq!(result.get(0, "ok"), Some(&Value::Bool(true)));
    assert_eq!(result.get(0, "missing"), Some(&Value::Null));
    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_uuid_and_json_columns() {
    let Some(options) = options() else { return };
    let manager = DatabaseManager::new(options).unwrap();
    let id = "6f1c2a0e-9a51-4a8e-bb0b-3d1d8f3f4c10";
    let result = manager
        .raw_query(
            "SELECT $1::uuid AS id, $2::jsonb AS doc, '1 day'::interval::text AS span",
            &(id, r#"{"a":1}"#),
        )
        .await
        .unwrap();
    assert_eq!(
        result.get(0, "id"),
        Some(&Value::Uuid(id.parse().unwrap()))
    );
    assert_eq!(
        result.get(0, "doc"),
        Some(&Value::Json(serde_json::json!({"a": 1})))
    );
    assert_eq!(result.get(0, "span"), Some(&Value::Str("1 day".into())));

    let err = manager.query("SELECT '1 day'::interval AS span").await.unwrap_err();
    assert!(err.to_string().contains("span"));
    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_array_rows() {
    let Some(options) = options() else { return };
    let manager = DatabaseManager::new(options).unwrap();
    let result = manager
        .query(QueryDescriptor::new("SELECT 1 AS a, 'x' AS b").row_mode(RowMode::Array))
        .await
        .unwrap();
    assert_eq!(result.rows[0].get_index(1), Some(&Value::Str("x".into())));
    assert_eq!(result.get(0, "a"), Some(&Value::I32(1)));
    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_rollback_discards_work() {
    let Some(options) = options() else { return };
    let manager = DatabaseManager::new(options.max(1)).unwrap();
    manager
        .query("CREATE TABLE IF NOT EXISTS dbmanager_rollback (id int PRIMARY KEY)")
        .await
        .unwrap();
    manager.query("TRUNCATE dbmanager_rollback").await.unwrap();

    let err = manager
        .run_transaction(|c| {
            Box::pin(async move {
                c.raw_query("INSERT INTO dbmanager_rollback (id) VALUES ($1)", &(1,))
                    .await?;
                c.raw_query("INSERT INTO dbmanager_rollback (id) VALUES ($1)", &(1,))
                    .await?;
                Ok(())
            })
        })
        .await
        .unwrap_err();
    assert!(err.is_unique_violation());
    assert_eq!(err.unique_violation(), Some("dbmanager_rollback_pkey"));

    let count = manager
        .query("SELECT count(*) AS n FROM dbmanager_rollback")
        .await
        .unwrap();
    assert_eq!(count.get(0, "n"), Some(&Value::I64(0)));
    manager.query("DROP TABLE dbmanager_rollback").await.unwrap();
    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_callbacks_fire() {
    let Some(options) = options() else { return };
    let connects = Arc::new(AtomicUsize::new(0));
    let acquires = Arc::new(AtomicUsize::new(0));
    let releases = Arc::new(AtomicUsize::new(0));
    let (c, a, r) = (connects.clone(), acquires.clone(), releases.clone());
    let manager = DatabaseManager::new(
        options
            .on_connect(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .on_acquire(move |_| {
                a.fetch_add(1, Ordering::SeqCst);
            })
            .on_release(move |_, _| {
                r.fetch_add(1, Ordering::SeqCst);
            }),
    )
    .unwrap();
    manager.query("SELECT 1").await.unwrap();
    manager.query("SELECT 1").await.unwrap();
    assert_eq!(connects.load(Ordering::SeqCst), 1);
    assert_eq!(acquires.load(Ordering::SeqCst), 2);
    assert_eq!(releases.load(Ordering::SeqCst), 2);

    manager.close().await.unwrap();
    assert!(matches!(
        manager.query("SELECT 1").await,
        Err(DbError::PoolClosed)
    ));
}
