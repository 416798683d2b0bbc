//! End-to-end tests through tokio-postgres, the way an application talks to
//! the bridge.

mod common;

use chrono::NaiveDateTime;
use std::time::Duration;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::Type;
use tokio_postgres::SimpleQueryMessage;
use uuid::Uuid;

fn simple_rows(messages: &[SimpleQueryMessage]) -> Vec<Vec<Option<String>>> {
    messages
        .iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => {
                Some((0..row.len()).map(|i| row.get(i).map(str::to_string)).collect())
            }
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn insert_returning_and_parameterized_select() -> anyhow::Result<()> {
    let addr = common::start_in_memory().await;
    let client = common::connect(addr).await;

    client
        .batch_execute("CREATE TABLE users (id SERIAL PRIMARY KEY, name TEXT NOT NULL, email VARCHAR(50))")
        .await?;

    let alice = client
        .query_one(
            "INSERT INTO users (name, email) VALUES ($1, $2) RETURNING id",
            &[&"alice", &"alice@example.com"],
        )
        .await?;
    let bob = client
        .query_one("INSERT INTO users (name) VALUES ($1) RETURNING id, name", &[&"bob"])
        .await?;
    assert_eq!(alice.get::<_, i32>(0), 1);
    assert_eq!(bob.get::<_, i32>("id"), 2);
    assert_eq!(bob.get::<_, &str>("name"), "bob");

    let statement = client.prepare("SELECT id, name, email FROM users WHERE name = $1").await?;
    assert_eq!(statement.params(), &[Type::TEXT]);
    let types: Vec<_> = statement.columns().iter().map(|c| c.type_().clone()).collect();
    assert_eq!(types, vec![Type::INT4, Type::TEXT, Type::VARCHAR]);

    let rows = client.query(&statement, &[&"alice"]).await?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get::<_, i32>("id"), 1);
    assert_eq!(rows[0].get::<_, Option<&str>>("email"), Some("alice@example.com"));

    let rows = client.query(&statement, &[&"nobody"]).await?;
    assert!(rows.is_empty());

    let updated = client
        .execute("UPDATE users SET email = $1 WHERE id = $2", &[&"bob@example.com", &2i32])
        .await?;
    assert_eq!(updated, 1);
    let deleted = client
        .query("DELETE FROM users WHERE id = $1 RETURNING name", &[&1i32])
        .await?;
    assert_eq!(deleted[0].get::<_, &str>(0), "alice");
    Ok(())
}

#[tokio::test]
async fn returning_matches_last_insert_rowid() -> anyhow::Result<()> {
    let addr = common::start_in_memory().await;
    let client = common::connect(addr).await;
    client
        .batch_execute("CREATE TABLE items (id BIGSERIAL PRIMARY KEY, label TEXT)")
        .await?;

    let returned = client
        .query("INSERT INTO items (label) VALUES ('a'), ('b') RETURNING id, label", &[])
        .await?;
    let ids: Vec<i64> = returned.iter().map(|r| r.get(0)).collect();
    assert_eq!(ids, vec![1, 2]);

    let latest = client
        .query_one("SELECT id FROM items WHERE rowid = last_insert_rowid()", &[])
        .await?;
    assert_eq!(latest.get::<_, i64>(0), 2);
    Ok(())
}

#[tokio::test]
async fn returning_rows_with_explicit_keys() -> anyhow::Result<()> {
    let addr = common::start_in_memory().await;
    let client = common::connect(addr).await;
    client
        .batch_execute("CREATE TABLE e (id INTEGER PRIMARY KEY, v TEXT); INSERT INTO e VALUES (10, 'x')")
        .await?;

    let rows = client
        .query("INSERT INTO e (id, v) VALUES (3, 'a'), (4, 'b') RETURNING id, v", &[])
        .await?;
    let returned: Vec<(i32, String)> = rows.iter().map(|r| (r.get(0), r.get(1))).collect();
    assert_eq!(returned, vec![(3, "a".to_string()), (4, "b".to_string())]);
    Ok(())
}

#[tokio::test]
async fn upsert_returning_reports_the_written_row() -> anyhow::Result<()> {
    let addr = common::start_in_memory().await;
    let client = common::connect(addr).await;
    client
        .batch_execute(
            "CREATE TABLE k (id SERIAL PRIMARY KEY, name TEXT UNIQUE, hits INTEGER); \
             INSERT INTO k (name, hits) VALUES ('a', 1), ('b', 1)",
        )
        .await?;

    let row = client
        .query_one(
            "INSERT INTO k (name, hits) VALUES ('a', 1) \
             ON CONFLICT (name) DO UPDATE SET hits = k.hits + 1 RETURNING id, name, hits",
            &[],
        )
        .await?;
    assert_eq!(row.get::<_, i32>("id"), 1);
    assert_eq!(row.get::<_, &str>("name"), "a");
    assert_eq!(row.get::<_, i32>("hits"), 2);

    let rows = client
        .query(
            "INSERT INTO k (name, hits) VALUES ('b', 5) ON CONFLICT (name) DO NOTHING RETURNING id",
            &[],
        )
        .await?;
    assert!(rows.is_empty());
    Ok(())
}

#[tokio::test]
async fn typed_values_round_trip_in_binary() -> anyhow::Result<()> {
    let addr = common::start_in_memory().await;
    let client = common::connect(addr).await;
    client
        .batch_execute(
            "CREATE TABLE events (id INTEGER PRIMARY KEY, happened_at TIMESTAMP, ref_id UUID, doc JSONB, big BIGINT, ok BOOLEAN)",
        )
        .await?;

    let at = NaiveDateTime::parse_from_str("2024-03-01 12:30:45.123456", "%Y-%m-%d %H:%M:%S%.f")?;
    let reference = Uuid::parse_str("a0eebc99-9c0b-4ef8-bb6d-6bb9bd380a11")?;
    let doc = serde_json::json!({"kind": "signup", "tags": ["a", "b"]});
    client
        .execute(
            "INSERT INTO events (id, happened_at, ref_id, doc, big, ok) VALUES ($1, $2, $3, $4, $5, $6)",
            &[&1i32, &at, &reference, &doc, &9_000_000_000i64, &true],
        )
        .await?;

    let row = client
        .query_one("SELECT happened_at, ref_id, doc, big, ok FROM events WHERE id = $1", &[&1i32])
        .await?;
    assert_eq!(row.get::<_, NaiveDateTime>("happened_at"), at);
    assert_eq!(row.get::<_, Uuid>("ref_id"), reference);
    assert_eq!(row.get::<_, serde_json::Value>("doc"), doc);
    assert_eq!(row.get::<_, i64>("big"), 9_000_000_000);
    assert!(row.get::<_, bool>("ok"));
    Ok(())
}

#[tokio::test]
async fn numeric_description_is_stable() -> anyhow::Result<()> {
    let addr = common::start_in_memory().await;
    let client = common::connect(addr).await;
    client
        .batch_execute("CREATE TABLE prices (id INTEGER PRIMARY KEY, amount NUMERIC(10,2))")
        .await?;

    let statement = client.prepare("SELECT amount FROM prices WHERE id = $1").await?;
    assert_eq!(statement.columns()[0].type_(), &Type::NUMERIC);
    assert!(client.query(&statement, &[&1i32]).await?.is_empty());

    client.batch_execute("INSERT INTO prices VALUES (1, 3.1)").await?;
    let statement = client.prepare("SELECT amount FROM prices WHERE id = $1").await?;
    assert_eq!(statement.columns()[0].type_(), &Type::NUMERIC);

    let rows = simple_rows(&client.simple_query("SELECT amount FROM prices").await?);
    assert_eq!(rows, vec![vec![Some("3.10".to_string())]]);
    Ok(())
}

#[tokio::test]
async fn numeric_beyond_double_precision_is_refused() -> anyhow::Result<()> {
    let addr = common::start_in_memory().await;
    let client = common::connect(addr).await;
    client
        .batch_execute("CREATE TABLE ledger (id INTEGER PRIMARY KEY, amount NUMERIC(30,10))")
        .await?;

    for literal in [
        "'1234567890.1234567890'",
        "12345678901234567.25",
        "'123456789012345678901234567890.5'",
    ] {
        let err = client
            .batch_execute(&format!("INSERT INTO ledger VALUES (1, {literal})"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(&SqlState::NUMERIC_VALUE_OUT_OF_RANGE), "{literal}");
    }
    let count = client.query_one("SELECT count(*) FROM ledger", &[]).await?;
    assert_eq!(count.get::<_, i64>(0), 0);

    client
        .batch_execute("INSERT INTO ledger VALUES (1, '12345.6789012345'), (2, 9007199254740993)")
        .await?;
    let rows = simple_rows(&client.simple_query("SELECT amount FROM ledger ORDER BY id").await?);
    assert_eq!(
        rows,
        vec![
            vec![Some("12345.6789012345".to_string())],
            vec![Some("9007199254740993.0000000000".to_string())],
        ]
    );
    Ok(())
}

#[tokio::test]
async fn constraint_violations_carry_sqlstate() -> anyhow::Result<()> {
    let addr = common::start_in_memory().await;
    let client = common::connect(addr).await;
    client
        .batch_execute("CREATE TABLE accounts (id INTEGER PRIMARY KEY, handle VARCHAR(8) NOT NULL UNIQUE)")
        .await?;
    client.batch_execute("INSERT INTO accounts VALUES (1, 'ann')").await?;

    let err = client
        .batch_execute("INSERT INTO accounts VALUES (2, 'ann')")
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::UNIQUE_VIOLATION));

    let err = client
        .batch_execute("INSERT INTO accounts VALUES (3, NULL)")
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::NOT_NULL_VIOLATION));

    let err = client
        .batch_execute("INSERT INTO accounts VALUES (4, 'much too long')")
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::CHECK_VIOLATION));

    let err = client.batch_execute("SELECT nope FROM accounts").await.unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::UNDEFINED_COLUMN));
    Ok(())
}

#[tokio::test]
async fn failed_transaction_until_rollback() -> anyhow::Result<()> {
    let addr = common::start_in_memory().await;
    let client = common::connect(addr).await;
    client.batch_execute("CREATE TABLE t (v INTEGER)").await?;

    client.batch_execute("BEGIN; INSERT INTO t VALUES (1)").await?;
    assert!(client.batch_execute("INSERT INTO missing VALUES (1)").await.is_err());
    let err = client.query("SELECT v FROM t", &[]).await.unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::IN_FAILED_SQL_TRANSACTION));
    client.batch_execute("ROLLBACK").await?;

    let count = client.query_one("SELECT count(*) FROM t", &[]).await?;
    assert_eq!(count.get::<_, i64>(0), 0);
    Ok(())
}

#[tokio::test]
async fn multi_statement_query_is_atomic() -> anyhow::Result<()> {
    let addr = common::start_in_memory().await;
    let client = common::connect(addr).await;
    client.batch_execute("CREATE TABLE t (v INTEGER PRIMARY KEY)").await?;

    let err = client
        .batch_execute("INSERT INTO t VALUES (1); INSERT INTO t VALUES (1)")
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::UNIQUE_VIOLATION));
    let count = client.query_one("SELECT count(*) FROM t", &[]).await?;
    assert_eq!(count.get::<_, i64>(0), 0);
    Ok(())
}

#[tokio::test]
async fn commits_are_visible_to_later_sessions() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let addr = common::start_on_file(&dir.path().join("bridge.db")).await;

    let writer = common::connect(addr).await;
    writer
        .batch_execute(
            "BEGIN; \
             CREATE TABLE counters (name TEXT PRIMARY KEY, value INTEGER); \
             INSERT INTO counters VALUES ('hits', 1); \
             UPDATE counters SET value = 42 WHERE name = 'hits'; \
             COMMIT",
        )
        .await?;
    drop(writer);

    let reader = common::connect(addr).await;
    let row = reader
        .query_one("SELECT value FROM counters WHERE name = $1", &[&"hits"])
        .await?;
    assert_eq!(row.get::<_, i32>(0), 42);
    Ok(())
}

#[tokio::test]
async fn disconnect_rolls_back_open_transaction() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let addr = common::start_on_file(&dir.path().join("bridge.db")).await;

    let first = common::connect(addr).await;
    first
        .batch_execute("CREATE TABLE t (v INTEGER); INSERT INTO t VALUES (1)")
        .await?;
    first.batch_execute("BEGIN; INSERT INTO t VALUES (2)").await?;
    drop(first);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let second = common::connect(addr).await;
    second.batch_execute("INSERT INTO t VALUES (3)").await?;
    let rows = second.query("SELECT v FROM t ORDER BY v", &[]).await?;
    let values: Vec<i32> = rows.iter().map(|r| r.get(0)).collect();
    assert_eq!(values, vec![1, 3]);
    Ok(())
}

#[tokio::test]
async fn second_writer_waits_for_the_first_to_commit() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let addr = common::start_on_file(&dir.path().join("bridge.db")).await;

    let first = common::connect(addr).await;
    first
        .batch_execute("CREATE TABLE t (v INTEGER); BEGIN; INSERT INTO t VALUES (1)")
        .await?;

    let second = common::connect(addr).await;
    let waiting = tokio::spawn(async move {
        second.batch_execute("INSERT INTO t VALUES (2)").await?;
        Ok::<_, tokio_postgres::Error>(second)
    });
    tokio::time::sleep(Duration::from_millis(200)).await;
    first.batch_execute("COMMIT").await?;

    let second = waiting.await??;
    let row = second.query_one("SELECT count(*) FROM t", &[]).await?;
    assert_eq!(row.get::<_, i64>(0), 2);
    Ok(())
}

#[tokio::test]
async fn readers_see_the_last_commit_during_an_open_write() -> anyhow::Result<()> {
    let addr = common::start_in_memory().await;
    let writer = common::connect(addr).await;
    writer
        .batch_execute("CREATE TABLE t (v INTEGER); INSERT INTO t VALUES (1)")
        .await?;
    writer.batch_execute("BEGIN; INSERT INTO t VALUES (2)").await?;

    let reader = common::connect(addr).await;
    let row = reader.query_one("SELECT count(*) FROM t", &[]).await?;
    assert_eq!(row.get::<_, i64>(0), 1);

    writer.batch_execute("COMMIT").await?;
    let row = reader.query_one("SELECT count(*) FROM t", &[]).await?;
    assert_eq!(row.get::<_, i64>(0), 2);
    Ok(())
}

#[tokio::test]
async fn settings_and_catalog_functions() -> anyhow::Result<()> {
    let addr = common::start_in_memory().await;
    let client = common::connect(addr).await;

    let rows = simple_rows(&client.simple_query("SHOW server_version").await?);
    assert!(rows[0][0].as_deref().is_some_and(|v| v.starts_with("15")));

    client.batch_execute("SET application_name = 'reporting'").await?;
    let rows = simple_rows(&client.simple_query("SHOW application_name").await?);
    assert_eq!(rows, vec![vec![Some("reporting".to_string())]]);

    let rows = simple_rows(&client.simple_query("SELECT current_database(), current_user").await?);
    assert_eq!(rows, vec![vec![Some("app".to_string()), Some("app".to_string())]]);

    let rows = simple_rows(&client.simple_query("SELECT to_regtype('nonexistent_type')").await?);
    assert!(rows.is_empty());
    let rows = simple_rows(&client.simple_query("SELECT to_regtype('integer')").await?);
    assert_eq!(rows, vec![vec![Some("integer".to_string())]]);

    client
        .batch_execute("CREATE TABLE widgets (id INTEGER PRIMARY KEY, price NUMERIC(8,3))")
        .await?;
    let rows = simple_rows(
        &client
            .simple_query(
                "SELECT column_name, data_type FROM information_schema.columns \
                 WHERE table_name = 'widgets' ORDER BY ordinal_position",
            )
            .await?,
    );
    assert_eq!(rows[0][0].as_deref(), Some("id"));
    assert_eq!(rows[1][0].as_deref(), Some("price"));
    assert_eq!(rows[1][1].as_deref(), Some("numeric"));
    Ok(())
}
