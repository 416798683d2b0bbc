//! Message-level checks with a raw frontend.

mod common;

use common::{command_tags, data_rows, error_code, row_description, tags, WireClient};

const NUMERIC_OID: u32 = 1700;
const INT4_OID: u32 = 23;
/// typmod of NUMERIC(10,2): ((10 << 16) | 2) + 4
const NUMERIC_10_2: i32 = 655_366;

async fn prices(client: &mut WireClient) {
    let messages = client
        .query(
            "CREATE TABLE prices (id INTEGER PRIMARY KEY, amount NUMERIC(10,2)); \
             INSERT INTO prices VALUES (1, 12.5)",
        )
        .await;
    assert_eq!(error_code(&messages), None);
    assert_eq!(command_tags(&messages), vec!["CREATE TABLE", "INSERT 0 1"]);
}

#[tokio::test]
async fn ssl_request_is_declined() {
    let addr = common::start_in_memory().await;
    let (answer, mut client) = WireClient::connect_with_ssl_request(addr).await;
    assert_eq!(answer, b'N');
    let messages = client.query("SELECT 1").await;
    assert_eq!(error_code(&messages), None);
}

#[tokio::test]
async fn simple_query_describes_numeric_with_typmod() {
    let addr = common::start_in_memory().await;
    let mut client = WireClient::connect(addr).await;
    prices(&mut client).await;

    let messages = client.query("SELECT amount FROM prices").await;
    assert_eq!(tags(&messages), "TDCZ");
    let fields = row_description(&messages);
    assert_eq!(fields[0].name, "amount");
    assert_eq!(fields[0].type_oid, NUMERIC_OID);
    assert_eq!(fields[0].typmod, NUMERIC_10_2);
    assert_eq!(data_rows(&messages), vec![vec![Some("12.50".to_string())]]);
    assert_eq!(command_tags(&messages), vec!["SELECT 1"]);
}

#[tokio::test]
async fn one_row_description_per_describe_execute_cycle() {
    let addr = common::start_in_memory().await;
    let mut client = WireClient::connect(addr).await;
    prices(&mut client).await;

    let mut descriptions = Vec::new();
    for (id, expected_rows) in [("1", 1), ("2", 0)] {
        client.parse("", "SELECT amount FROM prices WHERE id = $1", &[]).await;
        client.describe(b'S', "").await;
        client.bind("", "", &[Some(id)]).await;
        client.execute("", 0).await;
        let messages = client.sync().await;

        let expected = if expected_rows == 1 { "1tT2DCZ" } else { "1tT2CZ" };
        assert_eq!(tags(&messages), expected);
        let (_, params) = messages.iter().find(|(tag, _)| *tag == b't').unwrap();
        assert_eq!(&params[..], &[0, 1, 0, 0, 0, INT4_OID as u8][..]);
        assert_eq!(data_rows(&messages).len(), expected_rows);
        descriptions.push(row_description(&messages));
    }
    assert_eq!(descriptions[0], descriptions[1]);
    assert_eq!(descriptions[0][0].type_oid, NUMERIC_OID);
    assert_eq!(descriptions[0][0].typmod, NUMERIC_10_2);
}

#[tokio::test]
async fn describe_portal_then_execute() {
    let addr = common::start_in_memory().await;
    let mut client = WireClient::connect(addr).await;
    prices(&mut client).await;

    client.parse("q", "SELECT id, amount FROM prices", &[]).await;
    client.bind("p", "q", &[]).await;
    client.describe(b'P', "p").await;
    client.execute("p", 0).await;
    let messages = client.sync().await;
    assert_eq!(tags(&messages), "12TDCZ");
    let fields = row_description(&messages);
    assert_eq!(fields[0].type_oid, INT4_OID);
    assert_eq!(fields[1].type_oid, NUMERIC_OID);
}

#[tokio::test]
async fn row_description_names_the_source_column() {
    let addr = common::start_in_memory().await;
    let mut client = WireClient::connect(addr).await;
    prices(&mut client).await;

    let messages = client.query("SELECT amount, id, id + 1 AS next FROM prices").await;
    let fields = row_description(&messages);
    assert_ne!(fields[0].table_oid, 0);
    assert_eq!(fields[0].table_oid, fields[1].table_oid);
    assert_eq!((fields[0].attnum, fields[1].attnum), (2, 1));
    assert_eq!((fields[2].table_oid, fields[2].attnum), (0, 0));
}

#[tokio::test]
async fn bound_numeric_that_would_round_is_refused() {
    let addr = common::start_in_memory().await;
    let mut client = WireClient::connect(addr).await;
    client
        .query("CREATE TABLE ledger (id INTEGER PRIMARY KEY, amount NUMERIC(30,10))")
        .await;

    client.parse("", "INSERT INTO ledger VALUES ($1, $2)", &[]).await;
    client.bind("", "", &[Some("1"), Some("1234567890.1234567890")]).await;
    client.execute("", 0).await;
    let messages = client.sync().await;
    assert_eq!(error_code(&messages).as_deref(), Some("22003"));

    client.parse("", "INSERT INTO ledger VALUES ($1, $2)", &[]).await;
    client.bind("", "", &[Some("2"), Some("0.5")]).await;
    client.execute("", 0).await;
    let messages = client.sync().await;
    assert_eq!(command_tags(&messages), vec!["INSERT 0 1"]);
}

#[tokio::test]
async fn row_limit_suspends_the_portal() {
    let addr = common::start_in_memory().await;
    let mut client = WireClient::connect(addr).await;
    client
        .query("CREATE TABLE n (v INTEGER); INSERT INTO n VALUES (1), (2), (3)")
        .await;

    client.parse("", "SELECT v FROM n ORDER BY v", &[]).await;
    client.bind("", "", &[]).await;
    client.execute("", 2).await;
    client.execute("", 2).await;
    let messages = client.sync().await;
    assert_eq!(tags(&messages), "12DDsDCZ");
    let values: Vec<_> = data_rows(&messages).into_iter().map(|r| r[0].clone()).collect();
    assert_eq!(values, vec![Some("1".into()), Some("2".into()), Some("3".into())]);
}

#[tokio::test]
async fn errors_skip_to_sync() {
    let addr = common::start_in_memory().await;
    let mut client = WireClient::connect(addr).await;

    client.parse("", "SELEC 1", &[]).await;
    client.bind("", "", &[]).await;
    client.execute("", 0).await;
    let messages = client.sync().await;
    assert_eq!(tags(&messages), "EZ");
    assert_eq!(error_code(&messages).as_deref(), Some("42601"));

    let messages = client.query("SELECT 1").await;
    assert_eq!(error_code(&messages), None);
}

#[tokio::test]
async fn failed_transaction_reports_e_status() {
    let addr = common::start_in_memory().await;
    let mut client = WireClient::connect(addr).await;

    let messages = client.query("BEGIN").await;
    assert_eq!(messages.last().unwrap().1[..], [b'T']);
    let messages = client.query("SELECT * FROM missing").await;
    assert_eq!(error_code(&messages).as_deref(), Some("42P01"));
    assert_eq!(messages.last().unwrap().1[..], [b'E']);

    let messages = client.query("SELECT 1").await;
    assert_eq!(error_code(&messages).as_deref(), Some("25P02"));
    let messages = client.query("ROLLBACK").await;
    assert_eq!(command_tags(&messages), vec!["ROLLBACK"]);
    assert_eq!(messages.last().unwrap().1[..], [b'I']);
}

#[tokio::test]
async fn empty_query_and_to_regtype() {
    let addr = common::start_in_memory().await;
    let mut client = WireClient::connect(addr).await;

    assert_eq!(tags(&client.query("").await), "IZ");

    let messages = client.query("SELECT to_regtype('nonexistent_type')").await;
    assert_eq!(error_code(&messages), None);
    assert!(data_rows(&messages).is_empty());

    let messages = client.query("SELECT to_regtype('integer')").await;
    assert_eq!(data_rows(&messages), vec![vec![Some("integer".to_string())]]);
}
