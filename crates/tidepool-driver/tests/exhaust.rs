//! Exhaust cursors against the mock server: clean completion, server
//! errors, network errors, and abandoned streams.

mod common;

use bson::doc;
use tidepool_driver::{Client, DriverError, ExhaustState, FindOptions};

use common::{Fault, MockMongo, init_tracing, numbered};

fn exhaust_batches_of(batch_size: u32) -> FindOptions {
    FindOptions {
        batch_size,
        ..FindOptions::exhaust()
    }
}

async fn open_client(server: &MockMongo) -> Client {
    let client = Client::with_uri_str(&server.uri()).unwrap();
    client.open().await.unwrap();
    client
}

#[tokio::test]
async fn stream_completes_and_returns_connection() {
    init_tracing();
    let server = MockMongo::start().await;
    server.seed("db", "c", numbered(10));
    let client = open_client(&server).await;
    let pool = client.primary_pool().unwrap();

    let mut cursor = client.database("db").collection("c").find(doc! {}, exhaust_batches_of(2));
    assert!(cursor.fetch_next().await.unwrap());
    let conn_id = cursor.exhaust_cursor().unwrap().connection_id().unwrap();
    assert_eq!(pool.stats().checked_out, 1);

    let mut seen = Vec::new();
    while let Some(doc) = cursor.next_object() {
        seen.push(doc.get_i32("n").unwrap());
        if cursor.exhaust_cursor().unwrap().buffered() == 0 && !cursor.fetch_next().await.unwrap() {
            break;
        }
    }
    assert_eq!(seen, (0..10).collect::<Vec<_>>());

    let exhaust = cursor.exhaust_cursor().unwrap();
    assert_eq!(exhaust.state(), ExhaustState::Exhausted);
    assert_eq!(exhaust.batches(), 5);
    assert_eq!(exhaust.cursor_id(), 0);
    assert!(!cursor.alive());

    // One OP_QUERY went out for the whole stream.
    assert_eq!(pool.stats().checked_out, 0);
    assert_eq!(pool.idle_connection_ids(), vec![conn_id]);
}

#[tokio::test]
async fn collect_reads_every_batch() {
    let server = MockMongo::start().await;
    server.seed("db", "c", numbered(25));
    let client = open_client(&server).await;
    let requests_before = server.requests();

    let mut cursor = client.database("db").collection("c").find(doc! {}, exhaust_batches_of(4));
    let docs = cursor.collect().await.unwrap();
    assert_eq!(docs.len(), 25);
    assert_eq!(server.requests() - requests_before, 1);
    assert_eq!(cursor.exhaust_cursor().unwrap().batches(), 7);
}

#[tokio::test]
async fn empty_result_ends_immediately() {
    let server = MockMongo::start().await;
    let client = open_client(&server).await;

    let mut cursor = client
        .database("db")
        .collection("empty")
        .find(doc! {}, FindOptions::exhaust());
    assert!(cursor.next().await.unwrap().is_none());
    assert_eq!(cursor.exhaust_cursor().unwrap().state(), ExhaustState::Exhausted);
    assert_eq!(client.primary_pool().unwrap().stats().idle, 1);
}

#[tokio::test]
async fn server_error_keeps_connection_in_pool() {
    init_tracing();
    let server = MockMongo::start().await;
    server.seed("db", "c", numbered(10));
    let client = open_client(&server).await;
    let pool = client.primary_pool().unwrap();

    server.inject(Fault::ErrorMidStream(2, "exhaust interrupted".to_string()));
    let mut cursor = client.database("db").collection("c").find(doc! {}, exhaust_batches_of(2));
    assert!(cursor.fetch_next().await.unwrap());
    let conn_id = cursor.exhaust_cursor().unwrap().connection_id().unwrap();

    let mut delivered = 0;
    let err = loop {
        match cursor.next().await {
            Ok(Some(_)) => delivered += 1,
            Ok(None) => panic!("stream ended without the injected error"),
            Err(err) => break err,
        }
    };
    assert_eq!(delivered, 4);
    assert!(err.is_operation_failure());
    assert_eq!(err.to_string(), "exhaust interrupted");
    assert_eq!(cursor.exhaust_cursor().unwrap().state(), ExhaustState::Failed);

    assert_eq!(pool.idle_connection_ids(), vec![conn_id]);
    assert_eq!(pool.stats().total, 1);

    // The kept connection is clean and serves the next command.
    client.command("admin", doc! { "ping": 1 }).await.unwrap();
    assert_eq!(server.connections(), 1);
}

#[tokio::test]
async fn initial_query_failure_keeps_connection() {
    let server = MockMongo::start().await;
    let client = open_client(&server).await;
    let pool = client.primary_pool().unwrap();
    let before = pool.idle_connection_ids();

    server.inject(Fault::QueryFailure("bad query".to_string()));
    let mut cursor = client.database("db").collection("c").find(doc! {}, FindOptions::exhaust());
    let err = cursor.next().await.unwrap_err();
    assert_eq!(err.to_string(), "bad query");
    assert_eq!(pool.idle_connection_ids(), before);
}

#[tokio::test]
async fn network_error_discards_connection() {
    init_tracing();
    let server = MockMongo::start().await;
    server.seed("db", "c", numbered(10));
    let client = open_client(&server).await;
    let pool = client.primary_pool().unwrap();
    assert_eq!(pool.stats().total, 1);

    server.inject(Fault::HangUpMidStream(2));
    let mut cursor = client.database("db").collection("c").find(doc! {}, exhaust_batches_of(2));
    assert!(cursor.fetch_next().await.unwrap());
    let conn_id = cursor.exhaust_cursor().unwrap().connection_id().unwrap();

    let mut delivered = 0;
    let err = loop {
        match cursor.next().await {
            Ok(Some(_)) => delivered += 1,
            Ok(None) => panic!("stream ended without the injected hang-up"),
            Err(err) => break err,
        }
    };
    assert_eq!(delivered, 4);
    assert!(err.is_connection_failure(), "{err}");
    assert!(matches!(err, DriverError::AutoReconnect(_)));

    let stats = pool.stats();
    assert_eq!(stats.total, 0);
    assert_eq!(stats.checked_out, 0);
    assert!(!pool.idle_connection_ids().contains(&conn_id));
}

#[tokio::test]
async fn dropping_mid_stream_closes_connection() {
    let server = MockMongo::start().await;
    server.seed("db", "c", numbered(20));
    let client = open_client(&server).await;
    let pool = client.primary_pool().unwrap();

    {
        let mut cursor = client.database("db").collection("c").find(doc! {}, exhaust_batches_of(2));
        assert!(cursor.next().await.unwrap().is_some());
        assert_eq!(pool.stats().checked_out, 1);
    }

    // The half-read socket never returns to the pool.
    let stats = pool.stats();
    assert_eq!(stats.checked_out, 0);
    assert_eq!(stats.total, 0);

    client.command("admin", doc! { "ping": 1 }).await.unwrap();
    assert_eq!(server.connections(), 2);
}

#[tokio::test]
async fn close_mid_stream_abandons() {
    let server = MockMongo::start().await;
    server.seed("db", "c", numbered(20));
    let client = open_client(&server).await;

    let mut cursor = client.database("db").collection("c").find(doc! {}, exhaust_batches_of(3));
    assert!(cursor.next().await.unwrap().is_some());
    cursor.close().await;
    assert!(!cursor.alive());
    assert!(cursor.next().await.unwrap().is_none());
    assert_eq!(client.primary_pool().unwrap().stats().total, 0);
}

#[tokio::test]
async fn limit_stops_the_stream() {
    let server = MockMongo::start().await;
    server.seed("db", "c", numbered(10));
    let client = open_client(&server).await;

    let options = FindOptions {
        limit: 3,
        ..exhaust_batches_of(2)
    };
    let mut cursor = client.database("db").collection("c").find(doc! {}, options);
    let docs = cursor.collect().await.unwrap();
    assert_eq!(docs.len(), 3);
    assert!(!cursor.alive());
}

#[tokio::test]
async fn filter_applies_to_stream() {
    let server = MockMongo::start().await;
    server.seed(
        "db",
        "c",
        vec![
            doc! { "_id": 1, "kind": "a" },
            doc! { "_id": 2, "kind": "b" },
            doc! { "_id": 3, "kind": "a" },
        ],
    );
    let client = open_client(&server).await;

    let mut cursor = client
        .database("db")
        .collection("c")
        .find(doc! { "kind": "a" }, FindOptions::exhaust());
    let ids: Vec<i32> = cursor
        .collect()
        .await
        .unwrap()
        .iter()
        .map(|d| d.get_i32("_id").unwrap())
        .collect();
    assert_eq!(ids, vec![1, 3]);
    assert_eq!(cursor.exhaust_cursor().unwrap().filter(), &doc! { "kind": "a" });
}

#[tokio::test]
async fn socket_timeout_applies_to_pushed_batches() {
    let server = MockMongo::start().await;
    let client = Client::with_uri_str(&server.uri_with("socketTimeoutMS=100")).unwrap();
    client.open().await.unwrap();

    server.inject(Fault::Stall);
    let mut cursor = client.database("db").collection("c").find(doc! {}, FindOptions::exhaust());
    let err = cursor.next().await.unwrap_err();
    assert_eq!(err.to_string(), "timed out");
    assert_eq!(cursor.exhaust_cursor().unwrap().state(), ExhaustState::Failed);
    assert_eq!(client.primary_pool().unwrap().stats().total, 0);
}
