//! Drives the wire protocol against a running server bound to an
//! ephemeral TCP port, using a seeded `VecRowSource` so refresh and fetch
//! behavior is reproducible (spec §8 "Concrete end-to-end scenarios").

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use catalog::{Catalog, Cron, RowSource, VecRowSource};
use common::config::{Config, DbConfig, IndexSpec, KeyType, ListenConfig, ResourceCaps, TableSpec};
use engine::Engine;
use protocol::wire::{encode_length_prefix, HEADER_SIZE, PROTOCOL_VERSION};
use protocol::{decode_row, Field, Row, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

fn table_spec(name: &str, id: u8, period_seconds: u64) -> TableSpec {
    TableSpec {
        name: name.to_string(),
        id,
        period_seconds,
        select_text: format!("select id from {name}"),
        indexes: vec![IndexSpec {
            id: 0,
            column: "id".to_string(),
            key_type: KeyType::Int,
        }],
    }
}

fn config(tables: Vec<TableSpec>) -> Config {
    Config {
        db: DbConfig {
            driver: "mock".to_string(),
            dsn: "mock://".to_string(),
        },
        listen: ListenConfig {
            tcp_host: Some("127.0.0.1".to_string()),
            tcp_port: Some(0),
            unix_path: None,
            backlog: 128,
        },
        default_refresh_period_seconds: 30,
        cron_period_seconds: 1,
        strip_nulls: false,
        caps: ResourceCaps::default(),
        tables,
    }
}

struct TestServer {
    addr: SocketAddr,
    rows: Arc<VecRowSource>,
}

async fn start_server(cfg: Config) -> TestServer {
    let catalog = Arc::new(Catalog::new(cfg).unwrap());
    let rows = Arc::new(VecRowSource::new());
    let source: Arc<dyn RowSource> = rows.clone();
    let cron = Arc::new(Cron::new(catalog.clone(), source));
    cron.initial_load().await;
    tokio::spawn(cron.clone().run());

    let engine = Arc::new(Engine::new(catalog, cron.stop_handle()));
    let bound = engine.bind().await.unwrap();
    let addr = bound.tcp_addr().unwrap();
    tokio::spawn(async move {
        let _ = engine.serve_bound(bound).await;
    });

    TestServer { addr, rows }
}

async fn connect(addr: SocketAddr) -> TcpStream {
    TcpStream::connect(addr).await.unwrap()
}

async fn request(stream: &mut TcpStream, action: u8, table_id: u8, index_id: u8, key: &[u8]) -> Vec<u8> {
    let mut req = Vec::with_capacity(HEADER_SIZE + key.len());
    req.push(PROTOCOL_VERSION);
    req.push(action);
    req.push(table_id);
    req.push(index_id);
    req.extend_from_slice(&encode_length_prefix(key.len() as u32));
    req.extend_from_slice(key);
    stream.write_all(&req).await.unwrap();

    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await.unwrap();
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await.unwrap();
    payload
}

// Scenario 1: fetch a known key returns the exact configured row.
#[tokio::test]
async fn fetch_known_key_returns_configured_row() {
    let server = start_server(config(vec![table_spec("accounts", 0, 30)])).await;
    server.rows.set_rows(
        "accounts",
        vec![Row::new(vec![Field::new("id", Value::Int64(42))])],
    );
    // Force a synchronous refresh rather than waiting for the first cron tick.
    tokio::time::sleep(Duration::from_millis(1100)).await;

    let mut stream = connect(server.addr).await;
    let payload = request(&mut stream, b'F', 0, 0, &42i32.to_le_bytes()).await;
    let row = decode_row(&payload).unwrap();
    assert_eq!(row.fields.len(), 1);
    assert_eq!(row.fields[0].value, Value::Int64(42));
}

// Scenario 2: fetch with an unknown key is a zero-length miss.
#[tokio::test]
async fn fetch_unknown_key_is_a_miss() {
    let server = start_server(config(vec![table_spec("accounts", 0, 30)])).await;
    let mut stream = connect(server.addr).await;
    let payload = request(&mut stream, b'F', 0, 0, &999i32.to_le_bytes()).await;
    assert!(payload.is_empty());
}

// Scenario 3: staggered refresh periods. A short-period table picks up a
// change within roughly one cron tick; a long-period table does not.
#[tokio::test]
async fn staggered_refresh_periods_pick_up_changes_independently() {
    let server = start_server(config(vec![
        table_spec("fast", 0, 1),
        table_spec("slow", 1, 3600),
    ]))
    .await;
    server.rows.set_rows("fast", vec![Row::new(vec![Field::new("id", Value::Int64(1))])]);
    server.rows.set_rows("slow", vec![Row::new(vec![Field::new("id", Value::Int64(1))])]);
    tokio::time::sleep(Duration::from_millis(1100)).await;

    // Mutate the underlying source for both tables.
    server.rows.set_rows("fast", vec![Row::new(vec![Field::new("id", Value::Int64(2))])]);
    server.rows.set_rows("slow", vec![Row::new(vec![Field::new("id", Value::Int64(2))])]);
    tokio::time::sleep(Duration::from_millis(1200)).await;

    let mut stream = connect(server.addr).await;
    let fast_new = request(&mut stream, b'F', 0, 0, &2i32.to_le_bytes()).await;
    assert!(!fast_new.is_empty(), "fast table should observe the new row");

    let slow_new = request(&mut stream, b'F', 1, 0, &2i32.to_le_bytes()).await;
    assert!(slow_new.is_empty(), "slow table should not have refreshed yet");

    let slow_old = request(&mut stream, b'F', 1, 0, &1i32.to_le_bytes()).await;
    assert!(!slow_old.is_empty(), "slow table should still serve its original snapshot");
}

// Scenario 4: an oversized key is consumed and discarded without closing
// the connection, and a subsequent request on the same connection works.
#[tokio::test]
async fn oversized_key_is_discarded_without_closing_connection() {
    let mut cfg = config(vec![table_spec("accounts", 0, 30)]);
    cfg.caps.max_key_len = 16;
    let server = start_server(cfg).await;
    server.rows.set_rows("accounts", vec![Row::new(vec![Field::new("id", Value::Int64(42))])]);
    tokio::time::sleep(Duration::from_millis(1100)).await;

    let mut stream = connect(server.addr).await;
    let oversized = vec![0u8; 1_000_000];
    let miss = request(&mut stream, b'F', 0, 0, &oversized).await;
    assert!(miss.is_empty());

    let payload = request(&mut stream, b'F', 0, 0, &42i32.to_le_bytes()).await;
    assert!(!payload.is_empty(), "connection should remain usable after the oversized request");
}

// Scenario 5: DESCRIBE_SCHEMA mirrors the configured tables exactly.
#[tokio::test]
async fn describe_schema_matches_configured_tables() {
    let server = start_server(config(vec![table_spec("accounts", 0, 30)])).await;
    let mut stream = connect(server.addr).await;
    let payload = request(&mut stream, b'D', 0, 0, b"").await;
    let value: serde_json::Value = serde_json::from_slice(&payload).unwrap();
    assert_eq!(value["tables"][0]["id"], 0);
    assert_eq!(value["tables"][0]["name"], "accounts");
    assert_eq!(value["tables"][0]["indexes"][0]["column"], "id");
}

// Scenario 6: QUIT returns the literal farewell, closes the connection,
// and initiates full server shutdown: no new connections are accepted
// thereafter.
#[tokio::test]
async fn quit_returns_farewell_and_closes_connection() {
    let server = start_server(config(vec![table_spec("accounts", 0, 30)])).await;
    let mut stream = connect(server.addr).await;
    let payload = request(&mut stream, b'q', 0, 0, b"").await;
    assert_eq!(payload, protocol::QUIT_ACK);

    let mut buf = [0u8; 1];
    let n = stream.read(&mut buf).await.unwrap();
    assert_eq!(n, 0, "connection should be closed after the QUIT grace window");

    // Give the accept loop a moment to observe the stop notification and
    // drop the listener before probing for a refused connection.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(
        TcpStream::connect(server.addr).await.is_err(),
        "no new connections should be accepted after QUIT"
    );
}
