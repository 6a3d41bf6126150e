use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::sync::Arc;

use egd_core::control::{serve, ControlContext};
use egd_core::EntropyPool;
use tokio::sync::{watch, RwLock};

async fn spawn_server() -> (String, watch::Sender<bool>) {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);

    let pool = Arc::new(RwLock::new(EntropyPool::new(1000, 100)));
    pool.write().await.deposit(&[1u8; 10]);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let ctx = Arc::new(ControlContext {
        pool,
        pool_path: std::env::temp_dir().join("egd-control-test-pool.dat"),
        last_persist: Arc::new(RwLock::new(None)),
        started_at: chrono::Utc::now(),
        shutdown_tx: shutdown_tx.clone(),
    });

    let addr_clone = addr.clone();
    tokio::spawn(async move {
        let _ = serve(&addr_clone, ctx, shutdown_rx).await;
    });

    // give the listener a moment to bind
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    (addr, shutdown_tx)
}

#[tokio::test]
async fn scenario_s6_status_command_round_trip() {
    let (addr, _shutdown_tx) = spawn_server().await;

    let response = tokio::task::spawn_blocking(move || {
        let mut stream = TcpStream::connect(&addr).unwrap();
        stream.write_all(b"{\"command\":\"status\"}\n").unwrap();
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        line
    })
    .await
    .unwrap();

    let value: serde_json::Value = serde_json::from_str(response.trim_end()).unwrap();
    assert_eq!(value["status_code"], 200);
    let data = &value["data"];
    assert!(data.get("entropy_bytes").is_some());
    assert!(data.get("max_entropy").is_some());
    assert!(data.get("chunk_count").is_some());
    assert!(data.get("is_full").is_some());
    assert!(data.get("last_persist").is_some());
}

#[tokio::test]
async fn unknown_command_over_wire_returns_404() {
    let (addr, _shutdown_tx) = spawn_server().await;

    let response = tokio::task::spawn_blocking(move || {
        let mut stream = TcpStream::connect(&addr).unwrap();
        stream.write_all(b"{\"command\":\"bogus\"}\n").unwrap();
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        line
    })
    .await
    .unwrap();

    let value: serde_json::Value = serde_json::from_str(response.trim_end()).unwrap();
    assert_eq!(value["status_code"], 404);
}

#[tokio::test]
async fn malformed_json_returns_400() {
    let (addr, _shutdown_tx) = spawn_server().await;

    let response = tokio::task::spawn_blocking(move || {
        let mut stream = TcpStream::connect(&addr).unwrap();
        stream.write_all(b"not json\n").unwrap();
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        line
    })
    .await
    .unwrap();

    let value: serde_json::Value = serde_json::from_str(response.trim_end()).unwrap();
    assert_eq!(value["status_code"], 400);
}
