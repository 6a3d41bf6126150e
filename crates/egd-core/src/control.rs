//! Loopback-only control server: one line-JSON request per connection.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, RwLock};

use crate::error::{EgdError, ErrorCategory};
use crate::pool::EntropyPool;

const MAX_REQUEST_BYTES: usize = 1024;
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
pub struct ControlRequest {
    pub command: String,
    #[serde(default)]
    pub args: std::collections::HashMap<String, String>,
}

#[derive(Debug, Serialize)]
pub struct ControlResponse {
    pub status_code: u16,
    pub status_text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ControlResponse {
    fn ok(data: serde_json::Value) -> Self {
        Self { status_code: 200, status_text: "OK".to_string(), data: Some(data) }
    }

    fn error(status_code: u16, status_text: impl Into<String>) -> Self {
        Self { status_code, status_text: status_text.into(), data: None }
    }
}

/// What the server needs to answer `status`/`persist`/`quit`.
pub struct ControlContext {
    pub pool: Arc<RwLock<EntropyPool>>,
    pub pool_path: std::path::PathBuf,
    pub last_persist: Arc<RwLock<Option<chrono::DateTime<chrono::Utc>>>>,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub shutdown_tx: watch::Sender<bool>,
}

/// Binds the loopback control listener and serves connections until the
/// shutdown signal fires. Binding failure (address already in use) is
/// always fatal — the daemon cannot start without its control surface.
pub async fn serve(addr: &str, ctx: Arc<ControlContext>, mut shutdown_rx: watch::Receiver<bool>) -> Result<(), EgdError> {
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        EgdError::new(ErrorCategory::Fatal, "control", "CONTROL_BIND_FAILED", format!("{addr}: {e}")).with_cause(e)
    })?;

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _peer)) => {
                        let ctx = Arc::clone(&ctx);
                        let shutting_down = shutdown_rx.borrow().to_owned();
                        tokio::spawn(async move {
                            let _ = handle_connection(stream, ctx, shutting_down).await;
                        });
                    }
                    Err(_) => continue,
                }
            }
        }
    }
    Ok(())
}

async fn handle_connection(stream: TcpStream, ctx: Arc<ControlContext>, shutting_down: bool) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let mut line = String::new();
    let read_result = tokio::time::timeout(CONNECTION_TIMEOUT, reader.read_line(&mut line)).await;

    let response = match read_result {
        Err(_) => ControlResponse::error(400, "read timeout"),
        Ok(Err(e)) => return Err(e),
        Ok(Ok(0)) => ControlResponse::error(400, "empty request"),
        Ok(Ok(_)) if line.len() > MAX_REQUEST_BYTES => ControlResponse::error(400, "request exceeds 1 KiB"),
        Ok(Ok(_)) => {
            if shutting_down {
                ControlResponse::error(503, "shutting down")
            } else {
                match serde_json::from_str::<ControlRequest>(line.trim_end()) {
                    Ok(req) => dispatch(&req, &ctx).await,
                    Err(e) => ControlResponse::error(400, format!("malformed request: {e}")),
                }
            }
        }
    };

    let mut body = serde_json::to_string(&response).unwrap_or_else(|_| {
        r#"{"status_code":500,"status_text":"response serialization failed"}"#.to_string()
    });
    body.push('\n');

    let _ = tokio::time::timeout(CONNECTION_TIMEOUT, write_half.write_all(body.as_bytes())).await;
    Ok(())
}

async fn dispatch(req: &ControlRequest, ctx: &ControlContext) -> ControlResponse {
    match req.command.as_str() {
        "status" => {
            let pool = ctx.pool.read().await;
            let stats = pool.stats();
            let last_persist = *ctx.last_persist.read().await;
            ControlResponse::ok(serde_json::json!({
                "entropy_bytes": stats.total_bytes,
                "max_entropy": stats.max_entropy,
                "chunk_count": stats.chunk_count,
                "is_full": stats.total_bytes >= stats.max_entropy,
                "last_persist": last_persist,
            }))
        }
        "persist" => match do_persist(ctx).await {
            Ok((bytes_written, persist_time)) => ControlResponse::ok(serde_json::json!({
                "bytes_written": bytes_written,
                "file_path": ctx.pool_path.display().to_string(),
                "persist_time": persist_time,
            })),
            Err(e) => ControlResponse::error(500, e.to_string()),
        },
        "quit" => {
            let uptime = (chrono::Utc::now() - ctx.started_at).num_seconds().max(0);
            let _ = ctx.shutdown_tx.send(true);
            ControlResponse::ok(serde_json::json!({
                "message": "shutting down",
                "uptime_seconds": uptime,
            }))
        }
        _ => ControlResponse::error(404, format!("unknown command '{}'", req.command)),
    }
}

async fn do_persist(ctx: &ControlContext) -> Result<(usize, chrono::DateTime<chrono::Utc>), EgdError> {
    let pool = ctx.pool.read().await;
    let image_bytes = crate::format::encode(&pool.to_image());
    drop(pool);

    crate::pool::persist_image(&ctx.pool_path, &image_bytes)
        .await
        .map_err(|e| EgdError::new(ErrorCategory::Temporary, "control", "PERSIST_FAILED", e.to_string()).with_cause(e))?;

    let now = chrono::Utc::now();
    *ctx.last_persist.write().await = Some(now);
    Ok((image_bytes.len(), now))
}

/// Encodes binary data for a `Control message`'s `data` field, per the
/// base64-in-transit invariant. No currently-implemented command emits raw
/// bytes; this is exercised directly by unit tests.
pub fn encode_binary_data(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

pub fn decode_binary_data(text: &str) -> Result<Vec<u8>, EgdError> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD
        .decode(text)
        .map_err(|e| EgdError::new(ErrorCategory::Permanent, "control", "BASE64_DECODE_FAILED", e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_data_round_trips() {
        let original = vec![0u8, 1, 2, 255, 254, 253];
        let encoded = encode_binary_data(&original);
        let decoded = decode_binary_data(&encoded).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn malformed_base64_is_rejected() {
        assert!(decode_binary_data("not valid base64!!").is_err());
    }

    #[tokio::test]
    async fn status_command_reports_pool_stats() {
        let pool = Arc::new(RwLock::new(EntropyPool::new(100, 10)));
        pool.write().await.deposit(&[1, 2, 3]);
        let (shutdown_tx, _rx) = watch::channel(false);
        let ctx = ControlContext {
            pool,
            pool_path: std::path::PathBuf::from("/tmp/unused"),
            last_persist: Arc::new(RwLock::new(None)),
            started_at: chrono::Utc::now(),
            shutdown_tx,
        };
        let req = ControlRequest { command: "status".to_string(), args: Default::default() };
        let resp = dispatch(&req, &ctx).await;
        assert_eq!(resp.status_code, 200);
        assert_eq!(resp.data.unwrap()["entropy_bytes"], 3);
    }

    #[tokio::test]
    async fn unknown_command_is_404() {
        let pool = Arc::new(RwLock::new(EntropyPool::new(100, 10)));
        let (shutdown_tx, _rx) = watch::channel(false);
        let ctx = ControlContext {
            pool,
            pool_path: std::path::PathBuf::from("/tmp/unused"),
            last_persist: Arc::new(RwLock::new(None)),
            started_at: chrono::Utc::now(),
            shutdown_tx,
        };
        let req = ControlRequest { command: "bogus".to_string(), args: Default::default() };
        let resp = dispatch(&req, &ctx).await;
        assert_eq!(resp.status_code, 404);
    }
}
