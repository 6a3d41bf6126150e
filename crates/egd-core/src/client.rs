//! Blocking, single-request/single-response TCP client used by the CLI.
//! No async runtime needed for one round-trip per invocation.

use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use crate::error::{EgdError, ErrorCategory};

const TOTAL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Serialize)]
struct RequestWire<'a> {
    command: &'a str,
    args: std::collections::HashMap<String, String>,
}

/// Sends `command` with `args` to the daemon at `addr` and returns the
/// decoded response. Connection failures (refused, unreachable, timeout)
/// are surfaced in human-readable text for the operator.
pub fn send_command(addr: &str, command: &str, args: std::collections::HashMap<String, String>) -> Result<Value, EgdError> {
    let deadline = std::time::Instant::now() + TOTAL_TIMEOUT;

    let mut stream = TcpStream::connect(addr).map_err(|e| connect_error(addr, e))?;
    stream
        .set_read_timeout(Some(TOTAL_TIMEOUT))
        .map_err(|e| connect_error(addr, e))?;
    stream
        .set_write_timeout(Some(TOTAL_TIMEOUT))
        .map_err(|e| connect_error(addr, e))?;

    let request = RequestWire { command, args };
    let mut payload = serde_json::to_string(&request)
        .map_err(|e| EgdError::new(ErrorCategory::Permanent, "client", "REQUEST_ENCODE_FAILED", e.to_string()))?;
    payload.push('\n');

    stream
        .write_all(payload.as_bytes())
        .map_err(|e| EgdError::new(ErrorCategory::Temporary, "client", "REQUEST_SEND_FAILED", e.to_string()).with_cause(e))?;

    if std::time::Instant::now() >= deadline {
        return Err(EgdError::temporary("client", "CLIENT_TIMEOUT", "30s total timeout elapsed before reading reply"));
    }

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader
        .read_line(&mut line)
        .map_err(|e| EgdError::new(ErrorCategory::Temporary, "client", "RESPONSE_READ_FAILED", e.to_string()).with_cause(e))?;

    if line.is_empty() {
        return Err(EgdError::temporary("client", "EMPTY_RESPONSE", "daemon closed the connection without replying"));
    }

    serde_json::from_str(line.trim_end())
        .map_err(|e| EgdError::new(ErrorCategory::Permanent, "client", "RESPONSE_DECODE_FAILED", e.to_string()))
}

fn connect_error(addr: &str, e: std::io::Error) -> EgdError {
    let code = match e.kind() {
        std::io::ErrorKind::ConnectionRefused => "CONNECTION_REFUSED",
        std::io::ErrorKind::TimedOut => "CONNECTION_TIMEOUT",
        _ => "CONNECTION_FAILED",
    };
    EgdError::new(ErrorCategory::Temporary, "client", code, format!("{addr}: {e}")).with_cause(e)
}
