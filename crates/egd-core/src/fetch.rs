//! Acquisition: pulls raw bytes from a source's configured method.
//!
//! URL fetch uses a manual chunked read loop (`reqwest::Response::chunk()`)
//! wrapped in a per-chunk `tokio::time::timeout`, re-armed after every byte
//! received — `reqwest::ClientBuilder::timeout` only bounds the request as
//! a whole and can't express "reset the ceiling on any byte".

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command as TokioCommand;

use crate::config::Acquisition;
use crate::error::{EgdError, ErrorCategory};

const USER_AGENT: &str = "EGD-Rust/1.0";
const URL_TOTAL_CEILING: Duration = Duration::from_secs(60);
const SCRIPT_WALLCLOCK: Duration = Duration::from_secs(30);

/// Bytes acquired from a source cycle, before compression/stirring.
pub struct Acquired {
    pub bytes: Vec<u8>,
    pub limit_exceeded: bool,
}

/// Bounded capture buffer for subprocess stdout — mirrors the pattern used
/// for bounding in-flight output elsewhere in this crate: once `max_bytes`
/// is reached, further writes are dropped and `limit_exceeded` is set
/// rather than growing unbounded or erroring the whole cycle.
#[derive(Default)]
struct OutputBuffer {
    data: Vec<u8>,
    max_bytes: usize,
    limit_exceeded: bool,
}

impl OutputBuffer {
    fn new(max_bytes: usize) -> Self {
        Self { data: Vec::new(), max_bytes, limit_exceeded: false }
    }

    fn push(&mut self, chunk: &[u8]) {
        if self.data.len() >= self.max_bytes {
            self.limit_exceeded = true;
            return;
        }
        let room = self.max_bytes - self.data.len();
        if chunk.len() > room {
            self.data.extend_from_slice(&chunk[..room]);
            self.limit_exceeded = true;
        } else {
            self.data.extend_from_slice(chunk);
        }
    }

    fn into_acquired(self) -> Acquired {
        Acquired { bytes: self.data, limit_exceeded: self.limit_exceeded }
    }
}

const DEFAULT_STDOUT_CAP: usize = 1024 * 1024;

/// Runs the configured acquisition method and returns the raw bytes
/// captured, truncated per `size`/stdout-cap semantics. `size`/`min_size`
/// are applied only to URL and File fetches, per the source contract.
pub async fn acquire(
    acquisition: &Acquisition,
    size: Option<u64>,
    min_size: Option<u64>,
    insecure_tls: bool,
    timeout: Duration,
) -> Result<Acquired, EgdError> {
    match acquisition {
        Acquisition::Url { url, prefetch } => {
            fetch_url(url, prefetch.as_deref(), size, min_size, insecure_tls).await
        }
        Acquisition::File { path } => fetch_file(path, size).await,
        Acquisition::Command { argv } => fetch_command(argv).await,
        Acquisition::Script { interpreter, body } => fetch_script(interpreter, body, timeout).await,
    }
}

async fn fetch_url(
    url: &str,
    prefetch: Option<&str>,
    size: Option<u64>,
    min_size: Option<u64>,
    insecure_tls: bool,
) -> Result<Acquired, EgdError> {
    let client = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .danger_accept_invalid_certs(insecure_tls)
        .build()
        .map_err(|e| EgdError::new(ErrorCategory::Fatal, "fetch", "HTTP_CLIENT_BUILD_FAILED", e.to_string()))?;

    if let Some(prefetch_url) = prefetch {
        // Fetched and discarded to let the server establish session state;
        // prefetch failures are not fatal to the primary fetch.
        let _ = read_with_reset_timeout(&client, prefetch_url, None).await;
    }

    let cap = size.map(|s| s as usize);
    let acquired = read_with_reset_timeout(&client, url, cap).await?;

    if let Some(min) = min_size {
        if (acquired.bytes.len() as u64) < min {
            return Err(EgdError::temporary(
                "fetch",
                "URL_BELOW_MIN_SIZE",
                format!("received {} bytes, below min_size {min}", acquired.bytes.len()),
            ));
        }
    }

    Ok(acquired)
}

async fn read_with_reset_timeout(
    client: &reqwest::Client,
    url: &str,
    cap: Option<usize>,
) -> Result<Acquired, EgdError> {
    let mut response = client
        .get(url)
        .send()
        .await
        .map_err(|e| classify_reqwest_error("fetch", "URL_REQUEST_FAILED", e))?;

    if let Err(status_err) = response.error_for_status_ref() {
        let category = if status_err.status().map(|s| s.is_client_error()).unwrap_or(false) {
            ErrorCategory::Permanent
        } else {
            ErrorCategory::Temporary
        };
        return Err(EgdError::new(category, "fetch", "URL_BAD_STATUS", status_err.to_string()));
    }

    let mut buffer = OutputBuffer::new(cap.unwrap_or(usize::MAX));
    loop {
        let next = tokio::time::timeout(URL_TOTAL_CEILING, response.chunk())
            .await
            .map_err(|_| EgdError::temporary("fetch", "URL_TIMEOUT", "no byte received within the ceiling"))?
            .map_err(|e| classify_reqwest_error("fetch", "URL_STREAM_FAILED", e))?;

        match next {
            Some(chunk) => {
                buffer.push(&chunk);
                if let Some(c) = cap {
                    if buffer.data.len() >= c {
                        break;
                    }
                }
            }
            None => break,
        }
    }

    Ok(buffer.into_acquired())
}

fn classify_reqwest_error(component: &'static str, code: &'static str, e: reqwest::Error) -> EgdError {
    let category = if e.is_timeout() || e.is_connect() {
        ErrorCategory::Temporary
    } else if e.status().map(|s| s.is_client_error()).unwrap_or(false) {
        ErrorCategory::Permanent
    } else {
        ErrorCategory::Temporary
    };
    EgdError::new(category, component, code, e.to_string())
}

async fn fetch_file(path: &Path, size: Option<u64>) -> Result<Acquired, EgdError> {
    let metadata = tokio::fs::metadata(path).await.map_err(|e| classify_io_error("fetch", "FILE_STAT_FAILED", e))?;
    if !(metadata.is_file() || is_fifo(&metadata)) {
        return Err(EgdError::permanent("fetch", "FILE_NOT_REGULAR", format!("{} is not a regular file or pipe", path.display())));
    }

    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| classify_io_error("fetch", "FILE_OPEN_FAILED", e))?;

    let mut buffer = OutputBuffer::new(size.map(|s| s as usize).unwrap_or(usize::MAX));
    let mut chunk = vec![0u8; 64 * 1024];
    loop {
        let n = file
            .read(&mut chunk)
            .await
            .map_err(|e| classify_io_error("fetch", "FILE_READ_FAILED", e))?;
        if n == 0 {
            break;
        }
        buffer.push(&chunk[..n]);
        if buffer.data.len() >= buffer.max_bytes {
            break;
        }
    }
    Ok(buffer.into_acquired())
}

#[cfg(unix)]
fn is_fifo(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::FileTypeExt;
    metadata.file_type().is_fifo()
}

#[cfg(not(unix))]
fn is_fifo(_metadata: &std::fs::Metadata) -> bool {
    false
}

fn classify_io_error(component: &'static str, code: &'static str, e: std::io::Error) -> EgdError {
    let category = match e.kind() {
        std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => ErrorCategory::Permanent,
        _ => ErrorCategory::Temporary,
    };
    EgdError::new(category, component, code, e.to_string()).with_cause(e)
}

/// Command sources get a minimal, inherited-but-narrowed environment: no
/// `EGD_SOURCE_*` export, since that contract is specified for scripts.
async fn fetch_command(argv: &[String]) -> Result<Acquired, EgdError> {
    let (program, args) = argv.split_first().expect("validated non-empty argv");

    let output = TokioCommand::new(program)
        .args(args)
        .envs(minimal_env())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .await
        .map_err(|e| classify_io_error("fetch", "COMMAND_SPAWN_FAILED", e))?;

    if !output.status.success() {
        return Err(EgdError::permanent(
            "fetch",
            "COMMAND_NONZERO_EXIT",
            format!("{program:?} exited with {:?}", output.status.code()),
        ));
    }

    let mut buffer = OutputBuffer::new(DEFAULT_STDOUT_CAP);
    buffer.push(&output.stdout);
    Ok(buffer.into_acquired())
}

fn minimal_env() -> Vec<(String, String)> {
    let mut env = Vec::new();
    if let Ok(path) = std::env::var("PATH") {
        env.push(("PATH".to_string(), path));
    }
    if let Ok(home) = std::env::var("HOME") {
        env.push(("HOME".to_string(), home));
    }
    if let Ok(tmp) = std::env::var("TMPDIR") {
        env.push(("TMPDIR".to_string(), tmp));
    } else {
        env.push(("TMPDIR".to_string(), "/tmp".to_string()));
    }
    env
}

/// Writes `body` to an owner-only file inside a fresh secure working
/// directory, runs `interpreter` against it with the `EGD_SOURCE_*`
/// environment contract, and enforces the wall-clock kill with
/// process-group termination on timeout. The working directory is removed
/// unconditionally via `TempDir`'s `Drop` when this function returns.
pub async fn fetch_script_with_custom_env(
    interpreter: &str,
    body: &str,
    custom_env: &[(String, String)],
    timeout: Duration,
) -> Result<Acquired, EgdError> {
    run_script(interpreter, body, custom_env, timeout).await
}

async fn fetch_script(interpreter: &str, body: &str, timeout: Duration) -> Result<Acquired, EgdError> {
    run_script(interpreter, body, &[], timeout).await
}

async fn run_script(
    interpreter: &str,
    body: &str,
    custom_env: &[(String, String)],
    timeout: Duration,
) -> Result<Acquired, EgdError> {
    let dir = tempfile::Builder::new()
        .prefix("egd-src-")
        .tempdir()
        .map_err(|e| EgdError::new(ErrorCategory::Temporary, "fetch", "SCRIPT_WORKDIR_FAILED", e.to_string()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o700))
            .map_err(|e| EgdError::new(ErrorCategory::Temporary, "fetch", "SCRIPT_WORKDIR_FAILED", e.to_string()))?;
    }

    let script_path = dir.path().join("script");
    tokio::fs::write(&script_path, body)
        .await
        .map_err(|e| classify_io_error("fetch", "SCRIPT_WRITE_FAILED", e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o600))
            .await
            .map_err(|e| classify_io_error("fetch", "SCRIPT_WRITE_FAILED", e))?;
    }

    let wall_clock = timeout.min(SCRIPT_WALLCLOCK).max(Duration::from_secs(1));

    let mut command = TokioCommand::new(interpreter);
    command
        .arg(&script_path)
        .current_dir(dir.path())
        .envs(minimal_env())
        .envs(custom_env.iter().cloned())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());

    #[cfg(unix)]
    unsafe {
        use std::os::unix::process::CommandExt;
        command.pre_exec(|| {
            nix::unistd::setsid().map(|_| ()).map_err(std::io::Error::from)
        });
    }

    let mut child = command.spawn().map_err(|e| classify_io_error("fetch", "SCRIPT_SPAWN_FAILED", e))?;
    let mut stdout = child.stdout.take().expect("stdout piped");

    let mut buffer = OutputBuffer::new(DEFAULT_STDOUT_CAP);
    let mut chunk = vec![0u8; 64 * 1024];

    let run = async {
        loop {
            let n = stdout.read(&mut chunk).await.map_err(|e| classify_io_error("fetch", "SCRIPT_READ_FAILED", e))?;
            if n == 0 {
                break;
            }
            buffer.push(&chunk[..n]);
        }
        child.wait().await.map_err(|e| classify_io_error("fetch", "SCRIPT_WAIT_FAILED", e))
    };

    match tokio::time::timeout(wall_clock, run).await {
        Ok(Ok(status)) => {
            if !status.success() {
                return Err(EgdError::temporary(
                    "fetch",
                    "SCRIPT_NONZERO_EXIT",
                    format!("{interpreter} exited with {:?}", status.code()),
                ));
            }
        }
        Ok(Err(e)) => return Err(e),
        Err(_) => {
            kill_process_group(&child);
            let _ = child.wait().await;
            return Err(EgdError::temporary("fetch", "SCRIPT_TIMEOUT", format!("exceeded {wall_clock:?} wall clock")));
        }
    }

    if buffer.limit_exceeded {
        return Err(EgdError::temporary(
            "fetch",
            "SCRIPT_STDOUT_OVERFLOW",
            format!("script stdout exceeded {DEFAULT_STDOUT_CAP} bytes"),
        ));
    }

    Ok(buffer.into_acquired())
}

#[cfg(unix)]
fn kill_process_group(child: &tokio::process::Child) {
    if let Some(pid) = child.id() {
        let pgid = nix::unistd::Pid::from_raw(pid as i32);
        let _ = nix::sys::signal::killpg(pgid, nix::sys::signal::Signal::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_process_group(child: &tokio::process::Child) {
    let _ = child;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_buffer_truncates_and_flags_overflow() {
        let mut buffer = OutputBuffer::new(4);
        buffer.push(&[1, 2, 3]);
        assert!(!buffer.limit_exceeded);
        buffer.push(&[4, 5, 6]);
        assert!(buffer.limit_exceeded);
        assert_eq!(buffer.data, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn file_fetch_truncates_to_size() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        use std::io::Write;
        tmp.write_all(b"0123456789").unwrap();
        let acquired = fetch_file(tmp.path(), Some(4)).await.unwrap();
        assert_eq!(acquired.bytes, b"0123");
        assert!(acquired.limit_exceeded);
    }

    #[tokio::test]
    async fn command_source_captures_stdout() {
        let acquired = fetch_command(&["echo".to_string(), "hello".to_string()]).await.unwrap();
        assert_eq!(String::from_utf8_lossy(&acquired.bytes).trim(), "hello");
    }

    #[tokio::test]
    async fn command_source_reports_nonzero_exit_as_permanent() {
        let err = fetch_command(&["false".to_string()]).await.unwrap_err();
        assert_eq!(err.category, ErrorCategory::Permanent);
    }

    #[tokio::test]
    async fn script_source_exports_custom_env() {
        let acquired = run_script(
            "/bin/sh",
            "echo $EGD_SOURCE_FOO",
            &[("EGD_SOURCE_FOO".to_string(), "bar".to_string())],
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(String::from_utf8_lossy(&acquired.bytes).trim(), "bar");
    }

    #[tokio::test]
    async fn script_stdout_overflow_is_a_temporary_error() {
        let script = format!("head -c {} /dev/zero", DEFAULT_STDOUT_CAP + 1024);
        let err = run_script("/bin/sh", &script, &[], Duration::from_secs(5)).await.unwrap_err();
        assert_eq!(err.category, ErrorCategory::Temporary);
        assert_eq!(err.code, "SCRIPT_STDOUT_OVERFLOW");
    }
}
