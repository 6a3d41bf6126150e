//! `Source`: state machine wrapping one configured producer, driving
//! fetch → compress → stir → scale → deposit.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::compressor;
use crate::config::SourceConfig;
use crate::error::EgdError;
use crate::fetch::{self, Acquisition as FetchAcquisition};
use crate::stirrer;

const DISABLE_THRESHOLD: u32 = 5;

/// The source's lifecycle state, mirrored by `SourceRuntime`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceState {
    Idle,
    Due,
    Fetching,
    Processing,
    Deposited,
    FailedOnce,
    Disabled,
}

/// Runtime state for one configured source, owned by the scheduler and
/// shared with the control server for introspection via
/// `Arc<tokio::sync::RwLock<SourceRuntime>>`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SourceRuntime {
    pub state: SourceState,
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub disabled: bool,
    #[serde(skip)]
    pub first_run_deadline: DateTime<Utc>,
}

impl SourceRuntime {
    pub fn new(init_delay_secs: u64) -> Self {
        Self {
            state: SourceState::Idle,
            last_attempt: None,
            last_success: None,
            consecutive_failures: 0,
            disabled: false,
            first_run_deadline: Utc::now() + chrono::Duration::seconds(init_delay_secs as i64),
        }
    }

    /// A source is `Due` when enough time has elapsed since the last
    /// attempt, the initial delay has passed, and it isn't disabled.
    pub fn is_due(&self, now: DateTime<Utc>, interval_secs: u64) -> bool {
        if self.disabled {
            return false;
        }
        if now < self.first_run_deadline {
            return false;
        }
        match self.last_attempt {
            None => true,
            Some(last) => now >= last + chrono::Duration::seconds(interval_secs as i64),
        }
    }

    fn record_attempt(&mut self, now: DateTime<Utc>) {
        self.last_attempt = Some(now);
        self.state = SourceState::Fetching;
    }

    fn record_failure(&mut self, _now: DateTime<Utc>) {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= DISABLE_THRESHOLD {
            self.disabled = true;
            self.state = SourceState::Disabled;
        } else {
            self.state = SourceState::FailedOnce;
        }
    }

    fn record_success(&mut self, now: DateTime<Utc>) {
        self.consecutive_failures = 0;
        self.last_success = Some(now);
        self.state = SourceState::Deposited;
    }
}

/// Outcome of one cycle: bytes to offer the pool, or `None` if the cycle
/// failed (the failure has already been recorded on the runtime).
pub struct CycleOutcome {
    pub processed: Option<Vec<u8>>,
    pub newly_disabled: bool,
}

/// Runs one fetch→compress→stir→scale pass for `config`, updating
/// `runtime`'s counters and state in place. Never panics on a source
/// failure: all errors are absorbed into the runtime's failure policy.
pub async fn run_cycle(config: &SourceConfig, runtime: &mut SourceRuntime) -> CycleOutcome {
    let now = Utc::now();
    runtime.record_attempt(now);

    let timeout = Duration::from_secs(30);
    let result = acquire_for(config, timeout).await.and_then(|acquired| process(config, acquired.bytes));

    match result {
        Ok(processed) => {
            runtime.record_success(Utc::now());
            CycleOutcome { processed: Some(processed), newly_disabled: false }
        }
        Err(_err) => {
            let was_disabled = runtime.disabled;
            runtime.record_failure(Utc::now());
            CycleOutcome { processed: None, newly_disabled: !was_disabled && runtime.disabled }
        }
    }
}

async fn acquire_for(config: &SourceConfig, timeout: Duration) -> Result<fetch::Acquired, EgdError> {
    match &config.acquisition {
        FetchAcquisition::Script { interpreter, body } => {
            let custom_env = source_env_exports(config);
            fetch::fetch_script_with_custom_env(interpreter, body, &custom_env, timeout).await
        }
        other => fetch::acquire(other, config.size, config.min_size, config.insecure_tls, timeout).await,
    }
}

/// Builds the `EGD_SOURCE_<KEY>` environment export list for every
/// configured key on the owning source (standard and custom), uppercased.
fn source_env_exports(config: &SourceConfig) -> Vec<(String, String)> {
    let mut exports = vec![
        ("EGD_SOURCE_NAME".to_string(), config.name.clone()),
        ("EGD_SOURCE_INTERVAL_SECS".to_string(), config.interval_secs.to_string()),
        ("EGD_SOURCE_SCALE".to_string(), config.scale.to_string()),
        ("EGD_SOURCE_NO_COMPRESS".to_string(), config.no_compress.to_string()),
        ("EGD_SOURCE_INIT_DELAY_SECS".to_string(), config.init_delay_secs.to_string()),
        ("EGD_SOURCE_DISABLED".to_string(), config.disabled.to_string()),
        ("EGD_SOURCE_INSECURE_TLS".to_string(), config.insecure_tls.to_string()),
    ];
    if let Some(size) = config.size {
        exports.push(("EGD_SOURCE_SIZE".to_string(), size.to_string()));
    }
    if let Some(min_size) = config.min_size {
        exports.push(("EGD_SOURCE_MIN_SIZE".to_string(), min_size.to_string()));
    }
    exports.extend(
        config
            .custom
            .iter()
            .map(|(k, v)| (format!("EGD_SOURCE_{}", k.to_uppercase()), v.to_string())),
    );
    exports
}

fn process(config: &SourceConfig, raw: Vec<u8>) -> Result<Vec<u8>, EgdError> {
    let compressed = if config.no_compress { raw } else { compressor::compress(&raw) };
    let stirred = stirrer::stir(&compressed);
    let scaled_count = ((config.scale * stirred.len() as f64).floor() as usize).min(stirred.len());
    Ok(stirred[..scaled_count].to_vec())
}
