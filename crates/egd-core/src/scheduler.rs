//! Scheduler / Daemon: owns the pool and the source set, ticks sources on
//! their individual intervals, watches for persistence, and drives shutdown.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, RwLock};
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::config::DaemonConfig;
use crate::control::{self, ControlContext};
use crate::error::{EgdError, ErrorCategory};
use crate::lock::LockHandle;
use crate::pool::EntropyPool;
use crate::source::{self, SourceRuntime};

const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// The long-running daemon. Constructed once per `start` invocation.
pub struct Daemon {
    config: DaemonConfig,
    pool: Arc<RwLock<EntropyPool>>,
    runtimes: HashMap<String, Arc<RwLock<SourceRuntime>>>,
    started_at: chrono::DateTime<chrono::Utc>,
    last_persist: Arc<RwLock<Option<chrono::DateTime<chrono::Utc>>>>,
}

impl Daemon {
    pub async fn new(config: DaemonConfig) -> Result<Self, EgdError> {
        let pool = match EntropyPool::load(&config.pool_path, config.max_entropy, config.chunk_capacity).await? {
            Some(pool) => {
                info!(path = %config.pool_path.display(), "loaded persisted pool image");
                pool
            }
            None => {
                info!("no persisted pool image found, starting empty");
                EntropyPool::new(config.max_entropy, config.chunk_capacity)
            }
        };

        let runtimes = config
            .sources
            .iter()
            .map(|s| {
                let mut runtime = SourceRuntime::new(s.init_delay_secs);
                runtime.disabled = s.disabled;
                (s.name.clone(), Arc::new(RwLock::new(runtime)))
            })
            .collect();

        Ok(Self {
            config,
            pool: Arc::new(RwLock::new(pool)),
            runtimes,
            started_at: chrono::Utc::now(),
            last_persist: Arc::new(RwLock::new(None)),
        })
    }

    /// Runs the daemon to completion: acquires the lock, serves the
    /// control port, ticks sources, and shuts down on signal or `quit`.
    /// Returns the process exit code (0 on clean shutdown, nonzero if the
    /// final persist failed).
    pub async fn run(self, lock_path: &std::path::Path, force: bool) -> Result<i32, EgdError> {
        let mut lock = LockHandle::acquire(lock_path, force)?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let ctx = Arc::new(ControlContext {
            pool: Arc::clone(&self.pool),
            pool_path: self.config.pool_path.clone(),
            last_persist: Arc::clone(&self.last_persist),
            started_at: self.started_at,
            shutdown_tx: shutdown_tx.clone(),
        });

        let control_addr = self.config.control_addr.clone();
        let control_ctx = Arc::clone(&ctx);
        let control_shutdown_rx = shutdown_rx.clone();
        let control_task = tokio::spawn(async move { control::serve(&control_addr, control_ctx, control_shutdown_rx).await });

        let result = self.tick_loop(shutdown_tx.clone(), shutdown_rx).await;

        control_task.abort();

        let exit_code = match result {
            Ok(()) => 0,
            Err(e) => {
                warn!(error = %e, "final persist failed during shutdown");
                1
            }
        };

        lock.release();
        Ok(exit_code)
    }

    async fn tick_loop(&self, shutdown_tx: watch::Sender<bool>, mut shutdown_rx: watch::Receiver<bool>) -> Result<(), EgdError> {
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        let in_flight: Arc<tokio::sync::Mutex<std::collections::HashSet<String>>> =
            Arc::new(tokio::sync::Mutex::new(std::collections::HashSet::new()));
        let mut cycle_tasks: JoinSet<()> = JoinSet::new();
        let mut signal_terminate = unix_terminate_signal();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.dispatch_due_sources(&in_flight, &mut cycle_tasks).await;
                    self.maybe_persist().await;
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("received interrupt, shutting down");
                    break;
                }
                _ = wait_for_terminate(&mut signal_terminate) => {
                    info!("received termination signal, shutting down");
                    break;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("received quit command, shutting down");
                        break;
                    }
                }
            }
        }

        let _ = shutdown_tx.send(true);
        cycle_tasks.abort_all();
        while cycle_tasks.join_next().await.is_some() {}

        self.final_persist().await
    }

    async fn dispatch_due_sources(
        &self,
        in_flight: &Arc<tokio::sync::Mutex<std::collections::HashSet<String>>>,
        cycle_tasks: &mut JoinSet<()>,
    ) {
        let now = chrono::Utc::now();
        for source_config in &self.config.sources {
            let runtime = Arc::clone(&self.runtimes[&source_config.name]);
            let due = {
                let r = runtime.read().await;
                r.is_due(now, source_config.interval_secs)
            };
            if !due {
                continue;
            }

            {
                let mut guard = in_flight.lock().await;
                if guard.contains(&source_config.name) {
                    continue;
                }
                guard.insert(source_config.name.clone());
            }

            let pool = Arc::clone(&self.pool);
            let config = source_config.clone();
            let in_flight = Arc::clone(in_flight);

            cycle_tasks.spawn(async move {
                let outcome = source::run_cycle(&config, &mut *runtime.write().await).await;
                if let Some(processed) = outcome.processed {
                    let deposited = pool.write().await.deposit(&processed);
                    if deposited < processed.len() {
                        warn!(source = %config.name, requested = processed.len(), deposited, "pool at capacity, deposit truncated");
                    }
                }
                if outcome.newly_disabled {
                    warn!(source = %config.name, "source disabled after 5 consecutive failures");
                }
                in_flight.lock().await.remove(&config.name);
            });
        }
    }

    async fn maybe_persist(&self) {
        let due = {
            let last = *self.last_persist.read().await;
            match last {
                None => true,
                Some(t) => (chrono::Utc::now() - t).num_seconds() >= self.config.persist_interval_secs as i64,
            }
        };
        if !due {
            return;
        }
        let image_bytes = {
            let pool = self.pool.read().await;
            crate::format::encode(&pool.to_image())
        };
        if let Err(e) = crate::pool::persist_image(&self.config.pool_path, &image_bytes).await {
            warn!(error = %e, "periodic persist failed, will retry next tick");
            return;
        }
        *self.last_persist.write().await = Some(chrono::Utc::now());
    }

    async fn final_persist(&self) -> Result<(), EgdError> {
        let image_bytes = {
            let pool = self.pool.read().await;
            crate::format::encode(&pool.to_image())
        };
        crate::pool::persist_image(&self.config.pool_path, &image_bytes).await
    }
}

fn unix_terminate_signal() -> tokio::signal::unix::Signal {
    tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("installing a SIGTERM handler should not fail")
}

async fn wait_for_terminate(signal: &mut tokio::signal::unix::Signal) {
    signal.recv().await;
}
