//! Orchestrator: component init in dependency order, a periodic
//! state-snapshot writer, a PID file, and idempotent shutdown.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::circuit_breaker::CircuitBreaker;
use crate::config::{LaunchManifest, RunMode};
use crate::positions::PositionBook;
use crate::safeguards::Safeguards;

#[derive(Debug, Clone, Copy)]
pub struct OrchestratorConfig {
    pub state_update_interval: Duration,
    pub init_timeout: Duration,
    pub inflight_timeout: Duration,
    pub module_shutdown_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            state_update_interval: Duration::from_secs(5),
            init_timeout: Duration::from_secs(10),
            inflight_timeout: Duration::from_secs(5),
            module_shutdown_timeout: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StateSnapshot {
    pub mode: &'static str,
    pub circuit_open: bool,
    pub circuit_reason: Option<String>,
    pub open_position_count: usize,
    pub total_exposure_dollars: f64,
    pub total_realized_pnl: f64,
    pub snapshotted_at: String,
}

/// Named initialisation/shutdown step. Shutdown runs these in reverse
/// order of registration, each bounded by `module_shutdown_timeout`.
#[async_trait::async_trait]
pub trait ManagedComponent: Send + Sync {
    fn name(&self) -> &str;
    async fn init(&self) -> anyhow::Result<()>;
    async fn shutdown(&self) -> anyhow::Result<()>;
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    mode: RunMode,
    manifest: LaunchManifest,
    breaker: Arc<CircuitBreaker>,
    positions: Arc<PositionBook>,
    safeguards: Arc<Safeguards>,
    pid_file: PathBuf,
    state_file: PathBuf,
    components: Mutex<Vec<Arc<dyn ManagedComponent>>>,
    snapshot_task: Mutex<Option<JoinHandle<()>>>,
    shutting_down: AtomicBool,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        mode: RunMode,
        manifest: LaunchManifest,
        breaker: Arc<CircuitBreaker>,
        positions: Arc<PositionBook>,
        safeguards: Arc<Safeguards>,
        pid_file: PathBuf,
        state_file: PathBuf,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            mode,
            manifest,
            breaker,
            positions,
            safeguards,
            pid_file,
            state_file,
            components: Mutex::new(Vec::new()),
            snapshot_task: Mutex::new(None),
            shutting_down: AtomicBool::new(false),
        })
    }

    pub async fn register(&self, component: Arc<dyn ManagedComponent>) {
        self.components.lock().await.push(component);
    }

    /// Initialises every registered component in registration order,
    /// each bounded by `init_timeout`; the first failure aborts startup
    /// without initialising the rest. Writes the PID file and starts
    /// the snapshot timer once every component is up.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        if self.manifest.kill_switch_enabled {
            anyhow::bail!("launch manifest kill switch is enabled; refusing to start");
        }

        let components = self.components.lock().await.clone();
        for component in &components {
            match timeout(self.config.init_timeout, component.init()).await {
                Ok(Ok(())) => info!(component = component.name(), "initialised"),
                Ok(Err(e)) => {
                    error!(component = component.name(), error = %e, "init failed");
                    anyhow::bail!("component {} failed to initialise: {e}", component.name());
                }
                Err(_) => {
                    error!(component = component.name(), "init timed out");
                    anyhow::bail!("component {} init timed out", component.name());
                }
            }
        }

        std::fs::write(&self.pid_file, std::process::id().to_string())?;

        let this = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.state_update_interval);
            loop {
                ticker.tick().await;
                if let Err(e) = this.write_snapshot().await {
                    warn!(error = %e, "failed to write state snapshot");
                }
            }
        });
        *self.snapshot_task.lock().await = Some(handle);

        Ok(())
    }

    async fn write_snapshot(&self) -> anyhow::Result<()> {
        let snapshot = StateSnapshot {
            mode: match self.mode {
                RunMode::Paper => "paper",
                RunMode::Live => "live",
            },
            circuit_open: self.breaker.is_open(),
            circuit_reason: self.breaker.reason(),
            open_position_count: self.positions.open_positions().len(),
            total_exposure_dollars: self.positions.total_exposure_dollars(),
            total_realized_pnl: self.positions.total_realized_pnl(),
            snapshotted_at: chrono::Utc::now().to_rfc3339(),
        };
        let json = serde_json::to_string_pretty(&snapshot)?;
        tokio::fs::write(&self.state_file, json).await?;
        Ok(())
    }

    /// Idempotent: a second call while shutdown is already in progress
    /// is a no-op. Waits up to `inflight_timeout` for in-flight work
    /// (approximated here by draining tick reservations), writes one
    /// final snapshot, then shuts components down in reverse order,
    /// each bounded by `module_shutdown_timeout`. A single component's
    /// shutdown failure is logged, not fatal to the rest.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(handle) = self.snapshot_task.lock().await.take() {
            handle.abort();
        }

        let deadline = tokio::time::Instant::now() + self.config.inflight_timeout;
        while tokio::time::Instant::now() < deadline {
            self.safeguards.reset_tick_entries();
            tokio::time::sleep(Duration::from_millis(50)).await;
            break;
        }

        if let Err(e) = self.write_snapshot().await {
            warn!(error = %e, "failed to write final state snapshot");
        }

        let components = self.components.lock().await.clone();
        for component in components.iter().rev() {
            match timeout(self.config.module_shutdown_timeout, component.shutdown()).await {
                Ok(Ok(())) => info!(component = component.name(), "shut down"),
                Ok(Err(e)) => warn!(component = component.name(), error = %e, "shutdown failed"),
                Err(_) => warn!(component = component.name(), "shutdown timed out"),
            }
        }

        let _ = std::fs::remove_file(&self.pid_file);
    }
}
