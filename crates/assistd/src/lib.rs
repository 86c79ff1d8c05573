//! assistd - Assistant run lifecycle daemon
//!
//! Library components for the daemon process: storage, the task queue,
//! the run controller behind the HTTP API, and the worker contract used
//! by run executors.

pub mod controller;
pub mod queue;
pub mod server;
pub mod storage;
pub mod worker;

use std::path::PathBuf;
use std::sync::Arc;

use assist_core::{Config, ResumePolicy};
use controller::RunController;
use eyre::WrapErr;
use queue::{SqliteQueue, TaskQueue};
use server::AppState;
use storage::Storage;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use worker::Worker;

/// Daemon configuration, resolved from CLI flags, config file and defaults.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub db_path: PathBuf,
    pub bind_address: String,
    pub port: u16,
    pub auth_token: Option<String>,
    pub max_connections: u32,
    pub job_name: String,
    pub resume_policy: ResumePolicy,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self::from(Config::default())
    }
}

impl From<Config> for DaemonConfig {
    fn from(config: Config) -> Self {
        Self {
            db_path: config.db_path.unwrap_or_else(default_db_path),
            bind_address: config.bind_address,
            port: config.port,
            auth_token: config.auth_token,
            max_connections: config.max_connections,
            job_name: config.job_name,
            resume_policy: config.resume_policy,
        }
    }
}

/// Get the default database path (~/.local/share/assistd/assistd.db).
pub fn default_db_path() -> PathBuf {
    let data_dir = std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".local/share")
        });
    data_dir.join("assistd").join("assistd.db")
}

/// Daemon state.
#[derive(Debug)]
pub struct Daemon {
    config: DaemonConfig,
    storage: Storage,
    queue: Arc<dyn TaskQueue>,
    controller: RunController,
    shutdown: CancellationToken,
}

impl Daemon {
    /// Open the database, apply migrations and wire up the controller.
    pub async fn new(config: DaemonConfig) -> eyre::Result<Self> {
        let storage = Storage::new(&config.db_path, config.max_connections)
            .await
            .wrap_err_with(|| format!("failed to open database {}", config.db_path.display()))?;
        storage
            .migrate_embedded()
            .await
            .wrap_err("failed to apply migrations")?;

        let queue: Arc<dyn TaskQueue> = Arc::new(SqliteQueue::new(storage.pool().clone()));
        let controller = RunController::new(
            storage.clone(),
            Arc::clone(&queue),
            config.job_name.clone(),
            config.resume_policy,
        );

        Ok(Self {
            config,
            storage,
            queue,
            controller,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn controller(&self) -> &RunController {
        &self.controller
    }

    /// Worker handle for an executor running in this process.
    pub fn worker(&self) -> Worker {
        Worker::new(
            self.storage.clone(),
            Arc::clone(&self.queue),
            self.config.job_name.clone(),
        )
    }

    /// Recover orphaned runs, then serve HTTP until shutdown.
    pub async fn run(&self) -> eyre::Result<()> {
        info!(
            "assistd starting on {}:{}",
            self.config.bind_address, self.config.port
        );
        info!("database: {}", self.config.db_path.display());
        info!(
            "job: {}, resume policy: {}",
            self.config.job_name,
            self.config.resume_policy.as_str()
        );
        if self.config.auth_token.is_some() {
            info!("auth token: enabled");
        }

        if let Err(e) = self.controller.recover_queued_runs().await {
            warn!("failed to recover queued runs: {}", e);
        }

        let state = Arc::new(AppState {
            controller: self.controller.clone(),
            auth_token: self.config.auth_token.clone(),
        });
        server::start_server(
            state,
            &self.config.bind_address,
            self.config.port,
            self.shutdown.clone(),
        )
        .await
        .map_err(|e| eyre::eyre!("HTTP server error: {e}"))?;

        info!("assistd stopped");
        Ok(())
    }

    /// Signal the daemon to stop serving.
    pub fn shutdown(&self) {
        info!("shutdown requested");
        self.shutdown.cancel();
    }
}
