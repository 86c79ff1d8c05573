//! assistd - Assistant run lifecycle daemon
//!
//! Main entry point for the daemon binary.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::path::PathBuf;

use assist_core::{Config, ResumePolicy};
use assistd::{Daemon, DaemonConfig};
use clap::Parser;
use eyre::WrapErr;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "assistd", about = "Assistant run lifecycle daemon", version)]
struct Cli {
    /// Port to listen on
    #[arg(short, long, env = "ASSISTD_PORT")]
    port: Option<u16>,

    /// Address to bind the HTTP server to
    #[arg(long)]
    bind: Option<String>,

    /// SQLite database path
    #[arg(long, env = "ASSISTD_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Config file (key=value)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// How runs resume after tool outputs: enqueue or poll
    #[arg(long, value_parser = parse_resume_policy)]
    resume_policy: Option<ResumePolicy>,

    /// Bearer token required on API requests
    #[arg(long, env = "ASSISTD_AUTH_TOKEN", hide_env_values = true)]
    auth_token: Option<String>,
}

fn parse_resume_policy(value: &str) -> Result<ResumePolicy, String> {
    ResumePolicy::parse(value).ok_or_else(|| format!("expected `enqueue` or `poll`, got `{value}`"))
}

impl Cli {
    /// Resolve configuration: CLI flags > config file > defaults.
    fn into_config(self) -> eyre::Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)
                .wrap_err_with(|| format!("failed to load config {}", path.display()))?,
            None => Config::default(),
        };

        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(bind) = self.bind {
            config.bind_address = bind;
        }
        if let Some(db_path) = self.db_path {
            config.db_path = Some(db_path);
        }
        if let Some(policy) = self.resume_policy {
            config.resume_policy = policy;
        }
        if let Some(token) = self.auth_token {
            config.auth_token = Some(token);
        }
        Ok(config)
    }
}

fn main() -> eyre::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing.
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = DaemonConfig::from(cli.into_config()?);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .wrap_err("failed to create tokio runtime")?;

    runtime.block_on(async {
        let daemon = Daemon::new(config).await?;

        // Keep the run future alive across the signal so the server can
        // drain in-flight requests.
        let run = daemon.run();
        tokio::pin!(run);
        tokio::select! {
            result = &mut run => return result,
            signal = shutdown_signal() => signal?,
        }
        daemon.shutdown();
        run.await
    })
}

#[cfg(unix)]
async fn shutdown_signal() -> eyre::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).wrap_err("failed to register SIGTERM handler")?;
    let mut sigint =
        signal(SignalKind::interrupt()).wrap_err("failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigint.recv() => info!("received SIGINT, initiating graceful shutdown"),
        _ = sigterm.recv() => info!("received SIGTERM, initiating graceful shutdown"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> eyre::Result<()> {
    tokio::signal::ctrl_c()
        .await
        .wrap_err("failed to listen for ctrl-c")?;
    info!("received SIGINT, initiating graceful shutdown");
    Ok(())
}
