use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use httpmon::config::Config;

/// eBPF-based HTTP transaction monitoring agent.
#[derive(Parser)]
#[command(name = "httpmon", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

/// Build-time version info, injected via RUSTFLAGS or build.rs.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Some(Command::Version) = &cli.command {
        println!("httpmon {}", version::full());
        return Ok(());
    }

    // Initialize tracing.
    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    // Config is required for the main agent run.
    let config_path = cli
        .config
        .context("--config is required (use --help for usage)")?;

    let cfg = Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting httpmon",
    );

    // Build and run the tokio runtime.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg).await })
}

#[cfg(feature = "bpf")]
async fn run(cfg: Config) -> Result<()> {
    use std::sync::Arc;

    use httpmon::health::HealthMetrics;
    use httpmon::monitor::Monitor;
    use httpmon::probe::bpf::BpfProbe;
    use tokio_util::sync::CancellationToken;

    // Set up signal handling.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        let _ = shutdown_tx.send(());
    });

    let health = Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);
    health
        .start()
        .await
        .context("starting health metrics server")?;

    // Load and attach the capture probe.
    let cancel = CancellationToken::new();
    let mut probe = BpfProbe::new(cfg.probe.perf_buffer_pages);
    let (store, notifications) = probe
        .start(&cfg.probe.object_path, cancel.child_token())
        .await
        .context("starting BPF probe")?;

    // Wire up and start the monitor.
    let mut monitor = Monitor::new(&cfg, store, notifications, Arc::clone(&health))
        .context("creating monitor")?;
    monitor.start().await.context("starting monitor")?;

    tracing::info!("httpmon fully started");

    // Wait for shutdown signal.
    let _ = shutdown_rx.await;

    // Graceful shutdown: monitor first (final sweep), then the probe.
    monitor.stop().await;
    cancel.cancel();
    probe.stop().await;

    let residue = monitor.http_stats();
    tracing::info!(endpoints = residue.len(), "final stats discarded on exit");

    health.stop().await?;

    tracing::info!("httpmon stopped");

    Ok(())
}

#[cfg(not(feature = "bpf"))]
async fn run(_cfg: Config) -> Result<()> {
    anyhow::bail!("this build has no probe backend; rebuild with --features bpf")
}
