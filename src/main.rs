use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use zmq_receiver::config::Config;
use zmq_receiver::export::health::HealthMetrics;
use zmq_receiver::receiver::Receiver;
use zmq_receiver::sink::file::FileSink;
use zmq_receiver::transport::ZmqChannel;

/// Polls an upstream histogram merger and writes merged snapshots per run.
#[derive(Parser)]
#[command(name = "zmq-receiver", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging filter (trace, debug, info, warn, error). Derived from
    /// `verbose` when absent.
    #[arg(long)]
    log_level: Option<String>,

    /// Option overrides as key=value, e.g. in=REQ>tcp://localhost:60201.
    #[arg(value_name = "KEY=VALUE")]
    options: Vec<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

/// Build-time version info.
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
        println!("zmq-receiver {}", version::full());
        return Ok(());
    }

    let mut cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };
    cfg.apply_options(&cli.options)
        .context("applying command-line options")?;
    cfg.validate().context("validating configuration")?;

    // Initialize tracing.
    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| cfg.log_filter().to_string());
    let filter =
        EnvFilter::try_new(&level).with_context(|| format!("invalid log level: {level}"))?;

    fmt().with_env_filter(filter).with_target(true).init();

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting zmq-receiver",
    );

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(run(cfg))
}

async fn run(cfg: Config) -> Result<()> {
    let cancel = CancellationToken::new();

    // Set up signal handling.
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("registering SIGTERM handler")?;
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("received SIGINT, shutting down");
                }
                _ = sigterm.recv() => {
                    tracing::info!("received SIGTERM, shutting down");
                }
            }
            cancel.cancel();
        });
    }

    let health = Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);
    health
        .start()
        .await
        .context("starting health metrics server")?;

    let inbound = ZmqChannel::new(cfg.input_address()?);
    let control = cfg.control_address()?.map(ZmqChannel::new);
    let sink = FileSink::new(cfg.output.dir_prefix.clone(), cfg.subsystem.clone());

    let mut receiver = Receiver::new(&cfg, inbound, control, sink, Arc::clone(&health));
    let result = receiver.run(cancel).await;

    health.stop().await?;
    result.context("receiver failed")?;

    tracing::info!("zmq-receiver stopped");

    Ok(())
}
