// src/main.rs
use anyhow::{Context, Result};
use clap::Parser;
use harbr_balancer::{load_config, metrics, Engine};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Multi-protocol load balancer
#[derive(Parser, Debug)]
#[command(name = "harbr-balancer", author, version, about)]
struct Args {
    /// YAML configuration file
    #[arg(short, long, env = "CONFIG_FILE", default_value = "config.yml")]
    config: PathBuf,

    /// Serve Prometheus metrics on this address
    #[arg(long)]
    metrics_addr: Option<SocketAddr>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

fn init_tracing(args: &Args) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},harbr_balancer={}", args.log_level, args.log_level)));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if args.log_json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args);

    let config = load_config(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if args.check {
        config.validate()?;
        info!(config = %args.config.display(), "Configuration is valid");
        return Ok(());
    }

    if let Some(addr) = args.metrics_addr {
        metrics::init_metrics(addr)?;
        info!(%addr, "Prometheus exporter listening");
    }

    let engine = Engine::start(config).await?;
    wait_for_shutdown(&engine, &args.config).await;
    engine.shutdown().await;
    Ok(())
}

/// Serve until CTRL+C or SIGTERM; SIGHUP reloads the configuration file and
/// SIGUSR1 logs a runtime snapshot.
#[cfg(unix)]
async fn wait_for_shutdown(engine: &Engine, path: &Path) {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigterm, mut sighup, mut sigusr1) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::hangup()),
        signal(SignalKind::user_defined1()),
    ) {
        (Ok(term), Ok(hup), Ok(usr1)) => (term, hup, usr1),
        _ => {
            warn!("Failed to register signal handlers, only CTRL+C is honoured");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received CTRL+C signal");
                return;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM signal");
                return;
            }
            _ = sighup.recv() => {
                info!(config = %path.display(), "Received SIGHUP, reloading");
                match load_config(path).and_then(|config| engine.reload(config)) {
                    Ok(()) => {}
                    Err(e) => error!(error = %e, "Reload rejected, keeping current configuration"),
                }
            }
            _ = sigusr1.recv() => {
                info!(snapshot = ?engine.snapshot(), "Runtime snapshot");
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_engine: &Engine, _path: &Path) {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Received CTRL+C signal");
    }
}
