use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use ratewarden::config::{LogFormat, LoggingConfig, ServiceConfig};
use ratewarden::ratelimit::LimiterRegistry;

#[derive(Parser, Debug)]
#[command(name = "ratewarden", version, about = "Sliding-window-log rate limiter")]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the configured log format
    #[arg(long, value_enum, global = true)]
    log_format: Option<LogFormatArg>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load the configuration and print every policy's windows
    Validate,
    /// Answer `<policy> <key>` lines from stdin with allow/deny
    Replay {
        /// Emit one JSON object per decision
        #[arg(long)]
        json: bool,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum LogFormatArg {
    Text,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Text => LogFormat::Text,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}

#[derive(Serialize)]
struct Decision<'a> {
    policy: &'a str,
    key: &'a str,
    allowed: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = ServiceConfig::load(cli.config.as_deref())?;
    if let Some(format) = cli.log_format {
        config.logging.format = format.into();
    }
    init_tracing(&config.logging);

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let policies = config.rate_limiting.resolve()?;
    let registry = LimiterRegistry::from_config(&policies)?;
    info!(policies = registry.policies().len(), "Configuration loaded");

    match cli.command {
        Command::Validate => validate(&registry),
        Command::Replay { json } => replay(registry, json).await?,
    }

    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    match logging.format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn validate(registry: &LimiterRegistry) {
    for name in registry.policies() {
        if let Some(limiter) = registry.get(name) {
            println!("{}: {}", name, limiter.windows());
        }
    }
}

async fn replay(registry: LimiterRegistry, json: bool) -> anyhow::Result<()> {
    let reapers = registry.spawn_reapers();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = &mut shutdown => break,
        };
        let Some(line) = line else {
            break;
        };
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((policy, key)) = line.split_once(char::is_whitespace) else {
            warn!(line, "Expected `<policy> <key>`");
            continue;
        };
        let key = key.trim();

        let allowed = match registry.check(policy, key) {
            Ok(allowed) => allowed,
            Err(e) => {
                warn!(error = %e, "Skipping line");
                continue;
            }
        };

        let output = if json {
            serde_json::to_string(&Decision {
                policy,
                key,
                allowed,
            })?
        } else {
            format!("{} {} {}", policy, key, if allowed { "allow" } else { "deny" })
        };
        stdout.write_all(output.as_bytes()).await?;
        stdout.write_all(b"\n").await?;
    }
    stdout.flush().await?;

    for reaper in reapers {
        reaper.shutdown().await;
    }
    info!(stats = %serde_json::to_string(&registry.stats())?, "Replay finished");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }
}
