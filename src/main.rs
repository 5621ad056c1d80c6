use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ratewarden::config::{LoggingConfig, RatewardenConfig};
use ratewarden::http::ThrottledClient;
use ratewarden::ratelimit::{parse_limit_list, system_clock, RegistryDirectory};
use ratewarden::simulate::{self, SimulatedServer};

#[derive(Debug, Parser)]
#[command(name = "ratewarden", version, about)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Drive a simulated rate limited API through the limiter
    Simulate(SimulateArgs),
    /// Print the effective configuration
    ShowConfig,
}

#[derive(Debug, Args)]
struct SimulateArgs {
    /// Total number of requests to send
    #[arg(long, default_value_t = 100)]
    requests: usize,

    /// Maximum requests in flight at once
    #[arg(long, default_value_t = 10)]
    concurrency: usize,

    /// Operation name used for every request
    #[arg(long, default_value = "getMatch")]
    operation: String,

    /// Target the requests are sent to
    #[arg(long, default_value = "simulated")]
    target: String,

    /// Upper bound of the simulated server latency
    #[arg(long, default_value_t = 50)]
    latency_ms: u64,

    /// Application limits the server enforces, as `limit:secs,...`
    #[arg(long, default_value = "20:1,100:120")]
    app_limit: String,

    /// Operation limits the server enforces, as `limit:secs,...`
    #[arg(long, default_value = "500:10")]
    method_limit: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = RatewardenConfig::load(cli.config.as_deref())
        .context("Failed to load configuration")?;
    init_tracing(&config.logging);

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::ShowConfig => {
            print!("{}", serde_yaml::to_string(&config)?);
        }
        Command::Simulate(args) => run_simulation(config, args).await?,
    }

    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run_simulation(config: RatewardenConfig, args: SimulateArgs) -> anyhow::Result<()> {
    let app_rules = parse_limit_list(&args.app_limit).context("Invalid --app-limit")?;
    let method_rules = parse_limit_list(&args.method_limit).context("Invalid --method-limit")?;

    let clock = system_clock();
    let directory = RegistryDirectory::with_clock(config.limiter, clock.clone());
    let client = ThrottledClient::with_clock(directory.registry(&args.target), clock.clone());
    let server = SimulatedServer::new(
        &app_rules,
        &method_rules,
        Duration::from_millis(args.latency_ms),
        clock,
    )?;
    info!(target_key = %args.target, "Simulated server ready");

    let simulation = simulate::run(
        &client,
        &server,
        &args.operation,
        args.requests,
        args.concurrency,
    );

    tokio::select! {
        report = simulation => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        _ = shutdown_signal() => {
            warn!("Simulation interrupted");
        }
    }

    let snapshot = directory.snapshot();
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, stopping");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping");
        }
    }
}
