//! # Switchyard: gateway dispatch core
//!
//! Usage:
//!   switchyard serve                      # Start the gateway (default port 18790)
//!   switchyard serve --port 9000          # Custom port
//!   switchyard check-config               # Validate the config file and exit
//!   switchyard jobs list                  # List cron jobs on a running gateway
//!   switchyard jobs runs daily --limit 5  # Recent runs of one job
//!   switchyard jobs run daily             # Force-run a job now

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use switchyard_core::SwitchyardConfig;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "switchyard",
    version,
    about = "🚦 Switchyard: session routing, worker pool and cron dispatch"
)]
struct Cli {
    /// Config file (default: ~/.switchyard/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the gateway server
    Serve {
        /// Override the configured port
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Validate the config file and print a summary
    CheckConfig,
    /// Inspect cron jobs on a running gateway
    Jobs {
        /// Gateway base URL (default: from config)
        #[arg(long)]
        url: Option<String>,

        #[command(subcommand)]
        action: JobsAction,
    },
}

#[derive(Subcommand)]
enum JobsAction {
    /// List jobs with status and last run
    List,
    /// Show recent runs of a job
    Runs {
        id: String,
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Trigger a job now
    Run { id: String },
}

fn init_logging(verbose: bool, json: bool) {
    let filter = if verbose {
        "switchyard=debug,switchyard_gateway=debug,switchyard_pool=debug,switchyard_scheduler=debug,tower_http=debug"
    } else {
        "switchyard=info,switchyard_gateway=info,switchyard_pool=info,switchyard_scheduler=info"
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .init();
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<SwitchyardConfig> {
    let config = match path {
        Some(path) => SwitchyardConfig::load_from(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => SwitchyardConfig::load().context("loading default config")?,
    };
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_json);

    match cli.command {
        Command::Serve { port } => {
            let mut config = load_config(cli.config.as_ref())?;
            if let Some(port) = port {
                config.gateway.port = port;
            }
            tracing::info!("🚦 Switchyard v{} starting", env!("CARGO_PKG_VERSION"));
            switchyard_gateway::start(config).await
        }
        Command::CheckConfig => {
            let config = load_config(cli.config.as_ref())?;
            println!("✅ Config OK");
            println!("   Gateway:   http://{}:{}", config.gateway.host, config.gateway.port);
            println!("   Data dir:  {}", config.gateway.data_dir().display());
            println!(
                "   Agents:    {} (default: {})",
                config
                    .routing
                    .agents
                    .iter()
                    .map(|a| a.id.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
                config.routing.default_agent
            );
            println!(
                "   Pool:      {}..{} workers, `{} {}`",
                config.pool.min,
                config.pool.max,
                config.pool.command,
                config.pool.args.join(" ")
            );
            println!(
                "   Queue:     {} per session, {} global",
                config.queue.max_per_session, config.queue.global_max_pending
            );
            println!(
                "   Scheduler: {} (tick {}ms, run timeout {}ms)",
                if config.scheduler.enabled { "enabled" } else { "disabled" },
                config.scheduler.tick_interval_ms,
                config.scheduler.run_timeout_ms
            );
            Ok(())
        }
        Command::Jobs { url, action } => {
            let base = match url {
                Some(url) => url,
                None => {
                    let config = load_config(cli.config.as_ref())?;
                    format!("http://{}:{}", config.gateway.host, config.gateway.port)
                }
            };
            jobs_command(base.trim_end_matches('/'), action).await
        }
    }
}

async fn jobs_command(base: &str, action: JobsAction) -> Result<()> {
    let client = reqwest::Client::new();
    let response = match &action {
        JobsAction::List => client.get(format!("{base}/jobs")).send().await,
        JobsAction::Runs { id, limit } => {
            client
                .get(format!("{base}/jobs/{id}/runs?limit={limit}"))
                .send()
                .await
        }
        JobsAction::Run { id } => client.post(format!("{base}/jobs/{id}/run")).send().await,
    }
    .with_context(|| format!("gateway at {base} is not reachable"))?;

    let status = response.status();
    let body: serde_json::Value = response.json().await.context("gateway returned non-JSON")?;
    if !status.is_success() {
        anyhow::bail!(
            "{} ({status})",
            body["error"].as_str().unwrap_or("request failed")
        );
    }

    match action {
        JobsAction::List => {
            let jobs = body["jobs"].as_array().cloned().unwrap_or_default();
            if jobs.is_empty() {
                println!("No jobs.");
            }
            for job in jobs {
                let last = job["lastRun"]["status"].as_str().unwrap_or("-");
                println!(
                    "{:<24} {:<7} {:<6} {:<20} next={} last={}",
                    job["id"].as_str().unwrap_or("?"),
                    job["status"].as_str().unwrap_or("?"),
                    job["schedule"]["kind"].as_str().unwrap_or("?"),
                    job["schedule"]["expr"].as_str().unwrap_or("?"),
                    job["nextRun"].as_str().unwrap_or("-"),
                    last
                );
            }
        }
        JobsAction::Runs { id, .. } => {
            let runs = body["runs"].as_array().cloned().unwrap_or_default();
            if runs.is_empty() {
                println!("No runs for {id}.");
            }
            for run in runs {
                println!(
                    "#{:<6} {:<10} {:<26} {:>8}ms {}",
                    run["runId"],
                    run["status"].as_str().unwrap_or("?"),
                    run["triggeredAt"].as_str().unwrap_or("?"),
                    run["durationMs"].as_u64().map(|d| d.to_string()).unwrap_or_else(|| "-".into()),
                    run["error"].as_str().or(run["resultPreview"].as_str()).unwrap_or("")
                );
            }
        }
        JobsAction::Run { id } => {
            println!("🔔 Triggered {id} (run {})", body["runId"]);
        }
    }
    Ok(())
}
