//! Cadence
//!
//! Command-line host for media library maintenance jobs.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use cadence::config::CadenceConfig;
use cadence::{App, logging, scan};
use cadence_runtime::JobOutcome;

/// Media library maintenance host
#[derive(Parser, Debug)]
#[command(name = "cadence", version)]
#[command(about = "Plugin-driven background jobs for a media library", long_about = None)]
struct Args {
    /// Path to the config file (defaults to ./cadence.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Import media files into the library
    Scan {
        /// Directories to scan (defaults to library.media_roots)
        dirs: Vec<PathBuf>,
    },

    /// List plugins in registration order
    Plugins,

    /// Show the status of every job
    Jobs,

    /// Run jobs and wait for them to finish
    Run {
        /// Job identifiers, run in the given order
        #[arg(required_unless_present = "all")]
        jobs: Vec<String>,

        /// Run every installed job, in plugin order
        #[arg(long, conflicts_with = "jobs")]
        all: bool,
    },

    /// Run the background scheduler until interrupted
    Daemon,

    /// Print the effective configuration
    Config,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = CadenceConfig::load(args.config.as_deref())?;
    logging::init(&config.logging)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?
        .block_on(async_main(args.command, config))
}

async fn async_main(command: Command, config: CadenceConfig) -> Result<()> {
    if let Command::Config = command {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    info!("Starting Cadence v{}", env!("CARGO_PKG_VERSION"));
    let app = App::new(config)?;

    match command {
        Command::Scan { dirs } => run_scan(&app, dirs).await,
        Command::Plugins => {
            print_plugins(&app);
            Ok(())
        }
        Command::Jobs => {
            print_jobs(&app);
            Ok(())
        }
        Command::Run { jobs, all } => {
            let jobs = if all { app.ordered_job_ids() } else { jobs };
            run_jobs(&app, &jobs).await
        }
        Command::Daemon => {
            let shutdown = CancellationToken::new();
            tokio::spawn(shutdown_signal(shutdown.clone()));
            app.run_daemon(shutdown).await?;
            info!("Daemon shutdown complete");
            Ok(())
        }
        Command::Config => Ok(()),
    }
}

async fn run_scan(app: &App, dirs: Vec<PathBuf>) -> Result<()> {
    let roots = if dirs.is_empty() {
        app.config().library.media_roots.clone()
    } else {
        dirs
    };
    if roots.is_empty() {
        bail!("No directories given and library.media_roots is empty");
    }

    let library = Arc::clone(app.library());
    let report = tokio::task::spawn_blocking(move || scan::scan(&library, &roots))
        .await
        .context("Scan task failed")??;

    println!(
        "Discovered {} media files: {} imported, {} already known, {} errors",
        report.discovered, report.imported, report.already_known, report.errors
    );
    Ok(())
}

fn print_plugins(app: &App) {
    let installed = app.installed();
    for (entry, plugin) in app.plugin_entries().iter().zip(app.plugins()) {
        let state = if installed.disabled.contains(&entry.identifier) {
            "disabled"
        } else {
            "enabled"
        };
        println!("{:>4}  {:<22} {:<9} {}", entry.order, entry.identifier, state, plugin.name());
    }
}

fn print_jobs(app: &App) {
    for status in app.manager().get_all_job_status() {
        let last = status
            .last_run
            .map(|run| format!("{} at {}", run.outcome, run.finished_at.to_rfc3339()))
            .unwrap_or_else(|| "never run".to_string());
        let state = if status.is_running { "running" } else { "idle" };
        println!("{:<26} {:<8} {}", status.id, state, last);
        if !status.description.is_empty() {
            println!("    {}", status.description);
        }
    }
}

async fn run_jobs(app: &App, jobs: &[String]) -> Result<()> {
    let mut unsuccessful = 0;
    for (job_id, outcome) in app.run_jobs(jobs).await {
        match outcome {
            Some(JobOutcome::Succeeded) => println!("{job_id}: succeeded"),
            Some(outcome) => {
                println!("{job_id}: {outcome}");
                unsuccessful += 1;
            }
            None => {
                println!("{job_id}: unknown job");
                unsuccessful += 1;
            }
        }
    }

    if unsuccessful > 0 {
        bail!("{unsuccessful} job(s) did not succeed");
    }
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down...");
        },
    }

    shutdown.cancel();
}
