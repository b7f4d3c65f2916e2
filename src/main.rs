use std::process::ExitCode;

use clap::{Parser, Subcommand};

use storefront_agent::db::queries::DownloadQueries;
use storefront_agent::models::{Download, PackageSignal};
use storefront_agent::services::package_system::{status, CallbackReceiver};
use storefront_agent::{build_state, logging, AgentConfig, AgentError, AgentState, Result};

#[derive(Parser)]
#[command(name = "storefront-agent", version, about = "Catalog download and install agent")]
struct Cli {
    /// Debug-level console logging for one-shot commands
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Host the download pipeline until Ctrl-C
    Run,
    /// Enroll this device with an enrollment code
    Enroll { code: String },
    /// Forget stored credentials
    Logout,
    /// Print the catalog endpoint, optionally re-running discovery
    Endpoint {
        #[arg(long)]
        refresh: bool,
    },
    /// Queue a package for download and install
    Enqueue {
        package: String,
        #[arg(long)]
        update: bool,
    },
    /// Cancel a package's download and delete its files
    Cancel { package: String },
    /// Cancel every queued download
    CancelAll {
        #[arg(long)]
        updates_only: bool,
    },
    /// Show the download table
    List,
    /// Remove completed rows, or every finished row with --all
    Clear {
        #[arg(long)]
        all: bool,
    },
    /// Retry the install of a completed download
    Retry { package: String },
    /// Report that a package was removed from the device
    Uninstalled { package: String },
    /// Keep a package's record across uninstalls
    Favorite {
        package: String,
        #[arg(long)]
        off: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = AgentConfig::from_env();

    let logged = match cli.command {
        Command::Run => logging::init(&config.log_dir),
        _ => logging::init_stderr(cli.verbose),
    };
    if let Err(err) = logged {
        eprintln!("logging unavailable: {err}");
    }

    match execute(cli.command, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{}", err);
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn execute(command: Command, config: AgentConfig) -> Result<()> {
    let (state, callbacks) = build_state(config)?;

    match command {
        Command::Run => run(state, callbacks).await,
        Command::Enroll { code } => {
            let enrollment = state.auth.enroll(&code).await?;
            println!("enrolled as device {}", enrollment.device_uuid);
            Ok(())
        }
        Command::Logout => {
            state.auth.logout()?;
            println!("credentials cleared");
            Ok(())
        }
        Command::Endpoint { refresh } => {
            if refresh {
                state.endpoints.clear_cache();
            }
            println!("{}", state.endpoints.get_base_url().await);
            Ok(())
        }
        Command::Enqueue { package, update } => enqueue(&state, &package, update).await,
        Command::Cancel { package } => {
            if state.queue.cancel(&package)? {
                println!("cancelled {package}");
            } else {
                println!("nothing to cancel for {package}");
            }
            Ok(())
        }
        Command::CancelAll { updates_only } => {
            let cancelled = state.queue.cancel_all(updates_only)?;
            println!("cancelled {} queued downloads", cancelled.len());
            Ok(())
        }
        Command::List => {
            for download in state.queue.list()? {
                print_row(&download);
            }
            Ok(())
        }
        Command::Clear { all } => {
            let removed = if all {
                state.queue.clear_all()?
            } else {
                state.queue.clear_completed()?
            };
            println!("removed {removed} rows");
            Ok(())
        }
        Command::Retry { package } => retry(&state, callbacks, &package).await,
        Command::Uninstalled { package } => uninstalled(&state, callbacks, &package).await,
        Command::Favorite { package, off } => {
            if state.reconciler.set_favorite(&package, !off)? {
                println!("{package} favorite: {}", !off);
            } else {
                println!("no catalog record for {package}");
            }
            Ok(())
        }
    }
}

async fn run(state: AgentState, callbacks: CallbackReceiver) -> Result<()> {
    let mut updates = state.installer.subscribe_status();
    let mut tasks = state.start(callbacks)?;
    tasks.push(tokio::spawn(async move {
        while let Ok(update) = updates.recv().await {
            tracing::info!(
                "install outcome for {}: success={} session={} {}",
                update.package_name,
                update.success,
                update.download_session_id,
                update.error_message.as_deref().unwrap_or("")
            );
        }
    }));
    if let Some(active) = state.db.active_download()? {
        tracing::info!("resuming with {} {}", active.package_name, active.status);
    }
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");
    state.shutdown(tasks);
    Ok(())
}

async fn enqueue(state: &AgentState, package: &str, update: bool) -> Result<()> {
    let mut download = match state.catalog.app_details(package).await {
        Ok(details) => {
            state.reconciler.upsert_from_catalog(&details)?;
            let mut download = Download::new(
                package,
                &details.name,
                details.latest_version.as_deref().unwrap_or_default(),
                details.latest_version_code,
            );
            download.icon = details.icon;
            download
        }
        Err(err) => {
            tracing::warn!("catalog details for {} unavailable: {}", package, err);
            Download::new(package, package, "", 0)
        }
    };
    if update {
        download = download.as_update();
    }
    let row = state.queue.enqueue(download)?;
    println!("{} {}", row.package_name, row.status);
    Ok(())
}

/// Retries in-process and waits for the installer's verdict.
async fn retry(state: &AgentState, mut callbacks: CallbackReceiver, package: &str) -> Result<()> {
    let mut events = state.bus.subscribe();
    if !state.installer.retry_install(package).await? {
        println!("install of {package} did not start");
        return Ok(());
    }
    while let Some(signal) = callbacks.recv().await {
        let settled = match &signal {
            PackageSignal::Install(callback) => callback.status != status::PENDING_USER_ACTION,
            PackageSignal::Removed { .. } => false,
        };
        state.installer.handle_signal(signal)?;
        if settled {
            break;
        }
    }
    if let Some(event) = events.recv().await {
        state.reconciler.handle_event(&event).await?;
        println!("{event:?}");
    }
    Ok(())
}

/// Feeds a removal through the signal channel and applies it to the catalog.
async fn uninstalled(
    state: &AgentState,
    mut callbacks: CallbackReceiver,
    package: &str,
) -> Result<()> {
    let mut events = state.bus.subscribe();
    state
        .signals
        .send(PackageSignal::Removed {
            package_name: package.to_string(),
        })
        .await
        .map_err(|_| AgentError::Install("package signal channel closed".to_string()))?;
    if let Some(signal) = callbacks.recv().await {
        state.installer.handle_signal(signal)?;
    }
    if let Some(event) = events.recv().await {
        state.reconciler.handle_event(&event).await?;
        println!("{event:?}");
    }
    Ok(())
}

fn print_row(download: &Download) {
    println!(
        "{:<40} {:<12} {:>3}% {:>10} {}",
        download.package_name,
        download.status,
        download.progress,
        download.version,
        download.error_message.as_deref().unwrap_or("")
    );
}
