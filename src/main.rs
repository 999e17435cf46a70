//! Sluice - TCP relay with optional filter commands
//!
//! Listens on a local port and relays every client to a fixed upstream,
//! optionally piping either direction through a shell command.

mod cli;
mod daemon;
mod logging;

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::Parser;
use cli::{Args, Settings};
use daemon::Fork;
use sluice_relay::config::WORKER_STACK_SIZE;
use sluice_relay::{bind_std, exit_code, Listener, StartupError};
use std::process;
use std::time::Duration;
use tracing::{error, info};

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => process::exit(0),
                _ => process::exit(exit_code::SYNTAX_ERROR),
            }
        }
    };

    let settings = match cli::build_settings(args) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            eprintln!("{}", cli::USAGE);
            process::exit(exit_code_for(&e));
        }
    };

    if let Err(e) = logging::init_logging(&settings.log_level, settings.use_syslog) {
        eprintln!("Error: {:#}", e);
        process::exit(exit_code::SYNTAX_ERROR);
    }

    match serve(settings) {
        Ok(()) => process::exit(0),
        Err(e) => {
            error!("Cannot run server: {:#}", e);
            process::exit(exit_code_for(&e));
        }
    }
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<StartupError>()
        .map(StartupError::exit_code)
        .unwrap_or(exit_code::SYNTAX_ERROR)
}

/// Bind, detach unless told to stay in the foreground, then relay until
/// SIGTERM or Ctrl+C.
fn serve(settings: Settings) -> Result<()> {
    let Settings {
        relay, foreground, ..
    } = settings;

    // Bind first so address problems are reported before detaching.
    let std_listener = bind_std(relay.listen_addr())?;

    if !foreground {
        match daemon::detach().map_err(StartupError::Daemonize)? {
            Fork::Parent(pid) => {
                info!("Relay running in the background (pid {})", pid);
                return Ok(());
            }
            Fork::Child => {}
        }
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_stack_size(WORKER_STACK_SIZE)
        .build()
        .context("Failed to start async runtime")?;

    let result = runtime.block_on(async move {
        let mut listener = Listener::from_std(std_listener, relay)?;

        tokio::select! {
            _ = listener.run() => {}
            _ = shutdown_signal() => {
                info!("Shutdown signal received, stopping relay...");
            }
        }

        listener.shutdown();
        Ok::<(), StartupError>(())
    });

    runtime.shutdown_timeout(Duration::from_secs(1));
    result?;

    info!("Relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
