mod cli;

use std::process::ExitCode;
use std::sync::Arc;

use catalog::{Catalog, Cron, VecRowSource};
use clap::Parser;
use common::config::Config;
use common::log::{init_logging, LogTarget, LoggingOptions};
use engine::Engine;
use tracing::{error, info};

use crate::cli::CliArgs;

#[tokio::main]
async fn main() -> ExitCode {
    let args = CliArgs::parse();
    init_logging(LoggingOptions::new(args.debug, LogTarget::Stdout));

    let config = match Config::from_file(&args.config) {
        Ok(c) => c,
        Err(e) => {
            error!(path = ?args.config, error = %e, "failed to load configuration");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = config.validate() {
        error!(error = %e, "invalid configuration");
        return ExitCode::FAILURE;
    }

    let catalog = match Catalog::new(config) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!(error = %e, "failed to build catalog");
            return ExitCode::FAILURE;
        }
    };

    if args.check {
        let schema = String::from_utf8_lossy(&catalog.schema_json()).into_owned();
        println!("configuration OK, resolved schema:\n{schema}");
        return ExitCode::SUCCESS;
    }

    // Database drivers are outside this core's scope (spec §1); the
    // reference binary wires up the deterministic mock so the server is
    // runnable end to end without a live database.
    let source: Arc<dyn catalog::RowSource> = Arc::new(VecRowSource::new());

    let cron = Arc::new(Cron::new(catalog.clone(), source));
    info!("performing initial load of configured tables");
    cron.initial_load().await;

    // QUIT is one of the three shutdown triggers (spec §5), alongside
    // SIGINT/SIGTERM and a fatal error; sharing this handle with the
    // engine means a QUIT on any one connection tears down the whole
    // process, not just that connection's listener.
    let cron_stop = cron.stop_handle();
    let engine = Arc::new(Engine::new(catalog, cron_stop.clone()));
    let engine_stop = engine.stop_handle();

    let cron_task = tokio::spawn(cron.clone().run());
    let mut engine_task = tokio::spawn({
        let engine = engine.clone();
        async move {
            if let Err(e) = engine.serve().await {
                error!(error = %e, "connection engine exited with an error");
            }
        }
    });

    // Race the OS signal wait against the engine task finishing on its
    // own (a connection sent QUIT and already notified both stop
    // handles). Without this race, a QUIT-triggered shutdown would leave
    // `main` blocked forever waiting for a signal that never arrives.
    let quit_triggered = tokio::select! {
        _ = wait_for_shutdown_signal() => false,
        _ = &mut engine_task => true,
    };

    if quit_triggered {
        info!("quit received on a connection, shutting down");
    } else {
        info!("shutdown signal received, draining connections and cron");
        engine_stop.notify_waiters();
        cron_stop.notify_one();
    }

    let _ = cron_task.await;
    if !quit_triggered {
        let _ = engine_task.await;
    }

    info!("shutdown complete");
    ExitCode::SUCCESS
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
