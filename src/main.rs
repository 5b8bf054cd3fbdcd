use std::process::ExitCode;

use anyhow::Context;
use dsmr_mqtt_bridge::{instance, logging, Config, Coordinator, Shutdown, ShutdownReason};
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    logging::init();

    match run().await {
        Ok(reason) => ExitCode::from(reason.exit_code()),
        Err(e) => {
            error!(error = %format!("{e:#}"), "startup_failed");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<ShutdownReason> {
    let _lock = instance::acquire(instance::LOCK_NAME)?;

    let config = Config::from_env().context("loading configuration")?;
    info!(version = env!("CARGO_PKG_VERSION"), "starting_dsmr_mqtt_bridge");

    let coordinator = Coordinator::new(config);
    tokio::spawn(exit_on_signal(coordinator.shutdown()));

    Ok(coordinator.run().await)
}

async fn exit_on_signal(shutdown: Shutdown) {
    match wait_for_signal().await {
        Ok(signal) => info!(signal, "signal_received"),
        Err(e) => {
            error!(error = %e, "signal_handler_failed");
            return;
        }
    }
    shutdown.request(ShutdownReason::Signal);
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.map(|_| "SIGINT"),
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await.map(|_| "SIGINT")
}
