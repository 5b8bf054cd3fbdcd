use std::sync::{Arc, Mutex};

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{error, info, warn};

use crate::error::BridgeError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Interrupt or terminate request from outside.
    Signal,
    /// Replay input ran out.
    SourceFinished,
    Fatal(String),
}

impl ShutdownReason {
    pub fn exit_code(&self) -> u8 {
        match self {
            ShutdownReason::Signal | ShutdownReason::SourceFinished => 0,
            ShutdownReason::Fatal(_) => 1,
        }
    }
}

/// Process-wide stop signal.
///
/// Two stages: `workers` stops reader, publisher and discovery; `broker`
/// stops the MQTT connection, which runs last so it can flush. The first
/// recorded reason wins.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    workers: CancellationToken,
    broker: CancellationToken,
    reason: Arc<Mutex<Option<ShutdownReason>>>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self, reason: ShutdownReason) {
        {
            let mut slot = self.reason.lock().unwrap_or_else(|e| e.into_inner());
            if slot.is_none() {
                info!(reason = ?reason, "shutdown_requested");
                *slot = Some(reason);
            }
        }
        self.workers.cancel();
    }

    pub fn fatal(&self, err: &BridgeError) {
        error!(error = %err, "fatal_error");
        self.request(ShutdownReason::Fatal(err.to_string()));
    }

    /// Shuts down on a fatal error and only logs the others.
    /// Returns whether shutdown was requested.
    pub fn report(&self, err: &BridgeError) -> bool {
        if err.is_fatal() {
            self.fatal(err);
            return true;
        }
        warn!(error = %err, "recoverable_error");
        false
    }

    pub fn stop_broker(&self) {
        self.broker.cancel();
    }

    /// Sets both stop flags without recording a reason.
    pub fn stop_all(&self) {
        self.workers.cancel();
        self.broker.cancel();
    }

    pub fn workers_stopped(&self) -> WaitForCancellationFuture<'_> {
        self.workers.cancelled()
    }

    pub fn broker_stopped(&self) -> WaitForCancellationFuture<'_> {
        self.broker.cancelled()
    }

    pub fn is_stopping(&self) -> bool {
        self.workers.is_cancelled()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}
