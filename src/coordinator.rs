use std::{sync::Arc, time::Duration};

use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::assembler::FrameAssembler;
use crate::broker::{self, BrokerHandle};
use crate::config::{Config, SourceConfig};
use crate::discovery::DiscoveryAnnouncer;
use crate::error::Result;
use crate::publisher::TelegramPublisher;
use crate::shutdown::{Shutdown, ShutdownReason};
use crate::source::TelegramSource;
use crate::stats::{Counter, StatsReporter, Statistics};

/// Client library reported in the software version message.
pub const MQTT_LIBRARY: &str = "rumqttc";

/// Upper bound on waiting for each worker task during shutdown.
const WORKER_GRACE: Duration = Duration::from_secs(5);
/// Time for the `offline` status to reach the broker before it is stopped.
const OFFLINE_GRACE: Duration = Duration::from_secs(1);
const BROKER_GRACE: Duration = Duration::from_secs(5);

/// Payload of `<prefix>/sw-version`.
pub fn version_payload() -> String {
    format!("main={}; mqtt={MQTT_LIBRARY}", env!("CARGO_PKG_VERSION"))
}

/// Coordinates the worker tasks
/// Builds every worker from one configuration and runs the ordered unwind
pub struct Coordinator {
    config: Config,
    stats: Arc<Statistics>,
    shutdown: Shutdown,
}

impl Coordinator {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            stats: Statistics::new(),
            shutdown: Shutdown::new(),
        }
    }

    pub fn shutdown(&self) -> Shutdown {
        self.shutdown.clone()
    }

    pub fn stats(&self) -> Arc<Statistics> {
        self.stats.clone()
    }

    /// Connects to the configured broker, opens the configured source and
    /// runs until shutdown.
    pub async fn run(self) -> ShutdownReason {
        let (broker, broker_task) =
            broker::spawn(&self.config.mqtt, self.stats.clone(), self.shutdown.clone());
        let source = TelegramSource::open(&self.config.source).await;
        self.run_with(source, broker, broker_task).await
    }

    /// Runs the pipeline over an already started broker connection.
    pub async fn run_with(
        self,
        source: Result<TelegramSource>,
        broker: BrokerHandle,
        broker_task: JoinHandle<()>,
    ) -> ShutdownReason {
        info!(
            production = self.config.production,
            mqtt_maxrate = self.config.mqtt.max_rate,
            stats_interval = self.config.stats_interval.as_secs(),
            "configuration_loaded"
        );
        let reporter = StatsReporter::start(self.stats.clone(), self.config.stats_interval);

        broker.set_status(self.config.status_topic(), "online", true);
        debug!(status = "online", "meter_status_updated");
        broker.publish(self.config.version_topic(), version_payload(), true);

        let workers = match source {
            Ok(source) => self.start_workers(source, &broker),
            Err(e) => {
                self.stats.increment(Counter::SerialErrors);
                self.shutdown.fatal(&e);
                Vec::new()
            }
        };

        self.shutdown.workers_stopped().await;
        info!("graceful_shutdown_initiated");

        for worker in workers {
            if tokio::time::timeout(WORKER_GRACE, worker).await.is_err() {
                warn!("worker_stop_timeout");
            }
        }
        reporter.stop().await;

        broker.set_status(self.config.status_topic(), "offline", true);
        debug!(status = "offline", "meter_status_updated");
        tokio::time::sleep(OFFLINE_GRACE).await;

        self.shutdown.stop_broker();
        if tokio::time::timeout(BROKER_GRACE, broker_task).await.is_err() {
            warn!("broker_stop_timeout");
        }

        let reason = self.shutdown.reason().unwrap_or(ShutdownReason::Signal);
        info!(reason = ?reason, "shutdown_complete");
        reason
    }

    fn start_workers(&self, source: TelegramSource, broker: &BrokerHandle) -> Vec<JoinHandle<()>> {
        let (handoff_tx, handoff_rx) = mpsc::channel(1);

        let pause = match &self.config.source {
            SourceConfig::Replay { interval, .. } => *interval,
            SourceConfig::Serial { .. } => Duration::ZERO,
        };

        let publisher = TelegramPublisher::new(
            handoff_rx,
            broker.clone(),
            &self.config.mqtt,
            self.stats.clone(),
            self.shutdown.clone(),
        );
        let discovery = DiscoveryAnnouncer::new(
            broker.clone(),
            &self.config.discovery,
            &self.config.mqtt,
            env!("CARGO_PKG_VERSION"),
            self.shutdown.clone(),
        );
        let assembler =
            FrameAssembler::new(source, handoff_tx, self.stats.clone(), self.shutdown.clone())
                .with_pause(pause);

        let workers = vec![publisher.spawn(), discovery.spawn(), assembler.spawn()];
        info!("all_workers_started");
        workers
    }
}
