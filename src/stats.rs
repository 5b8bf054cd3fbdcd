use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use serde_derive::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    TelegramsReceived,
    TelegramsParsed,
    MqttMessagesSent,
    MqttErrors,
    ParseErrors,
    SerialErrors,
}

/// Point-in-time copy of all counters.
#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub telegrams_received: u64,
    pub telegrams_parsed: u64,
    pub mqtt_messages_sent: u64,
    pub mqtt_errors: u64,
    pub parse_errors: u64,
    pub serial_errors: u64,
}

impl StatsSnapshot {
    fn slot(&mut self, counter: Counter) -> &mut u64 {
        match counter {
            Counter::TelegramsReceived => &mut self.telegrams_received,
            Counter::TelegramsParsed => &mut self.telegrams_parsed,
            Counter::MqttMessagesSent => &mut self.mqtt_messages_sent,
            Counter::MqttErrors => &mut self.mqtt_errors,
            Counter::ParseErrors => &mut self.parse_errors,
            Counter::SerialErrors => &mut self.serial_errors,
        }
    }
}

/// Counters shared by every worker. Purely observational.
#[derive(Debug, Default)]
pub struct Statistics {
    counters: Mutex<StatsSnapshot>,
}

impl Statistics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn increment(&self, counter: Counter) {
        self.add(counter, 1);
    }

    pub fn add(&self, counter: Counter, count: u64) {
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        *counters.slot(counter) += count;
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.counters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn log(&self) {
        let stats = self.snapshot();
        info!(
            telegrams_received = stats.telegrams_received,
            telegrams_parsed = stats.telegrams_parsed,
            mqtt_messages_sent = stats.mqtt_messages_sent,
            mqtt_errors = stats.mqtt_errors,
            parse_errors = stats.parse_errors,
            serial_errors = stats.serial_errors,
            "statistics"
        );
    }
}

/// Periodic statistics logger. A zero interval disables the periodic part.
pub struct StatsReporter {
    stop: CancellationToken,
    task: Option<JoinHandle<()>>,
    stats: Arc<Statistics>,
}

impl StatsReporter {
    pub fn start(stats: Arc<Statistics>, interval: Duration) -> Self {
        let stop = CancellationToken::new();
        if interval.is_zero() {
            info!("statistics_logging_disabled");
            return Self {
                stop,
                task: None,
                stats,
            };
        }

        info!(interval_seconds = interval.as_secs(), "statistics_logging_started");
        let task_stats = stats.clone();
        let task_stop = stop.clone();
        let task = tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    _ = task_stop.cancelled() => break,
                    _ = ticker.tick() => task_stats.log(),
                }
            }
        });
        Self {
            stop,
            task: Some(task),
            stats,
        }
    }

    /// Stops the reporter and logs the final counters.
    pub async fn stop(mut self) {
        self.stop.cancel();
        if let Some(task) = self.task.take() {
            let _ = tokio::time::timeout(Duration::from_secs(2), task).await;
        }
        self.stats.log();
    }
}
