use std::sync::Arc;

use tokio::{sync::mpsc, task::JoinHandle, time::Instant};
use tracing::{debug, info, warn};

use crate::broker::BrokerHandle;
use crate::config::MqttConfig;
use crate::dsmr;
use crate::error::BridgeError;
use crate::rate_limiter::RateLimiter;
use crate::shutdown::Shutdown;
use crate::stats::{Counter, Statistics};
use crate::telegram::Telegram;

/// Turns telegrams from the handoff slot into one MQTT message per known field.
pub struct TelegramPublisher {
    handoff: mpsc::Receiver<Telegram>,
    broker: BrokerHandle,
    config: MqttConfig,
    limiter: RateLimiter,
    stats: Arc<Statistics>,
    shutdown: Shutdown,
}

impl TelegramPublisher {
    /// Creates a publisher limited to `config.max_rate` telegrams per hour.
    pub fn new(
        handoff: mpsc::Receiver<Telegram>,
        broker: BrokerHandle,
        config: &MqttConfig,
        stats: Arc<Statistics>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            handoff,
            broker,
            limiter: RateLimiter::per_hour(config.max_rate),
            config: config.clone(),
            stats,
            shutdown,
        }
    }

    /// Spawns the publisher loop.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        info!(
            max_rate = self.config.max_rate,
            interval_seconds = self.limiter.interval().as_secs_f64(),
            "parser_started"
        );

        loop {
            // A telegram already in the slot is still published after a stop
            let telegram = tokio::select! {
                biased;
                telegram = self.handoff.recv() => match telegram {
                    Some(telegram) => telegram,
                    None => break,
                },
                _ = self.shutdown.workers_stopped() => break,
            };
            self.handle(telegram, Instant::now());
        }

        info!("parser_stopped");
    }

    /// Publishes the fields of `telegram` if the rate limit allows it.
    /// Returns the number of messages handed to the broker.
    pub fn handle(&mut self, telegram: Telegram, now: Instant) -> usize {
        if !self.limiter.admit(now) {
            debug!(sequence = telegram.sequence(), "telegram_rate_limited");
            return 0;
        }
        self.stats.increment(Counter::TelegramsParsed);

        let mut published = 0;
        for reading in telegram.readings() {
            let Some(field) = dsmr::lookup(reading.code) else {
                continue;
            };
            match field.decode(&reading) {
                Some(value) => {
                    self.broker
                        .publish(self.config.topic(field.tag), value.to_payload(), false);
                    published += 1;
                }
                None => {
                    let err = BridgeError::ParseMismatch {
                        code: reading.code.to_string(),
                        value: reading.value.to_string(),
                    };
                    warn!(error = %err, "parse_error");
                    self.stats.increment(Counter::ParseErrors);
                }
            }
        }
        debug!(sequence = telegram.sequence(), published, "telegram_published");
        published
    }
}
