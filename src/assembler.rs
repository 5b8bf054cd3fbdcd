use std::{sync::Arc, time::Duration};

use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info};

use crate::error::Result;
use crate::shutdown::{Shutdown, ShutdownReason};
use crate::source::TelegramSource;
use crate::stats::{Counter, Statistics};
use crate::telegram::{Telegram, TERMINATOR};

enum Frame {
    Complete(Telegram),
    /// Replay input is over; any partial telegram was dropped.
    SourceFinished,
    Stopped,
}

/// Reads lines into telegrams and hands each one to the publisher.
///
/// The handoff channel has capacity 1 and a slot is reserved before the
/// first line of a telegram is read, so a new telegram is only started
/// once the previous one has been taken.
pub struct FrameAssembler {
    source: TelegramSource,
    handoff: mpsc::Sender<Telegram>,
    stats: Arc<Statistics>,
    shutdown: Shutdown,
    pause: Duration,
    sequence: u64,
}

impl FrameAssembler {
    /// Creates an assembler that numbers telegrams from 1.
    pub fn new(
        source: TelegramSource,
        handoff: mpsc::Sender<Telegram>,
        stats: Arc<Statistics>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            source,
            handoff,
            stats,
            shutdown,
            pause: Duration::ZERO,
            sequence: 0,
        }
    }

    /// Pause after each telegram; replays use it to mimic the meter's cadence.
    pub fn with_pause(mut self, pause: Duration) -> Self {
        self.pause = pause;
        self
    }

    /// Spawns the read loop.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        info!(source = %self.source.name(), mode = ?self.source.mode(), "read_serial_started");

        loop {
            let permit = tokio::select! {
                biased;
                _ = self.shutdown.workers_stopped() => break,
                permit = self.handoff.clone().reserve_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        debug!("handoff_closed");
                        break;
                    }
                },
            };

            match self.next_frame().await {
                Ok(Frame::Complete(telegram)) => {
                    debug!(
                        sequence = telegram.sequence(),
                        lines = telegram.len(),
                        "telegram_received"
                    );
                    self.stats.increment(Counter::TelegramsReceived);
                    permit.send(telegram);
                }
                Ok(Frame::SourceFinished) => {
                    info!(telegrams = self.sequence, "replay_finished");
                    self.shutdown.request(ShutdownReason::SourceFinished);
                    break;
                }
                Ok(Frame::Stopped) => break,
                Err(e) => {
                    self.stats.increment(Counter::SerialErrors);
                    if self.shutdown.report(&e) {
                        break;
                    }
                }
            }

            if !self.pause.is_zero() {
                tokio::select! {
                    biased;
                    _ = self.shutdown.workers_stopped() => break,
                    _ = tokio::time::sleep(self.pause) => {}
                }
            }
        }

        info!("read_serial_stopped");
    }

    async fn next_frame(&mut self) -> Result<Frame> {
        let mut telegram = Telegram::new(self.sequence + 1);

        loop {
            let line = tokio::select! {
                biased;
                _ = self.shutdown.workers_stopped() => return Ok(Frame::Stopped),
                line = self.source.next_line() => line?,
            };
            match line {
                Some(line) if line.starts_with(TERMINATOR) => break,
                Some(line) => telegram.push_line(line),
                None => {
                    if !telegram.is_empty() {
                        debug!(lines = telegram.len(), "partial_telegram_discarded");
                    }
                    return Ok(Frame::SourceFinished);
                }
            }
        }

        self.sequence += 1;
        Ok(Frame::Complete(telegram.complete()))
    }
}
