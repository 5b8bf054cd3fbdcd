use std::path::Path;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio_serial::{DataBits, FlowControl, Parity, SerialStream, StopBits};
use tracing::{debug, info};

use crate::config::SourceConfig;
use crate::error::{BridgeError, Result};

/// Marker line that ends a replay capture.
const REPLAY_END_MARKER: &str = "EOF";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceMode {
    /// Meter on a serial port; running out of input is an error.
    Live,
    /// Capture file; running out of input ends the session normally.
    Replay,
}

/// Line reader over the meter's P1 output.
pub struct TelegramSource {
    reader: Box<dyn tokio::io::AsyncBufRead + Send + Unpin>,
    mode: SourceMode,
    name: String,
    buf: Vec<u8>,
}

impl TelegramSource {
    pub async fn open(config: &SourceConfig) -> Result<Self> {
        match config {
            SourceConfig::Serial { port, baud_rate } => Self::open_serial(port, *baud_rate),
            SourceConfig::Replay { path, .. } => Self::open_replay(path).await,
        }
    }

    /// P1 ports talk 7E1 without flow control.
    fn open_serial(port: &str, baud_rate: u32) -> Result<Self> {
        let builder = tokio_serial::new(port, baud_rate)
            .data_bits(DataBits::Seven)
            .parity(Parity::Even)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None);

        let stream = SerialStream::open(&builder).map_err(|e| BridgeError::SourceUnavailable {
            source_name: port.to_string(),
            error: e.into(),
        })?;
        info!(port, baud_rate, "serial_port_opened");
        Ok(Self::from_reader(stream, SourceMode::Live, port))
    }

    async fn open_replay(path: &Path) -> Result<Self> {
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|error| BridgeError::SourceUnavailable {
                source_name: path.display().to_string(),
                error,
            })?;
        info!(file = %path.display(), "replay_file_opened");
        Ok(Self::from_reader(
            file,
            SourceMode::Replay,
            path.display().to_string(),
        ))
    }

    pub fn from_reader<R>(reader: R, mode: SourceMode, name: impl Into<String>) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self {
            reader: Box::new(BufReader::new(reader)),
            mode,
            name: name.into(),
            buf: Vec::with_capacity(128),
        }
    }

    pub fn mode(&self) -> SourceMode {
        self.mode
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Next line without its line ending.
    ///
    /// `Ok(None)` means the replay is over; a live source reports the end of
    /// its input as [`BridgeError::SourceReadFailure`].
    pub async fn next_line(&mut self) -> Result<Option<String>> {
        self.buf.clear();
        let read = self
            .reader
            .read_until(b'\n', &mut self.buf)
            .await
            .map_err(BridgeError::SourceReadFailure)?;

        if read == 0 {
            return match self.mode {
                SourceMode::Replay => {
                    debug!(source = %self.name, "replay_end_of_file");
                    Ok(None)
                }
                SourceMode::Live => Err(BridgeError::SourceReadFailure(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("{} closed", self.name),
                ))),
            };
        }

        let line = String::from_utf8_lossy(&self.buf).trim_end().to_string();
        if self.mode == SourceMode::Replay && line.starts_with(REPLAY_END_MARKER) {
            debug!(source = %self.name, "simulator_eof_detected");
            return Ok(None);
        }
        Ok(Some(line))
    }
}
