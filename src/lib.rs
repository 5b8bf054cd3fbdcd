//! DSMR to MQTT bridge library
//!
//! This library reads telegrams from the P1 port of a DSMR smart meter and
//! publishes every known field to an MQTT broker, together with Home Assistant
//! discovery metadata.

pub mod assembler;
pub mod broker;
pub mod config;
pub mod coordinator;
pub mod discovery;
pub mod dsmr;
pub mod error;
pub mod instance;
pub mod logging;
pub mod publisher;
pub mod rate_limiter;
pub mod shutdown;
pub mod source;
pub mod stats;
pub mod telegram;

// Re-export commonly used types for easier access
pub use assembler::FrameAssembler;
pub use broker::{BrokerConnection, BrokerHandle};
pub use config::Config;
pub use coordinator::Coordinator;
pub use discovery::DiscoveryAnnouncer;
pub use error::BridgeError;
pub use publisher::TelegramPublisher;
pub use shutdown::{Shutdown, ShutdownReason};
pub use source::TelegramSource;
pub use telegram::Telegram;
