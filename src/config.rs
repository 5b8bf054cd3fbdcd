use std::{env, path::PathBuf, time::Duration};

use crate::broker::target::BrokerTarget;
use crate::broker::ProtocolGeneration;
use crate::error::{BridgeError, Result};

const DEFAULT_TOPIC_PREFIX: &str = "dsmr";

/// Where telegram lines come from.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceConfig {
    /// P1 port of the meter.
    Serial { port: String, baud_rate: u32 },
    /// Captured telegrams, replayed with a fixed pause between them.
    Replay { path: PathBuf, interval: Duration },
}

#[derive(Debug, Clone, PartialEq)]
pub struct MqttConfig {
    pub target: BrokerTarget,
    pub client_id: String,
    pub qos: u8,
    pub username: String,
    pub password: String,
    pub protocol: ProtocolGeneration,
    pub clean_session: bool,
    /// Ceiling on published telegrams per hour.
    pub max_rate: u32,
    pub topic_prefix: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryConfig {
    pub enabled: bool,
    pub delete_on_exit: bool,
    /// Announcements per hour.
    pub rate: u32,
    /// Appended to discovery identifiers, non-empty in simulation mode.
    pub node_suffix: String,
}

/// Immutable process configuration, built once at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub production: bool,
    pub source: SourceConfig,
    pub mqtt: MqttConfig,
    pub discovery: DiscoveryConfig,
    pub stats_interval: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from any key lookup, e.g. a map in tests.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let production = parse_bool(lookup("DSMR_PRODUCTION"), true);

        let source = if production {
            SourceConfig::Serial {
                port: lookup("SERIAL_PORT").unwrap_or_else(|| "/dev/ttyUSB0".to_string()),
                baud_rate: parse_number(&lookup, "SERIAL_BAUDRATE", 115_200)?,
            }
        } else {
            SourceConfig::Replay {
                path: lookup("DSMR_SIMULATORFILE")
                    .unwrap_or_else(|| "test/dsmr.raw".to_string())
                    .into(),
                interval: Duration::from_millis(parse_number(
                    &lookup,
                    "DSMR_SIMULATOR_INTERVAL_MS",
                    1000,
                )?),
            }
        };

        let target = match lookup("MQTT_URL").filter(|url| !url.is_empty()) {
            Some(url) => BrokerTarget::from_url(&url)?,
            None => {
                let mut target = BrokerTarget::tcp(
                    lookup("MQTT_BROKER").unwrap_or_else(|| "192.168.1.1".to_string()),
                    parse_number(&lookup, "MQTT_PORT", 1883)?,
                );
                if let Some(path) = lookup("MQTT_WS_PATH").filter(|p| !p.is_empty()) {
                    target = target.with_websocket_path(path);
                }
                target
            }
        };

        let qos: u8 = parse_number(&lookup, "MQTT_QOS", 1)?;
        if qos > 2 {
            return Err(BridgeError::Config(format!("MQTT_QOS must be 0..=2, got {qos}")));
        }

        let max_rate: u32 = parse_number(&lookup, "MQTT_MAXRATE", 60)?;
        if !(1..=3600).contains(&max_rate) {
            return Err(BridgeError::Config(format!(
                "MQTT_MAXRATE must be 1..=3600, got {max_rate}"
            )));
        }

        let protocol = match lookup("MQTT_PROTOCOL") {
            Some(value) => value.parse()?,
            None => ProtocolGeneration::V5,
        };

        let mut topic_prefix =
            lookup("MQTT_TOPIC_PREFIX").unwrap_or_else(|| DEFAULT_TOPIC_PREFIX.to_string());
        let client_id;
        let node_suffix;
        if production {
            client_id = lookup("MQTT_CLIENT_ID").unwrap_or_else(|| "mqtt-dsmr".to_string());
            node_suffix = String::new();
        } else {
            // Keep simulated data away from the real meter's topics
            if topic_prefix == DEFAULT_TOPIC_PREFIX {
                topic_prefix = format!("test_{DEFAULT_TOPIC_PREFIX}");
            }
            client_id = "mqtt-dsmr-test".to_string();
            node_suffix = "TEST".to_string();
        }

        let discovery_rate: u32 = parse_number(&lookup, "HA_DISCOVERY_RATE", 12)?;
        if discovery_rate == 0 {
            return Err(BridgeError::Config("HA_DISCOVERY_RATE must be > 0".into()));
        }

        Ok(Self {
            production,
            source,
            mqtt: MqttConfig {
                target,
                client_id,
                qos,
                username: lookup("MQTT_USERNAME").unwrap_or_default(),
                password: lookup("MQTT_PASSWORD").unwrap_or_default(),
                protocol,
                clean_session: parse_bool(lookup("MQTT_CLEAN_SESSION"), true),
                max_rate,
                topic_prefix,
            },
            discovery: DiscoveryConfig {
                enabled: parse_bool(lookup("HA_DISCOVERY"), true),
                delete_on_exit: parse_bool(lookup("HA_DELETECONFIG"), true),
                rate: discovery_rate,
                node_suffix,
            },
            stats_interval: Duration::from_secs(parse_number(
                &lookup,
                "DSMR_STATS_LOG_INTERVAL",
                300,
            )?),
        })
    }

    pub fn status_topic(&self) -> String {
        self.mqtt.status_topic()
    }

    pub fn version_topic(&self) -> String {
        self.mqtt.topic("sw-version")
    }
}

impl MqttConfig {
    /// Topic below the configured prefix.
    pub fn topic(&self, leaf: &str) -> String {
        format!("{}/{leaf}", self.topic_prefix)
    }

    pub fn status_topic(&self) -> String {
        self.topic("status")
    }
}

/// Parses a boolean flag, falling back to `default` when unset.
fn parse_bool(val: Option<String>, default: bool) -> bool {
    match val {
        Some(val) => matches!(
            val.trim().to_ascii_lowercase().as_str(),
            "true" | "1" | "yes" | "on"
        ),
        None => default,
    }
}

fn parse_number<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| BridgeError::Config(format!("{key}=`{raw}`: {e}"))),
        None => Ok(default),
    }
}
