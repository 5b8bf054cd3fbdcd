//! Home Assistant MQTT discovery.
//!
//! Every known field is announced as a sensor with a retained config message
//! under `homeassistant/sensor/<node_id>/<tag>/config`. The set is
//! re-announced periodically so a restarted broker picks the device up again.

use std::time::Duration;

use serde_derive::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broker::BrokerHandle;
use crate::config::{DiscoveryConfig, MqttConfig};
use crate::dsmr::{Field, FIELDS};
use crate::shutdown::Shutdown;

const DISCOVERY_PREFIX: &str = "homeassistant";

#[derive(Debug, Serialize)]
struct SensorConfig<'a> {
    name: &'a str,
    unique_id: String,
    state_topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    unit_of_measurement: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    device_class: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    state_class: Option<&'a str>,
    availability_topic: String,
    payload_available: &'a str,
    payload_not_available: &'a str,
    device: Device<'a>,
}

#[derive(Debug, Serialize)]
struct Device<'a> {
    identifiers: [String; 1],
    name: String,
    manufacturer: &'a str,
    model: &'a str,
    sw_version: &'a str,
}

pub struct DiscoveryAnnouncer {
    broker: BrokerHandle,
    discovery: DiscoveryConfig,
    mqtt: MqttConfig,
    sw_version: String,
    shutdown: Shutdown,
}

impl DiscoveryAnnouncer {
    pub fn new(
        broker: BrokerHandle,
        discovery: &DiscoveryConfig,
        mqtt: &MqttConfig,
        sw_version: impl Into<String>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            broker,
            discovery: discovery.clone(),
            mqtt: mqtt.clone(),
            sw_version: sw_version.into(),
            shutdown,
        }
    }

    /// `dsmr` followed by the configured suffix.
    pub fn node_id(&self) -> String {
        format!("dsmr{}", self.discovery.node_suffix)
    }

    /// Time between two announcements of the full sensor set.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(3600) / self.discovery.rate.max(1)
    }

    pub fn config_topic(&self, field: &Field) -> String {
        format!("{DISCOVERY_PREFIX}/sensor/{}/{}/config", self.node_id(), field.tag)
    }

    pub fn config_payload(&self, field: &Field) -> serde_json::Result<String> {
        let node_id = self.node_id();
        let classification = field.classification();
        let unit = match classification {
            Some(class) => Some(class.unit),
            None if !field.unit.is_empty() => Some(field.unit),
            None => None,
        };
        let config = SensorConfig {
            name: field.name,
            unique_id: format!("{node_id}_{}", field.tag),
            state_topic: self.mqtt.topic(field.tag),
            unit_of_measurement: unit,
            device_class: classification.map(|c| c.device_class),
            state_class: classification.map(|c| c.state_class),
            availability_topic: self.mqtt.status_topic(),
            payload_available: "online",
            payload_not_available: "offline",
            device: Device {
                identifiers: [node_id.clone()],
                name: format!("DSMR meter {}", self.discovery.node_suffix)
                    .trim_end()
                    .to_string(),
                manufacturer: "dsmr_mqtt_bridge",
                model: "DSMR 5.0 P1",
                sw_version: &self.sw_version,
            },
        };
        serde_json::to_string(&config)
    }

    /// Publishes a retained config for every field; returns how many went out.
    pub fn announce(&self) -> usize {
        let mut sent = 0;
        for field in FIELDS {
            match self.config_payload(field) {
                Ok(payload) => {
                    self.broker.publish(self.config_topic(field), payload, true);
                    sent += 1;
                }
                Err(e) => warn!(tag = field.tag, error = %e, "discovery_encode_failed"),
            }
        }
        debug!(sensors = sent, "discovery_announced");
        sent
    }

    /// Removes every announced sensor with an empty retained message.
    pub fn retract(&self) -> usize {
        for field in FIELDS {
            self.broker.publish(self.config_topic(field), Vec::new(), true);
        }
        info!(sensors = FIELDS.len(), "discovery_config_deleted");
        FIELDS.len()
    }

    /// Spawns [`run`](Self::run) on the runtime.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(self) {
        if !self.discovery.enabled {
            info!("discovery_disabled");
            return;
        }
        let interval = self.interval();
        info!(
            node_id = %self.node_id(),
            interval_seconds = interval.as_secs(),
            "discovery_started"
        );

        loop {
            self.announce();
            tokio::select! {
                biased;
                _ = self.shutdown.workers_stopped() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }

        if self.discovery.delete_on_exit {
            self.retract();
        }
        info!("discovery_stopped");
    }
}
