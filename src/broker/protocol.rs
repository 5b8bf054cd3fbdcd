use std::{fmt, str::FromStr};

use tracing::debug;

use crate::error::BridgeError;

/// MQTT protocol generation used for the broker session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolGeneration {
    /// MQTT 3.1.1, session handling through the clean-session flag.
    V311,
    /// MQTT 5, session handling through clean-start.
    V5,
}

impl ProtocolGeneration {
    pub fn name(self) -> &'static str {
        match self {
            ProtocolGeneration::V311 => "MQTTv311",
            ProtocolGeneration::V5 => "MQTTv5",
        }
    }

    /// Whether this build can speak the generation at all.
    pub fn is_supported(self) -> bool {
        match self {
            ProtocolGeneration::V311 => true,
            ProtocolGeneration::V5 => cfg!(feature = "mqtt5"),
        }
    }

    /// Logs a subscribe acknowledgement. MQTT 3.1.1 acks carry the granted
    /// QoS per topic, MQTT 5 acks carry reason codes.
    pub fn log_subscribe_ack(self, pkid: u16, codes: &[String]) {
        match self {
            ProtocolGeneration::V311 => {
                debug!(pkid, "subscribed_v31");
                for code in codes {
                    debug!(granted_qos = %code, "granted_qos");
                }
            }
            ProtocolGeneration::V5 => {
                debug!(pkid, "subscribed_v5");
                for code in codes {
                    debug!(reason_code = %code, "subscription_reason_code");
                }
            }
        }
    }

    /// Falls back to MQTT 3.1.1 when the requested generation is not compiled in.
    pub fn resolve(self) -> (Self, Option<BridgeError>) {
        if self.is_supported() {
            (self, None)
        } else {
            let selected = ProtocolGeneration::V311;
            (
                selected,
                Some(BridgeError::ProtocolDowngrade {
                    requested: self.name(),
                    selected: selected.name(),
                }),
            )
        }
    }
}

impl fmt::Display for ProtocolGeneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ProtocolGeneration {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "5" | "v5" | "mqttv5" | "5.0" => Ok(ProtocolGeneration::V5),
            "3.1.1" | "311" | "v311" | "mqttv311" | "4" => Ok(ProtocolGeneration::V311),
            other => Err(BridgeError::Config(format!(
                "MQTT_PROTOCOL: unknown protocol `{other}`"
            ))),
        }
    }
}
