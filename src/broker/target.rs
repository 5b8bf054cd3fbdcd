use url::Url;

use crate::error::{BridgeError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    WebSocket { path: String },
}

/// Broker address plus transport, fixed for the lifetime of the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerTarget {
    pub host: String,
    pub port: u16,
    pub transport: Transport,
    pub tls: bool,
}

impl BrokerTarget {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            transport: Transport::Tcp,
            tls: false,
        }
    }

    pub fn with_websocket_path(mut self, path: impl Into<String>) -> Self {
        self.transport = Transport::WebSocket { path: path.into() };
        self
    }

    /// Parses `mqtt://`, `mqtts://`, `ws://` or `wss://` URLs.
    pub fn from_url(raw: &str) -> Result<Self> {
        let url = Url::parse(raw).map_err(|e| BridgeError::Config(format!("MQTT_URL: {e}")))?;
        let (default_port, websocket, tls) = match url.scheme() {
            "mqtt" => (1883, false, false),
            "mqtts" => (8883, false, true),
            "ws" => (80, true, false),
            "wss" => (443, true, true),
            other => {
                return Err(BridgeError::Config(format!(
                    "MQTT_URL: unsupported scheme `{other}`"
                )))
            }
        };
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| BridgeError::Config(format!("MQTT_URL: no host in `{raw}`")))?;

        let transport = if websocket {
            let path = match url.path() {
                "" | "/" => "/mqtt".to_string(),
                path => path.to_string(),
            };
            Transport::WebSocket { path }
        } else {
            Transport::Tcp
        };

        Ok(Self {
            host: host.to_string(),
            port: url.port().unwrap_or(default_port),
            transport,
            tls,
        })
    }

    /// Address handed to the MQTT client; WebSocket transports need the full URL.
    pub fn client_address(&self) -> String {
        match &self.transport {
            Transport::Tcp => self.host.clone(),
            Transport::WebSocket { path } => {
                let scheme = if self.tls { "wss" } else { "ws" };
                format!("{scheme}://{}:{}{path}", self.host, self.port)
            }
        }
    }

    pub fn transport_name(&self) -> &'static str {
        match self.transport {
            Transport::Tcp => "tcp",
            Transport::WebSocket { .. } => "websockets",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheme_defaults() {
        let plain = BrokerTarget::from_url("mqtt://broker.local").unwrap();
        assert_eq!(plain, BrokerTarget::tcp("broker.local", 1883));

        let tls = BrokerTarget::from_url("mqtts://broker.local").unwrap();
        assert_eq!(tls.port, 8883);
        assert!(tls.tls);
        assert_eq!(tls.transport, Transport::Tcp);

        let ws = BrokerTarget::from_url("ws://broker.local").unwrap();
        assert_eq!(ws.port, 80);
        assert!(!ws.tls);
        assert_eq!(
            ws.transport,
            Transport::WebSocket {
                path: "/mqtt".to_string()
            }
        );

        let wss = BrokerTarget::from_url("wss://broker.local:9001/ws").unwrap();
        assert_eq!(wss.port, 9001);
        assert!(wss.tls);
        assert_eq!(
            wss.transport,
            Transport::WebSocket {
                path: "/ws".to_string()
            }
        );
    }

    #[test]
    fn test_client_address() {
        assert_eq!(
            BrokerTarget::tcp("10.0.0.2", 1883).client_address(),
            "10.0.0.2"
        );
        let wss = BrokerTarget::from_url("wss://broker.local:9001/ws").unwrap();
        assert_eq!(wss.client_address(), "wss://broker.local:9001/ws");
        assert_eq!(wss.transport_name(), "websockets");
    }

    #[test]
    fn test_rejects_bad_urls() {
        assert!(BrokerTarget::from_url("http://broker.local").is_err());
        assert!(BrokerTarget::from_url("not a url").is_err());
    }

    #[test]
    fn test_explicit_websocket_path() {
        let target = BrokerTarget::tcp("broker", 8080).with_websocket_path("/mqtt");
        assert_eq!(target.client_address(), "ws://broker:8080/mqtt");
    }
}
