use std::{fmt, sync::Arc, time::Duration};

use thiserror::Error;
use tokio::{
    sync::{mpsc, Notify},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::policy::LinkBackoff;
use super::protocol::ProtocolGeneration;
use super::target::{BrokerTarget, Transport};
use super::StatusMessage;
use crate::config::MqttConfig;

const KEEP_ALIVE: Duration = Duration::from_secs(600);
const REQUEST_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// What the network loop observed on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Connecting,
    Connected,
    ConnectFailed(String),
    Disconnected { expected: bool, reason: String },
    SubscribeAck { pkid: u16, codes: Vec<String> },
    Message(InboundMessage),
}

#[derive(Debug, Error)]
#[error("{0}")]
pub struct LinkError(pub String);

impl LinkError {
    fn from_display(err: impl fmt::Display) -> Self {
        Self(err.to_string())
    }
}

/// Request side of an MQTT client. Every call only queues work for the
/// network loop and returns immediately.
pub trait MqttLink: Send + 'static {
    fn publish(&mut self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), LinkError>;
    fn subscribe(&mut self, topic: &str) -> Result<(), LinkError>;
    fn unsubscribe(&mut self, topic: &str) -> Result<(), LinkError>;
    /// Asks the network loop to skip its current backoff and connect again.
    fn reconnect(&mut self) -> Result<(), LinkError>;
    fn disconnect(&mut self) -> Result<(), LinkError>;
}

/// Background task driving the client's event loop.
pub struct NetworkLoop {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl NetworkLoop {
    /// Lets the loop flush for at most `grace`, then stops it.
    pub async fn close(self, grace: Duration) {
        let NetworkLoop { stop, mut task } = self;
        if tokio::time::timeout(grace, &mut task).await.is_err() {
            stop.cancel();
            if tokio::time::timeout(Duration::from_millis(500), &mut task)
                .await
                .is_err()
            {
                task.abort();
            }
        }
    }
}

pub enum RumqttLink {
    V311 {
        client: rumqttc::AsyncClient,
        qos: rumqttc::QoS,
        reconnect: Arc<Notify>,
    },
    #[cfg(feature = "mqtt5")]
    V5 {
        client: rumqttc::v5::AsyncClient,
        qos: rumqttc::v5::mqttbytes::QoS,
        reconnect: Arc<Notify>,
    },
}

impl RumqttLink {
    /// Builds the client for `protocol`, registers the last will and starts
    /// the network loop. The first connect attempt happens on the loop.
    pub fn connect(
        config: &MqttConfig,
        protocol: ProtocolGeneration,
        will: &StatusMessage,
    ) -> (Self, mpsc::UnboundedReceiver<LinkEvent>, NetworkLoop) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let reconnect = Arc::new(Notify::new());
        let stop = CancellationToken::new();

        info!(
            client_id = %config.client_id,
            protocol = %protocol,
            transport = config.target.transport_name(),
            tls = config.target.tls,
            "mqtt_client_configured"
        );

        let (link, task) = match protocol {
            #[cfg(feature = "mqtt5")]
            ProtocolGeneration::V5 => {
                let (client, eventloop) =
                    rumqttc::v5::AsyncClient::new(v5_options(config, will), REQUEST_CAPACITY);
                let task = tokio::spawn(drive_v5(
                    eventloop,
                    events_tx,
                    reconnect.clone(),
                    stop.clone(),
                ));
                let link = RumqttLink::V5 {
                    client,
                    qos: qos_v5(config.qos),
                    reconnect,
                };
                (link, task)
            }
            // Without MQTT 5 support the protocol was already resolved to 3.1.1
            _ => {
                let (client, eventloop) =
                    rumqttc::AsyncClient::new(v311_options(config, will), REQUEST_CAPACITY);
                let task = tokio::spawn(drive_v311(
                    eventloop,
                    events_tx,
                    reconnect.clone(),
                    stop.clone(),
                ));
                let link = RumqttLink::V311 {
                    client,
                    qos: qos_v311(config.qos),
                    reconnect,
                };
                (link, task)
            }
        };

        (link, events_rx, NetworkLoop { stop, task })
    }
}

impl MqttLink for RumqttLink {
    fn publish(&mut self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), LinkError> {
        match self {
            RumqttLink::V311 { client, qos, .. } => client
                .try_publish(topic, *qos, retain, payload)
                .map_err(LinkError::from_display),
            #[cfg(feature = "mqtt5")]
            RumqttLink::V5 { client, qos, .. } => client
                .try_publish(topic, *qos, retain, payload)
                .map_err(LinkError::from_display),
        }
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), LinkError> {
        match self {
            RumqttLink::V311 { client, qos, .. } => client
                .try_subscribe(topic, *qos)
                .map_err(LinkError::from_display),
            #[cfg(feature = "mqtt5")]
            RumqttLink::V5 { client, qos, .. } => client
                .try_subscribe(topic, *qos)
                .map_err(LinkError::from_display),
        }
    }

    fn unsubscribe(&mut self, topic: &str) -> Result<(), LinkError> {
        match self {
            RumqttLink::V311 { client, .. } => client
                .try_unsubscribe(topic)
                .map_err(LinkError::from_display),
            #[cfg(feature = "mqtt5")]
            RumqttLink::V5 { client, .. } => client
                .try_unsubscribe(topic)
                .map_err(LinkError::from_display),
        }
    }

    fn reconnect(&mut self) -> Result<(), LinkError> {
        match self {
            RumqttLink::V311 { reconnect, .. } => reconnect.notify_one(),
            #[cfg(feature = "mqtt5")]
            RumqttLink::V5 { reconnect, .. } => reconnect.notify_one(),
        }
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), LinkError> {
        match self {
            RumqttLink::V311 { client, .. } => {
                client.try_disconnect().map_err(LinkError::from_display)
            }
            #[cfg(feature = "mqtt5")]
            RumqttLink::V5 { client, .. } => {
                client.try_disconnect().map_err(LinkError::from_display)
            }
        }
    }
}

fn client_transport(target: &BrokerTarget) -> rumqttc::Transport {
    match (&target.transport, target.tls) {
        (Transport::Tcp, false) => rumqttc::Transport::tcp(),
        (Transport::Tcp, true) => rumqttc::Transport::tls_with_default_config(),
        (Transport::WebSocket { .. }, false) => rumqttc::Transport::Ws,
        (Transport::WebSocket { .. }, true) => rumqttc::Transport::wss_with_default_config(),
    }
}

fn qos_v311(level: u8) -> rumqttc::QoS {
    match level {
        0 => rumqttc::QoS::AtMostOnce,
        2 => rumqttc::QoS::ExactlyOnce,
        _ => rumqttc::QoS::AtLeastOnce,
    }
}

fn v311_options(config: &MqttConfig, will: &StatusMessage) -> rumqttc::MqttOptions {
    let target = &config.target;
    let mut options =
        rumqttc::MqttOptions::new(config.client_id.clone(), target.client_address(), target.port);
    options.set_keep_alive(KEEP_ALIVE);
    options.set_clean_session(config.clean_session);
    if !config.username.is_empty() {
        options.set_credentials(config.username.clone(), config.password.clone());
    }
    options.set_last_will(rumqttc::LastWill::new(
        will.topic.clone(),
        will.payload.clone().into_bytes(),
        qos_v311(config.qos),
        will.retain,
    ));
    options.set_transport(client_transport(target));
    options
}

#[cfg(feature = "mqtt5")]
fn qos_v5(level: u8) -> rumqttc::v5::mqttbytes::QoS {
    use rumqttc::v5::mqttbytes::QoS;
    match level {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

#[cfg(feature = "mqtt5")]
fn v5_options(config: &MqttConfig, will: &StatusMessage) -> rumqttc::v5::MqttOptions {
    let target = &config.target;
    let mut options = rumqttc::v5::MqttOptions::new(
        config.client_id.clone(),
        target.client_address(),
        target.port,
    );
    options.set_keep_alive(KEEP_ALIVE);
    // Clean start applies to every connect, not only the first one
    options.set_clean_start(config.clean_session);
    if !config.username.is_empty() {
        options.set_credentials(config.username.clone(), config.password.clone());
    }
    options.set_last_will(rumqttc::v5::mqttbytes::v5::LastWill::new(
        will.topic.clone(),
        will.payload.clone().into_bytes(),
        qos_v5(config.qos),
        will.retain,
        None,
    ));
    options.set_transport(client_transport(target));
    options
}

/// Waits out the backoff after a failed connection. Returns false when stopped.
async fn wait_before_retry(
    backoff: &mut LinkBackoff,
    reconnect: &Notify,
    stop: &CancellationToken,
) -> bool {
    let delay = backoff.next_delay();
    debug!(delay_ms = delay.as_millis() as u64, "mqtt_retry_scheduled");
    tokio::select! {
        biased;
        _ = stop.cancelled() => false,
        _ = reconnect.notified() => true,
        _ = tokio::time::sleep(delay) => true,
    }
}

async fn drive_v311(
    mut eventloop: rumqttc::EventLoop,
    events: mpsc::UnboundedSender<LinkEvent>,
    reconnect: Arc<Notify>,
    stop: CancellationToken,
) {
    use rumqttc::{ConnectReturnCode, Event, Outgoing, Packet};

    info!("mqtt_loop_started");
    let mut backoff = LinkBackoff::new();
    let mut connected = false;
    let _ = events.send(LinkEvent::Connecting);

    loop {
        let event = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            event = eventloop.poll() => event,
        };
        let report = match event {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    connected = true;
                    backoff.reset();
                    Some(LinkEvent::Connected)
                } else {
                    Some(LinkEvent::ConnectFailed(format!("{:?}", ack.code)))
                }
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => Some(LinkEvent::SubscribeAck {
                pkid: ack.pkid,
                codes: ack.return_codes.iter().map(|c| format!("{c:?}")).collect(),
            }),
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                Some(LinkEvent::Message(InboundMessage {
                    topic: publish.topic.clone(),
                    payload: publish.payload.to_vec(),
                }))
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                connected = false;
                Some(LinkEvent::Disconnected {
                    expected: true,
                    reason: "broker closed the session".to_string(),
                })
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                let _ = events.send(LinkEvent::Disconnected {
                    expected: true,
                    reason: "client disconnect".to_string(),
                });
                break;
            }
            Ok(_) => None,
            Err(e) => {
                let report = if connected {
                    LinkEvent::Disconnected {
                        expected: false,
                        reason: e.to_string(),
                    }
                } else {
                    LinkEvent::ConnectFailed(e.to_string())
                };
                connected = false;
                let _ = events.send(report);
                if !wait_before_retry(&mut backoff, &reconnect, &stop).await {
                    break;
                }
                Some(LinkEvent::Connecting)
            }
        };
        if let Some(report) = report {
            if events.send(report).is_err() {
                break;
            }
        }
    }
    info!("mqtt_loop_stopped");
}

#[cfg(feature = "mqtt5")]
async fn drive_v5(
    mut eventloop: rumqttc::v5::EventLoop,
    events: mpsc::UnboundedSender<LinkEvent>,
    reconnect: Arc<Notify>,
    stop: CancellationToken,
) {
    use rumqttc::v5::mqttbytes::v5::{ConnectReturnCode, Packet};
    use rumqttc::v5::Event;
    use rumqttc::Outgoing;

    info!("mqtt_loop_started");
    let mut backoff = LinkBackoff::new();
    let mut connected = false;
    let _ = events.send(LinkEvent::Connecting);

    loop {
        let event = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            event = eventloop.poll() => event,
        };
        let report = match event {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    connected = true;
                    backoff.reset();
                    Some(LinkEvent::Connected)
                } else {
                    Some(LinkEvent::ConnectFailed(format!("{:?}", ack.code)))
                }
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => Some(LinkEvent::SubscribeAck {
                pkid: ack.pkid,
                codes: ack.return_codes.iter().map(|c| format!("{c:?}")).collect(),
            }),
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                Some(LinkEvent::Message(InboundMessage {
                    topic: String::from_utf8_lossy(&publish.topic).into_owned(),
                    payload: publish.payload.to_vec(),
                }))
            }
            Ok(Event::Incoming(Packet::Disconnect(_))) => {
                connected = false;
                Some(LinkEvent::Disconnected {
                    expected: true,
                    reason: "broker closed the session".to_string(),
                })
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                let _ = events.send(LinkEvent::Disconnected {
                    expected: true,
                    reason: "client disconnect".to_string(),
                });
                break;
            }
            Ok(_) => None,
            Err(e) => {
                let report = if connected {
                    LinkEvent::Disconnected {
                        expected: false,
                        reason: e.to_string(),
                    }
                } else {
                    LinkEvent::ConnectFailed(e.to_string())
                };
                connected = false;
                let _ = events.send(report);
                if !wait_before_retry(&mut backoff, &reconnect, &stop).await {
                    break;
                }
                Some(LinkEvent::Connecting)
            }
        };
        if let Some(report) = report {
            if events.send(report).is_err() {
                break;
            }
        }
    }
    info!("mqtt_loop_stopped");
}
