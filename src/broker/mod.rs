//! Long-lived MQTT connection.
//!
//! The connection runs as one task that exclusively owns the connection
//! state, the subscription set and the status message. Other workers talk
//! to it through a cloneable [`BrokerHandle`]; nothing they send can block
//! them. A second task, the network loop in [`link`], drives the client's
//! event loop and reports back what happened on the wire.

pub mod link;
pub mod policy;
pub mod protocol;
pub mod target;

use std::{sync::Arc, time::Duration};

use tokio::{
    net::TcpStream,
    sync::mpsc,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::config::MqttConfig;
use crate::error::{BridgeError, Result};
use crate::shutdown::Shutdown;
use crate::stats::{Counter, Statistics};
use link::{InboundMessage, LinkEvent, MqttLink, NetworkLoop, RumqttLink};
use policy::{ReconnectPolicy, StartupBackoff};
pub use protocol::ProtocolGeneration;
use target::BrokerTarget;

/// Health check cadence of the connection task.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Time the network loop gets to flush after the disconnect request.
const FLUSH_GRACE: Duration = Duration::from_secs(1);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Liveness message, re-published on every (re)connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusMessage {
    pub topic: String,
    pub payload: String,
    pub retain: bool,
}

enum Command {
    Publish {
        topic: String,
        payload: Vec<u8>,
        retain: bool,
    },
    SetStatus(StatusMessage),
    Subscribe(String),
    Unsubscribe(String),
    SetMessageSink(mpsc::Sender<InboundMessage>),
}

/// Receiving end of a [`BrokerHandle`], consumed by [`BrokerConnection::new`].
pub struct CommandQueue(mpsc::UnboundedReceiver<Command>);

/// Cheap, cloneable front door to the connection task.
#[derive(Clone)]
pub struct BrokerHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl BrokerHandle {
    pub fn channel() -> (Self, CommandQueue) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { commands: tx }, CommandQueue(rx))
    }

    /// Best-effort publish; failures are counted by the connection task.
    pub fn publish(&self, topic: impl Into<String>, payload: impl Into<Vec<u8>>, retain: bool) {
        self.send(Command::Publish {
            topic: topic.into(),
            payload: payload.into(),
            retain,
        });
    }

    /// Stores the status message and publishes it now and after every reconnect.
    pub fn set_status(&self, topic: impl Into<String>, payload: impl Into<String>, retain: bool) {
        self.send(Command::SetStatus(StatusMessage {
            topic: topic.into(),
            payload: payload.into(),
            retain,
        }));
    }

    /// Requires [`set_message_sink`](Self::set_message_sink) to be called first.
    pub fn subscribe(&self, topic: impl Into<String>) {
        self.send(Command::Subscribe(topic.into()));
    }

    pub fn unsubscribe(&self, topic: impl Into<String>) {
        self.send(Command::Unsubscribe(topic.into()));
    }

    /// Routes messages of subscribed topics into `sink`.
    pub fn set_message_sink(&self, sink: mpsc::Sender<InboundMessage>) {
        self.send(Command::SetMessageSink(sink));
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!("broker_connection_closed");
        }
    }
}

pub struct BrokerConnection<L: MqttLink> {
    link: L,
    protocol: ProtocolGeneration,
    events: mpsc::UnboundedReceiver<LinkEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    network: Option<NetworkLoop>,
    state: ConnectionState,
    policy: ReconnectPolicy,
    subscriptions: Vec<String>,
    status: Option<StatusMessage>,
    message_sink: Option<mpsc::Sender<InboundMessage>>,
    published: u64,
    stats: Arc<Statistics>,
    shutdown: Shutdown,
}

impl<L: MqttLink> BrokerConnection<L> {
    pub fn new(
        link: L,
        protocol: ProtocolGeneration,
        events: mpsc::UnboundedReceiver<LinkEvent>,
        commands: CommandQueue,
        network: Option<NetworkLoop>,
        stats: Arc<Statistics>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            link,
            protocol,
            events,
            commands: commands.0,
            network,
            state: ConnectionState::Disconnected,
            policy: ReconnectPolicy::new(Instant::now()),
            subscriptions: Vec::new(),
            status: None,
            message_sink: None,
            published: 0,
            stats,
            shutdown,
        }
    }

    /// Runs until the broker stop signal; returns the number of publishes issued.
    pub async fn run(mut self) -> u64 {
        let mut health = tokio::time::interval(POLL_INTERVAL);
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.broker_stopped() => break,
                Some(event) = self.events.recv() => self.on_link_event(event),
                Some(command) = self.commands.recv() => self.on_command(command),
                _ = health.tick() => self.check_health(Instant::now()),
            }
        }

        self.close().await
    }

    fn on_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Connecting => self.set_state(ConnectionState::Connecting),
            LinkEvent::Connected => {
                info!("mqtt_connected");
                self.set_state(ConnectionState::Connected);
                self.replay_subscriptions();
                self.publish_status();
            }
            LinkEvent::ConnectFailed(reason) => {
                error!(reason = %reason, "mqtt_connection_failed");
                self.stats.increment(Counter::MqttErrors);
                self.set_state(ConnectionState::Disconnected);
            }
            LinkEvent::Disconnected { expected, reason } => {
                if expected {
                    info!(reason = %reason, "mqtt_expected_disconnect");
                } else {
                    let err = BridgeError::BrokerDisconnect(reason);
                    warn!(error = %err, "mqtt_unexpected_disconnect");
                    self.stats.increment(Counter::MqttErrors);
                }
                self.set_state(ConnectionState::Disconnected);
            }
            LinkEvent::SubscribeAck { pkid, codes } => {
                self.protocol.log_subscribe_ack(pkid, &codes)
            }
            LinkEvent::Message(message) => self.deliver(message),
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Publish {
                topic,
                payload,
                retain,
            } => self.publish(&topic, payload, retain),
            Command::SetStatus(status) => {
                debug!(topic = %status.topic, payload = %status.payload, "set_status");
                self.status = Some(status);
                self.publish_status();
            }
            Command::Subscribe(topic) => self.subscribe(topic),
            Command::Unsubscribe(topic) => self.unsubscribe(&topic),
            Command::SetMessageSink(sink) => {
                self.message_sink = Some(sink);
                self.replay_subscriptions();
            }
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        debug!(from = ?self.state, to = ?state, "mqtt_state_changed");
        match state {
            ConnectionState::Connected => self.policy.on_connected(),
            ConnectionState::Disconnected => self.policy.on_disconnected(Instant::now()),
            ConnectionState::Connecting => {}
        }
        self.state = state;
    }

    fn check_health(&mut self, now: Instant) {
        if self.state == ConnectionState::Connected {
            return;
        }
        if self.policy.should_reconnect(now) {
            info!(state = ?self.state, "mqtt_reconnect_attempt");
            self.set_state(ConnectionState::Connecting);
            if let Err(e) = self.link.reconnect() {
                error!(error = %e, "mqtt_reconnect_failed");
            }
        }
    }

    fn publish(&mut self, topic: &str, payload: Vec<u8>, retain: bool) {
        debug!(topic, "do_publish");
        self.published += 1;
        self.stats.increment(Counter::MqttMessagesSent);

        if let Err(e) = self.link.publish(topic, payload, retain) {
            let err = BridgeError::BrokerPublishFailure {
                topic: topic.to_string(),
                reason: e.to_string(),
            };
            warn!(error = %err, "mqtt_publish_failed");
            self.stats.increment(Counter::MqttErrors);
        }
    }

    fn publish_status(&mut self) {
        if let Some(status) = self.status.clone() {
            self.publish(&status.topic, status.payload.into_bytes(), status.retain);
        }
    }

    fn subscribe(&mut self, topic: String) {
        if self.message_sink.is_none() {
            let err = BridgeError::ConfigurationMisuse(format!(
                "subscribe to `{topic}` before a message sink was set"
            ));
            error!(error = %err, "subscription_queue_not_set");
            return;
        }
        debug!(topic = %topic, "subscribing");
        if let Err(e) = self.link.subscribe(&topic) {
            warn!(topic = %topic, error = %e, "mqtt_subscribe_failed");
            self.stats.increment(Counter::MqttErrors);
        }
        if !self.subscriptions.contains(&topic) {
            self.subscriptions.push(topic);
        }
    }

    fn unsubscribe(&mut self, topic: &str) {
        debug!(topic, "unsubscribing");
        if let Err(e) = self.link.unsubscribe(topic) {
            warn!(topic, error = %e, "mqtt_unsubscribe_failed");
        }
        match self.subscriptions.iter().position(|t| t == topic) {
            Some(index) => {
                self.subscriptions.remove(index);
            }
            None => warn!(topic, "unsubscribe_topic_not_found"),
        }
    }

    fn replay_subscriptions(&mut self) {
        for topic in &self.subscriptions {
            debug!(topic = %topic, "resubscribing_topic");
            if let Err(e) = self.link.subscribe(topic) {
                warn!(topic = %topic, error = %e, "mqtt_subscribe_failed");
                self.stats.increment(Counter::MqttErrors);
            }
        }
    }

    fn deliver(&mut self, message: InboundMessage) {
        debug!(topic = %message.topic, "message_received");
        match &self.message_sink {
            Some(sink) => {
                if let Err(e) = sink.try_send(message) {
                    warn!(error = %e, "message_sink_rejected");
                }
            }
            None => debug!("message_dropped_no_sink"),
        }
    }

    async fn close(mut self) -> u64 {
        debug!("mqtt_client_closing");
        // Publishes queued before the stop signal still go out
        while let Ok(command) = self.commands.try_recv() {
            self.on_command(command);
        }
        if let Err(e) = self.link.disconnect() {
            debug!(error = %e, "mqtt_disconnect_failed");
        }
        if let Some(network) = self.network.take() {
            network.close(FLUSH_GRACE).await;
        }
        self.shutdown.stop_all();
        info!(messages_published = self.published, "mqtt_client_stopped");
        self.published
    }
}

/// Probes raw TCP reachability of the broker until it answers.
///
/// Returns `Ok(false)` if shutdown was requested while waiting.
pub async fn wait_for_broker(
    target: &BrokerTarget,
    mut backoff: StartupBackoff,
    shutdown: &Shutdown,
) -> Result<bool> {
    loop {
        if probe(target).await {
            return Ok(true);
        }
        let Some(delay) = backoff.next_delay() else {
            return Err(BridgeError::BrokerUnreachableAtStartup {
                host: target.host.clone(),
                port: target.port,
                waited_secs: backoff.total_waited().as_secs(),
            });
        };
        tokio::select! {
            _ = shutdown.workers_stopped() => return Ok(false),
            _ = shutdown.broker_stopped() => return Ok(false),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn probe(target: &BrokerTarget) -> bool {
    debug!("checking_broker_connectivity");
    let attempt = tokio::time::timeout(
        PROBE_TIMEOUT,
        TcpStream::connect((target.host.as_str(), target.port)),
    )
    .await;
    match attempt {
        Ok(Ok(_stream)) => {
            debug!(broker = %target.host, port = target.port, "broker_connectivity_available");
            true
        }
        Ok(Err(e)) => {
            info!(
                broker = %target.host,
                port = target.port,
                error = %e,
                "broker_connectivity_unavailable"
            );
            false
        }
        Err(_) => {
            info!(broker = %target.host, port = target.port, "broker_connectivity_timeout");
            false
        }
    }
}

/// Starts the connection task: waits for the broker, connects with the
/// configured protocol generation and serves the returned handle.
pub fn spawn(
    config: &MqttConfig,
    stats: Arc<Statistics>,
    shutdown: Shutdown,
) -> (BrokerHandle, JoinHandle<()>) {
    let (handle, queue) = BrokerHandle::channel();
    let config = config.clone();

    let task = tokio::spawn(async move {
        info!(broker = %config.target.host, port = config.target.port, "mqtt_thread_starting");

        match wait_for_broker(&config.target, StartupBackoff::new(), &shutdown).await {
            Ok(true) => {}
            Ok(false) => {
                shutdown.stop_all();
                return;
            }
            Err(e) => {
                shutdown.report(&e);
                shutdown.stop_all();
                return;
            }
        }

        let (protocol, downgrade) = config.protocol.resolve();
        if let Some(warning) = downgrade {
            warn!(error = %warning, "mqtt_version_downgrade");
        }

        let will = StatusMessage {
            topic: config.status_topic(),
            payload: "offline".to_string(),
            retain: true,
        };
        let (link, events, network) = RumqttLink::connect(&config, protocol, &will);
        BrokerConnection::new(link, protocol, events, queue, Some(network), stats, shutdown)
            .run()
            .await;
    });

    (handle, task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Publish(String, String, bool),
        Subscribe(String),
        Unsubscribe(String),
        Reconnect,
        Disconnect,
    }

    #[derive(Clone, Default)]
    struct FakeLink {
        calls: Arc<Mutex<Vec<Call>>>,
        fail_publish: bool,
    }

    impl FakeLink {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn reconnects(&self) -> usize {
            self.calls()
                .iter()
                .filter(|c| **c == Call::Reconnect)
                .count()
        }

        fn record(&self, call: Call) {
            self.calls.lock().unwrap().push(call);
        }
    }

    impl MqttLink for FakeLink {
        fn publish(
            &mut self,
            topic: &str,
            payload: Vec<u8>,
            retain: bool,
        ) -> Result<(), link::LinkError> {
            self.record(Call::Publish(
                topic.to_string(),
                String::from_utf8(payload).unwrap(),
                retain,
            ));
            if self.fail_publish {
                Err(link::LinkError("request queue full".to_string()))
            } else {
                Ok(())
            }
        }

        fn subscribe(&mut self, topic: &str) -> Result<(), link::LinkError> {
            self.record(Call::Subscribe(topic.to_string()));
            Ok(())
        }

        fn unsubscribe(&mut self, topic: &str) -> Result<(), link::LinkError> {
            self.record(Call::Unsubscribe(topic.to_string()));
            Ok(())
        }

        fn reconnect(&mut self) -> Result<(), link::LinkError> {
            self.record(Call::Reconnect);
            Ok(())
        }

        fn disconnect(&mut self) -> Result<(), link::LinkError> {
            self.record(Call::Disconnect);
            Ok(())
        }
    }

    struct Harness {
        link: FakeLink,
        handle: BrokerHandle,
        events: mpsc::UnboundedSender<LinkEvent>,
        stats: Arc<Statistics>,
        shutdown: Shutdown,
        task: JoinHandle<u64>,
    }

    fn start(link: FakeLink) -> Harness {
        let (handle, queue) = BrokerHandle::channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let stats = Statistics::new();
        let shutdown = Shutdown::new();
        let connection = BrokerConnection::new(
            link.clone(),
            ProtocolGeneration::V311,
            events_rx,
            queue,
            None,
            stats.clone(),
            shutdown.clone(),
        );
        let task = tokio::spawn(connection.run());
        Harness {
            link,
            handle,
            events: events_tx,
            stats,
            shutdown,
            task,
        }
    }

    async fn settle() {
        tokio::time::sleep(POLL_INTERVAL * 3).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_replays_subscriptions_then_status() {
        let h = start(FakeLink::default());
        let (sink, _inbound) = mpsc::channel(8);
        h.handle.set_message_sink(sink);
        h.handle.subscribe("dsmr/cmd/a");
        h.handle.subscribe("dsmr/cmd/b");
        h.handle.set_status("dsmr/status", "online", true);
        settle().await;

        h.events.send(LinkEvent::Connected).unwrap();
        h.events
            .send(LinkEvent::Disconnected {
                expected: false,
                reason: "connection reset".to_string(),
            })
            .unwrap();
        settle().await;
        let before = h.link.calls().len();

        h.events.send(LinkEvent::Connected).unwrap();
        settle().await;

        let replay: Vec<Call> = h.link.calls()[before..].to_vec();
        assert_eq!(
            replay,
            vec![
                Call::Subscribe("dsmr/cmd/a".to_string()),
                Call::Subscribe("dsmr/cmd/b".to_string()),
                Call::Publish("dsmr/status".to_string(), "online".to_string(), true),
            ]
        );
        assert_eq!(h.stats.snapshot().mqtt_errors, 1);

        h.shutdown.stop_broker();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_cadence_while_disconnected() {
        let h = start(FakeLink::default());
        h.events.send(LinkEvent::Connected).unwrap();
        settle().await;
        h.events
            .send(LinkEvent::Disconnected {
                expected: false,
                reason: "keep alive timeout".to_string(),
            })
            .unwrap();
        settle().await;

        tokio::time::sleep(Duration::from_secs(58)).await;
        assert_eq!(h.link.reconnects(), 0, "no attempt below the threshold");

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(h.link.reconnects(), 1);

        // The attempt failed; next one only after another full threshold
        h.events
            .send(LinkEvent::ConnectFailed("connection refused".to_string()))
            .unwrap();
        tokio::time::sleep(Duration::from_secs(55)).await;
        assert_eq!(h.link.reconnects(), 1);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(h.link.reconnects(), 2);

        h.events.send(LinkEvent::Connected).unwrap();
        tokio::time::sleep(Duration::from_secs(180)).await;
        assert_eq!(h.link.reconnects(), 2, "no attempts while connected");

        h.shutdown.stop_broker();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_failures_are_counted_not_raised() {
        let link = FakeLink {
            fail_publish: true,
            ..FakeLink::default()
        };
        let h = start(link);
        h.handle.publish("dsmr/power", "1.5", false);
        h.handle.publish("dsmr/energy", "150", false);
        settle().await;

        let stats = h.stats.snapshot();
        assert_eq!(stats.mqtt_messages_sent, 2);
        assert_eq!(stats.mqtt_errors, 2);

        h.shutdown.stop_broker();
        assert_eq!(h.task.await.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_without_sink_is_noop() {
        let h = start(FakeLink::default());
        h.handle.subscribe("dsmr/cmd");
        h.handle.unsubscribe("never/added");
        settle().await;

        assert_eq!(
            h.link.calls(),
            vec![Call::Unsubscribe("never/added".to_string())]
        );

        // Reconnecting does not resurrect the rejected topic
        h.events.send(LinkEvent::Connected).unwrap();
        settle().await;
        assert!(!h.link.calls().contains(&Call::Subscribe("dsmr/cmd".to_string())));

        h.shutdown.stop_broker();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_removes_from_replay() {
        let h = start(FakeLink::default());
        let (sink, _inbound) = mpsc::channel(8);
        h.handle.set_message_sink(sink);
        h.handle.subscribe("a");
        h.handle.subscribe("b");
        h.handle.unsubscribe("a");
        settle().await;
        let before = h.link.calls().len();

        h.events.send(LinkEvent::Connected).unwrap();
        settle().await;
        assert_eq!(
            h.link.calls()[before..].to_vec(),
            vec![Call::Subscribe("b".to_string())]
        );

        h.shutdown.stop_broker();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_messages_reach_sink() {
        let h = start(FakeLink::default());
        let (sink, mut inbound) = mpsc::channel(8);
        h.handle.set_message_sink(sink);
        settle().await;

        let message = InboundMessage {
            topic: "dsmr/cmd".to_string(),
            payload: b"reset".to_vec(),
        };
        h.events.send(LinkEvent::Message(message.clone())).unwrap();
        assert_eq!(inbound.recv().await, Some(message));

        h.shutdown.stop_broker();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_drains_queue_then_disconnects() {
        let h = start(FakeLink::default());
        h.shutdown.stop_broker();
        h.handle.set_status("dsmr/status", "offline", true);

        assert_eq!(h.task.await.unwrap(), 1);
        assert_eq!(
            h.link.calls(),
            vec![
                Call::Publish("dsmr/status".to_string(), "offline".to_string(), true),
                Call::Disconnect,
            ]
        );
        assert!(h.shutdown.is_stopping());
    }

    #[tokio::test]
    async fn test_wait_for_broker_reachable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let target = BrokerTarget::tcp("127.0.0.1", port);

        let reachable = wait_for_broker(&target, StartupBackoff::new(), &Shutdown::new())
            .await
            .unwrap();
        assert!(reachable);
    }

    #[tokio::test]
    async fn test_wait_for_broker_gives_up() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let target = BrokerTarget::tcp("127.0.0.1", port);

        let backoff =
            StartupBackoff::with_limits(Duration::from_millis(1), Duration::from_millis(5));
        let result = wait_for_broker(&target, backoff, &Shutdown::new()).await;
        assert!(matches!(
            result,
            Err(BridgeError::BrokerUnreachableAtStartup { .. })
        ));
    }

    #[tokio::test]
    async fn test_wait_for_broker_stops_on_shutdown() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let target = BrokerTarget::tcp("127.0.0.1", port);

        let shutdown = Shutdown::new();
        shutdown.stop_broker();
        let result = wait_for_broker(&target, StartupBackoff::new(), &shutdown).await;
        assert!(matches!(result, Ok(false)));
    }
}
