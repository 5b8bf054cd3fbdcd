use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::{io::AsyncWriteExt, sync::mpsc, task::JoinHandle};

use dsmr_mqtt_bridge::{
    broker::{
        link::{LinkError, LinkEvent, MqttLink},
        BrokerConnection, BrokerHandle, ProtocolGeneration,
    },
    source::SourceMode,
    Config, Coordinator, ShutdownReason, TelegramSource,
};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Published {
    topic: String,
    payload: String,
    retain: bool,
}

/// Mock MQTT client that records every request instead of sending it
#[derive(Clone, Default)]
struct RecordingLink {
    published: Arc<Mutex<Vec<Published>>>,
    disconnects: Arc<Mutex<u32>>,
}

impl RecordingLink {
    fn published(&self) -> Vec<Published> {
        self.published.lock().unwrap().clone()
    }

    fn on_topic(&self, topic: &str) -> Vec<Published> {
        self.published()
            .into_iter()
            .filter(|p| p.topic == topic)
            .collect()
    }

    fn position(&self, topic: &str, payload: &str) -> Option<usize> {
        self.published()
            .iter()
            .position(|p| p.topic == topic && p.payload == payload)
    }

    fn disconnects(&self) -> u32 {
        *self.disconnects.lock().unwrap()
    }
}

impl MqttLink for RecordingLink {
    fn publish(&mut self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), LinkError> {
        self.published.lock().unwrap().push(Published {
            topic: topic.to_string(),
            payload: String::from_utf8(payload).unwrap(),
            retain,
        });
        Ok(())
    }

    fn subscribe(&mut self, _topic: &str) -> Result<(), LinkError> {
        Ok(())
    }

    fn unsubscribe(&mut self, _topic: &str) -> Result<(), LinkError> {
        Ok(())
    }

    fn reconnect(&mut self) -> Result<(), LinkError> {
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), LinkError> {
        *self.disconnects.lock().unwrap() += 1;
        Ok(())
    }
}

fn config(vars: &[(&str, &str)]) -> Config {
    let mut map: HashMap<String, String> = [
        ("DSMR_PRODUCTION", "false"),
        ("DSMR_SIMULATOR_INTERVAL_MS", "1000"),
        ("MQTT_MAXRATE", "3600"),
        ("HA_DISCOVERY", "false"),
        ("DSMR_STATS_LOG_INTERVAL", "0"),
    ]
    .iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    for (k, v) in vars {
        map.insert(k.to_string(), v.to_string());
    }
    Config::from_lookup(|key| map.get(key).cloned()).unwrap()
}

/// Starts a broker connection over a recording link, already connected
fn start_broker(coordinator: &Coordinator) -> (BrokerHandle, JoinHandle<()>, RecordingLink) {
    let link = RecordingLink::default();
    let (handle, queue) = BrokerHandle::channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    events_tx.send(LinkEvent::Connected).unwrap();

    let connection = BrokerConnection::new(
        link.clone(),
        ProtocolGeneration::V311,
        events_rx,
        queue,
        None,
        coordinator.stats(),
        coordinator.shutdown(),
    );
    let task = tokio::spawn(async move {
        // Keeps the event channel open for the lifetime of the connection
        let _events = events_tx;
        connection.run().await;
    });
    (handle, task, link)
}

fn replay(input: String) -> TelegramSource {
    TelegramSource::from_reader(
        std::io::Cursor::new(input.into_bytes()),
        SourceMode::Replay,
        "capture",
    )
}

#[tokio::test(start_paused = true)]
async fn test_end_to_end_virtual_totals() {
    let coordinator = Coordinator::new(config(&[]));
    let stats = coordinator.stats();
    let (broker, broker_task, link) = start_broker(&coordinator);

    let source = replay(
        "1-0:1.8.1(000100.000*kWh)\n1-0:1.8.2(000050.000*kWh)\n!\nEOF\n".to_string(),
    );
    let reason = coordinator.run_with(Ok(source), broker, broker_task).await;

    assert_eq!(reason, ShutdownReason::SourceFinished);
    assert_eq!(reason.exit_code(), 0);

    let value = |topic: &str| link.on_topic(topic).last().map(|p| p.payload.clone());
    assert_eq!(value("test_dsmr/energy_consumed_t1").as_deref(), Some("100"));
    assert_eq!(value("test_dsmr/energy_consumed_t2").as_deref(), Some("50"));
    assert_eq!(value("test_dsmr/energy_consumed").as_deref(), Some("150"));
    assert_eq!(value("test_dsmr/energy_returned").as_deref(), Some("0"));
    assert!(link
        .on_topic("test_dsmr/energy_consumed")
        .iter()
        .all(|p| !p.retain));

    let version = link.on_topic("test_dsmr/sw-version");
    assert_eq!(version.len(), 1);
    assert!(version[0].retain);
    assert!(version[0].payload.contains("mqtt=rumqttc"));

    let snapshot = stats.snapshot();
    assert_eq!(snapshot.telegrams_received, 1);
    assert_eq!(snapshot.telegrams_parsed, 1);
    assert_eq!(link.disconnects(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_every_telegram_consumed_in_order() {
    const N: u64 = 40;
    let coordinator = Coordinator::new(config(&[]));
    let stats = coordinator.stats();
    let (broker, broker_task, link) = start_broker(&coordinator);

    let mut input = String::new();
    for i in 1..=N {
        input.push_str(&format!("1-0:1.8.1({i:06}.000*kWh)\n!\n"));
    }
    let reason = coordinator
        .run_with(Ok(replay(input)), broker, broker_task)
        .await;
    assert_eq!(reason, ShutdownReason::SourceFinished);

    let totals: Vec<String> = link
        .on_topic("test_dsmr/energy_consumed")
        .into_iter()
        .map(|p| p.payload)
        .collect();
    let expected: Vec<String> = (1..=N).map(|i| i.to_string()).collect();
    assert_eq!(totals, expected);

    let snapshot = stats.snapshot();
    assert_eq!(snapshot.telegrams_received, N);
    assert_eq!(snapshot.telegrams_parsed, N);
}

#[tokio::test(start_paused = true)]
async fn test_rate_ceiling_bounds_published_telegrams() {
    const N: u64 = 120;
    let coordinator = Coordinator::new(config(&[("MQTT_MAXRATE", "60")]));
    let stats = coordinator.stats();
    let (broker, broker_task, link) = start_broker(&coordinator);

    let input: String = (0..N).map(|_| "1-0:1.7.0(01.000*kW)\n!\n").collect();
    coordinator
        .run_with(Ok(replay(input)), broker, broker_task)
        .await;

    let snapshot = stats.snapshot();
    assert_eq!(snapshot.telegrams_received, N);
    // Telegrams arrive once per second over two minutes
    let bound = (N * 60).div_ceil(3600) + 1;
    assert!(snapshot.telegrams_parsed <= bound);
    assert_eq!(snapshot.telegrams_parsed, 2);
    assert_eq!(link.on_topic("test_dsmr/power_consumed").len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_signal_mid_telegram_publishes_offline_once() {
    let coordinator = Coordinator::new(config(&[]));
    let stats = coordinator.stats();
    let shutdown = coordinator.shutdown();
    let (broker, broker_task, link) = start_broker(&coordinator);

    let (mut meter, reader) = tokio::io::duplex(1024);
    let source = TelegramSource::from_reader(reader, SourceMode::Live, "p1");
    let run = tokio::spawn(coordinator.run_with(Ok(source), broker, broker_task));

    meter
        .write_all(b"/ISK5\\2M550T-1012\n\n1-0:1.8.1(000100.000*kWh)\n")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    shutdown.request(ShutdownReason::Signal);

    let reason = run.await.unwrap();
    assert_eq!(reason, ShutdownReason::Signal);
    assert_eq!(reason.exit_code(), 0);

    let status = link.on_topic("test_dsmr/status");
    let offline: Vec<_> = status.iter().filter(|p| p.payload == "offline").collect();
    assert_eq!(offline.len(), 1);
    assert!(offline[0].retain);
    assert_eq!(status.last().unwrap().payload, "offline");
    assert!(status.iter().any(|p| p.payload == "online"));

    assert_eq!(stats.snapshot().telegrams_received, 0);
    assert!(link.on_topic("test_dsmr/energy_consumed_t1").is_empty());
    assert_eq!(link.disconnects(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_discovery_announced_and_deleted() {
    let coordinator = Coordinator::new(config(&[("HA_DISCOVERY", "true")]));
    let (broker, broker_task, link) = start_broker(&coordinator);

    let source = replay("1-0:1.7.0(01.000*kW)\n!\nEOF\n".to_string());
    coordinator.run_with(Ok(source), broker, broker_task).await;

    let topic = "homeassistant/sensor/dsmrTEST/power_consumed/config";
    let messages = link.on_topic(topic);
    // One announcement at start, one deletion on exit
    assert_eq!(messages.len(), 2);
    assert!(messages.iter().all(|p| p.retain));
    assert_eq!(messages[1].payload, "");

    let config: serde_json::Value = serde_json::from_str(&messages[0].payload).unwrap();
    assert_eq!(config["state_topic"], "test_dsmr/power_consumed");
    assert_eq!(config["device_class"], "power");
    assert_eq!(config["availability_topic"], "test_dsmr/status");

    // Deletion goes out before the device is marked offline
    let deleted = link.position(topic, "").unwrap();
    let offline = link.position("test_dsmr/status", "offline").unwrap();
    assert!(deleted < offline);
}

#[tokio::test(start_paused = true)]
async fn test_replays_bundled_capture() {
    let config = config(&[("DSMR_SIMULATORFILE", "test/dsmr.raw")]);
    let source = TelegramSource::open(&config.source).await;
    let coordinator = Coordinator::new(config);
    let stats = coordinator.stats();
    let (broker, broker_task, link) = start_broker(&coordinator);

    let reason = coordinator.run_with(source, broker, broker_task).await;
    assert_eq!(reason, ShutdownReason::SourceFinished);

    let snapshot = stats.snapshot();
    assert_eq!(snapshot.telegrams_received, 5);
    assert_eq!(snapshot.telegrams_parsed, 5);
    assert_eq!(snapshot.parse_errors, 0);

    let consumed = link.on_topic("test_dsmr/energy_consumed");
    assert_eq!(consumed.len(), 5);
    assert_eq!(consumed[0].payload, "23679.674");
    assert_eq!(link.on_topic("test_dsmr/gas_consumed")[0].payload, "1234.567");
    assert_eq!(link.on_topic("test_dsmr/voltage_l1")[0].payload, "231");
    assert_eq!(link.on_topic("test_dsmr/timestamp")[0].payload, "231017120000S");
}
