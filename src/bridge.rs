//! # Bridge
//!
//! Owns one [`DeviceConnectionHandle`] per configured plug and wires it to
//! the broker:
//!
//! ```text
//! <root>/<name>/+/set ──► handle_mqtt_message ──► Switch/Led/Measure ──► plug
//! plug ──► DeviceEvent ──► handle_device_event ──► voltage/power/relay/energytoday/state
//! ```
//!
//! Failures while handling a single inbound message are logged and dropped,
//! they never end the per-device subscription task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bluetooth::BluetoothAdapter;
use crate::config::DeviceConfig;
use crate::connection::{ConnectionError, DeviceConnectionHandle, SendError};
use crate::mqtt::topic::{device_topic, setter_subscription, strip_setter_suffix, DeviceTopic, TopicType};
use crate::mqtt::{MqttError, MqttMessage, MqttTransport};
use crate::protocol::{Availability, Command, DeviceEvent, Response};

const COMMAND_QUEUE_CAPACITY: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Invalid topic '{topic}'")]
    InvalidTopic { topic: String },

    #[error("Could not forward '{payload}' from '{topic}' to {device}: {source}")]
    Forward {
        payload: String,
        topic: String,
        device: String,
        source: SendError,
    },

    #[error(transparent)]
    Mqtt(#[from] MqttError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Shared by all per-device tasks
struct BridgeCore {
    root_topic: String,
    mqtt: Arc<dyn MqttTransport>,
    /// Last "online" publish per device; locking it also serializes outbound dispatch
    last_available: Mutex<HashMap<String, Instant>>,
}

pub struct Bridge {
    core: Arc<BridgeCore>,
    connections: Vec<DeviceConnectionHandle>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Bridge {
    /// Starts a connection for every device and subscribes to its command topics
    pub async fn start(
        root_topic: &str,
        devices: &[DeviceConfig],
        reconnect_delay: Duration,
        adapter: Arc<dyn BluetoothAdapter>,
        mqtt: Arc<dyn MqttTransport>,
    ) -> Result<Self, BridgeError> {
        let core = Arc::new(BridgeCore {
            root_topic: root_topic.to_string(),
            mqtt,
            last_available: Mutex::new(HashMap::new()),
        });
        let mut bridge = Self {
            core,
            connections: Vec::new(),
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
        };

        for device in devices {
            bridge
                .add_device(Arc::new(device.clone()), adapter.clone(), reconnect_delay)
                .await?;
        }
        info!("Bridge started for {} device(s)", bridge.connections.len());
        Ok(bridge)
    }

    async fn add_device(
        &mut self,
        device: Arc<DeviceConfig>,
        adapter: Arc<dyn BluetoothAdapter>,
        reconnect_delay: Duration,
    ) -> Result<(), BridgeError> {
        let connection = DeviceConnectionHandle::spawn(device.clone(), adapter, reconnect_delay);

        let events = connection.subscribe().await?;
        self.tasks.push(tokio::spawn(forward_device_events(
            self.core.clone(),
            device.clone(),
            events,
            self.cancel.clone(),
        )));

        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let filter = setter_subscription(&self.core.root_topic, device.name());
        self.core.mqtt.subscribe(&filter, command_tx).await?;
        self.tasks.push(tokio::spawn(handle_commands(
            self.core.clone(),
            connection.clone(),
            command_rx,
            self.cancel.clone(),
        )));

        connection.establish().await?;
        self.connections.push(connection);
        Ok(())
    }

    pub fn connections(&self) -> &[DeviceConnectionHandle] {
        &self.connections
    }

    /// Disconnects every plug and marks it lost at the broker
    pub async fn shutdown(self) {
        info!("Shutting down bridge");
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                error!("Bridge task failed: {}", e);
            }
        }

        for connection in &self.connections {
            connection.shutdown().await;
            let topic = device_topic(&self.core.root_topic, connection.config().name(), "state");
            self.core.publish(&topic, &Availability::Lost.to_string()).await;
        }
    }
}

async fn forward_device_events(
    core: Arc<BridgeCore>,
    device: Arc<DeviceConfig>,
    mut events: mpsc::Receiver<DeviceEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Some(event) => core.handle_device_event(&device, event).await,
            None => break,
        }
    }
    debug!("Event forwarding for {} stopped", device.name());
}

async fn handle_commands(
    core: Arc<BridgeCore>,
    connection: DeviceConnectionHandle,
    mut commands: mpsc::Receiver<MqttMessage>,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = commands.recv() => message,
        };
        let Some(message) = message else { break };
        if let Err(e) = core.handle_mqtt_message(&connection, &message).await {
            warn!("Dropping mqtt message: {}", e);
        }
    }
    debug!("Command handling for {} stopped", connection.config().name());
}

/// MQTT payloads are booleans; anything but "true" means off
fn parse_switch(payload: &str) -> bool {
    payload.trim().eq_ignore_ascii_case("true")
}

impl BridgeCore {
    async fn handle_mqtt_message(
        &self,
        connection: &DeviceConnectionHandle,
        message: &MqttMessage,
    ) -> Result<(), BridgeError> {
        let device = connection.config();
        let topic = DeviceTopic::new(
            self.root_topic.as_str(),
            strip_setter_suffix(&message.topic),
            device.name(),
        );
        if !topic.is_valid() {
            return Err(BridgeError::InvalidTopic {
                topic: message.topic.clone(),
            });
        }

        let forward = |source: SendError| BridgeError::Forward {
            payload: message.payload.clone(),
            topic: message.topic.clone(),
            device: device.name().to_string(),
            source,
        };

        match topic.topic_type() {
            TopicType::Relay => {
                let on = parse_switch(&message.payload);
                info!("Switching {} {}", device.name(), if on { "on" } else { "off" });
                connection.send(Command::switch(on)).await.map_err(forward)?;
                connection.send(Command::measure()).await.map_err(forward)?;
            }
            TopicType::Led => {
                let on = parse_switch(&message.payload);
                info!("Turning led of {} {}", device.name(), if on { "on" } else { "off" });
                connection.send(Command::led(on)).await.map_err(forward)?;
            }
            TopicType::Unknown => {
                warn!("Ignoring message on unsupported topic '{}'", message.topic);
            }
        }
        Ok(())
    }

    async fn handle_device_event(&self, device: &DeviceConfig, event: DeviceEvent) {
        let mut last_available = self.last_available.lock().await;
        let topic = |leaf: &str| device_topic(&self.root_topic, device.name(), leaf);

        match event {
            DeviceEvent::Response(Response::Measurement(measurement)) => {
                self.publish(&topic("voltage"), &measurement.voltage.to_string())
                    .await;
                self.publish(&topic("power"), &measurement.power.to_string())
                    .await;
                self.publish(&topic("relay"), &measurement.relay_on.to_string())
                    .await;
            }
            DeviceEvent::Response(Response::DailyData(daily)) => {
                self.publish(&topic("energytoday"), &daily.today.to_string())
                    .await;
            }
            DeviceEvent::Availability(Availability::Lost) => {
                info!("{} is lost", device.name());
                self.publish(&topic("state"), &Availability::Lost.to_string())
                    .await;
            }
            DeviceEvent::Availability(Availability::Available) => {
                let now = Instant::now();
                let due = match last_available.get(device.name()) {
                    Some(last) => now.duration_since(*last) >= device.refresh_interval(),
                    None => true,
                };
                if due {
                    last_available.insert(device.name().to_string(), now);
                    self.publish(&topic("state"), &Availability::Available.to_string())
                        .await;
                } else {
                    debug!("Suppressing repeated availability of {}", device.name());
                }
            }
            DeviceEvent::Response(
                response @ (Response::Login { .. }
                | Response::Switch { .. }
                | Response::Led
                | Response::SyncTime { .. }
                | Response::Incomplete { .. }
                | Response::Unknown),
            ) => {
                debug!("Not publishing {} of {}", response, device.name());
            }
        }
    }

    async fn publish(&self, topic: &str, payload: &str) {
        if let Err(e) = self.mqtt.publish(topic, payload).await {
            warn!("Failed to publish '{}' to '{}': {}", payload, topic, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{DailyData, Measurement};
    use crate::testing::{wait_until, FakeAdapter, FakeDevice, FakeMqtt};

    const ROOT: &str = "root";
    const WAIT: Duration = Duration::from_secs(5);

    fn plug(name: &str, address: &str) -> DeviceConfig {
        DeviceConfig::new(address, "1234", name, Duration::from_secs(60))
    }

    async fn running_bridge(
        devices: &[DeviceConfig],
    ) -> (Bridge, Arc<FakeMqtt>, Vec<Arc<FakeDevice>>) {
        let adapter = FakeAdapter::new();
        let fakes: Vec<_> = devices
            .iter()
            .map(|device| {
                let fake = FakeDevice::new(device.address());
                adapter.add(fake.clone());
                fake
            })
            .collect();
        let mqtt = FakeMqtt::new();

        let bridge = Bridge::start(ROOT, devices, Duration::from_secs(1), adapter, mqtt.clone())
            .await
            .unwrap();
        for fake in &fakes {
            let fake = fake.clone();
            wait_until(WAIT, move || fake.written().len() == 2).await;
        }
        wait_until(WAIT, || {
            bridge.connections().iter().all(|c| c.is_established())
        })
        .await;
        (bridge, mqtt, fakes)
    }

    fn bridge_core(mqtt: Arc<FakeMqtt>) -> BridgeCore {
        BridgeCore {
            root_topic: ROOT.to_string(),
            mqtt,
            last_available: Mutex::new(HashMap::new()),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn subscribes_to_setter_topics_and_reports_online() {
        let (_bridge, mqtt, _fakes) =
            running_bridge(&[plug("plug1", "AA:00:00:00:00:01"), plug("plug2", "AA:00:00:00:00:02")])
                .await;

        assert_eq!(
            mqtt.subscriptions(),
            vec!["root/plug1/+/set".to_string(), "root/plug2/+/set".to_string()]
        );
        let mqtt_probe = mqtt.clone();
        wait_until(WAIT, move || {
            mqtt_probe.published_to("root/plug1/state").len() == 1
                && mqtt_probe.published_to("root/plug2/state").len() == 1
        })
        .await;
        assert_eq!(mqtt.published_to("root/plug1/state"), vec!["online"]);
        assert_eq!(mqtt.published_to("root/plug2/state"), vec!["online"]);
    }

    #[tokio::test(start_paused = true)]
    async fn relay_command_switches_then_measures() {
        let (_bridge, mqtt, fakes) = running_bridge(&[plug("plug1", "AA:00:00:00:00:01")]).await;

        mqtt.inject("root/plug1/relay/set", "true").await;
        let device = fakes[0].clone();
        wait_until(WAIT, move || device.written().len() == 4).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let written = fakes[0].written();
        assert_eq!(written.len(), 4);
        assert_eq!(written[2], Command::switch(true).frame());
        assert_eq!(written[3], Command::measure().frame());
    }

    #[tokio::test(start_paused = true)]
    async fn led_command_only_sets_led() {
        let (_bridge, mqtt, fakes) = running_bridge(&[plug("plug1", "AA:00:00:00:00:01")]).await;

        mqtt.inject("root/plug1/led/set", "TRUE").await;
        let device = fakes[0].clone();
        wait_until(WAIT, move || device.written().len() == 3).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let written = fakes[0].written();
        assert_eq!(written.len(), 3);
        assert_eq!(written[2], Command::led(true).frame());
    }

    #[tokio::test(start_paused = true)]
    async fn failing_plug_does_not_block_later_messages() {
        let (_bridge, mqtt, fakes) =
            running_bridge(&[plug("plug1", "AA:00:00:00:00:01"), plug("plug2", "AA:00:00:00:00:02")])
                .await;
        fakes[0].fail_writes(true);

        mqtt.inject("root/plug1/relay/set", "false").await;
        mqtt.inject("root/plug1/power/set", "true").await;
        mqtt.inject("root/plug2/led/set", "false").await;

        let plug2 = fakes[1].clone();
        wait_until(WAIT, move || plug2.written().len() == 3).await;
        assert_eq!(fakes[1].written()[2], Command::led(false).frame());

        // plug1 reconnects after its write failure and takes commands again
        fakes[0].fail_writes(false);
        let plug1 = fakes[0].clone();
        wait_until(WAIT, move || plug1.written().len() == 4).await;
        mqtt.inject("root/plug1/led/set", "true").await;
        let plug1 = fakes[0].clone();
        wait_until(WAIT, move || plug1.written().len() == 5).await;
        assert_eq!(fakes[0].written()[4], Command::led(true).frame());
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_topic_is_rejected() {
        let (bridge, _mqtt, fakes) = running_bridge(&[plug("plug1", "AA:00:00:00:00:01")]).await;
        let connection = &bridge.connections()[0];

        let result = bridge
            .core
            .handle_mqtt_message(connection, &MqttMessage::from_topic("root/otherplug/relay/set", "true"))
            .await;

        assert!(matches!(result, Err(BridgeError::InvalidTopic { .. })));
        assert_eq!(fakes[0].written().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnected_plug_yields_forward_error() {
        let (bridge, _mqtt, fakes) = running_bridge(&[plug("plug1", "AA:00:00:00:00:01")]).await;
        fakes[0].set_connected(false);
        let connection = &bridge.connections()[0];

        let result = bridge
            .core
            .handle_mqtt_message(connection, &MqttMessage::from_topic("root/plug1/relay/set", "true"))
            .await;

        match result {
            Err(BridgeError::Forward { device, source, .. }) => {
                assert_eq!(device, "plug1");
                assert!(matches!(source, SendError::NotConnected { .. }));
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[tokio::test]
    async fn measurement_and_daily_data_are_published() {
        let mqtt = FakeMqtt::new();
        let core = bridge_core(mqtt.clone());
        let device = plug("plug1", "AA:00:00:00:00:01");

        let measurement = Measurement {
            relay_on: true,
            power: 11.464,
            voltage: 234,
            current: 89,
            frequency: 50,
        };
        core.handle_device_event(&device, DeviceEvent::Response(Response::Measurement(measurement)))
            .await;
        let mut hourly = [0u16; 24];
        hourly[23] = 1638;
        core.handle_device_event(
            &device,
            DeviceEvent::Response(Response::DailyData(DailyData {
                today: 1638,
                last_24h: 1638,
                hourly,
            })),
        )
        .await;
        core.handle_device_event(&device, DeviceEvent::Response(Response::Led))
            .await;

        assert_eq!(
            mqtt.published(),
            vec![
                ("root/plug1/voltage".to_string(), "234".to_string()),
                ("root/plug1/power".to_string(), "11.464".to_string()),
                ("root/plug1/relay".to_string(), "true".to_string()),
                ("root/plug1/energytoday".to_string(), "1638".to_string()),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn availability_is_debounced_per_interval() {
        let mqtt = FakeMqtt::new();
        let core = bridge_core(mqtt.clone());
        let device = plug("plug1", "AA:00:00:00:00:01");
        let available = || DeviceEvent::Availability(Availability::Available);

        core.handle_device_event(&device, available()).await;
        tokio::time::advance(Duration::from_secs(30)).await;
        core.handle_device_event(&device, available()).await;
        assert_eq!(mqtt.published_to("root/plug1/state"), vec!["online"]);

        core.handle_device_event(&device, DeviceEvent::Availability(Availability::Lost))
            .await;
        assert_eq!(mqtt.published_to("root/plug1/state"), vec!["online", "lost"]);

        tokio::time::advance(Duration::from_secs(31)).await;
        core.handle_device_event(&device, available()).await;
        assert_eq!(
            mqtt.published_to("root/plug1/state"),
            vec!["online", "lost", "online"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn debounce_is_tracked_per_device() {
        let mqtt = FakeMqtt::new();
        let core = bridge_core(mqtt.clone());
        let available = || DeviceEvent::Availability(Availability::Available);

        core.handle_device_event(&plug("plug1", "AA:00:00:00:00:01"), available())
            .await;
        core.handle_device_event(&plug("plug2", "AA:00:00:00:00:02"), available())
            .await;

        assert_eq!(mqtt.published_to("root/plug1/state"), vec!["online"]);
        assert_eq!(mqtt.published_to("root/plug2/state"), vec!["online"]);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_marks_devices_lost() {
        let (bridge, mqtt, fakes) = running_bridge(&[plug("plug1", "AA:00:00:00:00:01")]).await;

        bridge.shutdown().await;

        assert_eq!(
            mqtt.published_to("root/plug1/state").last().map(String::as_str),
            Some("lost")
        );
        assert!(!fakes[0].is_linked());
    }

    #[test]
    fn switch_payloads() {
        assert!(parse_switch("true"));
        assert!(parse_switch("True"));
        assert!(!parse_switch("false"));
        assert!(!parse_switch("on"));
        assert!(!parse_switch(""));
    }
}
