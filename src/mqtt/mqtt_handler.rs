use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::message_manager::{MqttMessage, MsgManager};
use super::{MqttError, MqttTransport};
use crate::config::MqttConfig;

const DEFAULT_PORT: u16 = 1883;
const REQUEST_CHANNEL_CAPACITY: usize = 200;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const RECONNECT_PAUSE: Duration = Duration::from_secs(1);
/// Upper bound for flushing queued publishes and the DISCONNECT packet
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Clone, Debug, Default)]
pub struct MQTTStatus {
    pub connection_state: ConnectionState,
    pub messages_received: usize,
    pub messages_sent: usize,
    pub last_activity: Option<chrono::DateTime<chrono::Local>>,
}

/// rumqttc backed broker connection.
///
/// The event loop runs in its own task; it keeps polling after connection
/// errors, which makes rumqttc reconnect, and renews all subscriptions on
/// every ConnAck because rumqttc does not do that on its own.
pub struct MqttHandler {
    client: AsyncClient,
    routes: Arc<Mutex<MsgManager>>,
    status: watch::Receiver<MQTTStatus>,
    cancel: CancellationToken,
    event_loop_task: Mutex<Option<JoinHandle<()>>>,
}

impl MqttHandler {
    /// Connects to the broker and waits for the first ConnAck
    pub async fn establish(config: &MqttConfig) -> Result<Self, MqttError> {
        let (host, port) = parse_broker_url(&config.url)?;
        let mut mqtt_options = MqttOptions::new(config.client_id.clone(), host.clone(), port);
        mqtt_options
            .set_keep_alive(Duration::from_secs(config.keep_alive_secs))
            .set_clean_session(true)
            .set_inflight(REQUEST_CHANNEL_CAPACITY as u16);
        if let Some((username, password)) = config.credentials() {
            mqtt_options.set_credentials(username, password);
        }

        let (client, event_loop) = AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY);
        let routes = Arc::new(Mutex::new(MsgManager::default()));
        let (status_tx, mut status_rx) = watch::channel(MQTTStatus {
            connection_state: ConnectionState::Connecting,
            ..Default::default()
        });
        let cancel = CancellationToken::new();

        info!("Connecting to mqtt server {}:{}", host, port);
        let task = tokio::spawn(run_event_loop(
            event_loop,
            client.clone(),
            routes.clone(),
            status_tx,
            cancel.clone(),
        ));

        let connected = tokio::time::timeout(
            CONNECT_TIMEOUT,
            status_rx.wait_for(|status| status.connection_state == ConnectionState::Connected),
        )
        .await
        .map(|result| result.is_ok());
        match connected {
            Ok(true) => info!("Established connection to mqtt server"),
            Ok(false) => return Err(MqttError::Closed),
            Err(_) => {
                cancel.cancel();
                task.abort();
                return Err(MqttError::ConnectTimeout(CONNECT_TIMEOUT));
            }
        }

        Ok(Self {
            client,
            routes,
            status: status_rx,
            cancel,
            event_loop_task: Mutex::new(Some(task)),
        })
    }

    pub fn status(&self) -> MQTTStatus {
        self.status.borrow().clone()
    }

    /// Disconnects from the broker and stops the event loop.
    ///
    /// Requests queued before the disconnect, such as the last state
    /// publishes, are written out first. The event loop is cancelled if that
    /// does not finish within [`DISCONNECT_TIMEOUT`].
    pub async fn shutdown(&self) {
        let task = match self.event_loop_task.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(mut task) = task else {
            debug!("Mqtt event loop already stopped");
            return;
        };

        if let Err(e) = self.client.disconnect().await {
            warn!("Failed to disconnect from mqtt server: {}", e);
        }

        let finished = match tokio::time::timeout(DISCONNECT_TIMEOUT, &mut task).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "Mqtt server did not take the disconnect within {:?}",
                    DISCONNECT_TIMEOUT
                );
                self.cancel.cancel();
                task.await
            }
        };
        self.cancel.cancel();
        if let Err(e) = finished {
            error!("Mqtt event loop task panicked: {}", e);
        }

        let status = self.status();
        info!(
            "Disconnected from mqtt server ({} messages received, {} sent)",
            status.messages_received, status.messages_sent
        );
    }

    fn with_routes<T>(&self, f: impl FnOnce(&mut MsgManager) -> T) -> T {
        match self.routes.lock() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

#[async_trait]
impl MqttTransport for MqttHandler {
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), MqttError> {
        debug!("Publishing '{}' to '{}'", payload, topic);
        self.client
            .publish(topic, QoS::AtMostOnce, false, payload.as_bytes().to_vec())
            .await?;
        Ok(())
    }

    async fn subscribe(
        &self,
        filter: &str,
        sink: mpsc::Sender<MqttMessage>,
    ) -> Result<(), MqttError> {
        self.with_routes(|routes| routes.add_route(filter, sink));
        self.client.subscribe(filter, QoS::AtMostOnce).await?;
        info!("Subscribed to topic '{}'", filter);
        Ok(())
    }
}

async fn run_event_loop(
    mut event_loop: EventLoop,
    client: AsyncClient,
    routes: Arc<Mutex<MsgManager>>,
    status: watch::Sender<MQTTStatus>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = event_loop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                status.send_modify(|s| s.connection_state = ConnectionState::Connected);
                let filters = match routes.lock() {
                    Ok(guard) => guard.filters(),
                    Err(poisoned) => poisoned.into_inner().filters(),
                };
                for filter in filters {
                    debug!("Renewing subscription '{}'", filter);
                    if let Err(e) = client.try_subscribe(filter.clone(), QoS::AtMostOnce) {
                        error!("Failed to subscribe to '{}': {}", filter, e);
                    }
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                debug!("Received message on topic '{}'", publish.topic);
                let message = MqttMessage::from_bytes(publish.topic, &publish.payload);
                status.send_modify(|s| {
                    s.messages_received += 1;
                    s.last_activity = Some(chrono::Local::now());
                });
                match routes.lock() {
                    Ok(mut guard) => guard.dispatch(&message),
                    Err(poisoned) => poisoned.into_inner().dispatch(&message),
                };
            }
            Ok(Event::Outgoing(Outgoing::Publish(_))) => {
                status.send_modify(|s| {
                    s.messages_sent += 1;
                    s.last_activity = Some(chrono::Local::now());
                });
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => {
                debug!("Message {} delivered", ack.pkid);
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("Disconnect sent to mqtt server");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("Connection to mqtt server is lost ({}). Reconnecting...", e);
                status.send_modify(|s| s.connection_state = ConnectionState::Reconnecting);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(RECONNECT_PAUSE) => {}
                }
            }
        }
    }

    status.send_modify(|s| s.connection_state = ConnectionState::Disconnected);
    debug!("Mqtt event loop stopped");
}

/// Splits `tcp://host:port`, `mqtt://host:port`, `host:port` or `host` into host and port
pub fn parse_broker_url(url: &str) -> Result<(String, u16), MqttError> {
    let without_scheme = url
        .strip_prefix("tcp://")
        .or_else(|| url.strip_prefix("mqtt://"))
        .unwrap_or(url);

    let (host, port) = match without_scheme.split_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| MqttError::InvalidUrl(url.to_string()))?;
            (host, port)
        }
        None => (without_scheme, DEFAULT_PORT),
    };

    if host.is_empty() || host.contains('/') {
        return Err(MqttError::InvalidUrl(url.to_string()));
    }
    Ok((host.to_string(), port))
}
