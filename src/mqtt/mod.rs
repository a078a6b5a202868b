//! # MQTT Integration Module
//!
//! Connects the bridge to the broker. Device values are published below the
//! configured root topic and command topics are subscribed per device.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── topic.rs            - Topic naming scheme and command topic validation
//! ├── message_manager.rs  - Message representation and routing to subscribers
//! └── mqtt_handler.rs     - rumqttc client, event loop and reconnect handling
//! ```
//!
//! The bridge only talks to the [`MqttTransport`] trait so the broker can be
//! replaced by an in-memory fake in tests.
//!
//! ## Topic layout
//!
//! ```text
//! <root>/<name>/voltage       published, volts
//! <root>/<name>/power         published, watts
//! <root>/<name>/relay         published, "true"/"false"
//! <root>/<name>/energytoday   published, Wh since midnight
//! <root>/<name>/state         published, "online"/"lost"
//! <root>/<name>/+/set         subscribed, "relay" or "led" with "true"/"false"
//! ```

pub mod message_manager;
pub mod mqtt_handler;
pub mod topic;

pub use message_manager::MqttMessage;
pub use mqtt_handler::MqttHandler;

use async_trait::async_trait;
use tokio::sync::mpsc;

#[derive(Debug, thiserror::Error)]
pub enum MqttError {
    #[error("Invalid broker url '{0}'")]
    InvalidUrl(String),

    #[error("Mqtt client request failed: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("Could not connect to mqtt server within {0:?}")]
    ConnectTimeout(std::time::Duration),

    #[error("Mqtt connection closed")]
    Closed,
}

/// What the bridge needs from a broker connection
#[async_trait]
pub trait MqttTransport: Send + Sync + 'static {
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), MqttError>;

    /// Registers `sink` for every message matching `filter` and subscribes at the broker
    async fn subscribe(
        &self,
        filter: &str,
        sink: mpsc::Sender<MqttMessage>,
    ) -> Result<(), MqttError>;
}
