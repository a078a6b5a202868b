use chrono::NaiveDateTime;
use std::fmt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::topic::topic_matches;

/// A message received from the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: String,
    pub timestamp: NaiveDateTime,
}

impl fmt::Display for MqttMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.payload)
    }
}

impl MqttMessage {
    pub fn from_topic(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        MqttMessage {
            topic: topic.into(),
            payload: payload.into(),
            timestamp: chrono::Local::now().naive_local(),
        }
    }

    pub fn from_bytes(topic: impl Into<String>, payload: &[u8]) -> Self {
        Self::from_topic(topic, String::from_utf8_lossy(payload).into_owned())
    }
}

/// Routes incoming publishes to the subscribers whose filter matches
#[derive(Default)]
pub struct MsgManager {
    routes: Vec<(String, mpsc::Sender<MqttMessage>)>,
}

impl MsgManager {
    pub fn add_route(&mut self, filter: impl Into<String>, sink: mpsc::Sender<MqttMessage>) {
        self.routes.push((filter.into(), sink));
    }

    pub fn filters(&self) -> Vec<String> {
        self.routes.iter().map(|(filter, _)| filter.clone()).collect()
    }

    /// Hands the message to every matching subscriber.
    ///
    /// A full subscriber queue drops the message for that subscriber only.
    pub fn dispatch(&mut self, message: &MqttMessage) -> usize {
        self.routes.retain(|(_, sink)| !sink.is_closed());

        let mut delivered = 0;
        for (filter, sink) in &self.routes {
            if !topic_matches(filter, &message.topic) {
                continue;
            }
            match sink.try_send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => warn!(
                    "Dropping mqtt message on '{}' for subscription '{}': {}",
                    message.topic, filter, e
                ),
            }
        }

        if delivered == 0 {
            debug!("No subscriber for message on topic '{}'", message.topic);
        }
        delivered
    }
}
