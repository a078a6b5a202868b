use std::fmt;

/// Kind of command addressed by a setter topic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicType {
    Relay,
    Led,
    Unknown,
}

impl TopicType {
    fn from_segment(segment: &str) -> Self {
        match segment {
            "relay" => TopicType::Relay,
            "led" => TopicType::Led,
            _ => TopicType::Unknown,
        }
    }
}

impl fmt::Display for TopicType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopicType::Relay => write!(f, "relay"),
            TopicType::Led => write!(f, "led"),
            TopicType::Unknown => write!(f, "unknown"),
        }
    }
}

/// An inbound topic, interpreted relative to one device.
///
/// Valid topics have the form `<root>/<device>/(relay|led)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTopic {
    root_topic: String,
    topic: String,
    device_name: String,
}

impl DeviceTopic {
    pub fn new(
        root_topic: impl Into<String>,
        topic: impl Into<String>,
        device_name: impl Into<String>,
    ) -> Self {
        Self {
            root_topic: root_topic.into(),
            topic: topic.into(),
            device_name: device_name.into(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.command_segment().is_some()
    }

    pub fn topic_type(&self) -> TopicType {
        self.command_segment()
            .map(TopicType::from_segment)
            .unwrap_or(TopicType::Unknown)
    }

    pub fn as_str(&self) -> &str {
        &self.topic
    }

    fn command_segment(&self) -> Option<&str> {
        let rest = self.topic.strip_prefix(self.root_topic.as_str())?;
        let rest = rest.strip_prefix('/')?;
        let rest = rest.strip_prefix(self.device_name.as_str())?;
        let segment = rest.strip_prefix('/')?;
        matches!(segment, "relay" | "led").then_some(segment)
    }
}

impl fmt::Display for DeviceTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.topic)
    }
}

/// Filter a device's command messages are subscribed with
pub fn setter_subscription(root_topic: &str, device_name: &str) -> String {
    format!("{}/{}/+/set", root_topic, device_name)
}

/// Topic a device value is published to, e.g. `home/sem/plug1/voltage`
pub fn device_topic(root_topic: &str, device_name: &str, leaf: &str) -> String {
    format!("{}/{}/{}", root_topic, device_name, leaf)
}

/// Strips the trailing `/set` a command arrives on, leaving `<root>/<device>/<kind>`
pub fn strip_setter_suffix(topic: &str) -> &str {
    topic.strip_suffix("/set").unwrap_or(topic)
}

/// MQTT filter matching with `+` and `#` wildcards
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(expected), Some(actual)) if expected == actual => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
