//! In-memory Bluetooth and MQTT transports for tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::bluetooth::{BluetoothAdapter, BluetoothDevice, NotificationStream, TransportError};
use crate::mqtt::topic::topic_matches;
use crate::mqtt::{MqttError, MqttMessage, MqttTransport};

#[derive(Default)]
pub struct FakeAdapter {
    devices: Mutex<HashMap<String, Arc<FakeDevice>>>,
    lookups: AtomicUsize,
}

impl FakeAdapter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, device: Arc<FakeDevice>) {
        self.devices
            .lock()
            .unwrap()
            .insert(device.address.clone(), device);
    }

    /// Number of `find_device` calls so far
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BluetoothAdapter for FakeAdapter {
    async fn discover(&self, _duration: Duration) -> Result<(), TransportError> {
        Ok(())
    }

    async fn find_device(&self, address: &str) -> Result<Arc<dyn BluetoothDevice>, TransportError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        match self.devices.lock().unwrap().get(address) {
            Some(device) => Ok(device.clone()),
            None => Err(TransportError::DeviceNotFound(address.to_string())),
        }
    }
}

/// A plug that records every frame written to it
pub struct FakeDevice {
    address: String,
    connected: AtomicBool,
    refuse_connections: AtomicBool,
    fail_writes: AtomicBool,
    written: Mutex<Vec<Vec<u8>>>,
    notifier: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
}

impl FakeDevice {
    pub fn new(address: &str) -> Arc<Self> {
        Arc::new(Self {
            address: address.to_string(),
            connected: AtomicBool::new(false),
            refuse_connections: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            written: Mutex::new(Vec::new()),
            notifier: Mutex::new(None),
        })
    }

    pub fn written(&self) -> Vec<Vec<u8>> {
        self.written.lock().unwrap().clone()
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn is_linked(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse_connections.store(refuse, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Emits a value on the notify characteristic
    pub fn notify(&self, raw: &[u8]) -> bool {
        match self.notifier.lock().unwrap().as_ref() {
            Some(tx) => tx.send(raw.to_vec()).is_ok(),
            None => false,
        }
    }

    /// Simulates the plug going out of range
    pub fn drop_link(&self) {
        self.set_connected(false);
        self.notifier.lock().unwrap().take();
    }
}

#[async_trait]
impl BluetoothDevice for FakeDevice {
    fn address(&self) -> String {
        self.address.clone()
    }

    async fn connect(&self) -> Result<bool, TransportError> {
        if !self.refuse_connections.load(Ordering::SeqCst) {
            self.set_connected(true);
        }
        Ok(self.is_linked())
    }

    async fn is_connected(&self) -> bool {
        self.is_linked()
    }

    async fn write(
        &self,
        _service: Uuid,
        _characteristic: Uuid,
        data: &[u8],
    ) -> Result<(), TransportError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(TransportError::Bluetooth(btleplug::Error::NotConnected));
        }
        self.written.lock().unwrap().push(data.to_vec());
        Ok(())
    }

    async fn subscribe(
        &self,
        _service: Uuid,
        _characteristic: Uuid,
    ) -> Result<NotificationStream, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.notifier.lock().unwrap() = Some(tx);
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|raw| (raw, rx))
        });
        Ok(stream.boxed())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.drop_link();
        Ok(())
    }
}

/// Broker stand-in recording publishes and routing injected messages
#[derive(Default)]
pub struct FakeMqtt {
    published: Mutex<Vec<(String, String)>>,
    sinks: Mutex<Vec<(String, mpsc::Sender<MqttMessage>)>>,
}

impl FakeMqtt {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn published(&self) -> Vec<(String, String)> {
        self.published.lock().unwrap().clone()
    }

    /// Payloads published to exactly `topic`, in order
    pub fn published_to(&self, topic: &str) -> Vec<String> {
        self.published()
            .into_iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, payload)| payload)
            .collect()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.sinks
            .lock()
            .unwrap()
            .iter()
            .map(|(filter, _)| filter.clone())
            .collect()
    }

    /// Delivers a message as if the broker had sent it
    pub async fn inject(&self, topic: &str, payload: &str) {
        let sinks: Vec<_> = self
            .sinks
            .lock()
            .unwrap()
            .iter()
            .filter(|(filter, _)| topic_matches(filter, topic))
            .map(|(_, sink)| sink.clone())
            .collect();
        for sink in sinks {
            let _ = sink.send(MqttMessage::from_topic(topic, payload)).await;
        }
    }
}

#[async_trait]
impl MqttTransport for FakeMqtt {
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), MqttError> {
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), payload.to_string()));
        Ok(())
    }

    async fn subscribe(
        &self,
        filter: &str,
        sink: mpsc::Sender<MqttMessage>,
    ) -> Result<(), MqttError> {
        self.sinks.lock().unwrap().push((filter.to_string(), sink));
        Ok(())
    }
}

/// Sleeps in small steps until `condition` holds, panicking after `timeout`
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within {:?}",
            timeout
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
