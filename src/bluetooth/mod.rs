//! Bluetooth transport
//!
//! The device connection only sees the [`BluetoothAdapter`] and
//! [`BluetoothDevice`] traits. [`btleplug_adapter`] implements them on top of
//! the host's BLE stack; tests use in-memory fakes.

pub mod btleplug_adapter;

pub use btleplug_adapter::BtleplugAdapter;

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Raw values the notify characteristic reports, in arrival order
pub type NotificationStream = BoxStream<'static, Vec<u8>>;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("No bluetooth adapter available")]
    NoAdapter,

    #[error("Could not find device {0}")]
    DeviceNotFound(String),

    #[error("Device {address} has no characteristic {uuid}")]
    CharacteristicNotFound { address: String, uuid: Uuid },

    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),
}

/// Entry point to the host's BLE stack
#[async_trait]
pub trait BluetoothAdapter: Send + Sync + 'static {
    /// Scans for devices so that they can be found by address afterwards
    async fn discover(&self, duration: Duration) -> Result<(), TransportError>;

    /// Looks up a device by its hardware address, `DeviceNotFound` if absent
    async fn find_device(&self, address: &str) -> Result<Arc<dyn BluetoothDevice>, TransportError>;
}

/// One remote peripheral
#[async_trait]
pub trait BluetoothDevice: Send + Sync + 'static {
    fn address(&self) -> String;

    /// Returns whether the link is up afterwards
    async fn connect(&self) -> Result<bool, TransportError>;

    async fn is_connected(&self) -> bool;

    async fn write(
        &self,
        service: Uuid,
        characteristic: Uuid,
        data: &[u8],
    ) -> Result<(), TransportError>;

    /// Enables notifications on `characteristic` and returns their values
    async fn subscribe(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<NotificationStream, TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;
}
