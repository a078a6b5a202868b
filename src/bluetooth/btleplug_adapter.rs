use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{BluetoothAdapter, BluetoothDevice, NotificationStream, TransportError};

/// Adapter backed by the first BLE controller btleplug reports
pub struct BtleplugAdapter {
    adapter: Adapter,
}

impl BtleplugAdapter {
    pub async fn first_available() -> Result<Self, TransportError> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(TransportError::NoAdapter)?;
        match adapter.adapter_info().await {
            Ok(info_text) => info!("Using bluetooth adapter {}", info_text),
            Err(e) => warn!("Could not read bluetooth adapter info: {}", e),
        }
        Ok(Self { adapter })
    }
}

#[async_trait]
impl BluetoothAdapter for BtleplugAdapter {
    async fn discover(&self, duration: Duration) -> Result<(), TransportError> {
        info!("Scanning for bluetooth devices for {:?}", duration);
        self.adapter.start_scan(ScanFilter::default()).await?;
        tokio::time::sleep(duration).await;
        if let Err(e) = self.adapter.stop_scan().await {
            warn!("Failed to stop bluetooth scan: {}", e);
        }

        for peripheral in self.adapter.peripherals().await? {
            debug!("Discovered bluetooth device {}", peripheral.address());
        }
        Ok(())
    }

    async fn find_device(&self, address: &str) -> Result<Arc<dyn BluetoothDevice>, TransportError> {
        let peripheral = self
            .adapter
            .peripherals()
            .await?
            .into_iter()
            .find(|p| p.address().to_string().eq_ignore_ascii_case(address))
            .ok_or_else(|| TransportError::DeviceNotFound(address.to_string()))?;
        Ok(Arc::new(BtleplugDevice { peripheral }))
    }
}

pub struct BtleplugDevice {
    peripheral: Peripheral,
}

impl BtleplugDevice {
    fn characteristic(&self, service: Uuid, uuid: Uuid) -> Result<Characteristic, TransportError> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.service_uuid == service && c.uuid == uuid)
            .ok_or_else(|| TransportError::CharacteristicNotFound {
                address: self.address(),
                uuid,
            })
    }
}

#[async_trait]
impl BluetoothDevice for BtleplugDevice {
    fn address(&self) -> String {
        self.peripheral.address().to_string()
    }

    async fn connect(&self) -> Result<bool, TransportError> {
        if !self.peripheral.is_connected().await? {
            self.peripheral.connect().await?;
        }
        self.peripheral.discover_services().await?;
        Ok(self.peripheral.is_connected().await?)
    }

    async fn is_connected(&self) -> bool {
        match self.peripheral.is_connected().await {
            Ok(connected) => connected,
            Err(e) => {
                debug!("Could not query connection state of {}: {}", self.address(), e);
                false
            }
        }
    }

    async fn write(
        &self,
        service: Uuid,
        characteristic: Uuid,
        data: &[u8],
    ) -> Result<(), TransportError> {
        let characteristic = self.characteristic(service, characteristic)?;
        self.peripheral
            .write(&characteristic, data, WriteType::WithoutResponse)
            .await?;
        Ok(())
    }

    async fn subscribe(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<NotificationStream, TransportError> {
        let characteristic = self.characteristic(service, characteristic)?;
        self.peripheral.subscribe(&characteristic).await?;
        let uuid = characteristic.uuid;
        let stream = self
            .peripheral
            .notifications()
            .await?
            .filter_map(move |notification| async move {
                (notification.uuid == uuid).then_some(notification.value)
            })
            .boxed();
        Ok(stream)
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.peripheral.disconnect().await?;
        Ok(())
    }
}
