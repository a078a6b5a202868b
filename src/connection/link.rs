//! Typestate for bringing up a plug link
//!
//! A link can only be logged in after the GATT connection is up, only be
//! time synced after login, and only send arbitrary commands once synced.
//! statum enforces that order at compile time.

use std::sync::Arc;

use statum::{machine, state};
use tracing::{debug, info, warn};

use super::{ConnectError, SendError};
use crate::bluetooth::{BluetoothDevice, NotificationStream};
use crate::config::DeviceConfig;
use crate::protocol::{
    Command, NOTIFY_CHARACTERISTIC_UUID, SERVICE_UUID, WRITE_CHARACTERISTIC_UUID,
};

#[state]
#[derive(Debug, Clone)]
pub enum LinkState {
    Unlinked,      // Device located, no GATT connection yet
    Linked,        // Connected and subscribed to notifications
    Authenticated, // Login frame written
    Synchronized,  // Clock set, ready for polling
}

#[machine]
pub struct DeviceLink<S: LinkState> {
    config: Arc<DeviceConfig>,
    device: Arc<dyn BluetoothDevice>,
}

impl<S: LinkState> DeviceLink<S> {
    pub fn name(&self) -> &str {
        self.config.name()
    }

    pub fn address(&self) -> &str {
        self.config.address()
    }

    /// Writes one frame, refusing to do so without a connection
    async fn write(&self, command: &Command) -> Result<(), SendError> {
        if !self.device.is_connected().await {
            return Err(SendError::NotConnected {
                address: self.address().to_string(),
            });
        }

        debug!("{} <- {} [{}]", self.name(), command, command.to_hex());
        self.device
            .write(SERVICE_UUID, WRITE_CHARACTERISTIC_UUID, command.frame())
            .await
            .map_err(|source| SendError::Failed {
                address: self.address().to_string(),
                source,
            })
    }

    /// Drops the GATT connection
    async fn release(&self) {
        if let Err(e) = self.device.disconnect().await {
            warn!("Failed to disconnect from {}: {}", self.name(), e);
        }
    }
}

impl DeviceLink<Unlinked> {
    pub fn create(config: Arc<DeviceConfig>, device: Arc<dyn BluetoothDevice>) -> Self {
        Self::new(config, device)
    }

    /// Connects and subscribes to the notify characteristic
    pub async fn connect(self) -> Result<(DeviceLink<Linked>, NotificationStream), ConnectError> {
        info!("Connecting to {} ({})", self.name(), self.address());

        let connected = self
            .device
            .connect()
            .await
            .map_err(|source| ConnectError::Transport {
                address: self.address().to_string(),
                source,
            })?;
        if !connected {
            return Err(ConnectError::NotConnected {
                address: self.address().to_string(),
            });
        }

        match self
            .device
            .subscribe(SERVICE_UUID, NOTIFY_CHARACTERISTIC_UUID)
            .await
        {
            Ok(notifications) => Ok((self.transition(), notifications)),
            Err(source) => {
                self.release().await;
                Err(ConnectError::Transport {
                    address: self.address().to_string(),
                    source,
                })
            }
        }
    }
}

impl DeviceLink<Linked> {
    pub async fn login(self) -> Result<DeviceLink<Authenticated>, ConnectError> {
        let written = match Command::login(self.config.pin()) {
            Ok(command) => self.write(&command).await.map_err(ConnectError::Login),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = written {
            self.release().await;
            return Err(e);
        }
        debug!("Login sent to {}", self.name());
        Ok(self.transition())
    }
}

impl DeviceLink<Authenticated> {
    pub async fn sync_time(self) -> Result<DeviceLink<Synchronized>, ConnectError> {
        let command = Command::sync_time(chrono::Local::now().naive_local());
        if let Err(e) = self.write(&command).await {
            self.release().await;
            return Err(ConnectError::SyncTime(e));
        }
        debug!("Clock of {} synchronized", self.name());
        Ok(self.transition())
    }
}

impl DeviceLink<Synchronized> {
    pub async fn send(&self, command: &Command) -> Result<(), SendError> {
        self.write(command).await
    }

    pub async fn disconnect(self) {
        self.release().await;
    }
}
