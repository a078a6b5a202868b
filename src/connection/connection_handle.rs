use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use super::device_connection::{ConnectionMessage, DeviceConnection, INBOX_CAPACITY};
use super::{ConnectionError, ConnectionState, SendError};
use crate::bluetooth::BluetoothAdapter;
use crate::config::DeviceConfig;
use crate::protocol::{Command, DeviceEvent};

const SUBSCRIBER_CAPACITY: usize = 64;

/// Handle to a running device connection.
///
/// Cheap to clone; the connection task ends when the last handle is dropped
/// or [`shutdown`](Self::shutdown) is called.
#[derive(Clone)]
pub struct DeviceConnectionHandle {
    config: Arc<DeviceConfig>,
    tx: mpsc::Sender<ConnectionMessage>,
    state: watch::Receiver<ConnectionState>,
}

impl DeviceConnectionHandle {
    /// Spawns the connection task. Nothing is connected until [`establish`](Self::establish).
    pub fn spawn(
        config: Arc<DeviceConfig>,
        adapter: Arc<dyn BluetoothAdapter>,
        reconnect_delay: Duration,
    ) -> Self {
        info!(
            "Spawning connection for {} ({})",
            config.name(),
            config.address()
        );

        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let connection = DeviceConnection::new(
            config.clone(),
            adapter,
            reconnect_delay,
            rx,
            tx.downgrade(),
            state_tx,
        );
        tokio::spawn(connection.run());

        Self {
            config,
            tx,
            state: state_rx,
        }
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Starts connecting. Failures are retried in the background forever.
    pub async fn establish(&self) -> Result<(), ConnectionError> {
        self.post(ConnectionMessage::Establish).await
    }

    /// Writes one command, failing fast if the plug is not connected
    pub async fn send(&self, command: Command) -> Result<(), SendError> {
        let (response_tx, response_rx) = oneshot::channel();
        let closed = || SendError::Closed {
            address: self.config.address().to_string(),
        };

        self.tx
            .send(ConnectionMessage::Send {
                command,
                response_tx,
            })
            .await
            .map_err(|_| closed())?;
        response_rx.await.map_err(|_| closed())?
    }

    /// Registers a new receiver for decoded responses and availability changes
    pub async fn subscribe(&self) -> Result<mpsc::Receiver<DeviceEvent>, ConnectionError> {
        let (event_tx, event_rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        self.post(ConnectionMessage::Subscribe(event_tx)).await?;
        Ok(event_rx)
    }

    pub async fn set_reconnect_delay(&self, delay: Duration) -> Result<(), ConnectionError> {
        self.post(ConnectionMessage::SetReconnectDelay(delay)).await
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_established(&self) -> bool {
        self.state().is_established()
    }

    /// Stops polling and reconnecting and disconnects the plug
    pub async fn shutdown(&self) {
        let (response_tx, response_rx) = oneshot::channel();
        if self
            .tx
            .send(ConnectionMessage::Shutdown { response_tx })
            .await
            .is_err()
        {
            debug!("Connection of {} already stopped", self.config.name());
            return;
        }
        if response_rx.await.is_err() {
            warn!("Connection of {} stopped during shutdown", self.config.name());
        }
    }

    async fn post(&self, message: ConnectionMessage) -> Result<(), ConnectionError> {
        self.tx
            .send(message)
            .await
            .map_err(|_| ConnectionError::Closed {
                device: self.config.name().to_string(),
            })
    }
}
