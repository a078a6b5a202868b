//! # Device Connection
//!
//! Owns the lifecycle of one plug: connect, login, time sync, periodic
//! polling, notification decoding, command sending and reconnection.
//!
//! ## Module Architecture
//!
//! ```text
//! connection/
//! ├── link.rs                - statum typestate for the connect → login → sync sequence
//! ├── device_connection.rs   - actor task owning the link, poll ticker and reconnect timer
//! └── connection_handle.rs   - cloneable handle talking to the actor through its inbox
//! ```
//!
//! ## State Machine
//!
//! ```text
//! Disconnected ──► Connecting ──► Authenticating ──► TimeSyncing ──► Polling
//!                      ▲               │                  │             │
//!                      │               ▼                  ▼             ▼
//!                      └──────────── ReconnectPending ◄─────────────────┘
//!                      (after the fixed reconnect delay)
//! ```
//!
//! Every state change is serialized through the actor's inbox: notifications,
//! poll ticks, reconnect timers and sends from the bridge are all messages, so
//! frames for one plug are never written concurrently.

pub mod connection_handle;
pub mod device_connection;
pub mod link;

pub use connection_handle::DeviceConnectionHandle;

use std::fmt;

use crate::bluetooth::TransportError;
use crate::protocol::ProtocolError;

/// Runtime state of a device connection, observable through a watch channel
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Authenticating,
    TimeSyncing,
    Polling,
    ReconnectPending,
}

impl ConnectionState {
    /// Logged in and polling
    pub fn is_established(&self) -> bool {
        *self == ConnectionState::Polling
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::TimeSyncing => "time syncing",
            ConnectionState::Polling => "polling",
            ConnectionState::ReconnectPending => "reconnect pending",
        };
        write!(f, "{}", name)
    }
}

/// Failure while bringing a link up. Always recoverable by reconnecting.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("Device {address} not found")]
    DeviceNotFound { address: String },

    #[error("Device {address} did not report a connection")]
    NotConnected { address: String },

    #[error("Bluetooth transport failed for {address}: {source}")]
    Transport {
        address: String,
        source: TransportError,
    },

    #[error("Could not build login: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Login failed: {0}")]
    Login(SendError),

    #[error("Time sync failed: {0}")]
    SyncTime(SendError),
}

impl ConnectError {
    pub(crate) fn from_lookup(address: &str, error: TransportError) -> Self {
        match error {
            TransportError::DeviceNotFound(_) => ConnectError::DeviceNotFound {
                address: address.to_string(),
            },
            source => ConnectError::Transport {
                address: address.to_string(),
                source,
            },
        }
    }
}

/// Failure of a single command write
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("Device {address} is not connected")]
    NotConnected { address: String },

    #[error("Failed to send message to {address}: {source}")]
    Failed {
        address: String,
        source: TransportError,
    },

    #[error("Connection actor of {address} is gone")]
    Closed { address: String },
}

/// The connection actor stopped before a request could be handled
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Connection to device '{device}' is closed")]
    Closed { device: String },
}
