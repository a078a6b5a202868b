//! Actor task owning one plug's link
//!
//! Everything that touches the link goes through [`ConnectionMessage`]s, so
//! the actor is the single writer for its plug. Background tasks (notification
//! forwarding, poll ticker, reconnect timer) only hold weak senders to the
//! inbox; the actor stops once every handle is dropped or on shutdown.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::link::{DeviceLink, Synchronized};
use super::{ConnectError, ConnectionState, SendError};
use crate::bluetooth::{BluetoothAdapter, NotificationStream};
use crate::config::DeviceConfig;
use crate::protocol::{Availability, Command, DeviceEvent, FrameAssembler, Response};

pub(super) const INBOX_CAPACITY: usize = 64;

#[derive(Debug)]
pub enum ConnectionMessage {
    Establish,
    /// Raw notification value of the link with the given generation
    Notification { generation: u64, raw: Vec<u8> },
    Poll,
    Reconnect,
    /// Notification stream of the link with the given generation ended
    LinkLost { generation: u64 },
    Send {
        command: Command,
        response_tx: oneshot::Sender<Result<(), SendError>>,
    },
    Subscribe(mpsc::Sender<DeviceEvent>),
    SetReconnectDelay(Duration),
    Shutdown {
        response_tx: oneshot::Sender<()>,
    },
}

pub struct DeviceConnection {
    config: Arc<DeviceConfig>,
    adapter: Arc<dyn BluetoothAdapter>,
    inbox: mpsc::Receiver<ConnectionMessage>,
    sender: mpsc::WeakSender<ConnectionMessage>,
    state: watch::Sender<ConnectionState>,
    link: Option<DeviceLink<Synchronized>>,
    /// Bumped for every connection attempt so stale notifications are ignored
    generation: u64,
    /// Partial frame of the current link
    assembler: FrameAssembler,
    subscribers: Vec<mpsc::Sender<DeviceEvent>>,
    reconnect_delay: Duration,
    forward_task: Option<JoinHandle<()>>,
    poll_task: Option<JoinHandle<()>>,
    reconnect_task: Option<JoinHandle<()>>,
}

impl DeviceConnection {
    pub fn new(
        config: Arc<DeviceConfig>,
        adapter: Arc<dyn BluetoothAdapter>,
        reconnect_delay: Duration,
        inbox: mpsc::Receiver<ConnectionMessage>,
        sender: mpsc::WeakSender<ConnectionMessage>,
        state: watch::Sender<ConnectionState>,
    ) -> Self {
        Self {
            config,
            adapter,
            inbox,
            sender,
            state,
            link: None,
            generation: 0,
            assembler: FrameAssembler::default(),
            subscribers: Vec::new(),
            reconnect_delay,
            forward_task: None,
            poll_task: None,
            reconnect_task: None,
        }
    }

    fn name(&self) -> &str {
        self.config.name()
    }

    pub async fn run(mut self) {
        debug!("Connection task for {} started", self.name());

        while let Some(message) = self.inbox.recv().await {
            match message {
                ConnectionMessage::Establish => self.establish().await,
                ConnectionMessage::Notification { generation, raw } => {
                    if generation == self.generation {
                        self.on_notification(raw).await;
                    }
                }
                ConnectionMessage::Poll => self.poll().await,
                ConnectionMessage::Reconnect => {
                    self.reconnect_task = None;
                    info!("Reconnecting to {}", self.name());
                    self.establish().await;
                }
                ConnectionMessage::LinkLost { generation } => {
                    if generation == self.generation && self.link.is_some() {
                        warn!("Link to {} dropped", self.name());
                        self.mark_lost().await;
                    }
                }
                ConnectionMessage::Send {
                    command,
                    response_tx,
                } => {
                    let result = self.send(&command).await;
                    if response_tx.send(result).is_err() {
                        debug!("Sender of {} for {} went away", command, self.name());
                    }
                }
                ConnectionMessage::Subscribe(subscriber) => self.subscribers.push(subscriber),
                ConnectionMessage::SetReconnectDelay(delay) => {
                    debug!("Reconnect delay of {} set to {:?}", self.name(), delay);
                    self.reconnect_delay = delay;
                }
                ConnectionMessage::Shutdown { response_tx } => {
                    self.close().await;
                    let _ = response_tx.send(());
                    return;
                }
            }
        }

        self.close().await;
    }

    async fn establish(&mut self) {
        if self.link.is_some() {
            debug!("{} is already established", self.name());
            return;
        }

        self.generation += 1;
        self.assembler.reset();
        self.set_state(ConnectionState::Connecting);
        match self.try_establish().await {
            Ok(()) => {
                if let Some(task) = self.reconnect_task.take() {
                    task.abort();
                }
                info!("{} established", self.name());
                self.emit(DeviceEvent::Availability(Availability::Available))
                    .await;
            }
            Err(e) => {
                warn!("Could not establish {}: {}", self.name(), e);
                self.stop_tasks();
                self.schedule_reconnect();
            }
        }
    }

    async fn try_establish(&mut self) -> Result<(), ConnectError> {
        let address = self.config.address();
        let device = self
            .adapter
            .find_device(address)
            .await
            .map_err(|e| ConnectError::from_lookup(address, e))?;

        let (link, notifications) = DeviceLink::create(self.config.clone(), device)
            .connect()
            .await?;
        self.start_forwarding(notifications);

        self.set_state(ConnectionState::Authenticating);
        let link = link.login().await?;
        self.set_state(ConnectionState::TimeSyncing);
        let link = link.sync_time().await?;

        self.link = Some(link);
        self.set_state(ConnectionState::Polling);
        self.start_polling();
        Ok(())
    }

    async fn poll(&mut self) {
        if self.link.is_none() {
            return;
        }

        for command in [Command::measure(), Command::daily_data()] {
            if let Err(e) = self.send(&command).await {
                warn!("Polling {} failed: {}", self.name(), e);
                return;
            }
        }
        self.emit(DeviceEvent::Availability(Availability::Available))
            .await;
    }

    /// Writes through the link; any failure takes the connection down
    async fn send(&mut self, command: &Command) -> Result<(), SendError> {
        let result = match &self.link {
            Some(link) => link.send(command).await,
            None => Err(SendError::NotConnected {
                address: self.config.address().to_string(),
            }),
        };

        if let Err(e) = &result {
            warn!("Sending {} to {} failed: {}", command, self.name(), e);
            self.mark_lost().await;
        }
        result
    }

    async fn on_notification(&mut self, raw: Vec<u8>) {
        debug!("{} -> [{}]", self.name(), hex::encode(&raw));
        let Some(response) = self.assembler.push(&raw) else {
            return;
        };
        match &response {
            Response::Measurement(measurement) => debug!("{}: {}", self.name(), measurement),
            Response::DailyData(daily) => {
                debug!("{}: {} hourly {:?}", self.name(), daily, daily.hourly)
            }
            Response::Login { result } if *result != 0 => {
                warn!("{} rejected the login (code {})", self.name(), result)
            }
            _ => debug!("{}: {}", self.name(), response),
        }
        self.emit(DeviceEvent::Response(response)).await;
    }

    /// Disconnects the link, reports it lost if it was established and schedules a reconnect
    async fn mark_lost(&mut self) {
        self.stop_tasks();
        if let Some(link) = self.link.take() {
            link.disconnect().await;
            self.emit(DeviceEvent::Availability(Availability::Lost)).await;
        }
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        self.set_state(ConnectionState::ReconnectPending);
        if self.reconnect_task.is_some() {
            debug!("Reconnect of {} already pending", self.name());
            return;
        }

        info!(
            "Reconnecting to {} in {:?}",
            self.name(),
            self.reconnect_delay
        );
        let sender = self.sender.clone();
        let delay = self.reconnect_delay;
        self.reconnect_task = Some(tokio::spawn(async move {
            sleep(delay).await;
            if let Some(tx) = sender.upgrade() {
                let _ = tx.send(ConnectionMessage::Reconnect).await;
            }
        }));
    }

    fn start_forwarding(&mut self, mut notifications: NotificationStream) {
        let sender = self.sender.clone();
        let generation = self.generation;
        self.forward_task = Some(tokio::spawn(async move {
            while let Some(raw) = notifications.next().await {
                let Some(tx) = sender.upgrade() else { return };
                if tx
                    .send(ConnectionMessage::Notification { generation, raw })
                    .await
                    .is_err()
                {
                    return;
                }
            }
            if let Some(tx) = sender.upgrade() {
                let _ = tx.send(ConnectionMessage::LinkLost { generation }).await;
            }
        }));
    }

    fn start_polling(&mut self) {
        let sender = self.sender.clone();
        let period = self.config.refresh_interval();
        self.poll_task = Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(tx) = sender.upgrade() else { return };
                if tx.send(ConnectionMessage::Poll).await.is_err() {
                    return;
                }
            }
        }));
    }

    fn stop_tasks(&mut self) {
        for task in [self.forward_task.take(), self.poll_task.take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }
    }

    async fn close(&mut self) {
        self.stop_tasks();
        if let Some(task) = self.reconnect_task.take() {
            task.abort();
        }
        if let Some(link) = self.link.take() {
            link.disconnect().await;
        }
        self.set_state(ConnectionState::Disconnected);
        info!("Connection to {} closed", self.name());
    }

    async fn emit(&mut self, event: DeviceEvent) {
        self.subscribers.retain(|subscriber| !subscriber.is_closed());
        for subscriber in &self.subscribers {
            if subscriber.send(event.clone()).await.is_err() {
                error!("Subscriber of {} went away while sending {:?}", self.config.name(), event);
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            debug!("{}: {} -> {}", self.config.name(), current, state);
            *current = state;
            true
        });
    }
}
