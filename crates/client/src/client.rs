//! Async driver around [`ConnectionController`].
//!
//! [`RelayClient::spawn`] starts one task that owns the controller, the
//! open transport and the reconnect timer. Callers talk to it through the
//! returned handle and read [`ClientEvent`]s from the receiver.

use std::collections::VecDeque;
use std::sync::Arc;

use taskrelay_core::messages::{ClientMessage, ServerMessage};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::controller::{AttemptId, CloseKind, Command, ConnectionController, ConnectionState};
use crate::error::ClientError;
use crate::reconnect::ReconnectConfig;
use crate::transport::{Connector, Transport, TransportEvent};

const EVENT_CHANNEL_CAPACITY: usize = 256;
const CONTROL_CHANNEL_CAPACITY: usize = 32;

/// Output of the relay client, in the order it happened.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    State(ConnectionState),
    Message(ServerMessage),
}

enum Control {
    Follow(Option<String>),
    Send(ClientMessage),
    Disconnect,
    Reconnect,
}

enum Internal {
    Connected(AttemptId, Box<dyn Transport>),
    ConnectFailed(AttemptId, ClientError),
    TimerFired(AttemptId),
}

/// Handle to a running relay client task.
#[derive(Clone)]
pub struct RelayClient {
    control: mpsc::Sender<Control>,
    cancel: CancellationToken,
}

impl RelayClient {
    /// Start the client task. It stays idle until [`follow`](Self::follow)
    /// is called.
    pub fn spawn(
        connector: Arc<dyn Connector>,
        config: ReconnectConfig,
    ) -> (Self, mpsc::Receiver<ClientEvent>, JoinHandle<()>) {
        let (control_tx, control_rx) = mpsc::channel(CONTROL_CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let driver = Driver {
            controller: ConnectionController::new(config),
            connector,
            events: event_tx,
            internal: internal_tx,
            connection: None,
            arrived: None,
            timer: None,
        };
        let handle = tokio::spawn(driver.run(control_rx, internal_rx, cancel.clone()));

        (
            Self {
                control: control_tx,
                cancel,
            },
            event_rx,
            handle,
        )
    }

    /// Follow `task_id`, replacing the current task.
    pub async fn follow(&self, task_id: impl Into<String>) -> Result<(), ClientError> {
        self.submit(Control::Follow(Some(task_id.into()))).await
    }

    /// Stop following and go idle.
    pub async fn clear(&self) -> Result<(), ClientError> {
        self.submit(Control::Follow(None)).await
    }

    /// Write a control message if the connection is open.
    pub async fn send(&self, message: ClientMessage) -> Result<(), ClientError> {
        self.submit(Control::Send(message)).await
    }

    /// Close the connection without reconnecting.
    pub async fn disconnect(&self) -> Result<(), ClientError> {
        self.submit(Control::Disconnect).await
    }

    /// Start over after the connection failed or was closed.
    pub async fn reconnect(&self) -> Result<(), ClientError> {
        self.submit(Control::Reconnect).await
    }

    /// Stop the client task, closing any open connection.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    async fn submit(&self, control: Control) -> Result<(), ClientError> {
        self.control
            .send(control)
            .await
            .map_err(|_| ClientError::Closed)
    }
}

struct Driver {
    controller: ConnectionController,
    connector: Arc<dyn Connector>,
    events: mpsc::Sender<ClientEvent>,
    internal: mpsc::UnboundedSender<Internal>,
    connection: Option<(AttemptId, Box<dyn Transport>)>,
    /// A completed connection awaiting `Adopt` or `Discard`.
    arrived: Option<(AttemptId, Box<dyn Transport>)>,
    timer: Option<JoinHandle<()>>,
}

impl Driver {
    async fn run(
        mut self,
        mut control: mpsc::Receiver<Control>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
        cancel: CancellationToken,
    ) {
        loop {
            let before = self.controller.state();

            let commands = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                item = control.recv() => match item {
                    Some(item) => self.on_control(item),
                    None => break,
                },
                Some(item) = internal.recv() => self.on_internal(item),
                (attempt, event) = next_transport_event(&mut self.connection) => {
                    self.on_transport(attempt, event).await
                }
            };
            self.apply(commands).await;

            let after = self.controller.state();
            if after != before {
                tracing::info!(from = %before, to = %after, "Relay connection state changed");
                emit(&self.events, ClientEvent::State(after)).await;
            }
        }

        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        if let Some((_, mut transport)) = self.connection.take() {
            transport.close().await;
        }
        tracing::debug!("Relay client stopped");
    }

    fn on_control(&mut self, control: Control) -> Vec<Command> {
        match control {
            Control::Follow(task_id) => self.controller.set_task(task_id.as_deref()),
            Control::Send(message) => self.controller.send(message),
            Control::Disconnect => self.controller.disconnect(),
            Control::Reconnect => self.controller.reconnect(),
        }
    }

    fn on_internal(&mut self, item: Internal) -> Vec<Command> {
        match item {
            Internal::Connected(attempt, transport) => {
                self.arrived = Some((attempt, transport));
                self.controller.on_connected(attempt)
            }
            Internal::ConnectFailed(attempt, e) => {
                tracing::warn!(attempt, error = %e, "Connection attempt failed");
                self.controller.on_connect_failed(attempt)
            }
            Internal::TimerFired(attempt) => {
                self.timer = None;
                self.controller.on_timer(attempt)
            }
        }
    }

    async fn on_transport(&mut self, attempt: AttemptId, event: TransportEvent) -> Vec<Command> {
        match event {
            TransportEvent::Message(message) => {
                emit(&self.events, ClientEvent::Message(message)).await;
                Vec::new()
            }
            TransportEvent::Closed(kind) => {
                self.connection = None;
                if kind == CloseKind::Abnormal {
                    tracing::warn!(
                        attempt,
                        error = %ClientError::TransportClosedAbnormally,
                        "Relay connection lost"
                    );
                }
                self.controller.on_closed(attempt, kind)
            }
        }
    }

    async fn apply(&mut self, commands: Vec<Command>) {
        let mut queue: VecDeque<Command> = commands.into();
        while let Some(command) = queue.pop_front() {
            match command {
                Command::Connect { attempt } => self.start_connect(attempt),
                Command::Adopt { attempt } => {
                    if let Some(arrived) = self.take_arrived(attempt) {
                        self.connection = Some(arrived);
                    }
                }
                Command::Discard { attempt } => {
                    if let Some((_, mut transport)) = self.take_arrived(attempt) {
                        tracing::debug!(attempt, "Closing superseded connection");
                        transport.close().await;
                    }
                }
                Command::Send(message) => {
                    let Some((attempt, transport)) = self.connection.as_mut() else {
                        continue;
                    };
                    if let Err(e) = transport.send(&message).await {
                        let attempt = *attempt;
                        tracing::warn!(attempt, error = %e, "Failed to send control message");
                        self.connection = None;
                        queue.extend(self.controller.on_closed(attempt, CloseKind::Abnormal));
                    }
                }
                Command::Close { attempt } => {
                    if self.connection.as_ref().is_some_and(|(a, _)| *a == attempt) {
                        if let Some((_, mut transport)) = self.connection.take() {
                            transport.close().await;
                        }
                    }
                }
                Command::ScheduleReconnect { attempt, delay } => {
                    self.cancel_timer();
                    let internal = self.internal.clone();
                    self.timer = Some(tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = internal.send(Internal::TimerFired(attempt));
                    }));
                }
                Command::CancelReconnect => self.cancel_timer(),
            }
        }
    }

    fn start_connect(&self, attempt: AttemptId) {
        tracing::debug!(attempt, "Connecting to relay");
        let connector = Arc::clone(&self.connector);
        let internal = self.internal.clone();
        tokio::spawn(async move {
            let item = match connector.connect().await {
                Ok(transport) => Internal::Connected(attempt, transport),
                Err(e) => Internal::ConnectFailed(attempt, e),
            };
            let _ = internal.send(item);
        });
    }

    fn take_arrived(&mut self, attempt: AttemptId) -> Option<(AttemptId, Box<dyn Transport>)> {
        match &self.arrived {
            Some((a, _)) if *a == attempt => self.arrived.take(),
            _ => None,
        }
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

async fn emit(events: &mpsc::Sender<ClientEvent>, event: ClientEvent) {
    if events.send(event).await.is_err() {
        tracing::trace!("Client event receiver dropped");
    }
}

async fn next_transport_event(
    connection: &mut Option<(AttemptId, Box<dyn Transport>)>,
) -> (AttemptId, TransportEvent) {
    match connection {
        Some((attempt, transport)) => (*attempt, transport.next_event().await),
        None => std::future::pending().await,
    }
}
