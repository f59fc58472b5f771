use std::fmt;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::address::Address;
use super::amqp_client::{Engine, EngineEvent};
use super::channel_manager::ChannelContext;
use super::errors::TransportError;
use super::lock;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Closing,
    Closed,
    Failed,
}

impl ConnectionState {
    /// Transitions the reactor callbacks are allowed to drive.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        matches!(
            (self, next),
            // A new attempt after a clean close or a failure starts from Connecting again.
            (Disconnected | Closed | Failed, Connecting)
                | (Connecting, Connected)
                | (Connecting | Connected | Closing, Failed)
                | (Connecting | Connected, Closing)
                // Peer-initiated shutdown skips Closing.
                | (Connected | Closing, Closed)
        )
    }

    /// No connection is alive in these states.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected | ConnectionState::Closed | ConnectionState::Failed
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
            ConnectionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Lifecycle notifications for a connection. Every method defaults to a no-op.
pub trait ConnectionEvents: Send + Sync {
    fn on_connected(&self) {}

    fn on_error(&self, _error: &TransportError) {}

    fn on_closed(&self) {}
}

/// Events sink that ignores everything.
#[derive(Debug, Default)]
pub struct NoEvents;

impl ConnectionEvents for NoEvents {}

struct TransportShared {
    id: String,
    state: watch::Sender<ConnectionState>,
    channel: Mutex<Option<ChannelContext>>,
}

impl TransportShared {
    /// Apply `next` if the table allows it. Leaving Connected invalidates the channel.
    fn transition(&self, next: ConnectionState) -> bool {
        let mut previous = None;

        self.state.send_if_modified(|current| {
            if current.can_transition_to(next) {
                previous = Some(*current);
                *current = next;
                true
            } else {
                false
            }
        });

        let Some(previous) = previous else {
            debug!(connection_id = %self.id, "Ignoring transition to {}", next);
            return false;
        };

        debug!(connection_id = %self.id, from = %previous, to = %next, "Connection state changed");

        if previous == ConnectionState::Connected {
            if let Some(channel) = lock(&self.channel).take() {
                channel.invalidate();
            }
        }

        true
    }
}

/// Owns one connection at a time and the state driven by its engine.
pub struct TransportHandle {
    engine: Arc<dyn Engine>,
    events: Arc<dyn ConnectionEvents>,
    shared: Arc<TransportShared>,
}

impl TransportHandle {
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        TransportHandle {
            engine,
            events: Arc::new(NoEvents),
            shared: Arc::new(TransportShared {
                id: format!("connection-{}", &Uuid::new_v4().to_string()[..8]),
                state,
                channel: Mutex::new(None),
            }),
        }
    }

    pub fn with_events(mut self, events: Arc<dyn ConnectionEvents>) -> Self {
        self.events = events;
        self
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// The channel of the current connect cycle, while Connected.
    pub fn channel(&self) -> Option<ChannelContext> {
        lock(&self.shared.channel).clone()
    }

    /// Run the handshake. On success the channel for this cycle is returned and
    /// `on_connected` has fired; on failure the handle is Failed and `on_error` has fired.
    /// A `close()` issued mid-handshake wins either way: the handle ends Closed and
    /// `on_closed` fires. No retry is attempted; calling `open` again starts a fresh attempt.
    pub async fn open(&self, address: &Address) -> Result<ChannelContext, TransportError> {
        let current = self.state();
        if !self.shared.transition(ConnectionState::Connecting) {
            return Err(TransportError::InvalidState(current));
        }

        info!(connection_id = %self.shared.id, "Attempting to connect to {}", address);

        let (sink, events_rx) = mpsc::unbounded_channel();

        let backend = match self.engine.connect(address, sink).await {
            Ok(backend) => backend,
            Err(reason) => {
                let err = TransportError::Handshake(reason);
                error!(connection_id = %self.shared.id, "Failed to connect: {}", err);
                if self.state() == ConnectionState::Closing {
                    // close() was called mid-handshake
                    if self.shared.transition(ConnectionState::Closed) {
                        self.events.on_closed();
                    }
                } else if self.shared.transition(ConnectionState::Failed) {
                    self.events.on_error(&err);
                }
                return Err(err);
            }
        };

        if !self.shared.transition(ConnectionState::Connected) {
            warn!(connection_id = %self.shared.id, "Connection closed during handshake");
            if let Err(reason) = backend.close().await {
                debug!(connection_id = %self.shared.id, "Close after aborted handshake failed: {}", reason);
            }
            if self.shared.transition(ConnectionState::Closed) {
                self.events.on_closed();
            }
            return Err(TransportError::Aborted);
        }

        let channel = ChannelContext::start(&self.shared.id, backend, self.shared.state.subscribe());
        *lock(&self.shared.channel) = Some(channel.clone());

        info!(connection_id = %self.shared.id, channel_id = %channel.id(), "Successfully connected");
        self.events.on_connected();

        tokio::spawn(pump_events(
            events_rx,
            channel.clone(),
            self.shared.clone(),
            self.events.clone(),
        ));

        Ok(channel)
    }

    /// Close the connection. A no-op returning `Ok` when nothing is open.
    pub async fn close(&self) -> Result<(), TransportError> {
        match self.state() {
            ConnectionState::Connected => {}
            ConnectionState::Connecting => {
                // open() observes Closing once the handshake returns and tears down.
                self.shared.transition(ConnectionState::Closing);
                return Ok(());
            }
            _ => return Ok(()),
        }

        let channel = self.channel();
        if !self.shared.transition(ConnectionState::Closing) {
            return Ok(());
        }

        info!(connection_id = %self.shared.id, "Closing connection");
        if let Some(channel) = channel {
            if let Err(reason) = channel.shutdown().await {
                warn!(connection_id = %self.shared.id, "Engine close reported: {}", reason);
            }
        }

        if self.shared.transition(ConnectionState::Closed) {
            self.events.on_closed();
        }
        Ok(())
    }

    /// Resolve once no connection is alive (Disconnected, Closed or Failed).
    pub async fn closed(&self) -> ConnectionState {
        let mut state = self.shared.state.subscribe();
        loop {
            let current = *state.borrow_and_update();
            if current.is_terminal() {
                return current;
            }
            if state.changed().await.is_err() {
                return self.state();
            }
        }
    }
}

impl fmt::Debug for TransportHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportHandle")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish()
    }
}

/// Reactor side of a connection: applies engine events in arrival order.
async fn pump_events(
    mut events_rx: mpsc::UnboundedReceiver<EngineEvent>,
    channel: ChannelContext,
    shared: Arc<TransportShared>,
    events: Arc<dyn ConnectionEvents>,
) {
    while let Some(event) = events_rx.recv().await {
        match event {
            EngineEvent::Delivery {
                consumer_tag,
                delivery,
            } => channel.dispatch(&consumer_tag, delivery),
            EngineEvent::ConsumerCancelled { consumer_tag } => channel.cancel_consumer(&consumer_tag),
            EngineEvent::Error(reason) => {
                let err = TransportError::Lost(reason);
                if shared.transition(ConnectionState::Failed) {
                    error!(connection_id = %shared.id, "Connection failed: {}", err);
                    events.on_error(&err);
                }
                return;
            }
            EngineEvent::Closed => {
                if shared.transition(ConnectionState::Closed) {
                    info!(connection_id = %shared.id, "Connection closed by peer");
                    events.on_closed();
                }
                return;
            }
        }
    }

    // Engine dropped its end. Expected while close() tears the connection down.
    if *shared.state.borrow() == ConnectionState::Closing {
        return;
    }
    let err = TransportError::Lost("event stream ended".to_string());
    if shared.transition(ConnectionState::Failed) {
        error!(connection_id = %shared.id, "Connection failed: {}", err);
        events.on_error(&err);
    }
}
