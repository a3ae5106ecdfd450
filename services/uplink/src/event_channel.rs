//! Persistent event channel to the alert service.
//!
//! The channel keeps one connection per subject open, reconnects with a
//! fixed delay after unsolicited closes, and fans inbound messages out to
//! listeners registered per [`EventKind`].
//!
//! ```text
//! Idle -> Connecting -> Open -> Closed -> Reconnecting -> Connecting -> ...
//!                                     \-> Failed (attempts exhausted)
//! ```

use crate::config::ChannelConfig;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

/// Errors that can occur on the event channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Channel is not connected")]
    NotConnected,

    #[error("Failed to serialize message: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// State of the channel connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Connecting,
    Open,
    Closed,
    Reconnecting,
    Failed,
}

/// Notification names listeners subscribe to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connected,
    Disconnected,
    Reconnecting,
    ReconnectFailed,
    Error,
    /// Every parsed inbound message
    Message,
    /// Inbound messages whose `type` field equals the given name
    Typed(String),
}

impl EventKind {
    pub fn typed(name: impl Into<String>) -> Self {
        EventKind::Typed(name.into())
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Connected => write!(f, "connected"),
            EventKind::Disconnected => write!(f, "disconnected"),
            EventKind::Reconnecting => write!(f, "reconnecting"),
            EventKind::ReconnectFailed => write!(f, "reconnect_failed"),
            EventKind::Error => write!(f, "error"),
            EventKind::Message => write!(f, "message"),
            EventKind::Typed(name) => write!(f, "{}", name),
        }
    }
}

/// Payload delivered to listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Connected,
    Disconnected,
    Reconnecting { attempt: u32, max_attempts: u32 },
    ReconnectFailed { attempts: u32 },
    Error(String),
    Message(Value),
}

/// Listener callback. Errors and panics are logged and do not affect other
/// listeners.
pub type Listener = Arc<dyn Fn(&ChannelEvent) -> anyhow::Result<()> + Send + Sync>;

/// Handle returned by [`EventChannel::on`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Outbound payload: raw text, or a JSON value serialized on send.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    Text(String),
    Json(Value),
}

impl OutboundMessage {
    fn into_text(self) -> Result<String, ChannelError> {
        match self {
            OutboundMessage::Text(text) => Ok(text),
            OutboundMessage::Json(value) => Ok(serde_json::to_string(&value)?),
        }
    }
}

impl From<String> for OutboundMessage {
    fn from(text: String) -> Self {
        OutboundMessage::Text(text)
    }
}

impl From<&str> for OutboundMessage {
    fn from(text: &str) -> Self {
        OutboundMessage::Text(text.to_string())
    }
}

impl From<Value> for OutboundMessage {
    fn from(value: Value) -> Self {
        OutboundMessage::Json(value)
    }
}

/// Frame read from a live connection.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Text(String),
    Error(String),
}

/// Frame written to a live connection.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    Text(String),
    Close,
}

/// Client side of an open connection. The connection is closed when
/// `inbound` yields `None`.
#[derive(Debug)]
pub struct ConnectionHandle {
    pub outbound: mpsc::UnboundedSender<OutboundFrame>,
    pub inbound: mpsc::UnboundedReceiver<InboundFrame>,
}

/// Opens connections for the channel.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, endpoint: &str) -> Result<ConnectionHandle, ChannelError>;
}

/// Reconnection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSettings {
    pub max_reconnect_attempts: u32,
    pub reconnect_delay: Duration,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 5,
            reconnect_delay: Duration::from_millis(3_000),
        }
    }
}

impl From<&ChannelConfig> for ChannelSettings {
    fn from(config: &ChannelConfig) -> Self {
        Self {
            max_reconnect_attempts: config.max_reconnect_attempts,
            reconnect_delay: config.reconnect_delay(),
        }
    }
}

struct Connection {
    state: ChannelState,
    attempts: u32,
    outbound: Option<mpsc::UnboundedSender<OutboundFrame>>,
    driver: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
    /// Bumped on every connect and disconnect; tasks from an older
    /// generation must not touch the connection.
    generation: u64,
}

struct Inner {
    endpoint: String,
    settings: ChannelSettings,
    connector: Arc<dyn Connector>,
    connection: Mutex<Connection>,
    listeners: Mutex<HashMap<EventKind, Vec<(ListenerId, Listener)>>>,
    next_listener_id: AtomicU64,
}

impl Inner {
    fn start_connecting(self: &Arc<Self>, conn: &mut Connection) {
        conn.generation += 1;
        conn.state = ChannelState::Connecting;

        let generation = conn.generation;
        let inner = Arc::clone(self);
        conn.driver = Some(tokio::spawn(async move {
            inner.drive(generation).await;
        }));
    }

    async fn drive(self: Arc<Self>, generation: u64) {
        debug!(endpoint = %self.endpoint, generation, "Opening event channel");

        let handle = match self.connector.open(&self.endpoint).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(endpoint = %self.endpoint, error = %e, "Event channel connection failed");
                self.emit(&EventKind::Error, &ChannelEvent::Error(e.to_string()));
                self.handle_close(generation);
                return;
            }
        };

        let mut inbound = {
            let mut conn = self.connection.lock();
            if conn.generation != generation {
                debug!(generation, "Connection superseded before open");
                return;
            }
            conn.state = ChannelState::Open;
            conn.attempts = 0;
            conn.outbound = Some(handle.outbound);
            handle.inbound
        };

        info!(endpoint = %self.endpoint, "Event channel connected");
        self.emit(&EventKind::Connected, &ChannelEvent::Connected);

        while let Some(frame) = inbound.recv().await {
            match frame {
                InboundFrame::Text(text) => self.dispatch_message(&text),
                InboundFrame::Error(message) => {
                    warn!(error = %message, "Event channel transport error");
                    self.emit(&EventKind::Error, &ChannelEvent::Error(message));
                }
            }
        }

        self.handle_close(generation);
    }

    fn dispatch_message(&self, text: &str) {
        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "Dropping malformed event channel message");
                return;
            }
        };

        let typed = value
            .get("type")
            .and_then(Value::as_str)
            .map(EventKind::typed);
        let event = ChannelEvent::Message(value);

        self.emit(&EventKind::Message, &event);
        if let Some(kind) = typed {
            self.emit(&kind, &event);
        }
    }

    fn handle_close(self: &Arc<Self>, generation: u64) {
        {
            let mut conn = self.connection.lock();
            if conn.generation != generation {
                return;
            }
            conn.state = ChannelState::Closed;
            conn.outbound = None;
        }

        info!(endpoint = %self.endpoint, "Event channel closed");
        self.emit(&EventKind::Disconnected, &ChannelEvent::Disconnected);

        let max_attempts = self.settings.max_reconnect_attempts;
        let next = {
            let mut conn = self.connection.lock();
            // A listener may have reconnected or disconnected already.
            if conn.generation != generation || conn.state != ChannelState::Closed {
                return;
            }

            if conn.attempts < max_attempts {
                conn.attempts += 1;
                conn.state = ChannelState::Reconnecting;
                self.schedule_reconnect(&mut conn, generation);
                ChannelEvent::Reconnecting {
                    attempt: conn.attempts,
                    max_attempts,
                }
            } else {
                conn.state = ChannelState::Failed;
                ChannelEvent::ReconnectFailed {
                    attempts: conn.attempts,
                }
            }
        };

        match next {
            ChannelEvent::Reconnecting { attempt, .. } => {
                info!(
                    attempt,
                    max_attempts,
                    delay_ms = self.settings.reconnect_delay.as_millis() as u64,
                    "Scheduling event channel reconnect"
                );
                self.emit(&EventKind::Reconnecting, &next);
            }
            _ => {
                error!(max_attempts, "Event channel reconnect attempts exhausted");
                self.emit(&EventKind::ReconnectFailed, &next);
            }
        }
    }

    fn schedule_reconnect(self: &Arc<Self>, conn: &mut Connection, generation: u64) {
        let inner = Arc::clone(self);
        let delay = self.settings.reconnect_delay;

        conn.reconnect = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let mut conn = inner.connection.lock();
            if conn.generation != generation || conn.state != ChannelState::Reconnecting {
                return;
            }
            conn.reconnect = None;
            inner.start_connecting(&mut conn);
        }));
    }

    fn emit(&self, kind: &EventKind, event: &ChannelEvent) {
        let listeners = match self.listeners.lock().get(kind) {
            Some(listeners) => listeners.clone(),
            None => return,
        };

        for (id, listener) in listeners {
            match panic::catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(listener = id.0, event = %kind, error = %e, "Event listener failed");
                }
                Err(_) => {
                    error!(listener = id.0, event = %kind, "Event listener panicked");
                }
            }
        }
    }
}

/// Client for the per-subject event channel.
///
/// Cloning yields another handle to the same channel. `connect` spawns the
/// connection task and must be called from within a Tokio runtime.
#[derive(Clone)]
pub struct EventChannel {
    inner: Arc<Inner>,
}

impl EventChannel {
    /// Create a channel for `{base_url}/ws/{subject_id}`.
    pub fn new(
        base_url: &str,
        subject_id: &str,
        settings: ChannelSettings,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let endpoint = format!("{}/ws/{}", base_url.trim_end_matches('/'), subject_id);

        Self {
            inner: Arc::new(Inner {
                endpoint,
                settings,
                connector,
                connection: Mutex::new(Connection {
                    state: ChannelState::Idle,
                    attempts: 0,
                    outbound: None,
                    driver: None,
                    reconnect: None,
                    generation: 0,
                }),
                listeners: Mutex::new(HashMap::new()),
                next_listener_id: AtomicU64::new(1),
            }),
        }
    }

    /// Channel backed by a WebSocket connection.
    pub fn websocket(base_url: &str, subject_id: &str, settings: ChannelSettings) -> Self {
        Self::new(base_url, subject_id, settings, Arc::new(WebSocketConnector))
    }

    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    pub fn state(&self) -> ChannelState {
        self.inner.connection.lock().state
    }

    /// Consecutive reconnect attempts since the last successful open.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.connection.lock().attempts
    }

    /// Open the connection. No-op while connecting or open.
    pub fn connect(&self) {
        let mut conn = self.inner.connection.lock();
        if matches!(conn.state, ChannelState::Connecting | ChannelState::Open) {
            debug!(state = ?conn.state, "Event channel already connecting or open");
            return;
        }

        if let Some(task) = conn.reconnect.take() {
            task.abort();
        }
        conn.attempts = 0;
        self.inner.start_connecting(&mut conn);
    }

    /// Close the connection without triggering reconnection.
    pub fn disconnect(&self) {
        let was_open = {
            let mut conn = self.inner.connection.lock();
            conn.generation += 1;

            if let Some(task) = conn.reconnect.take() {
                task.abort();
            }
            if let Some(outbound) = conn.outbound.take() {
                let _ = outbound.send(OutboundFrame::Close);
            }
            if let Some(driver) = conn.driver.take() {
                driver.abort();
            }

            let was_open = conn.state == ChannelState::Open;
            conn.state = ChannelState::Idle;
            conn.attempts = 0;
            was_open
        };

        info!(endpoint = %self.inner.endpoint, "Event channel disconnected");
        if was_open {
            self.inner
                .emit(&EventKind::Disconnected, &ChannelEvent::Disconnected);
        }
    }

    /// Send a message if the channel is open. Messages are never queued:
    /// when the channel is not open the payload is dropped.
    pub fn send(&self, payload: impl Into<OutboundMessage>) -> Result<(), ChannelError> {
        let conn = self.inner.connection.lock();

        let outbound = match (conn.state, conn.outbound.as_ref()) {
            (ChannelState::Open, Some(outbound)) => outbound,
            (state, _) => {
                warn!(state = ?state, "Event channel not open, dropping outbound message");
                return Err(ChannelError::NotConnected);
            }
        };

        let text = payload.into().into_text()?;
        outbound
            .send(OutboundFrame::Text(text))
            .map_err(|_| ChannelError::NotConnected)
    }

    /// Register a listener for `kind`.
    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&ChannelEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = ListenerId(self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed));
        self.inner
            .listeners
            .lock()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener. Returns whether it was registered.
    pub fn off(&self, kind: &EventKind, id: ListenerId) -> bool {
        let mut listeners = self.inner.listeners.lock();
        match listeners.get_mut(kind) {
            Some(entries) => {
                let before = entries.len();
                entries.retain(|(existing, _)| *existing != id);
                before != entries.len()
            }
            None => false,
        }
    }
}

impl fmt::Debug for EventChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventChannel")
            .field("endpoint", &self.inner.endpoint)
            .field("state", &self.state())
            .finish()
    }
}

/// [`Connector`] over `tokio-tungstenite`.
#[derive(Debug, Default, Clone)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self, endpoint: &str) -> Result<ConnectionHandle, ChannelError> {
        let (stream, _response) = tokio_tungstenite::connect_async(endpoint).await?;
        let (mut sink, mut source) = stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<OutboundFrame>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<InboundFrame>();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    outbound = outbound_rx.recv() => match outbound {
                        Some(OutboundFrame::Text(text)) => {
                            if let Err(e) = sink.send(Message::Text(text)).await {
                                let _ = inbound_tx.send(InboundFrame::Error(e.to_string()));
                                break;
                            }
                        }
                        Some(OutboundFrame::Close) | None => {
                            let _ = sink.send(Message::Close(None)).await;
                            break;
                        }
                    },
                    inbound = source.next() => match inbound {
                        Some(Ok(Message::Text(text))) => {
                            if inbound_tx.send(InboundFrame::Text(text)).is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                            Ok(text) => {
                                if inbound_tx.send(InboundFrame::Text(text)).is_err() {
                                    break;
                                }
                            }
                            Err(_) => debug!("Ignoring non UTF-8 binary frame"),
                        },
                        Some(Ok(Message::Close(frame))) => {
                            debug!(frame = ?frame, "Server closed event channel");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            let _ = inbound_tx.send(InboundFrame::Error(e.to_string()));
                            break;
                        }
                        None => break,
                    },
                }
            }
        });

        Ok(ConnectionHandle {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}
