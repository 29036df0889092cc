//! Bridge client for communication with the Insidious worker.
//!
//! This module provides `BridgeClient`, an async handle that connects to the
//! worker's TCP listener, runs the background receive loop, and sends
//! commands with optional reply correlation and timeout handling.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::ipc::framing;
use crate::ipc::pending::{Completion, PendingRequests, Waiter};
use crate::ipc::receiver::{LoopExit, ReceiveLoop};
use crate::ipc::router::{Router, Topic};
use crate::models::{CorrelationId, Message};

/// Bridge-specific error types.
///
/// These errors provide actionable messages for the failure modes a
/// front end has to handle when driving the worker.
#[derive(Debug, Error)]
pub enum IpcError {
    /// All connection attempts failed.
    #[error("Connection to {endpoint} failed after {attempts} attempt(s): {source}")]
    ConnectionFailed {
        endpoint: String,
        attempts: u32,
        #[source]
        source: io::Error,
    },

    /// No live connection at send time.
    #[error("Not connected to bridge")]
    NotConnected,

    /// Awaited reply did not arrive in time.
    #[error("No response received for {scope}.{operation} after {timeout:?}")]
    Timeout {
        scope: String,
        operation: String,
        timeout: Duration,
    },

    /// The outbound message could not be encoded.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The connection went away while the command was in flight.
    #[error("Connection closed before the command completed")]
    Disconnected,

    /// I/O error while writing a frame.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Whether a command waits for its correlated response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyMode {
    FireAndForget,
    Await(Duration),
}

/// Write half of the live connection and the token that tears it down.
struct WriteSide {
    half: OwnedWriteHalf,
    cancel: CancellationToken,
}

/// Removes a pending entry if the awaiting send is abandoned.
///
/// A caller that drops a `request()` future (outer timeout, `select!`)
/// must not leave its token behind, or a late reply would be swallowed.
struct PendingGuard<'a> {
    pending: &'a PendingRequests,
    id: CorrelationId,
    active: bool,
}

impl<'a> PendingGuard<'a> {
    fn new(pending: &'a PendingRequests, id: CorrelationId) -> Self {
        Self {
            pending,
            id,
            active: true,
        }
    }

    /// The entry has been completed; nothing to clean up.
    fn deactivate(&mut self) {
        self.active = false;
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.active && self.pending.discard(&self.id) {
            debug!(msg_id = %self.id, "Request abandoned, pending entry discarded");
        }
    }
}

/// Receive loop bookkeeping, guarded by the lifecycle lock.
#[derive(Default)]
struct Link {
    cancel: Option<CancellationToken>,
    reader: Option<JoinHandle<LoopExit>>,
}

struct Inner {
    config: BridgeConfig,
    router: Arc<Router>,
    /// Set while a connection is live; cleared by the receive loop on exit.
    running: Arc<AtomicBool>,
    connecting: AtomicBool,
    /// Write half; the lock serializes frames from concurrent senders.
    writer: Mutex<Option<WriteSide>>,
    link: Mutex<Link>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Last handle gone: stop the receive loop so the socket closes
        if let Some(cancel) = self.link.get_mut().cancel.take() {
            cancel.cancel();
        }
    }
}

/// Handle to the worker bridge.
///
/// Cheap to clone; every clone drives the same connection. Pass it
/// explicitly to whatever needs to talk to the worker.
///
/// # Connection Lifecycle
///
/// - `connect()` - Open the socket with bounded retry and start the receive loop
/// - `send()` / `request()` - Issue commands (fire-and-forget or awaited)
/// - `disconnect()` - Stop the loop and close the socket (idempotent)
///
/// # Example
///
/// ```ignore
/// use insidious_bridge::{BridgeClient, BridgeConfig};
/// use serde_json::json;
///
/// let client = BridgeClient::new(BridgeConfig::from_env());
/// client.connect().await?;
///
/// client.send("dns", "spoof_all", json!({"target_ip": "10.0.0.5"})).await?;
/// let status = client.request("mitm", "get_status", json!(null)).await?;
/// ```
#[derive(Clone)]
pub struct BridgeClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for BridgeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeClient")
            .field("endpoint", &self.inner.config.endpoint())
            .field("state", &self.state())
            .field("router", &self.inner.router)
            .finish()
    }
}

impl BridgeClient {
    /// Create a disconnected client.
    pub fn new(config: BridgeConfig) -> Self {
        let pending = Arc::new(PendingRequests::new());
        Self {
            inner: Arc::new(Inner {
                config,
                router: Arc::new(Router::new(pending)),
                running: Arc::new(AtomicBool::new(false)),
                connecting: AtomicBool::new(false),
                writer: Mutex::new(None),
                link: Mutex::new(Link::default()),
            }),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    /// Whether the transport is currently live.
    pub fn is_connected(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ConnectionState {
        if self.is_connected() {
            ConnectionState::Connected
        } else if self.inner.connecting.load(Ordering::SeqCst) {
            ConnectionState::Connecting
        } else {
            ConnectionState::Disconnected
        }
    }

    /// Number of commands still awaiting a reply.
    pub fn pending_requests(&self) -> usize {
        self.inner.router.pending().len()
    }

    /// Connect to the configured endpoint and start the receive loop.
    ///
    /// Makes up to `max_attempts` attempts, pausing `retry_interval`
    /// between them. Already being connected is not an error.
    ///
    /// # Errors
    ///
    /// Returns `IpcError::ConnectionFailed` with the last I/O error if every
    /// attempt fails. The client stays disconnected and `connect()` can be
    /// called again.
    pub async fn connect(&self) -> Result<(), IpcError> {
        let mut link = self.inner.link.lock().await;

        if self.is_connected() {
            debug!("Already connected to {}", self.inner.config.endpoint());
            return Ok(());
        }

        // A loop that ended on its own has already cleared `running`
        if let Some(reader) = link.reader.take() {
            if let Err(e) = reader.await {
                warn!("Previous receive loop failed: {}", e);
            }
        }
        link.cancel = None;

        self.inner.connecting.store(true, Ordering::SeqCst);
        let result = self.open_with_retry().await;
        self.inner.connecting.store(false, Ordering::SeqCst);
        let stream = result?;

        let (read_half, write_half) = stream.into_split();
        let cancel = CancellationToken::new();
        *self.inner.writer.lock().await = Some(WriteSide {
            half: write_half,
            cancel: cancel.clone(),
        });

        self.inner.running.store(true, Ordering::SeqCst);
        let reader = ReceiveLoop::new(
            read_half,
            Arc::clone(&self.inner.router),
            Arc::clone(&self.inner.running),
            cancel.clone(),
            self.inner.config.read_chunk_size,
        )
        .spawn();

        link.cancel = Some(cancel);
        link.reader = Some(reader);

        info!("Connected to bridge at {}", self.inner.config.endpoint());
        Ok(())
    }

    async fn open_with_retry(&self) -> Result<TcpStream, IpcError> {
        let config = &self.inner.config;
        let endpoint = config.endpoint();
        let attempts = config.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match TcpStream::connect(&endpoint).await {
                Ok(stream) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("Failed to set TCP_NODELAY: {}", e);
                    }
                    return Ok(stream);
                }
                Err(e) => {
                    warn!(attempt, "Connection attempt {} failed: {}", attempt, e);
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(config.retry_interval).await;
                    }
                }
            }
        }

        Err(IpcError::ConnectionFailed {
            endpoint,
            attempts,
            source: last_error
                .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "no attempt made")),
        })
    }

    /// Stop the receive loop and close the connection.
    ///
    /// Writes blocked on a stalled peer are abandoned with
    /// `IpcError::Disconnected`, and callers awaiting replies are released
    /// with the same error. Calling this on a disconnected client is a no-op.
    pub async fn disconnect(&self) {
        let mut link = self.inner.link.lock().await;
        self.inner.running.store(false, Ordering::SeqCst);

        // Cancelling first frees the writer lock from any in-progress write
        if let Some(cancel) = link.cancel.take() {
            cancel.cancel();
        }

        if let Some(mut writer) = self.inner.writer.lock().await.take() {
            if let Err(e) = writer.half.shutdown().await {
                debug!("Socket shutdown failed: {}", e);
            }
        }

        let abandoned = self.inner.router.pending().clear();
        if abandoned > 0 {
            debug!(abandoned, "Released requests awaiting replies");
        }

        if let Some(reader) = link.reader.take() {
            match reader.await {
                Ok(exit) => debug!(?exit, "Receive loop joined"),
                Err(e) => warn!("Receive loop failed: {}", e),
            }
            info!("Disconnected from bridge");
        }
    }

    /// Register a callback for `topic`.
    ///
    /// Callbacks run on the receive loop (or on the sending task for
    /// `Topic::Sent`) and must not block.
    pub fn subscribe<F>(&self, topic: Topic, handler: F)
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.inner.router.subscribe(topic, handler);
    }

    /// Register a channel for `topic`.
    pub fn subscribe_channel(&self, topic: Topic) -> mpsc::UnboundedReceiver<Message> {
        self.inner.router.subscribe_channel(topic)
    }

    /// Send a command without waiting for a reply.
    pub async fn send(
        &self,
        scope: &str,
        operation: &str,
        payload: serde_json::Value,
    ) -> Result<(), IpcError> {
        self.send_command(scope, operation, payload, ReplyMode::FireAndForget)
            .await
            .map(|_| ())
    }

    /// Send a command and wait for its response, using the configured timeout.
    pub async fn request(
        &self,
        scope: &str,
        operation: &str,
        payload: serde_json::Value,
    ) -> Result<Message, IpcError> {
        self.request_with_timeout(scope, operation, payload, self.inner.config.request_timeout)
            .await
    }

    /// Send a command and wait up to `timeout` for its response.
    pub async fn request_with_timeout(
        &self,
        scope: &str,
        operation: &str,
        payload: serde_json::Value,
        timeout: Duration,
    ) -> Result<Message, IpcError> {
        match self
            .send_command(scope, operation, payload, ReplyMode::Await(timeout))
            .await?
        {
            Some(reply) => Ok(reply),
            None => Err(IpcError::Disconnected),
        }
    }

    /// Build, write, and optionally await a command.
    ///
    /// This method:
    /// 1. Builds a `CMD` message with a fresh correlation token
    /// 2. Registers the token before writing, when a reply is awaited
    /// 3. Writes the frame under the write lock and flushes it
    /// 4. Fires `Topic::Sent` subscribers
    /// 5. Waits for the reply or the deadline, whichever comes first
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - The client is not connected (`IpcError::NotConnected`)
    /// - The frame cannot be encoded (`IpcError::Protocol`)
    /// - The write fails (`IpcError::Io`)
    /// - The connection is closed mid-flight (`IpcError::Disconnected`)
    /// - No reply arrives in time (`IpcError::Timeout`)
    pub async fn send_command(
        &self,
        scope: &str,
        operation: &str,
        payload: serde_json::Value,
        mode: ReplyMode,
    ) -> Result<Option<Message>, IpcError> {
        if !self.is_connected() {
            return Err(IpcError::NotConnected);
        }

        let mut message = Message::command(scope, operation, payload);
        let awaiting = match mode {
            ReplyMode::FireAndForget => None,
            ReplyMode::Await(timeout) => Some((self.register(&mut message), timeout)),
        };
        // Discards the entry on a failed write or if this future is dropped
        let mut guard = awaiting
            .as_ref()
            .map(|(waiter, _)| PendingGuard::new(self.inner.router.pending(), waiter.id().clone()));

        self.write_message(&message).await?;

        debug!(msg_id = %message.correlation_id, "Sent {}", message.route());
        self.inner.router.notify_sent(&message);

        match awaiting {
            None => Ok(None),
            Some((waiter, timeout)) => {
                let reply = self.await_reply(&message, waiter, timeout).await;
                if let Some(guard) = guard.as_mut() {
                    guard.deactivate();
                }
                reply.map(Some)
            }
        }
    }

    /// Register `message` in the pending table, redrawing its token on collision.
    fn register(&self, message: &mut Message) -> Waiter {
        let pending = self.inner.router.pending();
        loop {
            if let Some(waiter) = pending.register(message.correlation_id.clone()) {
                return waiter;
            }
            debug!(msg_id = %message.correlation_id, "Correlation token in use, redrawing");
            message.correlation_id = CorrelationId::generate();
        }
    }

    async fn write_message(&self, message: &Message) -> Result<(), IpcError> {
        let frame = framing::encode(message).map_err(|e| {
            IpcError::Protocol(format!("Failed to serialize {}: {}", message.route(), e))
        })?;

        let mut writer = self.inner.writer.lock().await;
        let WriteSide { half, cancel } = writer.as_mut().ok_or(IpcError::NotConnected)?;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(IpcError::Disconnected),
            written = framing::write_frame(half, &frame) => written.map_err(IpcError::from),
        }
    }

    async fn await_reply(
        &self,
        message: &Message,
        mut waiter: Waiter,
        timeout: Duration,
    ) -> Result<Message, IpcError> {
        let timed_out = || IpcError::Timeout {
            scope: message.scope.clone(),
            operation: message.operation.clone(),
            timeout,
        };

        match tokio::time::timeout(timeout, waiter.recv()).await {
            Ok(Some(Completion::Reply(reply))) => Ok(reply),
            Ok(Some(Completion::Expired)) => Err(timed_out()),
            Ok(None) => Err(IpcError::Disconnected),
            Err(_elapsed) => {
                if self.inner.router.pending().expire(waiter.id()) {
                    warn!(msg_id = %waiter.id(), "No response received for {}", message.route());
                    return Err(timed_out());
                }
                // The entry was completed or dropped under the lock already
                match waiter.recv().await {
                    Some(Completion::Reply(reply)) => Ok(reply),
                    Some(Completion::Expired) => Err(timed_out()),
                    None => Err(IpcError::Disconnected),
                }
            }
        }
    }
}

/// Trait for bridge operations used by front-end collaborators.
///
/// This trait abstracts the bridge to enable:
/// - Dependency injection for testing with a fake bridge
/// - Separation of interface from the socket implementation
#[async_trait]
pub trait BridgeService: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Send a command without waiting for a reply.
    async fn send(
        &self,
        scope: &str,
        operation: &str,
        payload: serde_json::Value,
    ) -> Result<(), IpcError>;

    /// Send a command and wait for its response.
    async fn request(
        &self,
        scope: &str,
        operation: &str,
        payload: serde_json::Value,
        timeout: Duration,
    ) -> Result<Message, IpcError>;
}

/// The trait methods delegate to the inherent methods.
#[async_trait]
impl BridgeService for BridgeClient {
    fn is_connected(&self) -> bool {
        BridgeClient::is_connected(self)
    }

    async fn send(
        &self,
        scope: &str,
        operation: &str,
        payload: serde_json::Value,
    ) -> Result<(), IpcError> {
        BridgeClient::send(self, scope, operation, payload).await
    }

    async fn request(
        &self,
        scope: &str,
        operation: &str,
        payload: serde_json::Value,
        timeout: Duration,
    ) -> Result<Message, IpcError> {
        BridgeClient::request_with_timeout(self, scope, operation, payload, timeout).await
    }
}
