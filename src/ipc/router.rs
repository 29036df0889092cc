//! Dispatch of decoded inbound messages.
//!
//! The router either hands a response to the caller waiting on its token or
//! fans the message out to the subscribers registered for its kind. It keeps
//! no per-message state of its own.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::ipc::pending::PendingRequests;
use crate::models::{Message, MessageKind};

/// Notification stream a subscriber can register for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topic {
    /// Responses that matched no pending request.
    Response,
    Event,
    Error,
    /// Commands written to the socket by this client.
    Sent,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Response => "response",
            Topic::Event => "event",
            Topic::Error => "error",
            Topic::Sent => "sent",
        }
    }
}

/// Callback invoked on the receive loop (or the sending task, for `Sent`).
///
/// Handlers must not block; anything that needs another thread should
/// forward the message over a channel.
pub type Handler = Arc<dyn Fn(&Message) + Send + Sync>;

/// Append-only list of handlers for one topic.
#[derive(Default)]
struct Registry {
    handlers: RwLock<Vec<Handler>>,
}

impl Registry {
    fn push(&self, handler: Handler) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    fn snapshot(&self) -> Vec<Handler> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn len(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Call every handler in registration order, outside the lock.
    fn notify(&self, message: &Message) {
        for handler in self.snapshot() {
            handler(message);
        }
    }
}

/// Routes inbound messages to waiters and subscribers.
pub struct Router {
    pending: Arc<PendingRequests>,
    responses: Registry,
    events: Registry,
    errors: Registry,
    sent: Registry,
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("pending", &self.pending.len())
            .field("responses", &self.responses.len())
            .field("events", &self.events.len())
            .field("errors", &self.errors.len())
            .field("sent", &self.sent.len())
            .finish()
    }
}

impl Router {
    pub fn new(pending: Arc<PendingRequests>) -> Self {
        Self {
            pending,
            responses: Registry::default(),
            events: Registry::default(),
            errors: Registry::default(),
            sent: Registry::default(),
        }
    }

    pub fn pending(&self) -> &Arc<PendingRequests> {
        &self.pending
    }

    fn registry(&self, topic: Topic) -> &Registry {
        match topic {
            Topic::Response => &self.responses,
            Topic::Event => &self.events,
            Topic::Error => &self.errors,
            Topic::Sent => &self.sent,
        }
    }

    /// Register a callback for `topic`.
    pub fn subscribe<F>(&self, topic: Topic, handler: F)
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.registry(topic).push(Arc::new(handler));
        debug!(topic = topic.as_str(), "Subscriber registered");
    }

    /// Register a channel for `topic` and return its receiving end.
    ///
    /// Once the receiver is dropped, further messages are discarded.
    pub fn subscribe_channel(&self, topic: Topic) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribe(topic, move |message| {
            let _ = tx.send(message.clone());
        });
        rx
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.registry(topic).len()
    }

    /// Dispatch one decoded inbound message.
    pub fn dispatch(&self, message: Message) {
        debug!(
            kind = %message.kind,
            msg_id = %message.correlation_id,
            "Received {}",
            message.route()
        );

        match message.kind {
            MessageKind::Response => {
                let unmatched = if message.correlation_id.is_empty() {
                    message
                } else {
                    let id = message.correlation_id.clone();
                    match self.pending.resolve(&id, message) {
                        Ok(()) => return,
                        Err(message) => message,
                    }
                };
                self.responses.notify(&unmatched);
            }
            MessageKind::Event => self.events.notify(&message),
            MessageKind::Error => self.errors.notify(&message),
            MessageKind::Command => {
                warn!(route = %message.route(), "Ignoring command frame sent by peer");
            }
            MessageKind::Unknown => {
                warn!(route = %message.route(), "Dropping message of unknown kind");
            }
        }
    }

    /// Notify `Sent` subscribers that `message` was flushed to the socket.
    pub fn notify_sent(&self, message: &Message) {
        self.sent.notify(message);
    }
}
