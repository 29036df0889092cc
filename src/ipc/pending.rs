//! Pending-request table pairing outbound commands with their replies.
//!
//! Entries are registered by the sending task and completed by the receive
//! loop. Every operation runs under one lock, so for a given token exactly
//! one of `resolve` / `expire` / `discard` takes effect.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

use crate::models::{CorrelationId, Message};

/// Final outcome delivered to a waiter.
#[derive(Debug)]
pub enum Completion {
    /// The peer answered with a matching response.
    Reply(Message),
    /// The deadline passed before a reply arrived.
    Expired,
}

/// Single-resolution handle returned by [`PendingRequests::register`].
#[derive(Debug)]
pub struct Waiter {
    id: CorrelationId,
    rx: oneshot::Receiver<Completion>,
}

impl Waiter {
    pub fn id(&self) -> &CorrelationId {
        &self.id
    }

    /// Wait for the entry to be completed.
    ///
    /// Returns `None` if the entry was dropped without an outcome (table torn
    /// down or entry discarded).
    pub async fn recv(&mut self) -> Option<Completion> {
        (&mut self.rx).await.ok()
    }

    /// Take an outcome that has already been delivered, without waiting.
    pub fn try_take(&mut self) -> Option<Completion> {
        self.rx.try_recv().ok()
    }
}

/// Map of outstanding correlation tokens to their waiters.
#[derive(Debug, Default)]
pub struct PendingRequests {
    entries: Mutex<HashMap<CorrelationId, oneshot::Sender<Completion>>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CorrelationId, oneshot::Sender<Completion>>> {
        // A panicking holder cannot leave the map half-updated; keep serving
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a waiter for `id`.
    ///
    /// Returns `None` if `id` is already outstanding.
    pub fn register(&self, id: CorrelationId) -> Option<Waiter> {
        let mut entries = self.lock();
        if entries.contains_key(&id) {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        entries.insert(id.clone(), tx);
        Some(Waiter { id, rx })
    }

    /// Complete the waiter for `id` with `message`.
    ///
    /// If no entry matched, the message is handed back so the caller can
    /// treat it as unsolicited. The waiter is completed before the lock is
    /// released, so a caller that loses the race in `expire` always finds
    /// the reply already delivered.
    pub fn resolve(&self, id: &CorrelationId, message: Message) -> Result<(), Message> {
        let mut entries = self.lock();
        let Some(tx) = entries.remove(id) else {
            return Err(message);
        };
        if tx.send(Completion::Reply(message)).is_err() {
            tracing::debug!(msg_id = %id, "Waiter dropped before reply was delivered");
        }
        Ok(())
    }

    /// Remove the entry for `id` and complete it as expired.
    ///
    /// Returns `false` if the entry was already resolved.
    pub fn expire(&self, id: &CorrelationId) -> bool {
        let mut entries = self.lock();
        let Some(tx) = entries.remove(id) else {
            return false;
        };
        let _ = tx.send(Completion::Expired);
        true
    }

    /// Remove the entry for `id` without completing it.
    pub fn discard(&self, id: &CorrelationId) -> bool {
        self.lock().remove(id).is_some()
    }

    /// Drop every outstanding entry without completing it.
    ///
    /// Waiters observe the closed channel and report the connection as gone.
    pub fn clear(&self) -> usize {
        let mut entries = self.lock();
        let dropped = entries.len();
        entries.clear();
        dropped
    }

    pub fn contains(&self, id: &CorrelationId) -> bool {
        self.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
