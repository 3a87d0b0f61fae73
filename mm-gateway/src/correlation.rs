//! Echo correlation: maps an outstanding call's echo to the slot its caller waits on.
//!
//! Delivery and timeout-unregistration both happen under the same mutex, so a
//! call observes exactly one of them. A slot dropped by a cancelled caller
//! unregisters itself.

use crate::error::{GatewayError, Result};
use crate::types::ActionReply;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::oneshot;

#[derive(Default)]
struct Slots {
    waiting: HashMap<String, oneshot::Sender<ActionReply>>,
    closed: bool,
}

fn lock(slots: &Mutex<Slots>) -> MutexGuard<'_, Slots> {
    slots.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
pub struct CorrelationTable {
    slots: Arc<Mutex<Slots>>,
}

/// Receiving end of one outstanding call.
#[derive(Debug)]
pub struct ResponseSlot {
    echo: String,
    rx: oneshot::Receiver<ActionReply>,
    table: Weak<Mutex<Slots>>,
}

impl ResponseSlot {
    pub fn echo(&self) -> &str {
        &self.echo
    }
}

impl Drop for ResponseSlot {
    fn drop(&mut self) {
        // Closing the receiver marks our sender, so a later registration that
        // reused the echo is left alone.
        self.rx.close();
        let Some(table) = self.table.upgrade() else {
            return;
        };
        let mut slots = lock(&table);
        let abandoned = slots
            .waiting
            .get(&self.echo)
            .is_some_and(oneshot::Sender::is_closed);
        if abandoned {
            slots.waiting.remove(&self.echo);
            tracing::debug!(echo = %self.echo, "caller abandoned call");
        }
    }
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, Slots> {
        lock(&self.slots)
    }

    pub fn register(&self, echo: impl Into<String>) -> Result<ResponseSlot> {
        let echo = echo.into();
        let (tx, rx) = oneshot::channel();
        let mut slots = self.slots();
        if slots.closed {
            return Err(GatewayError::Closed);
        }
        match slots.waiting.entry(echo.clone()) {
            Entry::Occupied(_) => Err(GatewayError::DuplicateEcho(echo)),
            Entry::Vacant(entry) => {
                entry.insert(tx);
                Ok(ResponseSlot {
                    echo,
                    rx,
                    table: Arc::downgrade(&self.slots),
                })
            }
        }
    }

    /// Hands `reply` to the caller waiting on `echo`. Returns false when nobody
    /// is waiting (foreign echo, already timed out, already delivered).
    pub fn deliver(&self, echo: &str, reply: ActionReply) -> bool {
        let mut slots = self.slots();
        match slots.waiting.remove(echo) {
            Some(tx) => tx.send(reply).is_ok(),
            None => false,
        }
    }

    /// Drops a slot whose request never made it onto the wire.
    pub fn cancel(&self, slot: ResponseSlot) -> bool {
        self.slots().waiting.remove(&slot.echo).is_some()
    }

    pub async fn wait(&self, mut slot: ResponseSlot, timeout: Duration) -> Result<ActionReply> {
        match tokio::time::timeout(timeout, &mut slot.rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(GatewayError::Closed),
            Err(_) => {
                let unregistered = self.slots().waiting.remove(&slot.echo).is_some();
                if unregistered {
                    tracing::debug!(echo = %slot.echo, ?timeout, "call timed out");
                    return Err(GatewayError::Timeout(timeout));
                }
                // Delivered between the timer firing and the lock: the reply
                // is already in the channel.
                slot.rx.try_recv().map_err(|_| GatewayError::Closed)
            }
        }
    }

    /// Fails every outstanding call and refuses new registrations.
    pub fn close_all(&self) {
        let mut slots = self.slots();
        slots.closed = true;
        let dropped = slots.waiting.len();
        slots.waiting.clear();
        if dropped > 0 {
            tracing::warn!(dropped, "closing correlation table with outstanding calls");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.slots().closed
    }

    pub fn outstanding(&self) -> usize {
        self.slots().waiting.len()
    }
}
