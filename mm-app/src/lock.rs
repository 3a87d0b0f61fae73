//! In-process named locks with a TTL.
//!
//! A lock is live while its entry exists and has not expired. Acquisition is a
//! single entry-API operation; release only removes an entry its guard still owns.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
struct LockEntry {
    owner: u64,
    expires_at: Instant,
}

impl LockEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

#[derive(Debug, Default)]
pub struct LockRegistry {
    entries: DashMap<String, LockEntry>,
    next_owner: AtomicU64,
}

/// Held lock. Dropping it releases the lock unless it expired and was taken over.
#[derive(Debug)]
pub struct LockGuard {
    registry: Arc<LockRegistry>,
    key: String,
    owner: u64,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let released = self
            .registry
            .entries
            .remove_if(&self.key, |_, entry| entry.owner == self.owner)
            .is_some();
        if released {
            tracing::debug!(key = %self.key, "lock released");
        } else {
            tracing::debug!(key = %self.key, "lock already expired and taken over; nothing to release");
        }
    }
}

impl LockRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Takes `key` for `ttl` unless a live lock already holds it.
    pub fn try_acquire(self: &Arc<Self>, key: &str, ttl: Duration) -> Option<LockGuard> {
        let now = Instant::now();
        let owner = self.next_owner.fetch_add(1, Ordering::Relaxed);
        let entry = LockEntry {
            owner,
            expires_at: now + ttl,
        };
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live(now) {
                    return None;
                }
                tracing::info!(key, "expired lock taken over");
                occupied.insert(entry);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(entry);
            }
        }
        Some(LockGuard {
            registry: self.clone(),
            key: key.to_string(),
            owner,
        })
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.entries
            .get(key)
            .is_some_and(|entry| entry.is_live(Instant::now()))
    }

    /// Drops expired entries; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_live(now));
        before.saturating_sub(self.entries.len())
    }
}
