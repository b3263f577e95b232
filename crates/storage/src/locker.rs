//! Per-key mutual exclusion.
//!
//! Entries are created on first use and removed once the last holder or
//! waiter goes away, so the registry only ever holds keys that are busy.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::OwnedMutexGuard;

#[derive(Debug)]
struct Slot {
    lock: Arc<tokio::sync::Mutex<()>>,
    /// Holders plus waiters.
    refs: usize,
}

/// Registry of async locks keyed by string.
#[derive(Debug, Default)]
pub struct LockRegistry {
    slots: Mutex<HashMap<String, Slot>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("lock registry poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Wait for exclusive access to `key`.
    ///
    /// Cancel safe: dropping the returned future while it waits releases
    /// the reservation on the entry.
    pub async fn lock(&self, key: &str) -> KeyGuard<'_> {
        let lock = {
            let mut slots = self.slots();
            let slot = slots.entry(key.to_string()).or_insert_with(|| Slot {
                lock: Arc::new(tokio::sync::Mutex::new(())),
                refs: 0,
            });
            slot.refs += 1;
            Arc::clone(&slot.lock)
        };
        let membership = Membership {
            registry: self,
            key: key.to_string(),
        };
        let guard = lock.lock_owned().await;
        KeyGuard {
            _guard: guard,
            _membership: membership,
        }
    }

    /// Number of keys currently held or waited on.
    pub fn len(&self) -> usize {
        self.slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A counted reference to a registry entry.
struct Membership<'a> {
    registry: &'a LockRegistry,
    key: String,
}

impl Drop for Membership<'_> {
    fn drop(&mut self) {
        let mut slots = self.registry.slots();
        if let Some(slot) = slots.get_mut(&self.key) {
            slot.refs -= 1;
            if slot.refs == 0 {
                slots.remove(&self.key);
            }
        }
    }
}

/// Exclusive access to one key, released on drop.
pub struct KeyGuard<'a> {
    // Field order matters: the lock is released before the entry is unreferenced.
    _guard: OwnedMutexGuard<()>,
    _membership: Membership<'a>,
}
