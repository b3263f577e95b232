//! Round-robin selection over credentials and destinations.

use crate::error::{StorageError, StorageResult};
use std::sync::Mutex;

/// An ordered, non-empty pool handing out items in rotation.
///
/// The cursor is shared by all callers; each [`RoundRobin::next`] observes
/// and advances it atomically, so K concurrent selections over K items
/// visit every item exactly once.
#[derive(Debug)]
pub struct RoundRobin<T> {
    items: Vec<T>,
    cursor: Mutex<usize>,
}

impl<T> RoundRobin<T> {
    /// Build a pool. `kind` names the pool in the error for an empty list.
    pub fn new(kind: &str, items: Vec<T>) -> StorageResult<Self> {
        if items.is_empty() {
            return Err(StorageError::Config(format!("{kind} pool is empty")));
        }
        Ok(Self {
            items,
            cursor: Mutex::new(0),
        })
    }

    /// Select the next item, wrapping around at the end.
    pub fn next(&self) -> &T {
        let mut cursor = match self.cursor.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("round-robin cursor lock poisoned, recovering");
                poisoned.into_inner()
            }
        };
        let index = *cursor;
        *cursor = (index + 1) % self.items.len();
        &self.items[index]
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }
}
