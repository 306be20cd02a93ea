// src/engine/idempotency.rs

//! Bounded at-most-once cache for calls carrying an idempotency key.

use std::any::Any;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::debug;

use crate::errors::Result;
use crate::sync::lock;

type Outcome = Arc<dyn Any + Send + Sync>;

/// One key's slot. Its mutex is held while the first caller runs the
/// operation, so concurrent retries wait for that outcome instead of
/// applying the operation again.
#[derive(Default)]
struct Slot {
    outcome: Mutex<Option<Outcome>>,
}

/// Successful outcomes keyed by `operation:idempotency-key`, evicted oldest
/// first once `capacity` keys are held.
pub(crate) struct IdempotencyCache {
    slots: DashMap<String, Arc<Slot>>,
    order: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl IdempotencyCache {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            slots: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    /// Run `op` unless an earlier call with the same key succeeded, in which
    /// case its outcome is returned. Failures are not cached.
    pub(crate) fn run<T, F>(&self, key: String, op: F) -> Result<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Result<T>,
    {
        let slot = self.reserve(key.clone());
        let mut outcome = lock(&slot.outcome);

        if let Some(value) = outcome.as_ref().and_then(|v| v.downcast_ref::<T>()) {
            debug!(%key, "idempotent replay");
            return Ok(value.clone());
        }

        let value = op()?;
        *outcome = Some(Arc::new(value.clone()));
        Ok(value)
    }

    fn reserve(&self, key: String) -> Arc<Slot> {
        let (slot, inserted) = match self.slots.entry(key.clone()) {
            Entry::Occupied(entry) => (Arc::clone(entry.get()), false),
            Entry::Vacant(entry) => {
                let slot = Arc::new(Slot::default());
                entry.insert(Arc::clone(&slot));
                (slot, true)
            }
        };

        if inserted {
            let mut order = lock(&self.order);
            order.push_back(key);
            while order.len() > self.capacity {
                if let Some(oldest) = order.pop_front() {
                    self.slots.remove(&oldest);
                    debug!(key = %oldest, "idempotency key evicted");
                }
            }
        }
        slot
    }
}
