//! Bounded execution pool and dispatch deduplication

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Fixed number of execution slots; never queues
#[derive(Clone)]
pub struct WorkerPool {
    slots: Arc<Semaphore>,
    capacity: usize,
}

impl WorkerPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Take a slot; `None` when every slot is in use
    pub fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.slots.clone().try_acquire_owned().ok()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn running(&self) -> usize {
        self.capacity.saturating_sub(self.slots.available_permits())
    }
}

/// Remembers the most recent `retention` (task instance, attempt) pairs
pub struct DedupCache {
    seen: HashSet<(String, u32)>,
    order: VecDeque<(String, u32)>,
    retention: usize,
}

impl DedupCache {
    pub fn new(retention: usize) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            retention: retention.max(1),
        }
    }

    pub fn contains(&self, task_instance_id: &str, attempt: u32) -> bool {
        self.seen.contains(&(task_instance_id.to_string(), attempt))
    }

    /// Returns false if the pair was already recorded
    pub fn insert(&mut self, task_instance_id: &str, attempt: u32) -> bool {
        let key = (task_instance_id.to_string(), attempt);
        if !self.seen.insert(key.clone()) {
            return false;
        }
        self.order.push_back(key);
        while self.order.len() > self.retention {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
