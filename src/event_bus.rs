//! Broadcast of engine and delivery notifications
//!
//! Producers never block on subscribers: a subscriber that falls more than
//! `capacity` events behind loses the oldest ones.

use std::time::Duration;
use tokio::sync::broadcast;

pub struct EventBus<E> {
    tx: broadcast::Sender<E>,
}

impl<E: Clone> EventBus<E> {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Returns the number of subscribers that received the event
    pub fn publish(&self, event: E) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl<E: Clone> Default for EventBus<E> {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Wait until `rx` yields an event accepted by `select`, skipping lag gaps
///
/// Returns `None` on timeout or when the bus is dropped.
pub async fn wait_for<E, T, F>(rx: &mut broadcast::Receiver<E>, timeout: Duration, mut select: F) -> Option<T>
where
    E: Clone,
    F: FnMut(&E) -> Option<T>,
{
    let wait = async {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Some(found) = select(&event) {
                        return Some(found);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    };
    tokio::time::timeout(timeout, wait).await.ok().flatten()
}
