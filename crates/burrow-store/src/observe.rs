//! Key-level change observation
//!
//! Each observed key has one broadcast channel. The registry keeps only a
//! [`Weak`] handle to it; [`Observer`]s own the strong references, so a
//! channel lives exactly as long as someone is listening. Dead entries are
//! pruned the next time a change for that key is sent.

use std::pin::Pin;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use futures::Stream;
use tokio::sync::broadcast;
use tracing::trace;

use crate::key::Key;

/// A change to an observed key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    /// The key was set to a new value
    Update(Key),
    /// The key was deleted
    Remove(Key),
}

impl Change {
    /// Key the change applies to
    pub fn key(&self) -> &Key {
        match self {
            Change::Update(key) | Change::Remove(key) => key,
        }
    }
}

type Channel = broadcast::Sender<Change>;

/// Weakly-held per-key notification channels
#[derive(Debug)]
pub struct ObserverRegistry {
    channels: DashMap<Key, Weak<Channel>>,
    capacity: usize,
}

impl ObserverRegistry {
    /// Create a registry whose channels buffer `capacity` changes per listener
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Subscribe to changes on `key`, joining the live channel if one exists
    pub fn observe(&self, key: Key) -> Observer {
        let mut slot = self.channels.entry(key.clone()).or_default();
        let channel = match slot.upgrade() {
            Some(channel) => channel,
            None => {
                let (tx, _) = broadcast::channel(self.capacity);
                let channel = Arc::new(tx);
                *slot = Arc::downgrade(&channel);
                channel
            }
        };
        drop(slot);

        let rx = channel.subscribe();
        Observer {
            key,
            channel,
            rx,
        }
    }

    /// Deliver a change without waiting for listeners
    ///
    /// Drops the registry entry if nobody holds the channel any more.
    pub fn send(&self, change: Change) {
        let key = change.key().clone();
        let channel = match self.channels.get(&key) {
            Some(slot) => slot.upgrade(),
            None => return,
        };

        match channel {
            Some(channel) => {
                // Err only means every receiver is gone mid-drop
                let _ = channel.send(change);
            }
            None => {
                self.channels
                    .remove_if(&key, |_, slot| slot.strong_count() == 0);
                trace!(key = %key, "Pruned dead observation channel");
            }
        }
    }

    /// Number of keys with a registry entry, live or not yet pruned
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Whether no key has ever been observed (or all were pruned)
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Number of keys with at least one live observer
    pub fn live(&self) -> usize {
        self.channels
            .iter()
            .filter(|slot| slot.value().strong_count() > 0)
            .count()
    }
}

/// Subscription to one key's changes
///
/// Dropping the observer releases its share of the channel.
#[derive(Debug)]
pub struct Observer {
    key: Key,
    channel: Arc<Channel>,
    rx: broadcast::Receiver<Change>,
}

impl Observer {
    /// Key being observed
    pub fn key(&self) -> &Key {
        &self.key
    }

    /// Wait for the next change
    ///
    /// Changes missed because this observer fell behind are skipped.
    pub async fn recv(&mut self) -> Option<Change> {
        loop {
            match self.rx.recv().await {
                Ok(change) => return Some(change),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    trace!(key = %self.key, skipped, "Observer lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Take the next change if one is already buffered
    pub fn try_recv(&mut self) -> Option<Change> {
        loop {
            match self.rx.try_recv() {
                Ok(change) => return Some(change),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }

    /// Another observer of the same channel, starting from now
    pub fn resubscribe(&self) -> Observer {
        Observer {
            key: self.key.clone(),
            channel: Arc::clone(&self.channel),
            rx: self.channel.subscribe(),
        }
    }

    /// Turn the observer into an async stream of changes
    pub fn into_stream(mut self) -> Pin<Box<dyn Stream<Item = Change> + Send>> {
        Box::pin(async_stream::stream! {
            while let Some(change) = self.recv().await {
                yield change;
            }
        })
    }
}
