//! In-process application state store.
//!
//! Every committed mutation produces a new immutable snapshot which is pushed,
//! in commit order and without coalescing, to every live subscriber.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tracing::debug;

use crate::types::{AppSnapshot, StakeKey, StakeInfo, StakeMap};

pub type StateUpdates = mpsc::UnboundedReceiver<Arc<AppSnapshot>>;

#[derive(Debug, Default)]
struct StoreInner {
    snapshot: Arc<AppSnapshot>,
    subscribers: Vec<mpsc::UnboundedSender<Arc<AppSnapshot>>>,
}

#[derive(Debug, Default)]
pub struct StateStore {
    inner: Mutex<StoreInner>,
}

impl StateStore {
    pub fn new(initial: AppSnapshot) -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                snapshot: Arc::new(initial),
                subscribers: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get_state(&self) -> Arc<AppSnapshot> {
        Arc::clone(&self.lock().snapshot)
    }

    /// Receiver gets every snapshot committed after this call.
    pub fn subscribe(&self) -> StateUpdates {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().subscribers.push(tx);
        rx
    }

    /// Applies `mutate` to a copy of the current snapshot and commits it.
    /// The lock is held while notifying, so delivery order matches commit order.
    pub fn update<F>(&self, mutate: F) -> Arc<AppSnapshot>
    where
        F: FnOnce(&mut AppSnapshot),
    {
        let mut inner = self.lock();
        let mut next = (*inner.snapshot).clone();
        mutate(&mut next);
        next.version = inner.snapshot.version.wrapping_add(1);

        let next = Arc::new(next);
        inner.snapshot = Arc::clone(&next);
        inner
            .subscribers
            .retain(|tx| tx.send(Arc::clone(&next)).is_ok());

        debug!(version = next.version, subscribers = inner.subscribers.len(), "State committed");
        next
    }

    pub fn set_rpc_url(&self, rpc_url: Option<String>) -> Arc<AppSnapshot> {
        self.update(|s| s.rpc_url = rpc_url)
    }

    pub fn set_wallet_address(&self, wallet: Option<String>) -> Arc<AppSnapshot> {
        self.update(|s| s.wallet_address = wallet)
    }

    pub fn set_stakes(&self, stakes: StakeMap) -> Arc<AppSnapshot> {
        self.update(|s| s.stakes = stakes)
    }

    /// Rebuilds the stake map around one entry, the way the balance refresh
    /// path commits results even when nothing changed.
    pub fn upsert_stake(&self, key: impl Into<StakeKey>, info: StakeInfo) -> Arc<AppSnapshot> {
        let key = key.into();
        self.update(|s| {
            let mut stakes = s.stakes.clone();
            stakes.insert(key, info);
            s.stakes = stakes;
        })
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivers_every_commit_in_order() {
        let store = StateStore::default();
        let mut rx = store.subscribe();

        store.set_rpc_url(Some("a.rpc".to_string()));
        store.set_wallet_address(Some("W".to_string()));
        store.set_rpc_url(Some("a.rpc".to_string()));

        let versions: Vec<u64> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|s| s.version)
            .collect();
        assert_eq!(versions, vec![1, 2, 3]);
        assert_eq!(store.get_state().wallet_address.as_deref(), Some("W"));
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let store = StateStore::default();
        let rx = store.subscribe();
        let _keep = store.subscribe();
        assert_eq!(store.subscriber_count(), 2);

        drop(rx);
        store.set_wallet_address(None);
        assert_eq!(store.subscriber_count(), 1);
    }

    #[test]
    fn snapshots_are_immutable() {
        let store = StateStore::default();
        let before = store.get_state();
        store.set_rpc_url(Some("a.rpc".to_string()));
        assert_eq!(before.rpc_url, None);
        assert_eq!(store.get_state().endpoint(), "a.rpc");
    }
}
