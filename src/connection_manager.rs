//! Keeps one connection handle, the wallet address and a reconciled stake map
//! consistent with the application state.
//!
//! Responsibilities:
//! - Recreate the connection only when the endpoint value changes.
//! - Cache the wallet address.
//! - Replace the cached stake map only on a structural difference, so a
//!   freshly rebuilt but identical map keeps the existing `Arc`.

use std::sync::Arc;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::connection::ConnectionFactory;
use crate::deltas::{compute_deltas, AppliedState, StateDeltas};
use crate::state_store::StateStore;
use crate::types::{AppSnapshot, StakeMap};

pub struct ConnectionManager<F: ConnectionFactory> {
    factory: F,
    applied: AppliedState,
    connection: Option<Arc<F::Connection>>,
}

impl<F: ConnectionFactory> std::fmt::Debug for ConnectionManager<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("endpoint", &self.applied.endpoint)
            .field("wallet", &self.applied.wallet)
            .field("stakes", &self.applied.stakes.len())
            .field("connected", &self.connection.is_some())
            .finish()
    }
}

impl<F: ConnectionFactory> ConnectionManager<F> {
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            applied: AppliedState::default(),
            connection: None,
        }
    }

    /// Applies one observed state transition. Duplicate deliveries are no-ops.
    pub fn on_state_change(&mut self, snapshot: &AppSnapshot) -> StateDeltas {
        let deltas = compute_deltas(&self.applied, snapshot);

        if deltas.endpoint_changed {
            self.replace_connection(snapshot.endpoint());
        }

        if deltas.wallet_changed {
            debug!(wallet = %snapshot.wallet(), "Wallet address changed");
            self.applied.wallet = snapshot.wallet().to_string();
        }

        if deltas.stakes_changed {
            debug!(
                version = snapshot.version,
                entries = snapshot.stakes.len(),
                "Stake records changed"
            );
            self.applied.stakes = Arc::new(snapshot.stakes.clone());
        }

        deltas
    }

    fn replace_connection(&mut self, endpoint: &str) {
        let next = if endpoint.is_empty() {
            None
        } else {
            Some(Arc::new(self.factory.create_connection(endpoint)))
        };

        if let Some(previous) = std::mem::replace(&mut self.connection, next) {
            self.factory.release(previous);
        }

        info!(
            from = %self.applied.endpoint,
            to = %endpoint,
            connected = self.connection.is_some(),
            "RPC endpoint changed"
        );
        self.applied.endpoint = endpoint.to_string();
    }

    /// `None` until a non-empty endpoint has been observed.
    pub fn get_connection(&self) -> Option<Arc<F::Connection>> {
        self.connection.clone()
    }

    pub fn get_wallet_address(&self) -> Option<&str> {
        Some(self.applied.wallet.as_str()).filter(|w| !w.is_empty())
    }

    pub fn get_stakes(&self) -> Arc<StakeMap> {
        Arc::clone(&self.applied.stakes)
    }

    pub fn endpoint(&self) -> &str {
        &self.applied.endpoint
    }
}

pub type SharedConnectionManager<F> = Arc<RwLock<ConnectionManager<F>>>;

pub fn new_shared<F: ConnectionFactory>(factory: F) -> SharedConnectionManager<F> {
    Arc::new(RwLock::new(ConnectionManager::new(factory)))
}

/// Feeds the current state and then every committed snapshot into `manager`,
/// one at a time and in commit order. Abort the handle to stop watching.
pub fn spawn_state_watcher<F>(manager: SharedConnectionManager<F>, store: &StateStore) -> JoinHandle<()>
where
    F: ConnectionFactory + 'static,
    F::Connection: 'static,
{
    // Subscribe before reading so no commit falls between the two.
    let mut updates = store.subscribe();
    let initial = store.get_state();

    tokio::spawn(async move {
        manager.write().await.on_state_change(&initial);

        while let Some(snapshot) = updates.recv().await {
            manager.write().await.on_state_change(&snapshot);
        }

        debug!("State store closed; connection watcher exiting");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StakeInfo;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug)]
    struct TestConnection {
        endpoint: String,
    }

    #[derive(Debug, Clone, Default)]
    struct CountingFactory {
        created: Arc<std::sync::Mutex<Vec<String>>>,
        released: Arc<AtomicUsize>,
    }

    impl CountingFactory {
        fn created(&self) -> Vec<String> {
            self.created.lock().unwrap().clone()
        }

        fn released(&self) -> usize {
            self.released.load(Ordering::Relaxed)
        }
    }

    impl ConnectionFactory for CountingFactory {
        type Connection = TestConnection;

        fn create_connection(&self, endpoint: &str) -> TestConnection {
            self.created.lock().unwrap().push(endpoint.to_string());
            TestConnection {
                endpoint: endpoint.to_string(),
            }
        }

        fn release(&self, _connection: Arc<TestConnection>) {
            self.released.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn stake(addr: &str, rewards: u64) -> StakeInfo {
        StakeInfo {
            stake_address: addr.to_string(),
            proof_address: "P1".to_string(),
            decimals_lp: 9,
            rewards,
            claim_at: None,
        }
    }

    fn snapshot(rpc: Option<&str>, wallet: Option<&str>, stakes: &[(&str, StakeInfo)]) -> AppSnapshot {
        AppSnapshot {
            version: 0,
            rpc_url: rpc.map(str::to_string),
            wallet_address: wallet.map(str::to_string),
            stakes: stakes
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        }
    }

    #[test]
    fn no_connection_before_endpoint() {
        let factory = CountingFactory::default();
        let mut manager = ConnectionManager::new(factory.clone());

        assert!(manager.get_connection().is_none());
        manager.on_state_change(&snapshot(None, Some("W"), &[]));
        manager.on_state_change(&snapshot(Some(""), Some("W"), &[]));

        assert!(manager.get_connection().is_none());
        assert!(factory.created().is_empty());
        assert_eq!(manager.get_wallet_address(), Some("W"));
    }

    #[test]
    fn unchanged_endpoint_keeps_same_handle() {
        let factory = CountingFactory::default();
        let mut manager = ConnectionManager::new(factory.clone());

        manager.on_state_change(&snapshot(Some("a.rpc"), None, &[]));
        let first = manager.get_connection().unwrap();

        manager.on_state_change(&snapshot(Some("a.rpc"), Some("W"), &[]));
        manager.on_state_change(&snapshot(Some("a.rpc"), Some("W"), &[("X", stake("S1", 5))]));
        manager.on_state_change(&snapshot(Some("a.rpc"), Some("W"), &[("X", stake("S1", 5))]));

        let current = manager.get_connection().unwrap();
        assert!(Arc::ptr_eq(&first, &current));
        assert_eq!(factory.created(), vec!["a.rpc".to_string()]);
        assert_eq!(factory.released(), 0);
    }

    #[test]
    fn endpoint_change_replaces_and_releases() {
        let factory = CountingFactory::default();
        let mut manager = ConnectionManager::new(factory.clone());

        manager.on_state_change(&snapshot(Some("a.rpc"), None, &[]));
        let deltas = manager.on_state_change(&snapshot(Some("b.rpc"), None, &[]));
        assert!(deltas.endpoint_changed);
        assert_eq!(manager.get_connection().unwrap().endpoint, "b.rpc");
        assert_eq!(factory.released(), 1);

        // Clearing the endpoint drops the handle without creating a new one.
        manager.on_state_change(&snapshot(None, None, &[]));
        assert!(manager.get_connection().is_none());
        assert_eq!(factory.released(), 2);
        assert_eq!(factory.created(), vec!["a.rpc".to_string(), "b.rpc".to_string()]);
    }

    #[test]
    fn structurally_equal_stakes_keep_cached_map() {
        let mut manager = ConnectionManager::new(CountingFactory::default());

        manager.on_state_change(&snapshot(Some("a.rpc"), None, &[("X", stake("S1", 5))]));
        let cached = manager.get_stakes();

        let deltas = manager.on_state_change(&snapshot(Some("a.rpc"), None, &[("X", stake("S1", 5))]));
        assert!(deltas.is_empty());
        assert!(Arc::ptr_eq(&cached, &manager.get_stakes()));

        let deltas = manager.on_state_change(&snapshot(Some("a.rpc"), None, &[("X", stake("S1", 6))]));
        assert!(deltas.stakes_changed);
        assert_eq!(manager.get_stakes().get("X").unwrap().rewards, 6);
        assert_eq!(cached.get("X").unwrap().rewards, 5);
    }

    #[tokio::test]
    async fn malformed_endpoint_still_yields_handle() {
        let mut manager = ConnectionManager::new(crate::connection::RpcConnectionFactory::default());

        let deltas = manager.on_state_change(&snapshot(Some("::not a url::"), None, &[]));
        assert!(deltas.endpoint_changed);

        let client = manager.get_connection().unwrap();
        assert_eq!(client.url(), "::not a url::");
        assert_eq!(manager.endpoint(), "::not a url::");
    }

    #[test]
    fn wallet_cleared_reads_as_none() {
        let mut manager = ConnectionManager::new(CountingFactory::default());
        manager.on_state_change(&snapshot(None, Some("W"), &[]));
        let deltas = manager.on_state_change(&snapshot(None, None, &[]));
        assert!(deltas.wallet_changed);
        assert_eq!(manager.get_wallet_address(), None);
    }

    async fn wait_until<C: FnMut() -> bool>(mut check: C) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn store_driven_scenario() {
        let factory = CountingFactory::default();
        let manager = new_shared(factory.clone());
        let store = StateStore::default();

        let watcher = spawn_state_watcher(Arc::clone(&manager), &store);

        store.set_rpc_url(Some("a.rpc".to_string()));
        let mut stakes = StakeMap::new();
        stakes.insert("X".to_string(), stake("S1", 5));
        store.set_stakes(stakes.clone());
        // Same values committed again through a fresh map.
        store.upsert_stake("X", stake("S1", 5));

        let probe = factory.clone();
        wait_until(|| !probe.created().is_empty()).await;
        let reader = Arc::clone(&manager);
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if reader.read().await.get_stakes().len() == 1 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        // Let the duplicate commit drain.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let guard = manager.read().await;
        assert_eq!(factory.created(), vec!["a.rpc".to_string()]);
        assert!(guard.get_connection().is_some());
        assert_eq!(*guard.get_stakes(), stakes);
        drop(guard);

        watcher.abort();
    }
}
