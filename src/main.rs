//! Application entry: wires the state store, the connection manager and the
//! account subscription together and keeps them in sync until Ctrl-C.

use std::sync::Arc;

use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use stake_sync::config::Config;
use stake_sync::connection::RpcConnectionFactory;
use stake_sync::connection_manager::{new_shared, spawn_state_watcher};
use stake_sync::state_store::StateStore;
use stake_sync::streaming::PubsubStreamingService;
use stake_sync::subscription_controller::SubscriptionController;
use stake_sync::types::{AppSnapshot, SocketEvent};

const DEFAULT_LOG_FILTER: &str = "stake_sync=info";

fn on_socket_event(event: SocketEvent) {
    info!(id = %event.id, "Account update");
    debug!(id = %event.id, data = %event.data, "Account update payload");
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .with_target(false)
        .init();

    let cfg = Config::load()?;
    info!("Loaded config: {:?}", cfg);

    let store = Arc::new(StateStore::new(cfg.initial_snapshot()));

    let factory = RpcConnectionFactory::from_commitment_name(&cfg.commitment);
    let commitment = factory.commitment();
    let connections = new_shared(factory);
    let watcher = spawn_state_watcher(Arc::clone(&connections), &store);

    let service = PubsubStreamingService::new(commitment);
    let mut controller = SubscriptionController::with_capacity(service, cfg.event_channel_capacity);

    let mut updates = store.subscribe();
    let apply = |controller: &mut SubscriptionController<PubsubStreamingService>, snapshot: &AppSnapshot| {
        let desired = cfg.watch_set_for(snapshot);
        match controller.set_desired(desired, on_socket_event) {
            Ok(outcome) => debug!(version = snapshot.version, ?outcome, "Subscription reconciled"),
            Err(e) => warn!(version = snapshot.version, error = %e, "Subscription update failed"),
        }
    };

    apply(&mut controller, store.get_state().as_ref());

    loop {
        tokio::select! {
            maybe = updates.recv() => match maybe {
                Some(snapshot) => apply(&mut controller, snapshot.as_ref()),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                break;
            }
        }
    }

    controller.clear()?;
    watcher.abort();

    let manager = connections.read().await;
    info!(
        endpoint = %manager.endpoint(),
        wallet = manager.get_wallet_address().unwrap_or("-"),
        stakes = manager.get_stakes().len(),
        "Stopped"
    );

    Ok(())
}
