//! Background streaming service contract and the Solana pubsub implementation.
//!
//! `start`/`stop` are requests: the service may still be delivering events
//! from a previous session after `stop` returns. Events go into the sink
//! handed to `start`; once the controller drops the matching receiver those
//! sends fail and the events are discarded.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Result};
use futures::stream::{self, StreamExt};
use itertools::Itertools;
use solana_client::nonblocking::pubsub_client::PubsubClient;
use solana_client::rpc_config::RpcAccountInfoConfig;
use solana_sdk::commitment_config::CommitmentConfig;
use solana_sdk::pubkey::Pubkey;
use tokio::task::JoinHandle;
use tokio_retry::{
    strategy::{jitter, ExponentialBackoff},
    Retry,
};
use tracing::{debug, error, info, warn};

use crate::errors::SyncError;
use crate::types::{AccountRef, EventSender, SocketEvent, SOCKET_EVENT_NAME};

pub trait StreamingService: Send {
    /// Begin streaming notifications for `accounts` from `url` into `sink`.
    fn start(&mut self, url: &str, accounts: &[AccountRef], sink: EventSender) -> Result<()>;

    /// Request the current session to end. No-op when nothing is running.
    fn stop(&mut self) -> Result<()>;

    /// Whether the last started session is still delivering. A session can
    /// end on its own (connect retries exhausted, subscribe failure, socket
    /// closed); the controller restarts it on the next `set_desired`.
    fn is_running(&self) -> bool {
        true
    }
}

/// Streams `accountSubscribe` notifications over a Solana websocket.
#[derive(Debug)]
pub struct PubsubStreamingService {
    commitment: CommitmentConfig,
    connect_attempts: usize,
    session: Option<JoinHandle<()>>,
}

impl PubsubStreamingService {
    pub fn new(commitment: CommitmentConfig) -> Self {
        Self {
            commitment,
            connect_attempts: 5,
            session: None,
        }
    }

    pub fn with_connect_attempts(mut self, attempts: usize) -> Self {
        self.connect_attempts = attempts.max(1);
        self
    }
}

pub fn parse_account(account: &AccountRef) -> Result<(String, Pubkey), SyncError> {
    Pubkey::from_str(&account.account)
        .map(|pubkey| (account.id.clone(), pubkey))
        .map_err(|_| SyncError::InvalidAccount {
            id: account.id.clone(),
            account: account.account.clone(),
        })
}

/// Pairs each account id with its parsed key; unparseable addresses are skipped.
pub fn parse_accounts(accounts: &[AccountRef]) -> Vec<(String, Pubkey)> {
    accounts
        .iter()
        .filter_map(|a| {
            parse_account(a)
                .inspect_err(|err| warn!(error = %err, "Skipping account"))
                .ok()
        })
        .collect()
}

impl StreamingService for PubsubStreamingService {
    fn start(&mut self, url: &str, accounts: &[AccountRef], sink: EventSender) -> Result<()> {
        if let Some(previous) = self.session.take() {
            warn!("start called with a live session; aborting it first");
            previous.abort();
        }

        let targets = parse_accounts(accounts);
        if targets.is_empty() {
            return Err(SyncError::Streaming(format!("no valid accounts to watch on {url}")).into());
        }

        info!(
            url = %url,
            accounts = %targets.iter().map(|(id, _)| id).join(","),
            event = SOCKET_EVENT_NAME,
            "Starting account stream"
        );

        let url = url.to_string();
        let commitment = self.commitment;
        let attempts = self.connect_attempts;
        self.session = Some(tokio::spawn(async move {
            if let Err(e) = run_session(url, targets, commitment, attempts, sink).await {
                error!(error = %e, "Account stream ended with error");
            }
        }));

        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if let Some(session) = self.session.take() {
            debug!("Stopping account stream");
            session.abort();
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.session.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for PubsubStreamingService {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            session.abort();
        }
    }
}

async fn run_session(
    url: String,
    targets: Vec<(String, Pubkey)>,
    commitment: CommitmentConfig,
    attempts: usize,
    sink: EventSender,
) -> Result<()> {
    let retry_strategy = ExponentialBackoff::from_millis(100)
        .max_delay(Duration::from_secs(5))
        .map(jitter)
        .take(attempts.saturating_sub(1));

    let url_ref = url.as_str();
    let client = Retry::spawn(retry_strategy, || async move {
        PubsubClient::new(url_ref).await.map_err(|e| {
            warn!(url = %url_ref, error = %e, "Websocket connect failed");
            anyhow!(e.to_string())
        })
    })
    .await
    .map_err(|e| SyncError::Streaming(format!("connect to {url} failed: {e}")))?;

    let config = RpcAccountInfoConfig {
        commitment: Some(commitment),
        ..Default::default()
    };

    let mut streams = Vec::with_capacity(targets.len());
    let mut unsubscribers = Vec::with_capacity(targets.len());
    for (id, pubkey) in &targets {
        let (updates, unsubscribe) = client
            .account_subscribe(pubkey, Some(config.clone()))
            .await
            .map_err(|e| SyncError::Streaming(format!("accountSubscribe {id} failed: {e}")))?;
        let id = id.clone();
        streams.push(updates.map(move |update| (id.clone(), update)).boxed());
        unsubscribers.push(unsubscribe);
    }

    let mut merged = stream::select_all(streams);
    while let Some((id, update)) = merged.next().await {
        let data = match serde_json::to_value(&update) {
            Ok(data) => data,
            Err(e) => {
                warn!(id = %id, error = %e, "Unable to encode account update");
                continue;
            }
        };

        if sink.send(SocketEvent { id, data }).await.is_err() {
            debug!("Event receiver dropped; ending account stream");
            break;
        }
    }

    drop(merged);
    for unsubscribe in unsubscribers {
        unsubscribe().await;
    }
    Ok(())
}
