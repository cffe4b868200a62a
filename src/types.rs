use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Name under which the streaming service emits account notifications.
pub const SOCKET_EVENT_NAME: &str = "SolanaSocketEvent";

/// Pool/boost key a stake record is cached under.
pub type StakeKey = String;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StakeInfo {
    pub stake_address: String,
    pub proof_address: String,
    pub decimals_lp: u8,
    pub rewards: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_at: Option<DateTime<Utc>>,
}

pub type StakeMap = HashMap<StakeKey, StakeInfo>;

/// Versioned application state as committed by the state store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppSnapshot {
    pub version: u64,
    pub rpc_url: Option<String>,
    pub wallet_address: Option<String>,
    pub stakes: StakeMap,
}

impl AppSnapshot {
    /// Endpoint with `None` collapsed to the empty string.
    pub fn endpoint(&self) -> &str {
        self.rpc_url.as_deref().unwrap_or("")
    }

    pub fn wallet(&self) -> &str {
        self.wallet_address.as_deref().unwrap_or("")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AccountRef {
    pub id: String,
    pub account: String,
}

impl AccountRef {
    pub fn new(id: impl Into<String>, account: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            account: account.into(),
        }
    }
}

/// Desired subscription target. Accounts live in an ordered set, so two
/// watch sets built from the same accounts in any order compare equal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct WatchSet {
    pub url: String,
    pub accounts: BTreeSet<AccountRef>,
}

impl WatchSet {
    pub fn new(url: impl Into<String>, accounts: impl IntoIterator<Item = AccountRef>) -> Self {
        Self {
            url: url.into(),
            accounts: accounts.into_iter().collect(),
        }
    }

    /// One account per stake record: `{id: stake key, account: stake address}`.
    pub fn from_stakes(url: impl Into<String>, stakes: &StakeMap) -> Self {
        Self::new(
            url,
            stakes
                .iter()
                .map(|(key, info)| AccountRef::new(key.clone(), info.stake_address.clone())),
        )
    }

    pub fn with_accounts(mut self, extra: impl IntoIterator<Item = AccountRef>) -> Self {
        self.accounts.extend(extra);
        self
    }

    /// Empty url or empty account set means "no subscription wanted".
    pub fn is_incomplete(&self) -> bool {
        self.url.is_empty() || self.accounts.is_empty()
    }
}

/// Payload delivered by the streaming service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SocketEvent {
    pub id: String,
    pub data: serde_json::Value,
}

pub type EventSender = mpsc::Sender<SocketEvent>;
pub type EventReceiver = mpsc::Receiver<SocketEvent>;
