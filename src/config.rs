use std::env;
use std::path::Path;

use serde::Deserialize;
use tracing::warn;

use crate::errors::SyncError;
use crate::types::{AccountRef, AppSnapshot, StakeMap, WatchSet};

const DEFAULT_CONFIG_PATH: &str = "stake_sync.toml";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP RPC endpoint seeded into the state store at startup
    pub rpc_url: Option<String>,
    /// Websocket endpoint for account notifications; derived from rpc_url when absent
    pub ws_url: Option<String>,
    pub wallet_address: Option<String>,
    /// processed | confirmed | finalized
    pub commitment: String,
    pub event_channel_capacity: usize,
    /// Accounts watched in addition to the stake accounts
    pub extra_accounts: Vec<AccountRef>,
    /// Stake records seeded into the state store at startup
    pub stakes: StakeMap,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rpc_url: None,
            ws_url: None,
            wallet_address: None,
            commitment: "confirmed".to_string(),
            event_channel_capacity: 256,
            extra_accounts: Vec::new(),
            stakes: StakeMap::new(),
        }
    }
}

impl Config {
    /// Loads the file named by `STAKE_SYNC_CONFIG`, then applies env overrides.
    pub fn load() -> Result<Self, SyncError> {
        let path = env::var("STAKE_SYNC_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut cfg = Self::load_or_default(&path)?;
        cfg.apply_env();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Only a missing file falls back to defaults; parse and validation
    /// errors are returned.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, SyncError> {
        let path = path.as_ref();
        match Self::from_file(path) {
            Err(SyncError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "Config file not found; using defaults");
                Ok(Self::default())
            }
            other => other,
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SyncError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, SyncError> {
        let cfg: Config = toml::from_str(raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        if self.event_channel_capacity == 0 {
            return Err(SyncError::Config(
                "event_channel_capacity must be > 0".to_string(),
            ));
        }
        if !matches!(self.commitment.as_str(), "processed" | "confirmed" | "finalized") {
            return Err(SyncError::Config(format!(
                "unknown commitment level: {}",
                self.commitment
            )));
        }
        Ok(())
    }

    fn apply_env(&mut self) {
        if let Ok(url) = env::var("STAKE_SYNC_RPC_URL") {
            self.rpc_url = Some(url);
        }
        if let Ok(url) = env::var("STAKE_SYNC_WS_URL") {
            self.ws_url = Some(url);
        }
        if let Ok(wallet) = env::var("STAKE_SYNC_WALLET") {
            self.wallet_address = Some(wallet);
        }
    }

    /// Explicit ws_url, otherwise the rpc_url with its scheme swapped.
    pub fn resolved_ws_url(&self) -> String {
        self.ws_url_for(self.rpc_url.as_deref().unwrap_or(""))
    }

    fn ws_url_for(&self, rpc_url: &str) -> String {
        match self.ws_url.as_ref().filter(|ws| !ws.is_empty()) {
            Some(ws) => ws.clone(),
            None => ws_url_from_rpc(rpc_url),
        }
    }

    /// Accounts to stream for `snapshot`: every stake account plus the extra
    /// accounts, on the websocket matching the snapshot's endpoint.
    pub fn watch_set_for(&self, snapshot: &AppSnapshot) -> WatchSet {
        WatchSet::from_stakes(self.ws_url_for(snapshot.endpoint()), &snapshot.stakes)
            .with_accounts(self.extra_accounts.iter().cloned())
    }

    /// Initial state committed to the store at startup.
    pub fn initial_snapshot(&self) -> AppSnapshot {
        AppSnapshot {
            version: 0,
            rpc_url: self.rpc_url.clone(),
            wallet_address: self.wallet_address.clone(),
            stakes: self.stakes.clone(),
        }
    }
}

pub fn ws_url_from_rpc(rpc_url: &str) -> String {
    if let Some(rest) = rpc_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = rpc_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        rpc_url.to_string()
    }
}
