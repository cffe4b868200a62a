use std::sync::Arc;

use solana_client::nonblocking::rpc_client::RpcClient;
use solana_sdk::commitment_config::{CommitmentConfig, CommitmentLevel};
use tracing::debug;

/// Builds connection handles for an endpoint.
///
/// Construction must not perform I/O; a malformed endpoint surfaces on the
/// first request made through the handle, not here.
pub trait ConnectionFactory: Send + Sync {
    type Connection: Send + Sync;

    fn create_connection(&self, endpoint: &str) -> Self::Connection;

    /// Called with the manager's reference when a handle is replaced.
    /// Readers still holding a clone keep the connection alive until they drop it.
    fn release(&self, connection: Arc<Self::Connection>) {
        drop(connection);
    }
}

/// Production factory producing nonblocking Solana RPC clients.
#[derive(Debug, Clone)]
pub struct RpcConnectionFactory {
    commitment: CommitmentConfig,
}

impl Default for RpcConnectionFactory {
    fn default() -> Self {
        Self::new(CommitmentLevel::Confirmed)
    }
}

impl RpcConnectionFactory {
    pub fn new(level: CommitmentLevel) -> Self {
        Self {
            commitment: CommitmentConfig { commitment: level },
        }
    }

    /// Accepts the config spelling of a commitment level; unknown values fall back to confirmed.
    pub fn from_commitment_name(name: &str) -> Self {
        let level = match name {
            "processed" => CommitmentLevel::Processed,
            "finalized" => CommitmentLevel::Finalized,
            _ => CommitmentLevel::Confirmed,
        };
        Self::new(level)
    }

    pub fn commitment(&self) -> CommitmentConfig {
        self.commitment
    }
}

impl ConnectionFactory for RpcConnectionFactory {
    type Connection = RpcClient;

    fn create_connection(&self, endpoint: &str) -> RpcClient {
        debug!(endpoint = %endpoint, "Creating RPC client");
        RpcClient::new_with_commitment(endpoint.to_string(), self.commitment)
    }

    fn release(&self, connection: Arc<RpcClient>) {
        debug!(
            endpoint = %connection.url(),
            outstanding = Arc::strong_count(&connection) - 1,
            "Releasing RPC client"
        );
    }
}
