//! Pure change detection between the last applied configuration and a new
//! state snapshot. No side effects happen here; the connection manager
//! decides what to do with the result.

use std::sync::Arc;

use crate::types::{AppSnapshot, StakeMap};

/// Per-key structural comparison. Key sets must match and every shared key
/// must carry a field-wise equal record.
pub fn stakes_equal(a: &StakeMap, b: &StakeMap) -> bool {
    a.len() == b.len()
        && a
            .iter()
            .all(|(key, info)| b.get(key).is_some_and(|other| other == info))
}

/// Projection of the state that has already been acted upon.
#[derive(Debug, Clone, Default)]
pub struct AppliedState {
    pub endpoint: String,
    pub wallet: String,
    pub stakes: Arc<StakeMap>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateDeltas {
    pub endpoint_changed: bool,
    pub wallet_changed: bool,
    pub stakes_changed: bool,
}

impl StateDeltas {
    pub fn is_empty(&self) -> bool {
        !(self.endpoint_changed || self.wallet_changed || self.stakes_changed)
    }
}

/// Evaluated in the fixed order endpoint, wallet, stakes.
pub fn compute_deltas(prev: &AppliedState, next: &AppSnapshot) -> StateDeltas {
    StateDeltas {
        endpoint_changed: next.endpoint() != prev.endpoint,
        wallet_changed: next.wallet() != prev.wallet,
        stakes_changed: !stakes_equal(&prev.stakes, &next.stakes),
    }
}
