//! Snapshot and restore.
//!
//! A snapshot captures everything mutable about a channel. Restoring it under
//! the same configuration yields a channel that behaves identically to the
//! one that produced it; the configuration itself is never serialized (it
//! holds the signing key) and is re-supplied by the caller, guarded by a
//! fingerprint.

use crate::agreement::Agreements;
use crate::channel::{Channel, ChannelConfig, ChannelPhase, OnChainOpen};
use crate::error::ChannelError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A serializable snapshot of a channel's mutable state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    config_fingerprint: [u8; 32],
    phase: ChannelPhase,
    agreements: Agreements,
    open_executed_with: Option<OnChainOpen>,
    latest_declaration_executed: Option<i64>,
    closed_with_iteration: Option<i64>,
    local_channel_account_balance: Option<i64>,
    remote_channel_account_balance: Option<i64>,
    last_ingested_order_id: Option<i64>,
}

fn config_fingerprint(config: &ChannelConfig) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"channel-config");
    hasher.update(config.network_id.as_bytes());
    hasher.update(config.max_open_expiry.as_nanos().to_le_bytes());
    hasher.update([config.initiator as u8]);
    hasher.update(config.local_channel_account.as_bytes());
    hasher.update(config.remote_channel_account.as_bytes());
    hasher.update(config.local_signer.address().as_bytes());
    hasher.update(config.remote_signer.as_bytes());
    hasher.finalize().into()
}

impl Channel {
    /// Capture the channel's mutable state.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            config_fingerprint: config_fingerprint(&self.config),
            phase: self.phase,
            agreements: self.agreements.clone(),
            open_executed_with: self.open_executed_with,
            latest_declaration_executed: self.latest_declaration_executed,
            closed_with_iteration: self.closed_with_iteration,
            local_channel_account_balance: self.local_channel_account_balance,
            remote_channel_account_balance: self.remote_channel_account_balance,
            last_ingested_order_id: self.last_ingested_order_id,
        }
    }

    /// Reconstruct a channel from a snapshot taken under the same
    /// configuration.
    pub fn from_snapshot(config: ChannelConfig, snapshot: Snapshot) -> Result<Channel, ChannelError> {
        if snapshot.config_fingerprint != config_fingerprint(&config) {
            return Err(ChannelError::SnapshotConfigMismatch);
        }
        Ok(Channel {
            config,
            phase: snapshot.phase,
            agreements: snapshot.agreements,
            open_executed_with: snapshot.open_executed_with,
            latest_declaration_executed: snapshot.latest_declaration_executed,
            closed_with_iteration: snapshot.closed_with_iteration,
            local_channel_account_balance: snapshot.local_channel_account_balance,
            remote_channel_account_balance: snapshot.remote_channel_account_balance,
            last_ingested_order_id: snapshot.last_ingested_order_id,
        })
    }
}
