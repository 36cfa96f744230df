//! Shared fixtures: a deterministic channel pair and the message shuttling a
//! real agent would do over its transport.

use crate::agreement::CloseAgreement;
use crate::asset::Asset;
use crate::channel::{Channel, ChannelConfig, OpenParams};
use crate::error::ChannelError;
use crate::keys::Signer;
use std::time::{Duration, SystemTime};

pub const NETWORK: &str = "sluice test network ; september 2025";
pub const OBSERVATION_PERIOD: Duration = Duration::from_secs(20);
pub const OBSERVATION_LEDGER_GAP: i64 = 4;

pub fn initiator_signer() -> Signer {
    Signer::from_seed(&[1u8; 32])
}

pub fn responder_signer() -> Signer {
    Signer::from_seed(&[2u8; 32])
}

/// Configs for both sides of one channel, mirror images of each other.
pub fn config_pair() -> (ChannelConfig, ChannelConfig) {
    let initiator = initiator_signer();
    let responder = responder_signer();
    let initiator_account = Signer::from_seed(&[11u8; 32]).address();
    let responder_account = Signer::from_seed(&[12u8; 32]).address();
    let initiator_config = ChannelConfig {
        network_id: NETWORK.into(),
        max_open_expiry: Duration::from_secs(3600),
        initiator: true,
        local_channel_account: initiator_account,
        remote_channel_account: responder_account,
        local_signer: initiator.clone(),
        remote_signer: responder.address(),
    };
    let responder_config = ChannelConfig {
        network_id: NETWORK.into(),
        max_open_expiry: Duration::from_secs(3600),
        initiator: false,
        local_channel_account: responder_account,
        remote_channel_account: initiator_account,
        local_signer: responder,
        remote_signer: initiator.address(),
    };
    (initiator_config, responder_config)
}

pub fn channel_pair() -> (Channel, Channel) {
    let (ic, rc) = config_pair();
    (Channel::new(ic), Channel::new(rc))
}

pub fn open_params(starting_sequence: i64, contribution: i64) -> OpenParams {
    OpenParams {
        observation_period_time: OBSERVATION_PERIOD,
        observation_period_ledger_gap: OBSERVATION_LEDGER_GAP,
        asset: Asset::Native,
        expires_at: SystemTime::now() + Duration::from_secs(300),
        starting_sequence,
        initiator_contribution: contribution,
        responder_contribution: contribution,
    }
}

/// Run the full open exchange: propose, confirm on the responder, confirm
/// the reply on the initiator.
pub fn open_channel_pair(starting_sequence: i64, contribution: i64) -> (Channel, Channel) {
    let (mut initiator, mut responder) = channel_pair();
    let envelope = initiator.propose_open(open_params(starting_sequence, contribution)).unwrap();
    let envelope = responder.confirm_open(envelope).unwrap();
    initiator.confirm_open(envelope).unwrap();
    (initiator, responder)
}

/// Run the full payment exchange from `proposer` to `confirmer`.
pub fn payment(
    proposer: &mut Channel,
    confirmer: &mut Channel,
    amount: i64,
) -> Result<CloseAgreement, ChannelError> {
    let envelope = proposer.propose_payment(amount)?;
    let confirmed = confirmer.confirm_payment(envelope)?;
    proposer.finalize_payment(confirmed.confirmer_signatures)
}
