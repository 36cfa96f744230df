//! The channel state machine.
//!
//! A `Channel` is the deterministic object replicated on both sides of a
//! payment channel. It negotiates the on-chain formation, produces the
//! monotonically numbered sequence of mutually signed close agreements,
//! validates everything the counterparty sends, and tracks what the ledger
//! has executed. It performs no I/O: callers ship envelopes over their own
//! transport and feed observed ledger transactions into [`Channel::ingest_tx`].
//!
//! Operations are not thread safe; callers serialize access to a channel.

use crate::agreement::{Agreements, CloseAgreement, OpenAgreement};
use crate::asset::Asset;
use crate::balance::{owed_by_initiator, owed_by_responder, ChannelBalances};
use crate::envelope::{
    CloseDetails, CloseEnvelope, CloseSignatures, CloseTxs, OpenDetails, OpenEnvelope, OpenSignatures, OpenTxs,
};
use crate::error::ChannelError;
use crate::ingest::{ChannelEvent, StreamedTx};
use crate::keys::{Address, Signer};
use crate::tx::{
    build_close, build_declaration, build_formation, position_of_sequence, CloseParams, DeclarationParams,
    DecoratedSignature, FormationParams, Operation, SequencePosition, Tx, TxBuildError,
};
use log::debug;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::time::{Duration, SystemTime};

/// Immutable configuration of one side of a channel.
#[derive(Clone, Debug)]
pub struct ChannelConfig {
    /// Identifier of the network the channel's transactions are bound to.
    pub network_id: String,
    /// Upper bound on how far in the future an open proposal may expire.
    pub max_open_expiry: Duration,
    /// Whether the local participant is the channel's initiator.
    pub initiator: bool,
    pub local_channel_account: Address,
    pub remote_channel_account: Address,
    pub local_signer: Signer,
    pub remote_signer: Address,
}

impl ChannelConfig {
    pub fn initiator_channel_account(&self) -> Address {
        if self.initiator {
            self.local_channel_account
        } else {
            self.remote_channel_account
        }
    }

    pub fn responder_channel_account(&self) -> Address {
        if self.initiator {
            self.remote_channel_account
        } else {
            self.local_channel_account
        }
    }

    pub fn initiator_signer(&self) -> Address {
        if self.initiator {
            self.local_signer.address()
        } else {
            self.remote_signer
        }
    }

    pub fn responder_signer(&self) -> Address {
        if self.initiator {
            self.remote_signer
        } else {
            self.local_signer.address()
        }
    }
}

/// Which phase of its life the channel is in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelPhase {
    /// No open has been proposed.
    New,
    /// An open proposal exists but is not yet fully signed.
    ProposingOpen,
    /// The open agreement is authorized; payments can flow.
    Open,
    /// A cooperative close has been proposed; payments are rejected.
    Closing,
    /// A close transaction executed on the ledger. Terminal and read only.
    Closed,
}

impl Display for ChannelPhase {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelPhase::New => write!(f, "New"),
            ChannelPhase::ProposingOpen => write!(f, "ProposingOpen"),
            ChannelPhase::Open => write!(f, "Open"),
            ChannelPhase::Closing => write!(f, "Closing"),
            ChannelPhase::Closed => write!(f, "Closed"),
        }
    }
}

/// Parameters of an open proposal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpenParams {
    pub observation_period_time: Duration,
    pub observation_period_ledger_gap: i64,
    pub asset: Asset,
    pub expires_at: SystemTime,
    /// The sequence the initiator's channel account holds once the formation
    /// executes. The commitment chain hangs off this number.
    pub starting_sequence: i64,
    pub initiator_contribution: i64,
    pub responder_contribution: i64,
}

/// Record of the formation transaction having executed on the ledger.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnChainOpen {
    pub starting_sequence: i64,
    pub order_id: i64,
}

/// One side's replica of a payment channel.
#[derive(Debug)]
pub struct Channel {
    pub(crate) config: ChannelConfig,
    pub(crate) phase: ChannelPhase,
    pub(crate) agreements: Agreements,
    pub(crate) open_executed_with: Option<OnChainOpen>,
    pub(crate) latest_declaration_executed: Option<i64>,
    pub(crate) closed_with_iteration: Option<i64>,
    pub(crate) local_channel_account_balance: Option<i64>,
    pub(crate) remote_channel_account_balance: Option<i64>,
    pub(crate) last_ingested_order_id: Option<i64>,
}

impl Channel {
    pub fn new(config: ChannelConfig) -> Channel {
        Channel {
            config,
            phase: ChannelPhase::New,
            agreements: Agreements::default(),
            open_executed_with: None,
            latest_declaration_executed: None,
            closed_with_iteration: None,
            local_channel_account_balance: None,
            remote_channel_account_balance: None,
            last_ingested_order_id: None,
        }
    }

    //------------------------------------   Accessors   ---------------------------------------------------//

    pub fn phase(&self) -> ChannelPhase {
        self.phase
    }

    pub fn is_initiator(&self) -> bool {
        self.config.initiator
    }

    pub fn local_channel_account(&self) -> Address {
        self.config.local_channel_account
    }

    pub fn remote_channel_account(&self) -> Address {
        self.config.remote_channel_account
    }

    pub fn open_agreement(&self) -> Result<&OpenAgreement, ChannelError> {
        self.agreements.open_agreement()
    }

    pub fn latest_authorized_close_agreement(&self) -> Result<&CloseAgreement, ChannelError> {
        self.agreements.latest_authorized_close()
    }

    pub fn latest_unauthorized_close_agreement(&self) -> Option<&CloseEnvelope> {
        self.agreements.latest_unauthorized_close()
    }

    /// The open envelope proposed but not yet fully signed, if any.
    pub fn proposed_open_envelope(&self) -> Option<&OpenEnvelope> {
        self.agreements.proposed_open()
    }

    /// Balances at the latest authorized close agreement.
    pub fn balances(&self) -> Result<ChannelBalances, ChannelError> {
        Ok(self.agreements.latest_authorized_close()?.balances())
    }

    /// The highest iteration whose declaration has been observed on the
    /// ledger.
    pub fn latest_declaration_executed(&self) -> Option<i64> {
        self.latest_declaration_executed
    }

    /// The iteration whose close transaction terminated the channel.
    pub fn closed_with_iteration(&self) -> Option<i64> {
        self.closed_with_iteration
    }

    pub fn open_executed_with(&self) -> Option<OnChainOpen> {
        self.open_executed_with
    }

    /// Update the cached on-chain balance of the local channel account. Used
    /// to re-check an `Underfunded` proposal after refreshing from the
    /// ledger.
    pub fn update_local_channel_account_balance(&mut self, balance: i64) {
        self.local_channel_account_balance = Some(balance);
    }

    /// Update the cached on-chain balance of the remote channel account.
    pub fn update_remote_channel_account_balance(&mut self, balance: i64) {
        self.remote_channel_account_balance = Some(balance);
    }

    pub fn local_channel_account_balance(&self) -> Option<i64> {
        self.local_channel_account_balance
    }

    pub fn remote_channel_account_balance(&self) -> Option<i64> {
        self.remote_channel_account_balance
    }

    fn local_address(&self) -> Address {
        self.config.local_signer.address()
    }

    //------------------------------------   Open   --------------------------------------------------------//

    /// Propose opening the channel. Only the initiator proposes; the
    /// returned envelope carries the proposer's signatures over the
    /// formation and the initial declaration and close pair.
    pub fn propose_open(&mut self, params: OpenParams) -> Result<OpenEnvelope, ChannelError> {
        if !self.config.initiator {
            return Err(ChannelError::InvalidOpen("only the initiator proposes the open".into()));
        }
        if self.phase != ChannelPhase::New {
            return Err(ChannelError::AlreadyOpen);
        }
        let now = SystemTime::now();
        // Half the configured window, so clock drift between the
        // participants cannot push the proposal past the confirmer's limit.
        let latest_allowed = now + self.config.max_open_expiry / 2;
        if params.expires_at > latest_allowed {
            return Err(ChannelError::InvalidOpen("expiry is too far in the future".into()));
        }
        if params.starting_sequence <= 0 {
            return Err(ChannelError::InvalidOpen("starting sequence must be positive".into()));
        }
        if params.observation_period_ledger_gap < 0 {
            return Err(ChannelError::InvalidOpen("observation period ledger gap is negative".into()));
        }
        if params.initiator_contribution < 0 || params.responder_contribution < 0 {
            return Err(ChannelError::InvalidOpen("contributions must not be negative".into()));
        }
        let details = OpenDetails {
            observation_period_time: params.observation_period_time,
            observation_period_ledger_gap: params.observation_period_ledger_gap,
            asset: params.asset,
            expires_at: params.expires_at,
            starting_sequence: params.starting_sequence,
            initiator_contribution: params.initiator_contribution,
            responder_contribution: params.responder_contribution,
            proposing_signer: self.local_address(),
            confirming_signer: self.config.remote_signer,
        };
        let txs = self.open_txs_for(&details)?;
        let envelope = OpenEnvelope {
            proposer_signatures: OpenSignatures::sign(&self.config.network_id, &txs, &self.config.local_signer),
            confirmer_signatures: OpenSignatures::default(),
            details,
        };
        self.agreements.store_proposed_open(envelope.clone());
        self.phase = ChannelPhase::ProposingOpen;
        debug!("proposed open at starting sequence {}", envelope.details.starting_sequence);
        Ok(envelope)
    }

    /// Confirm an open envelope. Valid on either side and idempotent.
    ///
    /// Adds every signature the local participant can produce. Returns the
    /// envelope once it is fully authorized, or the `NotSigned` sentinel
    /// while a counterparty signature is still outstanding, in which case
    /// the caller sends the envelope to the peer and re-presents the reply.
    pub fn confirm_open(&mut self, mut envelope: OpenEnvelope) -> Result<OpenEnvelope, ChannelError> {
        if self.phase == ChannelPhase::Closed {
            return Err(ChannelError::Closed);
        }
        if let Ok(open) = self.agreements.open_agreement() {
            // Already authorized. Re-presenting the same agreement is a
            // no-op; anything else is a fresh open and rejected.
            return if open.envelope.details == envelope.details {
                Ok(open.envelope.clone())
            } else {
                Err(ChannelError::InvalidOpen("an open agreement is already authorized".into()))
            };
        }

        self.validate_open_details(&envelope.details)?;
        let txs = self.open_txs_for(&envelope.details)?;
        let network = self.config.network_id.clone();
        let local = self.local_address();

        if envelope.details.proposing_signer == local {
            // Our own proposal coming back. Restore our signatures in case
            // the peer returned a stripped envelope, then require theirs.
            if let Some(proposed) = self.agreements.proposed_open() {
                if envelope.proposer_signatures.is_empty() {
                    envelope.proposer_signatures = proposed.proposer_signatures.clone();
                }
            }
        } else if envelope.confirmer_signatures.is_empty() {
            envelope.confirmer_signatures = OpenSignatures::sign(&network, &txs, &self.config.local_signer);
        }

        if !envelope.is_authorized() {
            self.agreements.store_proposed_open(envelope);
            if self.phase == ChannelPhase::New {
                self.phase = ChannelPhase::ProposingOpen;
            }
            return Err(ChannelError::NotSigned);
        }

        envelope.proposer_signatures.verify(&network, &txs, &envelope.details.proposing_signer)?;
        envelope.confirmer_signatures.verify(&network, &txs, &envelope.details.confirming_signer)?;

        let initial_close = CloseAgreement { envelope: self.initial_close_envelope(&envelope) };
        self.agreements.store_open(OpenAgreement { envelope: envelope.clone() });
        self.agreements.store_authorized_close(initial_close);
        let details = &envelope.details;
        let (local_contribution, remote_contribution) = if self.config.initiator {
            (details.initiator_contribution, details.responder_contribution)
        } else {
            (details.responder_contribution, details.initiator_contribution)
        };
        self.local_channel_account_balance.get_or_insert(local_contribution);
        self.remote_channel_account_balance.get_or_insert(remote_contribution);
        self.phase = ChannelPhase::Open;
        debug!("open authorized, channel is usable");
        Ok(envelope)
    }

    fn validate_open_details(&self, details: &OpenDetails) -> Result<(), ChannelError> {
        let now = SystemTime::now();
        if details.expires_at <= now {
            return Err(ChannelError::InvalidOpen("open proposal has expired".into()));
        }
        if details.expires_at > now + self.config.max_open_expiry {
            return Err(ChannelError::InvalidOpen("expiry is too far in the future".into()));
        }
        if details.starting_sequence <= 0 {
            return Err(ChannelError::InvalidOpen("starting sequence must be positive".into()));
        }
        if details.observation_period_ledger_gap < 0 {
            return Err(ChannelError::InvalidOpen("observation period ledger gap is negative".into()));
        }
        if details.initiator_contribution < 0 || details.responder_contribution < 0 {
            return Err(ChannelError::InvalidOpen("contributions must not be negative".into()));
        }
        let local = self.local_address();
        let expected_proposer = if self.config.initiator { local } else { self.config.remote_signer };
        let expected_confirmer = if self.config.initiator { self.config.remote_signer } else { local };
        if details.proposing_signer != expected_proposer || details.confirming_signer != expected_confirmer {
            return Err(ChannelError::InvalidOpen("signers do not match the channel participants".into()));
        }
        if let Some(proposed) = self.agreements.proposed_open() {
            if proposed.details != *details {
                return Err(ChannelError::InvalidOpen("details differ from the proposed open".into()));
            }
        }
        Ok(())
    }

    /// The iteration-0 close agreement embedded in the open: it returns each
    /// participant's contribution if the channel is closed before any
    /// payment is made.
    fn initial_close_envelope(&self, open: &OpenEnvelope) -> CloseEnvelope {
        CloseEnvelope {
            details: initial_close_details(&open.details),
            proposer_signatures: CloseSignatures {
                close: open.proposer_signatures.close,
                declaration: open.proposer_signatures.declaration,
            },
            confirmer_signatures: CloseSignatures {
                close: open.confirmer_signatures.close,
                declaration: open.confirmer_signatures.declaration,
            },
        }
    }

    /// The formation transaction of the authorized open agreement, carrying
    /// both participants' signatures, ready for external submission.
    pub fn open_tx(&self) -> Result<Tx, ChannelError> {
        let open = self.agreements.open_agreement()?;
        let txs = self.open_txs_for(open.details())?;
        let details = open.details();
        let signatures = decorated_pair(
            open.envelope.proposer_signatures.formation,
            details.proposing_signer,
            open.envelope.confirmer_signatures.formation,
            details.confirming_signer,
        );
        Ok(txs.formation.add_signature_decorated(signatures))
    }

    //------------------------------------   Payment   -----------------------------------------------------//

    /// Propose paying `amount` of the channel's asset to the remote
    /// participant.
    pub fn propose_payment(&mut self, amount: i64) -> Result<CloseEnvelope, ChannelError> {
        self.propose_payment_with_memo(amount, None)
    }

    /// Propose a payment carrying an opaque memo, delivered to the remote
    /// participant with the authorized agreement.
    pub fn propose_payment_with_memo(
        &mut self,
        amount: i64,
        memo: Option<Vec<u8>>,
    ) -> Result<CloseEnvelope, ChannelError> {
        match self.phase {
            ChannelPhase::Open => {}
            ChannelPhase::Closing => return Err(ChannelError::CloseInProgress),
            ChannelPhase::Closed => return Err(ChannelError::Closed),
            ChannelPhase::New | ChannelPhase::ProposingOpen => return Err(ChannelError::NotOpen),
        }
        if amount <= 0 {
            return Err(ChannelError::NonPositiveAmount(amount));
        }
        if self.agreements.latest_unauthorized_close().is_some() {
            return Err(ChannelError::InvalidPayment("a proposal is already awaiting the counterparty".into()));
        }
        let open_details = self.agreements.open_agreement()?.details().clone();
        let authorized = self.agreements.latest_authorized_close()?;
        let balances = authorized.balances();
        let payer_balance = if self.config.initiator { balances.to_initiator } else { balances.to_responder };
        let new_balances = if self.config.initiator {
            balances.pay_from_initiator(amount)
        } else {
            balances.pay_from_responder(amount)
        };
        let new_balances = match new_balances {
            Some(b) => b,
            None if payer_balance < amount => return Err(ChannelError::Underfunded),
            None => return Err(ChannelError::BalanceOverflow),
        };
        // The close at the new balances must be covered by what the local
        // channel account actually holds on the ledger, per the cache.
        let owed = if self.config.initiator {
            owed_by_initiator(&new_balances, open_details.responder_contribution)
        } else {
            owed_by_responder(&new_balances, open_details.initiator_contribution)
        };
        if owed > self.local_channel_account_balance.unwrap_or(0) {
            debug!("proposal underfunded: {owed} owed exceeds cached local balance");
            return Err(ChannelError::Underfunded);
        }
        let details = CloseDetails {
            iteration_number: authorized.iteration_number() + 1,
            balances: new_balances,
            payment_amount: if self.config.initiator { amount } else { -amount },
            memo,
            observation_period_time: open_details.observation_period_time,
            observation_period_ledger_gap: open_details.observation_period_ledger_gap,
            proposing_signer: self.local_address(),
            confirming_signer: self.config.remote_signer,
        };
        let txs = self.close_txs_for(&open_details, &details)?;
        let envelope = CloseEnvelope {
            proposer_signatures: CloseSignatures::sign(&self.config.network_id, &txs, &self.config.local_signer),
            confirmer_signatures: CloseSignatures::default(),
            details,
        };
        self.agreements.store_unauthorized_close(envelope.clone());
        debug!("proposed payment of {amount} at iteration {}", envelope.details.iteration_number);
        Ok(envelope)
    }

    /// Confirm a payment envelope from the counterparty, or an already
    /// authorized agreement re-presented. Adds the local signatures and, if
    /// the envelope is then fully signed, advances the latest authorized
    /// close agreement.
    pub fn confirm_payment(&mut self, mut envelope: CloseEnvelope) -> Result<CloseEnvelope, ChannelError> {
        match self.phase {
            ChannelPhase::Open => {}
            ChannelPhase::Closing => return Err(ChannelError::CloseInProgress),
            ChannelPhase::Closed => return Err(ChannelError::Closed),
            ChannelPhase::New | ChannelPhase::ProposingOpen => return Err(ChannelError::NotOpen),
        }
        let open_details = self.agreements.open_agreement()?.details().clone();
        let authorized = self.agreements.latest_authorized_close()?.clone();
        let i_cur = authorized.iteration_number();
        let details = envelope.details.clone();

        if details.iteration_number == i_cur && details == *authorized.details() {
            // Replay of the agreement already authorized.
            return Ok(authorized.envelope);
        }
        if details.iteration_number <= i_cur {
            return Err(ChannelError::IterationTooOld { expected: i_cur + 1, actual: details.iteration_number });
        }
        if details.iteration_number > i_cur + 1 {
            return Err(ChannelError::IterationTooNew { expected: i_cur + 1, actual: details.iteration_number });
        }

        let local = self.local_address();
        if details.proposing_signer == local {
            // Our own proposal returned with the counterparty's signatures.
            return Ok(self.finalize_pending(envelope.confirmer_signatures)?.envelope);
        }

        // A proposal from the counterparty. If we hold our own pending
        // proposal at the same iteration both sides resolve the race the
        // same way: the proposal from the smaller address wins.
        if let Some(pending) = self.agreements.latest_unauthorized_close() {
            if pending.details.proposing_signer == local && pending.details.iteration_number == details.iteration_number
            {
                if local < details.proposing_signer {
                    return Err(ChannelError::ProposalSuperseded);
                }
                debug!("discarding local proposal at iteration {} in favor of the counterparty's", details.iteration_number);
                self.agreements.discard_unauthorized_close();
            }
        }

        if details.proposing_signer != self.config.remote_signer || details.confirming_signer != local {
            return Err(ChannelError::InvalidPayment("signers do not match the channel participants".into()));
        }
        let remote_is_initiator = !self.config.initiator;
        if remote_is_initiator && details.payment_amount <= 0 || !remote_is_initiator && details.payment_amount >= 0 {
            return Err(ChannelError::InvalidPayment("payment direction does not match the proposer".into()));
        }
        let expected_balances = authorized
            .balances()
            .apply_payment(details.payment_amount)
            .ok_or(ChannelError::BalanceOverflow)?;
        if details.balances != expected_balances {
            return Err(ChannelError::InvalidPayment("balances do not follow from the payment amount".into()));
        }
        if details.observation_period_time != open_details.observation_period_time
            || details.observation_period_ledger_gap != open_details.observation_period_ledger_gap
        {
            return Err(ChannelError::InvalidPayment("observation period differs from the open agreement".into()));
        }
        // The proposer must be able to cover the new balances on chain.
        let owed = if remote_is_initiator {
            owed_by_initiator(&details.balances, open_details.responder_contribution)
        } else {
            owed_by_responder(&details.balances, open_details.initiator_contribution)
        };
        if owed > self.remote_channel_account_balance.unwrap_or(0) {
            debug!("confirm underfunded: {owed} owed exceeds cached remote balance");
            return Err(ChannelError::Underfunded);
        }

        let txs = self.close_txs_for(&open_details, &details)?;
        let network = self.config.network_id.clone();
        envelope.proposer_signatures.verify(&network, &txs, &details.proposing_signer)?;
        if envelope.confirmer_signatures.is_empty() {
            envelope.confirmer_signatures = CloseSignatures::sign(&network, &txs, &self.config.local_signer);
        } else {
            envelope.confirmer_signatures.verify(&network, &txs, &details.confirming_signer)?;
        }
        self.agreements.store_authorized_close(CloseAgreement { envelope: envelope.clone() });
        debug!("payment authorized at iteration {}", details.iteration_number);
        Ok(envelope)
    }

    /// Attach the counterparty's signatures to the pending proposal and
    /// promote it to the latest authorized close agreement. Called by the
    /// original proposer.
    pub fn finalize_payment(&mut self, confirmer_signatures: CloseSignatures) -> Result<CloseAgreement, ChannelError> {
        match self.phase {
            ChannelPhase::Open | ChannelPhase::Closing => {}
            ChannelPhase::Closed => return Err(ChannelError::Closed),
            ChannelPhase::New | ChannelPhase::ProposingOpen => return Err(ChannelError::NotOpen),
        }
        self.finalize_pending(confirmer_signatures)
    }

    fn finalize_pending(&mut self, confirmer_signatures: CloseSignatures) -> Result<CloseAgreement, ChannelError> {
        let open_details = self.agreements.open_agreement()?.details().clone();
        let pending = match self.agreements.latest_unauthorized_close() {
            Some(pending) => pending.clone(),
            None => {
                // Replaying signatures for the agreement already authorized
                // is a no-op returning the same agreement.
                if let Ok(authorized) = self.agreements.latest_authorized_close() {
                    if authorized.envelope.confirmer_signatures == confirmer_signatures {
                        return Ok(authorized.clone());
                    }
                }
                return Err(ChannelError::NoUnauthorizedAgreement);
            }
        };
        if pending.details.proposing_signer != self.local_address() {
            return Err(ChannelError::InvalidPayment("the pending proposal was not proposed locally".into()));
        }
        let txs = self.close_txs_for(&open_details, &pending.details)?;
        confirmer_signatures.verify(&self.config.network_id, &txs, &pending.details.confirming_signer)?;
        let envelope = CloseEnvelope { confirmer_signatures, ..pending };
        let agreement = CloseAgreement { envelope };
        self.agreements.store_authorized_close(agreement.clone());
        debug!("finalized agreement at iteration {}", agreement.iteration_number());
        Ok(agreement)
    }

    //------------------------------------   Cooperative close   -------------------------------------------//

    /// Propose closing the channel cooperatively: a revision of the current
    /// balances whose close transaction carries no observation period, so it
    /// can be submitted immediately once authorized.
    pub fn propose_close(&mut self) -> Result<CloseEnvelope, ChannelError> {
        match self.phase {
            ChannelPhase::Open | ChannelPhase::Closing => {}
            ChannelPhase::Closed => return Err(ChannelError::Closed),
            ChannelPhase::New | ChannelPhase::ProposingOpen => return Err(ChannelError::NotOpen),
        }
        let open_details = self.agreements.open_agreement()?.details().clone();
        let authorized = self.agreements.latest_authorized_close()?;
        let details = CloseDetails {
            iteration_number: authorized.iteration_number() + 1,
            balances: authorized.balances(),
            payment_amount: 0,
            memo: None,
            observation_period_time: Duration::ZERO,
            observation_period_ledger_gap: 0,
            proposing_signer: self.local_address(),
            confirming_signer: self.config.remote_signer,
        };
        let txs = self.close_txs_for(&open_details, &details)?;
        let envelope = CloseEnvelope {
            proposer_signatures: CloseSignatures::sign(&self.config.network_id, &txs, &self.config.local_signer),
            confirmer_signatures: CloseSignatures::default(),
            details,
        };
        self.agreements.store_unauthorized_close(envelope.clone());
        self.phase = ChannelPhase::Closing;
        debug!("proposed cooperative close at iteration {}", envelope.details.iteration_number);
        Ok(envelope)
    }

    /// Confirm a cooperative close envelope, from either side.
    pub fn confirm_close(&mut self, mut envelope: CloseEnvelope) -> Result<CloseEnvelope, ChannelError> {
        match self.phase {
            ChannelPhase::Open | ChannelPhase::Closing => {}
            ChannelPhase::Closed => return Err(ChannelError::Closed),
            ChannelPhase::New | ChannelPhase::ProposingOpen => return Err(ChannelError::NotOpen),
        }
        let open_details = self.agreements.open_agreement()?.details().clone();
        let authorized = self.agreements.latest_authorized_close()?.clone();
        let i_cur = authorized.iteration_number();
        let details = envelope.details.clone();

        if details.iteration_number == i_cur && details == *authorized.details() {
            return Ok(authorized.envelope);
        }
        if details.iteration_number <= i_cur {
            return Err(ChannelError::IterationTooOld { expected: i_cur + 1, actual: details.iteration_number });
        }
        if details.iteration_number > i_cur + 1 {
            return Err(ChannelError::IterationTooNew { expected: i_cur + 1, actual: details.iteration_number });
        }

        let local = self.local_address();
        if details.proposing_signer == local {
            let agreement = self.finalize_pending(envelope.confirmer_signatures)?;
            self.phase = ChannelPhase::Closing;
            return Ok(agreement.envelope);
        }

        if details.proposing_signer != self.config.remote_signer || details.confirming_signer != local {
            return Err(ChannelError::InvalidClose("signers do not match the channel participants".into()));
        }
        if details.payment_amount != 0 {
            return Err(ChannelError::InvalidClose("a close revision must not move funds".into()));
        }
        if details.balances != authorized.balances() {
            return Err(ChannelError::InvalidClose("balances differ from the latest authorized agreement".into()));
        }
        if details.observation_period_time != Duration::ZERO || details.observation_period_ledger_gap != 0 {
            return Err(ChannelError::InvalidClose("a close revision must drop the observation period".into()));
        }

        let txs = self.close_txs_for(&open_details, &details)?;
        let network = self.config.network_id.clone();
        envelope.proposer_signatures.verify(&network, &txs, &details.proposing_signer)?;
        if envelope.confirmer_signatures.is_empty() {
            envelope.confirmer_signatures = CloseSignatures::sign(&network, &txs, &self.config.local_signer);
        } else {
            envelope.confirmer_signatures.verify(&network, &txs, &details.confirming_signer)?;
        }
        self.agreements.store_authorized_close(CloseAgreement { envelope: envelope.clone() });
        self.phase = ChannelPhase::Closing;
        debug!("cooperative close authorized at iteration {}", details.iteration_number);
        Ok(envelope)
    }

    /// Attach the counterparty's signatures to a pending close proposal.
    /// Mirrors [`Channel::finalize_payment`].
    pub fn finalize_close(&mut self, confirmer_signatures: CloseSignatures) -> Result<CloseAgreement, ChannelError> {
        match self.phase {
            ChannelPhase::Open | ChannelPhase::Closing => {}
            ChannelPhase::Closed => return Err(ChannelError::Closed),
            ChannelPhase::New | ChannelPhase::ProposingOpen => return Err(ChannelError::NotOpen),
        }
        let agreement = self.finalize_pending(confirmer_signatures)?;
        self.phase = ChannelPhase::Closing;
        Ok(agreement)
    }

    /// The declaration and close transaction pair of the latest authorized
    /// close agreement, with both participants' signatures attached. The
    /// caller submits the declaration, waits out the observation period, and
    /// then submits the close.
    pub fn close_txs(&self) -> Result<(Tx, Tx), ChannelError> {
        let open_details = self.agreements.open_agreement()?.details();
        let authorized = self.agreements.latest_authorized_close()?;
        let details = authorized.details();
        let txs = self.close_txs_for(open_details, details)?;
        let envelope = &authorized.envelope;
        let declaration = txs.declaration.add_signature_decorated(decorated_pair(
            envelope.proposer_signatures.declaration,
            details.proposing_signer,
            envelope.confirmer_signatures.declaration,
            details.confirming_signer,
        ));
        let close = txs.close.add_signature_decorated(decorated_pair(
            envelope.proposer_signatures.close,
            details.proposing_signer,
            envelope.confirmer_signatures.close,
            details.confirming_signer,
        ));
        Ok((declaration, close))
    }

    /// Reset a channel whose open proposal expired without the formation
    /// executing. Only valid before the open agreement is authorized.
    pub fn close_teardown(&mut self) -> Result<(), ChannelError> {
        match self.phase {
            ChannelPhase::New | ChannelPhase::ProposingOpen => {
                self.agreements.reset();
                self.phase = ChannelPhase::New;
                Ok(())
            }
            _ => Err(ChannelError::AlreadyOpen),
        }
    }

    //------------------------------------   Ingestion   ---------------------------------------------------//

    /// Ingest a transaction observed on the ledger. Transactions must be
    /// presented in monotonic `order_id` order; duplicates are ignored.
    /// Returns the event the transaction signifies for this channel, if any.
    pub fn ingest_tx(&mut self, streamed: &StreamedTx) -> Result<Option<ChannelEvent>, ChannelError> {
        if self.phase == ChannelPhase::Closed {
            return Ok(None);
        }
        if let Some(last) = self.last_ingested_order_id {
            if streamed.order_id <= last {
                return Ok(None);
            }
        }
        self.last_ingested_order_id = Some(streamed.order_id);
        if !streamed.success {
            return Ok(None);
        }
        let Ok(open) = self.agreements.open_agreement() else {
            return Ok(None);
        };
        let open_details = open.details().clone();
        let start = open_details.starting_sequence;
        let network = self.config.network_id.clone();

        let formation = self.open_txs_for(&open_details)?.formation;
        if streamed.tx.hash(&network) == formation.hash(&network) {
            if self.open_executed_with.is_some() {
                return Ok(None);
            }
            self.open_executed_with = Some(OnChainOpen { starting_sequence: start, order_id: streamed.order_id });
            if self.phase == ChannelPhase::ProposingOpen {
                self.phase = ChannelPhase::Open;
            }
            debug!("observed formation at order id {}", streamed.order_id);
            return Ok(Some(ChannelEvent::OpenExecuted { order_id: streamed.order_id }));
        }

        if streamed.tx.source() == self.config.initiator_channel_account() {
            match position_of_sequence(start, streamed.tx.sequence_number()) {
                Some(SequencePosition::Declaration(iteration)) => {
                    if self.latest_declaration_executed.map_or(true, |cur| iteration > cur) {
                        self.latest_declaration_executed = Some(iteration);
                        debug!("observed declaration for iteration {iteration}");
                        return Ok(Some(ChannelEvent::DeclarationExecuted {
                            iteration,
                            order_id: streamed.order_id,
                        }));
                    }
                    return Ok(None);
                }
                Some(SequencePosition::Close(iteration)) => {
                    self.phase = ChannelPhase::Closed;
                    self.closed_with_iteration = Some(iteration);
                    debug!("observed close for iteration {iteration}, channel is closed");
                    return Ok(Some(ChannelEvent::CloseExecuted { iteration, order_id: streamed.order_id }));
                }
                None => {}
            }
        }

        self.observe_balance_changes(&streamed.tx, &open_details.asset);
        Ok(None)
    }

    /// Track deposits to and withdrawals from the channel accounts so the
    /// cached balances reflect what the ledger holds.
    fn observe_balance_changes(&mut self, tx: &Tx, asset: &Asset) {
        for op in tx.operations() {
            let Operation::Payment { from, to, asset: op_asset, amount } = op else {
                continue;
            };
            if op_asset != asset {
                continue;
            }
            for (account, cached) in [
                (self.config.local_channel_account, &mut self.local_channel_account_balance),
                (self.config.remote_channel_account, &mut self.remote_channel_account_balance),
            ] {
                if *to == account {
                    *cached = Some(cached.unwrap_or(0).saturating_add(*amount));
                } else if *from == account {
                    *cached = Some(cached.unwrap_or(0).saturating_sub(*amount));
                }
            }
        }
    }

    //------------------------------------   Transaction derivation   --------------------------------------//

    fn open_txs_for(&self, details: &OpenDetails) -> Result<OpenTxs, ChannelError> {
        let formation = build_formation(&FormationParams {
            initiator_channel_account: self.config.initiator_channel_account(),
            responder_channel_account: self.config.responder_channel_account(),
            initiator_signer: self.config.initiator_signer(),
            responder_signer: self.config.responder_signer(),
            start_sequence: details.starting_sequence,
            expires_at: details.expires_at,
            asset: details.asset.clone(),
            initiator_contribution: details.initiator_contribution,
            responder_contribution: details.responder_contribution,
        })
        .map_err(invalid_open)?;
        let initial = initial_close_details(details);
        let CloseTxs { declaration, close } = self.close_txs_for(details, &initial).map_err(invalid_open_from)?;
        Ok(OpenTxs { formation, declaration, close })
    }

    fn close_txs_for(&self, open: &OpenDetails, close: &CloseDetails) -> Result<CloseTxs, ChannelError> {
        // Declarations always gate on the starting sequence. The gate is part
        // of the signed bytes, so it cannot track which declaration executes
        // first; rooting it at the chain start keeps every newer declaration
        // executable after any older one lands.
        let declaration = build_declaration(&DeclarationParams {
            initiator_channel_account: self.config.initiator_channel_account(),
            start_sequence: open.starting_sequence,
            iteration_number: close.iteration_number,
            iteration_executed: 0,
        })
        .map_err(invalid_close)?;
        let close_tx = build_close(&CloseParams {
            observation_period_time: close.observation_period_time,
            observation_period_ledger_gap: close.observation_period_ledger_gap,
            initiator_signer: self.config.initiator_signer(),
            responder_signer: self.config.responder_signer(),
            initiator_channel_account: self.config.initiator_channel_account(),
            responder_channel_account: self.config.responder_channel_account(),
            start_sequence: open.starting_sequence,
            iteration_number: close.iteration_number,
            amount_to_initiator: close.balances.to_initiator,
            amount_to_responder: close.balances.to_responder,
            asset: open.asset.clone(),
        })
        .map_err(invalid_close)?;
        Ok(CloseTxs { declaration, close: close_tx })
    }
}

/// The details of the iteration-0 close agreement implied by an open
/// agreement: contributions returned, full observation period.
fn initial_close_details(open: &OpenDetails) -> CloseDetails {
    CloseDetails {
        iteration_number: 0,
        balances: open.initial_balances(),
        payment_amount: 0,
        memo: None,
        observation_period_time: open.observation_period_time,
        observation_period_ledger_gap: open.observation_period_ledger_gap,
        proposing_signer: open.proposing_signer,
        confirming_signer: open.confirming_signer,
    }
}

fn decorated_pair(
    proposer: Option<crate::keys::Signature>,
    proposer_signer: Address,
    confirmer: Option<crate::keys::Signature>,
    confirmer_signer: Address,
) -> Vec<DecoratedSignature> {
    let mut signatures = Vec::with_capacity(2);
    if let Some(signature) = proposer {
        signatures.push(DecoratedSignature { signer: proposer_signer, signature });
    }
    if let Some(signature) = confirmer {
        signatures.push(DecoratedSignature { signer: confirmer_signer, signature });
    }
    signatures
}

fn invalid_open(e: TxBuildError) -> ChannelError {
    ChannelError::InvalidOpen(e.to_string())
}

fn invalid_open_from(e: ChannelError) -> ChannelError {
    match e {
        ChannelError::InvalidClose(msg) => ChannelError::InvalidOpen(msg),
        other => other,
    }
}

fn invalid_close(e: TxBuildError) -> ChannelError {
    ChannelError::InvalidClose(e.to_string())
}
