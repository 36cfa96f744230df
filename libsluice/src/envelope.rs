//! Agreement details and the signature envelopes that carry them.
//!
//! A *details* block is the semantic content both participants sign. An
//! envelope pairs a details block with the proposer's and the confirmer's
//! signature sets. Signatures bind the canonical bytes of the transactions
//! derived from the details, never the envelope encoding, so an envelope can
//! be re-encoded freely in transit.

use crate::asset::Asset;
use crate::balance::ChannelBalances;
use crate::error::ChannelError;
use crate::keys::{Address, Signature, Signer};
use crate::tx::Tx;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

//------------------------------------   Details blocks   --------------------------------------------------//

/// The negotiated content of an open agreement.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenDetails {
    pub observation_period_time: Duration,
    pub observation_period_ledger_gap: i64,
    pub asset: Asset,
    pub expires_at: SystemTime,
    pub starting_sequence: i64,
    pub initiator_contribution: i64,
    pub responder_contribution: i64,
    pub proposing_signer: Address,
    pub confirming_signer: Address,
}

impl OpenDetails {
    pub fn initial_balances(&self) -> ChannelBalances {
        ChannelBalances::new(self.initiator_contribution, self.responder_contribution)
    }
}

/// The negotiated content of a close agreement at one iteration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseDetails {
    /// Strictly increasing across the life of the channel. Iteration 0 is
    /// the initial agreement embedded in the open.
    pub iteration_number: i64,
    /// What each side is owed if the channel closes at this iteration.
    pub balances: ChannelBalances,
    /// The change relative to the previous iteration. Positive pays the
    /// initiator's funds to the responder, negative the reverse.
    pub payment_amount: i64,
    pub memo: Option<Vec<u8>>,
    /// The close transaction's time lock. Zeroed by a cooperative close.
    pub observation_period_time: Duration,
    pub observation_period_ledger_gap: i64,
    pub proposing_signer: Address,
    pub confirming_signer: Address,
}

//------------------------------------   Signature sets   --------------------------------------------------//

/// Signatures by one participant over the transactions of an open agreement.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenSignatures {
    pub close: Option<Signature>,
    pub declaration: Option<Signature>,
    pub formation: Option<Signature>,
}

impl OpenSignatures {
    pub fn is_full(&self) -> bool {
        self.close.is_some() && self.declaration.is_some() && self.formation.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.close.is_none() && self.declaration.is_none() && self.formation.is_none()
    }

    /// Sign all three transactions with `signer`.
    pub fn sign(network_id: &str, txs: &OpenTxs, signer: &Signer) -> Self {
        OpenSignatures {
            close: Some(txs.close.sign_detached(network_id, signer)),
            declaration: Some(txs.declaration.sign_detached(network_id, signer)),
            formation: Some(txs.formation.sign_detached(network_id, signer)),
        }
    }

    /// Verify that all three signatures are present and valid for `signer`.
    pub fn verify(&self, network_id: &str, txs: &OpenTxs, signer: &Address) -> Result<(), ChannelError> {
        let slots = [
            (&self.close, &txs.close),
            (&self.declaration, &txs.declaration),
            (&self.formation, &txs.formation),
        ];
        for (slot, tx) in slots {
            let signature = slot.as_ref().ok_or(ChannelError::NotSigned)?;
            if !tx.verify_signature(network_id, signer, signature) {
                return Err(ChannelError::InvalidSignature { signer: *signer });
            }
        }
        Ok(())
    }
}

/// Signatures by one participant over the transaction pair of a close
/// agreement.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseSignatures {
    pub close: Option<Signature>,
    pub declaration: Option<Signature>,
}

impl CloseSignatures {
    pub fn is_full(&self) -> bool {
        self.close.is_some() && self.declaration.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.close.is_none() && self.declaration.is_none()
    }

    pub fn sign(network_id: &str, txs: &CloseTxs, signer: &Signer) -> Self {
        CloseSignatures {
            close: Some(txs.close.sign_detached(network_id, signer)),
            declaration: Some(txs.declaration.sign_detached(network_id, signer)),
        }
    }

    pub fn verify(&self, network_id: &str, txs: &CloseTxs, signer: &Address) -> Result<(), ChannelError> {
        let slots = [(&self.close, &txs.close), (&self.declaration, &txs.declaration)];
        for (slot, tx) in slots {
            let signature = slot.as_ref().ok_or(ChannelError::NotSigned)?;
            if !tx.verify_signature(network_id, signer, signature) {
                return Err(ChannelError::InvalidSignature { signer: *signer });
            }
        }
        Ok(())
    }
}

//------------------------------------   Derived transactions   --------------------------------------------//

/// The transactions derived from an open agreement's details: the formation
/// plus the initial declaration and close pair.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpenTxs {
    pub formation: Tx,
    pub declaration: Tx,
    pub close: Tx,
}

/// The transaction pair derived from a close agreement's details.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseTxs {
    pub declaration: Tx,
    pub close: Tx,
}

//------------------------------------   Envelopes   -------------------------------------------------------//

/// An open agreement in flight: details plus the signatures collected so far.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenEnvelope {
    pub details: OpenDetails,
    pub proposer_signatures: OpenSignatures,
    pub confirmer_signatures: OpenSignatures,
}

impl OpenEnvelope {
    /// Authorized means fully signed by both participants.
    pub fn is_authorized(&self) -> bool {
        self.proposer_signatures.is_full() && self.confirmer_signatures.is_full()
    }
}

/// A close agreement in flight.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseEnvelope {
    pub details: CloseDetails,
    pub proposer_signatures: CloseSignatures,
    pub confirmer_signatures: CloseSignatures,
}

impl CloseEnvelope {
    pub fn is_authorized(&self) -> bool {
        self.proposer_signatures.is_full() && self.confirmer_signatures.is_full()
    }
}
