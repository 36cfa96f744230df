//! Builders for the three transactions of the channel commitment scheme.
//!
//! All three are deterministic functions of their parameters. Both
//! participants build them independently from the agreement details and must
//! arrive at identical transactions, otherwise their signatures cannot match.

use crate::asset::Asset;
use crate::keys::Address;
use crate::tx::{close_sequence, declaration_sequence, Operation, Preconditions, Tx};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};
use thiserror::Error;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormationParams {
    pub initiator_channel_account: Address,
    pub responder_channel_account: Address,
    pub initiator_signer: Address,
    pub responder_signer: Address,
    pub start_sequence: i64,
    pub expires_at: SystemTime,
    pub asset: Asset,
    pub initiator_contribution: i64,
    pub responder_contribution: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclarationParams {
    pub initiator_channel_account: Address,
    pub start_sequence: i64,
    pub iteration_number: i64,
    pub iteration_executed: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseParams {
    pub observation_period_time: Duration,
    pub observation_period_ledger_gap: i64,
    pub initiator_signer: Address,
    pub responder_signer: Address,
    pub initiator_channel_account: Address,
    pub responder_channel_account: Address,
    pub start_sequence: i64,
    pub iteration_number: i64,
    pub amount_to_initiator: i64,
    pub amount_to_responder: i64,
    pub asset: Asset,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TxBuildError {
    #[error("start sequence {0} is not positive")]
    NonPositiveStartSequence(i64),
    #[error("iteration number {0} is negative")]
    NegativeIteration(i64),
    #[error("executed iteration {executed} is not before iteration {iteration}")]
    ExecutedIterationNotBefore { executed: i64, iteration: i64 },
    #[error("amount {0} is negative")]
    NegativeAmount(i64),
}

/// The one-time transaction that sets both channel accounts under joint
/// 2-of-2 control, deposits the initial contributions, and leaves the
/// initiator's channel account at the chain's starting sequence.
pub fn build_formation(p: &FormationParams) -> Result<Tx, TxBuildError> {
    if p.start_sequence <= 0 {
        return Err(TxBuildError::NonPositiveStartSequence(p.start_sequence));
    }
    if p.initiator_contribution < 0 {
        return Err(TxBuildError::NegativeAmount(p.initiator_contribution));
    }
    if p.responder_contribution < 0 {
        return Err(TxBuildError::NegativeAmount(p.responder_contribution));
    }
    let signers = [p.initiator_signer, p.responder_signer];
    let preconditions = Preconditions { expires_at: Some(p.expires_at), ..Preconditions::default() };
    Ok(Tx::new(
        p.initiator_channel_account,
        p.start_sequence,
        preconditions,
        vec![
            Operation::ConfigureMultisig {
                account: p.initiator_channel_account,
                signers,
                contribution: p.initiator_contribution,
            },
            Operation::ConfigureMultisig {
                account: p.responder_channel_account,
                signers,
                contribution: p.responder_contribution,
            },
        ],
    ))
}

/// The transaction announcing "iteration `i` is the latest" by consuming
/// iteration `i`'s declaration sequence.
///
/// The minimum-sequence gate is the sequence the channel account holds after
/// the last declaration known to have executed, so a newer declaration stays
/// valid after an older one lands on the ledger.
pub fn build_declaration(p: &DeclarationParams) -> Result<Tx, TxBuildError> {
    if p.start_sequence <= 0 {
        return Err(TxBuildError::NonPositiveStartSequence(p.start_sequence));
    }
    if p.iteration_number < 0 {
        return Err(TxBuildError::NegativeIteration(p.iteration_number));
    }
    if p.iteration_executed != 0 && p.iteration_executed >= p.iteration_number {
        return Err(TxBuildError::ExecutedIterationNotBefore {
            executed: p.iteration_executed,
            iteration: p.iteration_number,
        });
    }
    let sequence = declaration_sequence(p.start_sequence, p.iteration_number);
    let min_sequence = if p.iteration_executed == 0 {
        p.start_sequence
    } else {
        declaration_sequence(p.start_sequence, p.iteration_executed)
    };
    let preconditions = Preconditions { min_sequence: Some(min_sequence), ..Preconditions::default() };
    Ok(Tx::new(
        p.initiator_channel_account,
        sequence,
        preconditions,
        vec![Operation::BumpSequence { to: sequence }],
    ))
}

/// The time-locked transaction that distributes channel funds according to
/// iteration `i`'s balances. It consumes the sequence directly after its
/// declaration, and its observation-period gates hold it invalid until the
/// declaration has aged enough for the counterparty to override it.
pub fn build_close(p: &CloseParams) -> Result<Tx, TxBuildError> {
    if p.start_sequence <= 0 {
        return Err(TxBuildError::NonPositiveStartSequence(p.start_sequence));
    }
    if p.iteration_number < 0 {
        return Err(TxBuildError::NegativeIteration(p.iteration_number));
    }
    if p.amount_to_initiator < 0 {
        return Err(TxBuildError::NegativeAmount(p.amount_to_initiator));
    }
    if p.amount_to_responder < 0 {
        return Err(TxBuildError::NegativeAmount(p.amount_to_responder));
    }
    let preconditions = Preconditions {
        min_sequence_age: p.observation_period_time,
        min_sequence_ledger_gap: p.observation_period_ledger_gap,
        ..Preconditions::default()
    };
    Ok(Tx::new(
        p.initiator_channel_account,
        close_sequence(p.start_sequence, p.iteration_number),
        preconditions,
        vec![Operation::Distribute {
            initiator_account: p.initiator_channel_account,
            responder_account: p.responder_channel_account,
            asset: p.asset.clone(),
            amount_to_initiator: p.amount_to_initiator,
            amount_to_responder: p.amount_to_responder,
        }],
    ))
}
