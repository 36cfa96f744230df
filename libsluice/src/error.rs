use crate::keys::Address;
use thiserror::Error;

/// Errors returned by channel operations.
///
/// `NotSigned` is a sentinel rather than a failure: the envelope is still
/// missing a counterparty signature and should be sent to the peer, with the
/// reply re-presented to the same operation. Callers branch on it and logging
/// layers suppress it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("the channel is not open")]
    NotOpen,
    #[error("an open has already been proposed or agreed")]
    AlreadyOpen,
    #[error("the channel is closed")]
    Closed,
    #[error("the envelope is missing a signature the local participant cannot supply")]
    NotSigned,
    #[error("open proposal is inconsistent with local state: {0}")]
    InvalidOpen(String),
    #[error("payment proposal is inconsistent with local state: {0}")]
    InvalidPayment(String),
    #[error("close proposal is inconsistent with local state: {0}")]
    InvalidClose(String),
    #[error("signature by {signer} failed verification")]
    InvalidSignature { signer: Address },
    #[error("proposer is underfunded for this payment")]
    Underfunded,
    #[error("iteration {actual} is older than the expected iteration {expected}")]
    IterationTooOld { expected: i64, actual: i64 },
    #[error("iteration {actual} is newer than the expected iteration {expected}")]
    IterationTooNew { expected: i64, actual: i64 },
    #[error("a close is in progress")]
    CloseInProgress,
    #[error("no close agreements have been authorized")]
    NoAgreements,
    #[error("no unauthorized agreement is pending")]
    NoUnauthorizedAgreement,
    #[error("a concurrent proposal from the lower address supersedes this one")]
    ProposalSuperseded,
    #[error("payment amount {0} is not positive")]
    NonPositiveAmount(i64),
    #[error("balance arithmetic overflowed")]
    BalanceOverflow,
    #[error("snapshot was taken under a different channel configuration")]
    SnapshotConfigMismatch,
}

impl ChannelError {
    /// True for the retry sentinel, which callers handle in-band.
    pub fn is_not_signed(&self) -> bool {
        matches!(self, ChannelError::NotSigned)
    }

    /// True for errors the caller can recover from by refreshing cached
    /// balances and retrying the same operation.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ChannelError::Underfunded | ChannelError::NotSigned)
    }
}
