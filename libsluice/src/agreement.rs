//! Authorized agreements and the ledger of the latest ones.

use crate::balance::ChannelBalances;
use crate::envelope::{CloseDetails, CloseEnvelope, OpenDetails, OpenEnvelope};
use crate::error::ChannelError;
use serde::{Deserialize, Serialize};

/// A fully signed open agreement. Frozen once the formation executes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenAgreement {
    pub envelope: OpenEnvelope,
}

impl OpenAgreement {
    pub fn details(&self) -> &OpenDetails {
        &self.envelope.details
    }

    pub fn initial_balances(&self) -> ChannelBalances {
        self.envelope.details.initial_balances()
    }
}

/// A fully signed close agreement at one iteration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseAgreement {
    pub envelope: CloseEnvelope,
}

impl CloseAgreement {
    pub fn details(&self) -> &CloseDetails {
        &self.envelope.details
    }

    pub fn iteration_number(&self) -> i64 {
        self.envelope.details.iteration_number
    }

    pub fn balances(&self) -> ChannelBalances {
        self.envelope.details.balances
    }
}

/// The channel's record of the latest agreements: the authorized open, the
/// latest authorized close, and the one pending proposal awaiting the
/// counterparty's signatures.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Agreements {
    open: Option<OpenAgreement>,
    proposed_open: Option<OpenEnvelope>,
    latest_authorized_close: Option<CloseAgreement>,
    latest_unauthorized_close: Option<CloseEnvelope>,
}

impl Agreements {
    pub fn open_agreement(&self) -> Result<&OpenAgreement, ChannelError> {
        self.open.as_ref().ok_or(ChannelError::NotOpen)
    }

    pub fn store_open(&mut self, agreement: OpenAgreement) {
        self.open = Some(agreement);
        self.proposed_open = None;
    }

    pub fn proposed_open(&self) -> Option<&OpenEnvelope> {
        self.proposed_open.as_ref()
    }

    pub fn store_proposed_open(&mut self, envelope: OpenEnvelope) {
        self.proposed_open = Some(envelope);
    }

    pub fn latest_authorized_close(&self) -> Result<&CloseAgreement, ChannelError> {
        self.latest_authorized_close.as_ref().ok_or(ChannelError::NoAgreements)
    }

    pub fn latest_unauthorized_close(&self) -> Option<&CloseEnvelope> {
        self.latest_unauthorized_close.as_ref()
    }

    pub fn store_unauthorized_close(&mut self, envelope: CloseEnvelope) {
        self.latest_unauthorized_close = Some(envelope);
    }

    pub fn discard_unauthorized_close(&mut self) {
        self.latest_unauthorized_close = None;
    }

    /// Storing a new authorized close atomically clears the pending
    /// unauthorized slot.
    pub fn store_authorized_close(&mut self, agreement: CloseAgreement) {
        self.latest_authorized_close = Some(agreement);
        self.latest_unauthorized_close = None;
    }

    /// Wipe everything. Used when tearing down an expired open proposal.
    pub fn reset(&mut self) {
        *self = Agreements::default();
    }
}
