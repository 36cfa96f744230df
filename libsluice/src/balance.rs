use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

//------------------------------------   Channel balances   ------------------------------------------------//

/// The amount of the channel's asset owed to each participant if the channel
/// were closed at the current agreement.
///
/// The sum of the two sides is constant for the life of the channel and equal
/// to the sum of the initial contributions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelBalances {
    pub to_initiator: i64,
    pub to_responder: i64,
}

impl ChannelBalances {
    pub fn new(to_initiator: i64, to_responder: i64) -> Self {
        ChannelBalances { to_initiator, to_responder }
    }

    pub fn total(&self) -> Option<i64> {
        self.to_initiator.checked_add(self.to_responder)
    }

    /// Move `amount` from the initiator's side to the responder's side.
    /// Returns `None` when the payer's balance would go negative or the
    /// receiver's balance would overflow.
    pub fn pay_from_initiator(&self, amount: i64) -> Option<Self> {
        let to_initiator = self.to_initiator.checked_sub(amount)?;
        if to_initiator < 0 {
            return None;
        }
        let to_responder = self.to_responder.checked_add(amount)?;
        Some(ChannelBalances { to_initiator, to_responder })
    }

    /// Move `amount` from the responder's side to the initiator's side.
    pub fn pay_from_responder(&self, amount: i64) -> Option<Self> {
        let to_responder = self.to_responder.checked_sub(amount)?;
        if to_responder < 0 {
            return None;
        }
        let to_initiator = self.to_initiator.checked_add(amount)?;
        Some(ChannelBalances { to_initiator, to_responder })
    }

    /// Apply a signed payment amount. Positive pays initiator to responder,
    /// negative pays responder to initiator.
    pub fn apply_payment(&self, amount: i64) -> Option<Self> {
        if amount >= 0 {
            self.pay_from_initiator(amount)
        } else {
            self.pay_from_responder(amount.checked_neg()?)
        }
    }
}

impl Display for ChannelBalances {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "initiator={} responder={}", self.to_initiator, self.to_responder)
    }
}

/// The amount a close at `balances` draws out of the initiator's channel
/// account, given the responder's initial contribution. Zero when the flow of
/// funds is toward the initiator.
pub fn owed_by_initiator(balances: &ChannelBalances, responder_contribution: i64) -> i64 {
    (balances.to_responder - responder_contribution).max(0)
}

/// The amount a close at `balances` draws out of the responder's channel
/// account, given the initiator's initial contribution.
pub fn owed_by_responder(balances: &ChannelBalances, initiator_contribution: i64) -> i64 {
    (balances.to_initiator - initiator_contribution).max(0)
}
