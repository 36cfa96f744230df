//! Types for feeding observed ledger transactions into a channel.

use crate::tx::Tx;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// A transaction observed on the ledger, in execution order.
///
/// `order_id` totally orders transactions as the ledger executed them.
/// Callers must present streamed transactions to a channel in monotonic
/// `order_id` order; duplicates are tolerated, reordering is not.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamedTx {
    pub order_id: i64,
    pub tx: Tx,
    pub success: bool,
}

/// What a channel learned from one ingested transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelEvent {
    /// The formation transaction executed. The channel is live on the ledger.
    OpenExecuted { order_id: i64 },
    /// A declaration for `iteration` executed. If the iteration is older than
    /// the latest authorized agreement, the caller should submit the latest
    /// declaration to override it within the observation period.
    DeclarationExecuted { iteration: i64, order_id: i64 },
    /// A close for `iteration` executed. The channel is terminally closed.
    CloseExecuted { iteration: i64, order_id: i64 },
}

impl Display for ChannelEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelEvent::OpenExecuted { .. } => write!(f, "OpenExecuted"),
            ChannelEvent::DeclarationExecuted { iteration, .. } => {
                write!(f, "DeclarationExecuted(iteration={iteration})")
            }
            ChannelEvent::CloseExecuted { iteration, .. } => write!(f, "CloseExecuted(iteration={iteration})"),
        }
    }
}
