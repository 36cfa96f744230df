use crate::keys::Address;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// An asset held in a channel: either the ledger's native asset or a
/// credit asset identified by its code and issuing account.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Asset {
    Native,
    Credit { code: String, issuer: Address },
}

impl Asset {
    pub fn is_native(&self) -> bool {
        matches!(self, Asset::Native)
    }
}

impl Display for Asset {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Asset::Native => write!(f, "native"),
            Asset::Credit { code, issuer } => write!(f, "{}:{}", code, issuer),
        }
    }
}
