//! Seams between the agent and the ledger it runs against.
//!
//! The agent never talks to a ledger directly; the application supplies
//! implementations of these traits. Errors cross the seam as `anyhow`
//! errors, the agent does not interpret them beyond reporting.

use crate::agent::AgentSnapshot;
use libsluice::asset::Asset;
use libsluice::ingest::StreamedTx;
use libsluice::keys::Address;
use libsluice::tx::Tx;
use std::sync::mpsc::Receiver;

/// Gets the balance of an asset held by an account.
pub trait BalanceCollector {
    fn get_balance(&self, account: &Address, asset: &Asset) -> Result<i64, anyhow::Error>;
}

/// Gets the current sequence number of an account.
pub trait SequenceNumberCollector {
    fn get_sequence_number(&self, account: &Address) -> Result<i64, anyhow::Error>;
}

/// Submits a transaction to the ledger.
pub trait Submitter {
    fn submit_tx(&self, tx: &Tx) -> Result<(), anyhow::Error>;
}

/// Streams transactions affecting a set of accounts, in execution order,
/// starting after `cursor`. The returned closure cancels the stream.
pub trait Streamer {
    fn stream_tx(&self, cursor: Option<i64>, accounts: &[Address]) -> (Receiver<StreamedTx>, Box<dyn FnOnce() + Send>);
}

/// Receives a snapshot of the agent whenever its meaningful state changes.
pub trait Snapshotter {
    fn snapshot(&mut self, snapshot: &AgentSnapshot) -> Result<(), anyhow::Error>;
}
