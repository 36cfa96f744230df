//! Core state machine for two-party off-chain payment channels.
//!
//! The channel rides on any account-based ledger that offers multi-signature
//! accounts, sequence-number-gated transactions, and time-gated transactions.
//! Each side runs a [`channel::Channel`], exchanges signed envelopes with the
//! counterparty over its own transport, and submits the derived transactions
//! to the ledger through its own collaborators. The channel itself performs
//! no I/O.

pub mod agreement;
pub mod asset;
pub mod balance;
pub mod channel;
pub mod envelope;
pub mod error;
pub mod ingest;
pub mod keys;
pub mod snapshot;
pub mod tx;

#[cfg(test)]
mod tests;
