//! An agent that coordinates a payment channel over a byte-stream
//! connection: the initial handshake, channel opens, payments, closes, and
//! ledger ingestion.
//!
//! The agent wires a [`libsluice::channel::Channel`] to the outside world
//! through a small set of collaborator traits (balances, sequence numbers,
//! transaction submission, streaming, snapshot persistence) and a typed
//! message protocol. It holds the protocol logic only; connection management
//! lives in [`tcp`] and can be replaced by any transport that moves
//! [`msg::Message`] values in order.

pub mod agent;
pub mod collaborators;
pub mod error;
pub mod msg;
pub mod store;
pub mod tcp;

pub use agent::{Agent, AgentConfig, AgentEvent, AgentSnapshot};
pub use error::AgentError;
