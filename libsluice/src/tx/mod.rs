//! Ledger transactions as the channel core sees them.
//!
//! The channel protocol only needs a transaction to carry a source account,
//! a sequence-number target, the validity gates the commitment chain is built
//! on (minimum sequence, minimum sequence age and ledger gap, an expiry), and
//! a small set of operations. Signatures bind the canonical bytes of the
//! transaction body under a network identifier, so both participants derive
//! identical bytes from identical agreement details.

mod build;

pub use build::{build_close, build_declaration, build_formation, CloseParams, DeclarationParams, FormationParams, TxBuildError};

use crate::asset::Asset;
use crate::keys::{Address, Signature, Signer};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::{Display, Formatter};
use std::time::{Duration, SystemTime};

/// A single ledger operation carried by a transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    /// Configure `account` as a 2-of-2 multi-signature account controlled by
    /// `signers`, and deposit its initial contribution to the channel.
    ConfigureMultisig { account: Address, signers: [Address; 2], contribution: i64 },
    /// Consume a sequence number without any other ledger effect.
    BumpSequence { to: i64 },
    /// A plain transfer between accounts.
    Payment { from: Address, to: Address, asset: Asset, amount: i64 },
    /// Distribute channel funds to both participants and release the
    /// multi-signature control of the channel accounts.
    Distribute {
        initiator_account: Address,
        responder_account: Address,
        asset: Asset,
        amount_to_initiator: i64,
        amount_to_responder: i64,
    },
}

/// Validity gates on a transaction.
///
/// `min_sequence` relaxes the usual "sequence must be exactly account
/// sequence plus one" rule: the transaction is valid while the account
/// sequence lies in `[min_sequence, sequence - 1]`. `min_sequence_age` and
/// `min_sequence_ledger_gap` hold the transaction invalid until that much
/// time, and that many ledgers, have passed since the account's sequence
/// last changed. The close transaction's observation period is expressed
/// through these two gates.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preconditions {
    pub expires_at: Option<SystemTime>,
    pub min_sequence: Option<i64>,
    pub min_sequence_age: Duration,
    pub min_sequence_ledger_gap: i64,
}

/// A signature together with the address that produced it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecoratedSignature {
    pub signer: Address,
    pub signature: Signature,
}

/// Hash of a transaction's canonical signature payload.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxHash(pub [u8; 32]);

impl Display for TxHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::fmt::Debug for TxHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "TxHash({})", self)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct TxBody {
    source: Address,
    sequence: i64,
    preconditions: Preconditions,
    operations: Vec<Operation>,
}

/// A transaction, optionally carrying collected signatures.
///
/// The body is immutable once built. Signing appends decorated signatures
/// and never alters the bytes that signatures bind.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tx {
    body: TxBody,
    signatures: Vec<DecoratedSignature>,
}

impl Tx {
    pub fn new(source: Address, sequence: i64, preconditions: Preconditions, operations: Vec<Operation>) -> Self {
        Tx { body: TxBody { source, sequence, preconditions, operations }, signatures: Vec::new() }
    }

    pub fn source(&self) -> Address {
        self.body.source
    }

    pub fn sequence_number(&self) -> i64 {
        self.body.sequence
    }

    pub fn preconditions(&self) -> &Preconditions {
        &self.body.preconditions
    }

    pub fn operations(&self) -> &[Operation] {
        &self.body.operations
    }

    pub fn signatures(&self) -> &[DecoratedSignature] {
        &self.signatures
    }

    /// The canonical bytes signatures bind: the network identifier hash
    /// followed by the serialized body. Signatures are excluded so that
    /// collecting them does not change what is signed.
    fn signature_payload(&self, network_id: &str) -> Vec<u8> {
        let mut payload = Sha256::digest(network_id.as_bytes()).to_vec();
        let body = bincode::serialize(&self.body).expect("transaction bodies always serialize");
        payload.extend_from_slice(&body);
        payload
    }

    /// Hash of the canonical signature payload under `network_id`.
    pub fn hash(&self, network_id: &str) -> TxHash {
        TxHash(Sha256::digest(self.signature_payload(network_id)).into())
    }

    /// Sign the transaction hash with each signer and append the decorated
    /// signatures.
    pub fn sign(mut self, network_id: &str, signers: &[&Signer]) -> Tx {
        let hash = self.hash(network_id);
        for signer in signers {
            let signature = signer.sign(&hash.0);
            self.signatures.push(DecoratedSignature { signer: signer.address(), signature });
        }
        self
    }

    /// Produce a detached signature over the transaction hash.
    pub fn sign_detached(&self, network_id: &str, signer: &Signer) -> Signature {
        signer.sign(&self.hash(network_id).0)
    }

    /// Verify a detached signature over the transaction hash.
    pub fn verify_signature(&self, network_id: &str, signer: &Address, signature: &Signature) -> bool {
        signer.verify(&self.hash(network_id).0, signature)
    }

    /// Attach already-collected signatures, e.g. from an envelope.
    pub fn add_signature_decorated(mut self, signatures: impl IntoIterator<Item = DecoratedSignature>) -> Tx {
        self.signatures.extend(signatures);
        self
    }
}

//------------------------------------  Commitment chain arithmetic  ---------------------------------------//

/// Sequence consumed by the declaration of agreement iteration `i`.
///
/// The chain starts at the starting sequence `s` left by the formation
/// transaction. Iteration 0 is the initial pair embedded in the open
/// agreement; each iteration advances the chain by two sequence numbers, so
/// executing a declaration invalidates every older declaration while leaving
/// all newer ones executable.
pub fn declaration_sequence(start: i64, iteration: i64) -> i64 {
    start + 2 * iteration + 1
}

/// Sequence consumed by the close of agreement iteration `i`.
pub fn close_sequence(start: i64, iteration: i64) -> i64 {
    declaration_sequence(start, iteration) + 1
}

/// Where a sequence number falls in the commitment chain rooted at `start`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SequencePosition {
    Declaration(i64),
    Close(i64),
}

/// Classify `sequence` as the declaration or close of some iteration, if it
/// lies on the commitment chain at all.
pub fn position_of_sequence(start: i64, sequence: i64) -> Option<SequencePosition> {
    let offset = sequence - start;
    if offset < 1 {
        return None;
    }
    let iteration = (offset - 1) / 2;
    if offset % 2 == 1 {
        Some(SequencePosition::Declaration(iteration))
    } else {
        Some(SequencePosition::Close(iteration))
    }
}
