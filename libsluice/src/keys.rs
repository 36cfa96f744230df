use ed25519_dalek::{Signer as DalekSigner, SigningKey, Verifier, VerifyingKey};
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{Debug, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

/// The public identity of an account or signer on the ledger.
///
/// Addresses order by their raw key bytes. That ordering is part of the
/// protocol: when both participants propose a payment at the same iteration,
/// the proposal from the smaller address wins on both sides.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address([u8; 32]);

impl Address {
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Address(*bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Verify `signature` over `message` against this address. False when
    /// the signature does not verify or the address bytes do not describe a
    /// valid public key.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(&self.0) else {
            return false;
        };
        key.verify(message, &signature.to_dalek()).is_ok()
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl Debug for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Address({})", self)
    }
}

impl FromStr for Address {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| KeyError::InvalidEncoding)?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| KeyError::InvalidEncoding)?;
        Ok(Address(bytes))
    }
}

/// A full keypair that can sign on behalf of its address.
#[derive(Clone)]
pub struct Signer {
    signing_key: SigningKey,
    address: Address,
}

impl Signer {
    /// Generate a new random signer.
    pub fn generate() -> Self {
        Self::from_seed(&rand::random::<[u8; 32]>())
    }

    /// Deterministic construction from a 32-byte seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        let address = Address(signing_key.verifying_key().to_bytes());
        Signer { signing_key, address }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.signing_key.sign(message).to_bytes())
    }
}

impl Debug for Signer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signer({})", self.address)
    }
}

/// An ed25519 signature produced by a [`Signer`]. Serializes as hex.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature([u8; 64]);

impl Signature {
    pub fn to_bytes(&self) -> [u8; 64] {
        self.0
    }

    pub fn from_bytes(bytes: &[u8; 64]) -> Self {
        Signature(*bytes)
    }

    fn to_dalek(self) -> ed25519_dalek::Signature {
        ed25519_dalek::Signature::from_bytes(&self.0)
    }
}

impl Debug for Signature {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature({}..)", hex::encode(&self.0[..8]))
    }
}

impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(DeError::custom)?;
        let bytes: [u8; 64] = bytes.try_into().map_err(|_| DeError::custom("signature must be 64 bytes"))?;
        Ok(Signature(bytes))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("invalid address encoding")]
    InvalidEncoding,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify() {
        let signer = Signer::from_seed(&[7u8; 32]);
        let sig = signer.sign(b"a message");
        assert!(signer.address().verify(b"a message", &sig));
        assert!(!signer.address().verify(b"another message", &sig));
    }

    #[test]
    fn verify_rejects_wrong_signer() {
        let alice = Signer::from_seed(&[1u8; 32]);
        let bob = Signer::from_seed(&[2u8; 32]);
        let sig = alice.sign(b"payload");
        assert!(!bob.address().verify(b"payload", &sig));
    }

    #[test]
    fn address_round_trips_through_hex() {
        let signer = Signer::generate();
        let addr = signer.address();
        let parsed: Address = addr.to_string().parse().unwrap();
        assert_eq!(addr, parsed);
    }

    #[test]
    fn address_ordering_is_byte_order() {
        let a = Signer::from_seed(&[1u8; 32]).address();
        let b = Signer::from_seed(&[2u8; 32]).address();
        assert_eq!(a.cmp(&b), a.as_bytes().cmp(b.as_bytes()));
    }

    #[test]
    fn signature_serde_round_trips() {
        let signer = Signer::from_seed(&[3u8; 32]);
        let sig = signer.sign(b"payload");
        let encoded = bincode::serialize(&sig).unwrap();
        let decoded: Signature = bincode::deserialize(&encoded).unwrap();
        assert_eq!(sig, decoded);
    }
}
