//! BLS keys and signatures.
//!
//! Keys and signatures are carried in compressed form (48-byte public
//! keys, 96-byte signatures) and only decompressed at verification
//! time, so malformed bytes surface as verification-stage errors
//! rather than deserialization panics. Aggregation uses the fact that
//! every verification ticket signs the same message (the block hash),
//! which permits the fast aggregate-verify path.

use std::fmt;

use blst::min_pk::{
    AggregateSignature, PublicKey as BlstPublicKey, SecretKey, Signature as BlstSignature,
};
use blst::BLST_ERROR;
use rand::RngCore;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Domain separation tag for all ticket and block signatures.
pub const DST: &[u8] = b"BLS_SIG_BLS12381G2_XMD:SHA-256_SSWU_RO_POP_";

/// Errors from key and signature handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CryptoError {
    /// Secret key material was rejected by the backend.
    #[error("invalid secret key material")]
    InvalidSecretKey,

    /// Compressed public key bytes failed to decode or group-check.
    #[error("invalid public key bytes")]
    InvalidPublicKey,

    /// Compressed signature bytes failed to decode or group-check.
    #[error("invalid signature bytes")]
    InvalidSignature,

    /// An aggregate was requested over an empty signature set.
    #[error("no signatures to aggregate")]
    EmptyAggregate,
}

/// A compressed BLS12-381 G1 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; Self::SIZE]);

impl PublicKey {
    /// Width of a compressed public key in bytes.
    pub const SIZE: usize = 48;

    /// Wrap compressed bytes without validating them.
    pub const fn from_bytes(bytes: [u8; Self::SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw compressed bytes.
    pub fn as_bytes(&self) -> &[u8; Self::SIZE] {
        &self.0
    }

    /// Lowercase hex encoding.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from a hex string.
    pub fn from_hex(s: &str) -> Result<Self, crate::HexError> {
        let bytes = hex::decode(s)?;
        let bytes: [u8; Self::SIZE] =
            bytes
                .try_into()
                .map_err(|b: Vec<u8>| crate::HexError::InvalidLength {
                    expected: Self::SIZE,
                    actual: b.len(),
                })?;
        Ok(Self(bytes))
    }

    /// Decode and group-check the key.
    pub fn decode(&self) -> Result<BlstPublicKey, CryptoError> {
        BlstPublicKey::key_validate(&self.0).map_err(|_| CryptoError::InvalidPublicKey)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({}..)", &self.to_hex()[..8])
    }
}

/// A compressed BLS12-381 G2 signature.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature([u8; Self::SIZE]);

impl Signature {
    /// Width of a compressed signature in bytes.
    pub const SIZE: usize = 96;

    /// Wrap compressed bytes without validating them.
    pub const fn from_bytes(bytes: [u8; Self::SIZE]) -> Self {
        Self(bytes)
    }

    /// The all-zero placeholder signature. Never verifies.
    pub const fn zero() -> Self {
        Self([0u8; Self::SIZE])
    }

    /// Raw compressed bytes.
    pub fn as_bytes(&self) -> &[u8; Self::SIZE] {
        &self.0
    }

    /// Lowercase hex encoding.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from a hex string.
    pub fn from_hex(s: &str) -> Result<Self, crate::HexError> {
        let bytes = hex::decode(s)?;
        let bytes: [u8; Self::SIZE] =
            bytes
                .try_into()
                .map_err(|b: Vec<u8>| crate::HexError::InvalidLength {
                    expected: Self::SIZE,
                    actual: b.len(),
                })?;
        Ok(Self(bytes))
    }

    /// Decode the compressed signature.
    pub fn decode(&self) -> Result<BlstSignature, CryptoError> {
        BlstSignature::uncompress(&self.0).map_err(|_| CryptoError::InvalidSignature)
    }

    /// Verify this signature over `message` under a single key.
    pub fn verify(&self, message: &[u8], public_key: &PublicKey) -> bool {
        let Ok(signature) = self.decode() else {
            return false;
        };
        let Ok(key) = public_key.decode() else {
            return false;
        };
        signature.verify(true, message, DST, &[], &key, false) == BLST_ERROR::BLST_SUCCESS
    }
}

impl Default for Signature {
    fn default() -> Self {
        Self::zero()
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({}..)", &self.to_hex()[..8])
    }
}

/// A BLS signing key with its cached public key.
pub struct KeyPair {
    secret: SecretKey,
    public: PublicKey,
}

impl KeyPair {
    /// Generate a fresh keypair from OS randomness.
    pub fn generate() -> Self {
        let mut ikm = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut ikm);
        Self::from_ikm(&ikm).expect("32 bytes of key material is always sufficient")
    }

    /// Derive a keypair from input key material (at least 32 bytes).
    pub fn from_ikm(ikm: &[u8]) -> Result<Self, CryptoError> {
        let secret = SecretKey::key_gen(ikm, &[]).map_err(|_| CryptoError::InvalidSecretKey)?;
        let public = PublicKey(secret.sk_to_pk().compress());
        Ok(Self { secret, public })
    }

    /// The public half of this keypair.
    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    /// Sign a message.
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.secret.sign(message, DST, &[]).compress())
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

/// Aggregate compressed signatures into a single signature.
///
/// Fails with [`CryptoError::EmptyAggregate`] on an empty slice and
/// [`CryptoError::InvalidSignature`] when any entry fails to decode.
pub fn aggregate_signatures(signatures: &[Signature]) -> Result<BlstSignature, CryptoError> {
    if signatures.is_empty() {
        return Err(CryptoError::EmptyAggregate);
    }
    let decoded = signatures
        .iter()
        .map(Signature::decode)
        .collect::<Result<Vec<_>, _>>()?;
    let refs: Vec<&BlstSignature> = decoded.iter().collect();
    AggregateSignature::aggregate(&refs, true)
        .map(|agg| agg.to_signature())
        .map_err(|_| CryptoError::InvalidSignature)
}

/// Verify an aggregate signature where every signer signed `message`.
pub fn verify_aggregate(
    aggregate: &BlstSignature,
    public_keys: &[BlstPublicKey],
    message: &[u8],
) -> bool {
    let refs: Vec<&BlstPublicKey> = public_keys.iter().collect();
    aggregate.fast_aggregate_verify(true, message, DST, &refs) == BLST_ERROR::BLST_SUCCESS
}

macro_rules! impl_hex_serde {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                struct HexVisitor;

                impl Visitor<'_> for HexVisitor {
                    type Value = $ty;

                    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                        write!(f, "a {}-character hex string", <$ty>::SIZE * 2)
                    }

                    fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                        <$ty>::from_hex(v).map_err(de::Error::custom)
                    }
                }

                deserializer.deserialize_str(HexVisitor)
            }
        }
    };
}

impl_hex_serde!(PublicKey);
impl_hex_serde!(Signature);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify() {
        let keys = KeyPair::generate();
        let signature = keys.sign(b"message");
        assert!(signature.verify(b"message", &keys.public_key()));
        assert!(!signature.verify(b"other message", &keys.public_key()));
    }

    #[test]
    fn verify_fails_under_wrong_key() {
        let keys = KeyPair::generate();
        let other = KeyPair::generate();
        let signature = keys.sign(b"message");
        assert!(!signature.verify(b"message", &other.public_key()));
    }

    #[test]
    fn zero_signature_never_verifies() {
        let keys = KeyPair::generate();
        assert!(!Signature::zero().verify(b"message", &keys.public_key()));
    }

    #[test]
    fn aggregate_verifies_over_common_message() {
        let message = b"common message";
        let keys: Vec<KeyPair> = (0..4).map(|_| KeyPair::generate()).collect();
        let signatures: Vec<Signature> = keys.iter().map(|k| k.sign(message)).collect();
        let aggregate = aggregate_signatures(&signatures).unwrap();
        let public_keys: Vec<_> = keys
            .iter()
            .map(|k| k.public_key().decode().unwrap())
            .collect();
        assert!(verify_aggregate(&aggregate, &public_keys, message));
        assert!(!verify_aggregate(&aggregate, &public_keys, b"tampered"));
    }

    #[test]
    fn aggregate_rejects_malformed_bytes() {
        let keys = KeyPair::generate();
        let good = keys.sign(b"message");
        let bad = Signature::from_bytes([0xff; Signature::SIZE]);
        assert_eq!(
            aggregate_signatures(&[good, bad]).unwrap_err(),
            CryptoError::InvalidSignature
        );
        assert_eq!(
            aggregate_signatures(&[]).unwrap_err(),
            CryptoError::EmptyAggregate
        );
    }

    #[test]
    fn public_key_hex_round_trip() {
        let keys = KeyPair::generate();
        let pk = keys.public_key();
        assert_eq!(PublicKey::from_hex(&pk.to_hex()).unwrap(), pk);
    }
}
