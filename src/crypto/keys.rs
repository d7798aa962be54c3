//! ed25519 signing keys with purpose-tagged messages
//!
//! One wrapper serves merchant instance keys, tip reserve keys and
//! verification of exchange signatures. Every signature covers
//! `purpose (u32 BE) || payload`, so a signature produced for one
//! operation can never be replayed for another.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use thiserror::Error;

/// Signature purpose tags. Values are part of the wire protocol and
/// must never be reused across operations.
pub mod purpose {
    /// Merchant signature over contract terms hash.
    pub const CONTRACT: u32 = 1101;
    /// Merchant signature confirming a completed payment.
    pub const PAYMENT_OK: u32 = 1104;
    /// Merchant signature authorizing a per-coin refund.
    pub const REFUND: u32 = 1102;
    /// Reserve signature authorizing a tip withdrawal.
    pub const TIP_PICKUP: u32 = 1103;
    /// Exchange signature over a deposit confirmation.
    pub const EXCHANGE_DEPOSIT_CONFIRM: u32 = 1033;
    /// Exchange signature over an aggregate transfer report.
    pub const EXCHANGE_TRANSFER_DETAILS: u32 = 1035;
    /// Exchange master signature over the denomination key set.
    pub const EXCHANGE_KEY_SET: u32 = 1035 + 1;
    /// Coin signature over a deposit permission (verified, never produced).
    pub const COIN_DEPOSIT: u32 = 1201;
}

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Invalid signature encoding: {0}")]
    InvalidSignature(String),

    #[error("Signature verification failed")]
    VerificationFailed,
}

/// An ed25519 keypair. Private key bytes only ever live in this process
/// and the `merchant_instances` / `merchant_tip_reserves` tables.
#[derive(Clone)]
pub struct KeyPair {
    signing: SigningKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_hex(priv_hex: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(priv_hex)
            .map_err(|e| CryptoError::InvalidKey(format!("bad private key hex: {}", e)))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("private key must be 32 bytes".to_string()))?;
        Ok(Self {
            signing: SigningKey::from_bytes(&bytes),
        })
    }

    pub fn private_hex(&self) -> String {
        hex::encode(self.signing.to_bytes())
    }

    pub fn public_hex(&self) -> String {
        hex::encode(self.signing.verifying_key().to_bytes())
    }

    /// Sign `purpose || payload`. ed25519 is deterministic, so the same
    /// inputs always yield the same signature (pickup idempotence
    /// depends on this).
    pub fn sign(&self, purpose: u32, payload: &[u8]) -> String {
        let mut msg = Vec::with_capacity(4 + payload.len());
        msg.extend_from_slice(&purpose.to_be_bytes());
        msg.extend_from_slice(payload);
        hex::encode(self.signing.sign(&msg).to_bytes())
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print private key material.
        f.debug_struct("KeyPair")
            .field("public", &self.public_hex())
            .finish()
    }
}

/// Verify a purpose-tagged signature against a hex-encoded public key.
pub fn verify_purpose(
    pub_hex: &str,
    purpose: u32,
    payload: &[u8],
    sig_hex: &str,
) -> Result<(), CryptoError> {
    let pub_bytes = hex::decode(pub_hex)
        .map_err(|e| CryptoError::InvalidKey(format!("bad public key hex: {}", e)))?;
    let pub_bytes: [u8; 32] = pub_bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKey("public key must be 32 bytes".to_string()))?;
    let key = VerifyingKey::from_bytes(&pub_bytes)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;

    let sig_bytes = hex::decode(sig_hex)
        .map_err(|e| CryptoError::InvalidSignature(format!("bad signature hex: {}", e)))?;
    let sig_bytes: [u8; 64] = sig_bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidSignature("signature must be 64 bytes".to_string()))?;
    let sig = Signature::from_bytes(&sig_bytes);

    let mut msg = Vec::with_capacity(4 + payload.len());
    msg.extend_from_slice(&purpose.to_be_bytes());
    msg.extend_from_slice(payload);

    key.verify(&msg, &sig)
        .map_err(|_| CryptoError::VerificationFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify_round_trip() {
        let kp = KeyPair::generate();
        let sig = kp.sign(purpose::CONTRACT, b"contract-hash-bytes");
        verify_purpose(&kp.public_hex(), purpose::CONTRACT, b"contract-hash-bytes", &sig)
            .expect("signature must verify");
    }

    #[test]
    fn test_purpose_separation() {
        let kp = KeyPair::generate();
        let sig = kp.sign(purpose::CONTRACT, b"payload");
        // Same payload under a different purpose must not verify.
        assert!(verify_purpose(&kp.public_hex(), purpose::REFUND, b"payload", &sig).is_err());
    }

    #[test]
    fn test_wrong_key_rejected() {
        let kp = KeyPair::generate();
        let other = KeyPair::generate();
        let sig = kp.sign(purpose::PAYMENT_OK, b"receipt");
        assert!(matches!(
            verify_purpose(&other.public_hex(), purpose::PAYMENT_OK, b"receipt", &sig),
            Err(CryptoError::VerificationFailed)
        ));
    }

    #[test]
    fn test_signatures_are_deterministic() {
        let kp = KeyPair::generate();
        let a = kp.sign(purpose::REFUND, b"coin|rtid|amount");
        let b = kp.sign(purpose::REFUND, b"coin|rtid|amount");
        assert_eq!(a, b);
    }

    #[test]
    fn test_hex_round_trip() {
        let kp = KeyPair::generate();
        let restored = KeyPair::from_hex(&kp.private_hex()).unwrap();
        assert_eq!(kp.public_hex(), restored.public_hex());
    }

    #[test]
    fn test_bad_key_material() {
        assert!(KeyPair::from_hex("zz").is_err());
        assert!(KeyPair::from_hex("aabb").is_err());
        assert!(verify_purpose("nothex", purpose::CONTRACT, b"x", "00").is_err());
    }
}
