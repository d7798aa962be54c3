//! Cryptographic primitives: contract hashing and signing keys
//!
//! - `hash`: canonical JSON serialization and domain-separated SHA-512
//!   hashes for contracts and bank accounts
//! - `keys`: ed25519 keypairs for merchant instances, tip reserves and
//!   exchange signature verification

pub mod hash;
pub mod keys;

pub use hash::{account_hash, canonical_json, contract_hash};
pub use keys::{verify_purpose, CryptoError, KeyPair};
