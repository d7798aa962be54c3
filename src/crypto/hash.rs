//! Hash computation for contracts and bank accounts
//!
//! Contract terms are referenced by hash in every downstream operation
//! (deposits, refunds, tracking), so hashing must be deterministic:
//! the JSON is canonicalized first (sorted keys, compact separators),
//! then hashed with a domain-separation tag so a contract hash can
//! never collide with an account hash over the same bytes.
//!
//! Wallets compute the same hash independently; any deviation here
//! breaks payment verification for every wallet.

use serde_json::{Map, Value};
use sha2::{Digest, Sha512};

/// Domain tag for contract terms.
const TAG_CONTRACT: &[u8] = b"merchant-contract-terms-v1";

/// Domain tag for bank account descriptors.
const TAG_ACCOUNT: &[u8] = b"merchant-wire-account-v1";

// ============================================================================
// Canonical JSON
// ============================================================================

/// Rebuild a JSON value with all object keys sorted lexicographically.
fn sort_keys(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let mut sorted = Map::new();
            for (k, val) in entries {
                sorted.insert(k.clone(), sort_keys(val));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

/// Serialize a JSON value in canonical form: UTF-8, object keys sorted
/// lexicographically, no insignificant whitespace.
///
/// Amounts must already be strings (`"CUR:VALUE.FRACTION"`) and
/// timestamps `{"t_ms": ...}` objects; canonicalization does not
/// rewrite values, only ordering and spacing.
pub fn canonical_json(v: &Value) -> String {
    // serde_json emits map entries in insertion order, so inserting in
    // sorted order yields the canonical byte sequence.
    sort_keys(v).to_string()
}

// ============================================================================
// Domain-separated hashing
// ============================================================================

fn tagged_sha512(tag: &[u8], payload: &[u8]) -> [u8; 64] {
    let mut hasher = Sha512::new();
    hasher.update((tag.len() as u32).to_le_bytes());
    hasher.update(tag);
    hasher.update(payload);
    hasher.finalize().into()
}

/// Hash of canonicalized contract terms. This is the `h_contract` every
/// coin signature, deposit row and refund row refers to.
pub fn contract_hash(terms: &Value) -> [u8; 64] {
    tagged_sha512(TAG_CONTRACT, canonical_json(terms).as_bytes())
}

/// Content hash of a bank account descriptor: deterministic hash over
/// the canonical JSON of `(payto_uri, salt)`.
pub fn account_hash(payto_uri: &str, salt: &str) -> [u8; 64] {
    let doc = serde_json::json!({
        "payto_uri": payto_uri,
        "salt": salt,
    });
    tagged_sha512(TAG_ACCOUNT, canonical_json(&doc).as_bytes())
}

/// Hex form of a 64-byte hash, as stored and sent on the wire.
pub fn hash_to_hex(h: &[u8; 64]) -> String {
    hex::encode(h)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_sorts_keys() {
        let v = json!({"zeta": 1, "alpha": {"b": 2, "a": 1}, "mid": [ {"y": 0, "x": 0} ]});
        assert_eq!(
            canonical_json(&v),
            r#"{"alpha":{"a":1,"b":2},"mid":[{"x":0,"y":0}],"zeta":1}"#
        );
    }

    #[test]
    fn test_canonical_is_compact() {
        let v = json!({"amount": "EUR:5.00000000", "summary": "a book"});
        let canon = canonical_json(&v);
        assert!(!canon.contains(": "));
        assert!(!canon.contains(", "));
    }

    #[test]
    fn test_canonical_insensitive_to_insertion_order() {
        let a: Value = serde_json::from_str(r#"{"x":1,"y":2}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"y":2,"x":1}"#).unwrap();
        assert_eq!(canonical_json(&a), canonical_json(&b));
    }

    #[test]
    fn test_contract_hash_deterministic() {
        let terms = json!({
            "order_id": "1",
            "amount": "EUR:5.00000000",
            "summary": "a book",
        });
        assert_eq!(contract_hash(&terms), contract_hash(&terms));

        let other = json!({
            "order_id": "2",
            "amount": "EUR:5.00000000",
            "summary": "a book",
        });
        assert_ne!(contract_hash(&terms), contract_hash(&other));
    }

    #[test]
    fn test_contract_and_account_domains_disjoint() {
        // Same payload bytes, different tags: hashes must differ.
        let doc = json!({"payto_uri": "payto://iban/X", "salt": "s"});
        let as_contract = contract_hash(&doc);
        let as_account = account_hash("payto://iban/X", "s");
        assert_ne!(as_contract, as_account);
    }

    #[test]
    fn test_account_hash_depends_on_salt() {
        let a = account_hash("payto://iban/DE123", "salt-one");
        let b = account_hash("payto://iban/DE123", "salt-two");
        assert_ne!(a, b);
    }

    #[test]
    fn test_hash_hex_length() {
        let h = contract_hash(&json!({}));
        assert_eq!(hash_to_hex(&h).len(), 128);
    }
}
