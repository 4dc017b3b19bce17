use sha3::{Digest, Sha3_512};

use crate::key::NodeId;
use crate::KEY_LENGTH;

/// The well-known anonymous signed-request sentinel: a 128-character all-`f`
/// hex string. When exactly this value is presented, signature verification
/// is skipped.
pub const ANONYMOUS_SENTINEL: &str =
    "ffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff";

/// Hashes arbitrary bytes down to a `NodeId`-width digest. `hash(value) ==
/// key` is the "hashable key" test used by `DataStore::store`.
pub fn hash_to_key(data: &[u8]) -> NodeId {
    let mut hasher = Sha3_512::default();
    hasher.update(data);
    let digest = hasher.finalize();
    let mut out = [0u8; KEY_LENGTH];
    out.copy_from_slice(&digest[..KEY_LENGTH]);
    NodeId::new(out)
}

/// Narrow signer/verifier seam the core depends on; the core never picks a
/// concrete PKI scheme. A request presenting `ANONYMOUS_SENTINEL` as its
/// `signed_request` field skips verification entirely.
pub trait Verifier: Send + Sync {
    fn verify(&self, public_key: &[u8], message: &[u8], signature: &[u8]) -> bool;
}

pub trait Signer: Send + Sync {
    fn sign(&self, message: &[u8]) -> Vec<u8>;
    fn public_key(&self) -> Vec<u8>;
}

/// Checks whether a presented `signed_request` string is the anonymous
/// sentinel, in which case signature verification must be skipped.
pub fn is_anonymous_sentinel(signed_request: &str) -> bool {
    signed_request == ANONYMOUS_SENTINEL
}

/// Hex-encodes a signature for the `signed_request` wire field.
pub fn encode_signature(signature: &[u8]) -> String {
    signature.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Inverse of `encode_signature`; `None` on malformed hex.
pub fn decode_signature(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}
