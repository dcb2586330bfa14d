//! Gene Hash Computation
//!
//! Content-addressed identity for an agent record: a binary SHA-256
//! Merkle tree over the record's leaf hashes. Leaves are sorted before
//! tree construction and every pair is sorted before hashing, so the
//! result is independent of record order. An odd level is padded by
//! duplicating its last element.

use chrono::Utc;
use sha2::{Digest, Sha256};

use crate::types::AgentRecord;

/// SHA-256 of a single byte string.
fn leaf_hash(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// Hash a sorted pair of nodes into their parent.
fn pair_hash(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    let mut hasher = Sha256::new();
    hasher.update(lo);
    hasher.update(hi);
    hasher.finalize().into()
}

/// Compute the gene hash over a set of record leaves.
///
/// Identical leaf sets always produce the same hash regardless of input
/// order; any single-byte change in any leaf changes it. The empty set
/// hashes the empty string (defined, not an error). A single leaf is
/// returned unchanged by tree construction.
pub fn compute_identity(leaves: &[Vec<u8>]) -> String {
    if leaves.is_empty() {
        return format!("0x{}", hex::encode(leaf_hash(b"")));
    }

    let mut level: Vec<[u8; 32]> = leaves.iter().map(|l| leaf_hash(l)).collect();
    level.sort_unstable();

    while level.len() > 1 {
        if level.len() % 2 == 1 {
            let last = *level.last().unwrap();
            level.push(last);
        }
        level = level
            .chunks_exact(2)
            .map(|pair| pair_hash(&pair[0], &pair[1]))
            .collect();
    }

    format!("0x{}", hex::encode(level[0]))
}

/// Serialize an agent record into its canonical leaf set: the identity
/// metadata (gene hash excluded, since it is what we are computing), one
/// leaf per trait, one per knowledge entry, one per history event.
pub fn record_leaves(record: &AgentRecord) -> Vec<Vec<u8>> {
    let mut leaves: Vec<Vec<u8>> = Vec::new();

    let mut meta = record.identity.clone();
    meta.gene_hash = String::new();
    if let Ok(bytes) = serde_json::to_vec(&meta) {
        leaves.push(bytes);
    }

    for t in &record.traits {
        if let Ok(bytes) = serde_json::to_vec(t) {
            leaves.push(bytes);
        }
    }
    for k in &record.knowledge {
        if let Ok(bytes) = serde_json::to_vec(k) {
            leaves.push(bytes);
        }
    }
    for h in &record.history {
        if let Ok(bytes) = serde_json::to_vec(h) {
            leaves.push(bytes);
        }
    }

    leaves
}

/// Gene hash of a full agent record.
pub fn identity_of(record: &AgentRecord) -> String {
    compute_identity(&record_leaves(record))
}

/// Whether a record's gene hash matches its content. An imported record
/// that fails this check is an integrity violation: fatal, never
/// auto-corrected.
pub fn verify_identity(record: &AgentRecord) -> bool {
    identity_of(record) == record.identity.gene_hash
}

/// Build a reincarnated record from a verified import: the genome and
/// knowledge carry over, history starts fresh, and the identity is
/// recomputed with the old identity recorded as the sole parent.
pub fn reincarnate(old: &AgentRecord) -> AgentRecord {
    let mut record = old.clone();
    record.identity.origin = "reincarnated".to_string();
    record.identity.parents = vec![old.identity.gene_hash.clone()];
    record.identity.generation = old.identity.generation + 1;
    record.identity.born_at = Utc::now().to_rfc3339();
    record.identity.gene_hash = String::new();
    record.history.clear();
    record.identity.gene_hash = identity_of(&record);
    record
}

/// Whether a string is a well-formed gene hash: `0x` + 64 lowercase hex.
pub fn is_valid_identity(s: &str) -> bool {
    s.len() == 66
        && s.starts_with("0x")
        && s[2..]
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// SHA-256 of the empty string.
    const EMPTY_ROOT: &str = "0xe3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    fn leaves(items: &[&str]) -> Vec<Vec<u8>> {
        items.iter().map(|s| s.as_bytes().to_vec()).collect()
    }

    #[test]
    fn test_empty_input_hashes_empty_string() {
        assert_eq!(compute_identity(&[]), EMPTY_ROOT);
    }

    #[test]
    fn test_single_leaf_passes_through_unchanged() {
        // sha256("alpha"), unchanged by tree construction.
        assert_eq!(
            compute_identity(&leaves(&["alpha"])),
            "0x8ed3f6ad685b959ead7022518e1af76cd816f8e8ec7ccdda1ed4018e8f2223f8"
        );
    }

    #[test]
    fn test_four_leaf_reference_root() {
        // Independently computed with hashlib: sorted leaves, pair-sorted
        // concatenation at each level.
        assert_eq!(
            compute_identity(&leaves(&["alpha", "beta", "gamma", "delta"])),
            "0xf5e883dc840dd6032986722a2cdcd999efc2668fb95c1b64d568b1a41bc55f2d"
        );
    }

    #[test]
    fn test_odd_level_duplicates_last() {
        assert_eq!(
            compute_identity(&leaves(&["alpha", "beta", "gamma"])),
            "0x6eb4b3e371a6d041aa6199355a1be8bc363c0e783f513d199fd5c99934590bc8"
        );
    }

    #[test]
    fn test_deterministic_and_order_independent() {
        let a = compute_identity(&leaves(&["alpha", "beta", "gamma", "delta"]));
        let b = compute_identity(&leaves(&["delta", "gamma", "beta", "alpha"]));
        assert_eq!(a, b);
        assert_eq!(a, compute_identity(&leaves(&["alpha", "beta", "gamma", "delta"])));
    }

    #[test]
    fn test_single_byte_change_changes_hash() {
        let h1 = compute_identity(&leaves(&[r#"{"a":"1"}"#]));
        let h2 = compute_identity(&leaves(&[r#"{"a":"2"}"#]));
        assert_eq!(
            h1,
            "0x9afeb0f2b203f254312ec8ded441d0318b7c34c57f8695ede42d2215a30c0960"
        );
        assert_eq!(
            h2,
            "0xd1c5b45e236f653abc1ed23bd5f2bafada6b49b4a173911e502a8bc5e89d8528"
        );
        assert_ne!(h1, h2);
    }

    #[test]
    fn test_verify_identity_detects_tampering() {
        let mut record = crate::test_support::sample_record("", "survive");
        record.identity.gene_hash = identity_of(&record);
        assert!(verify_identity(&record));

        record.identity.purpose = "something else".to_string();
        assert!(!verify_identity(&record));
    }

    #[test]
    fn test_reincarnation_recomputes_identity() {
        let mut old = crate::test_support::sample_record("", "survive");
        old.identity.gene_hash = identity_of(&old);

        let new = reincarnate(&old);
        assert!(verify_identity(&new));
        assert_ne!(new.identity.gene_hash, old.identity.gene_hash);
        assert_eq!(new.identity.parents, vec![old.identity.gene_hash.clone()]);
        assert_eq!(new.identity.generation, old.identity.generation + 1);
        assert_eq!(new.identity.origin, "reincarnated");
        assert!(new.history.is_empty());
        // The genome itself carries over untouched.
        assert_eq!(new.traits, old.traits);
    }

    #[test]
    fn test_identity_format() {
        let h = compute_identity(&leaves(&["alpha"]));
        assert!(is_valid_identity(&h));
        assert!(!is_valid_identity("0x1234"));
        assert!(!is_valid_identity(&h[2..]));
    }
}
