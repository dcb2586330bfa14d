//! Inbreeding Detection
//!
//! Two agents are judged related if their ancestry trees overlap within a
//! fixed depth, or - as a cheap offline fallback when the registry is
//! unreachable - if their identity hashes share a fixed-length prefix.

use tracing::{debug, warn};

use crate::types::RegistryClient;

/// Ancestry lookup depth for the registry-backed relatedness check.
pub const ANCESTRY_DEPTH: u32 = 3;

/// Hex prefix length for the offline fallback.
pub const RELATEDNESS_PREFIX_LEN: usize = 8;

/// Whether two gene hashes share an `len`-character hex prefix
/// (the `0x` tag is not counted).
pub fn share_prefix(a: &str, b: &str, len: usize) -> bool {
    let a = a.strip_prefix("0x").unwrap_or(a);
    let b = b.strip_prefix("0x").unwrap_or(b);
    if a.len() < len || b.len() < len {
        return false;
    }
    a[..len].eq_ignore_ascii_case(&b[..len])
}

/// Judge whether two identities are too closely related to breed.
///
/// With a registry available, fetches both ancestry sets up to
/// [`ANCESTRY_DEPTH`] generations and reports relatedness when either
/// identity appears in the other's tree or the trees intersect. If the
/// registry is absent or the lookup fails, falls back to the prefix test.
pub async fn are_related(
    registry: Option<&dyn RegistryClient>,
    a: &str,
    b: &str,
) -> bool {
    if share_prefix(a, b, RELATEDNESS_PREFIX_LEN) {
        debug!("Identities {} and {} share a prefix; judged related", a, b);
        return true;
    }

    let registry = match registry {
        Some(r) => r,
        None => return false,
    };

    let ancestry_a = registry.get_ancestry(a, ANCESTRY_DEPTH).await;
    let ancestry_b = registry.get_ancestry(b, ANCESTRY_DEPTH).await;

    match (ancestry_a, ancestry_b) {
        (Ok(anc_a), Ok(anc_b)) => {
            if anc_a.iter().any(|x| x == b) || anc_b.iter().any(|x| x == a) {
                return true;
            }
            anc_a.iter().any(|x| anc_b.contains(x))
        }
        (Err(e), _) | (_, Err(e)) => {
            // Registry unavailable: the prefix test above is the fallback,
            // and it already said "unrelated".
            warn!("Ancestry lookup failed, relying on prefix fallback: {:#}", e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_share_prefix_detects_eight_char_overlap() {
        let a = "0xdeadbeef000000000000000000000000000000000000000000000000000000aa";
        let b = "0xdeadbeef111111111111111111111111111111111111111111111111111111bb";
        assert!(share_prefix(a, b, 8));
        assert!(!share_prefix(a, b, 9));
    }

    #[test]
    fn test_share_prefix_ignores_hex_tag() {
        assert!(share_prefix("0xabcdef12aa", "abcdef12bb", 8));
    }

    #[test]
    fn test_distinct_prefixes_unrelated() {
        let a = "0xaaaaaaaa000000000000000000000000000000000000000000000000000000aa";
        let b = "0xbbbbbbbb000000000000000000000000000000000000000000000000000000bb";
        assert!(!share_prefix(a, b, 8));
    }

    #[tokio::test]
    async fn test_no_registry_falls_back_to_prefix() {
        let related_a = "0xdeadbeef000000000000000000000000000000000000000000000000000000aa";
        let related_b = "0xdeadbeef111111111111111111111111111111111111111111111111111111bb";
        assert!(are_related(None, related_a, related_b).await);

        let distinct_a = "0xaaaaaaaa000000000000000000000000000000000000000000000000000000aa";
        let distinct_b = "0xbbbbbbbb000000000000000000000000000000000000000000000000000000bb";
        assert!(!are_related(None, distinct_a, distinct_b).await);
    }
}
