//! Cache key generation using SHA-256 hashes

use sha2::{Digest, Sha256};

/// Number of hex characters of the parameter hash kept in a key
const HASH_CHARS: usize = 16;

/// Generate a deterministic cache key for a query scope and its parameters.
///
/// Keys keep the scope readable (`"home:trending"`) so entries can be cleared
/// by prefix. Parameters are sorted by name before hashing, so the same
/// filters in any order produce the same key.
pub fn query_key(scope: &str, params: &[(&str, &str)]) -> String {
    if params.is_empty() {
        return scope.to_string();
    }

    let mut sorted_params: Vec<_> = params.iter().collect();
    sorted_params.sort_by(|a, b| a.0.cmp(b.0).then_with(|| a.1.cmp(b.1)));

    let mut hasher = Sha256::new();
    for (k, v) in sorted_params {
        hasher.update(k.as_bytes());
        hasher.update(b"=");
        hasher.update(v.as_bytes());
        hasher.update(b"&");
    }

    let digest = format!("{:x}", hasher.finalize());
    format!("{}:{}", scope, &digest[..HASH_CHARS])
}
