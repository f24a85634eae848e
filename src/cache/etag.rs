//! Content validators ("etags") for cached files.
//!
//! A token is computed from the raw bytes of a file: the byte length in
//! lowercase hex, a dash, then the first 27 characters of the base64-encoded
//! SHA-256 digest. Equality is byte-for-byte over the token; there is no
//! weak or semantic comparison.

use base64::prelude::{Engine as _, BASE64_STANDARD_NO_PAD};
use sha2::{Digest, Sha256};

/// Fixed token for empty input.
pub const EMPTY_ETAG: &str = "0-47DEQpj8HBSa+/TImW+5JCeuQeR";

/// Length of the digest portion of a token.
const DIGEST_CHARS: usize = 27;

/// Computes the content validator for `bytes`.
pub fn compute_etag(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return EMPTY_ETAG.to_string();
    }
    let digest = Sha256::digest(bytes);
    let encoded = BASE64_STANDARD_NO_PAD.encode(digest);
    format!("{:x}-{}", bytes.len(), &encoded[..DIGEST_CHARS])
}
