//! Stored secret comparison
//!
//! Passwords and tokens are stored either in plaintext or as bcrypt hashes.
//! A hash is recognized by its `$2a$`, `$2b$` or `$2y$` prefix.

use bcrypt::{BcryptError, Version};

/// Prefixes identifying bcrypt hashes
pub const BCRYPT_PREFIXES: [&str; 3] = ["$2a$", "$2b$", "$2y$"];

/// Check whether a stored password or token is a bcrypt hash
pub fn is_hashed(secret: &str) -> bool {
    BCRYPT_PREFIXES.iter().any(|p| secret.starts_with(p))
}

/// Compare a stored secret against the one a client presented
///
/// A hashed `stored` is only ever verified with bcrypt; a plaintext `stored`
/// is never hashed.
pub fn compare(stored: &str, presented: &str) -> bool {
    if is_hashed(stored) {
        return bcrypt::verify(presented, stored).unwrap_or(false);
    }
    constant_time_eq(stored.as_bytes(), presented.as_bytes())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

/// Hash a secret for storage in configuration, in the `$2a$` format
pub fn hash_secret(plain: &str, cost: u32) -> Result<String, BcryptError> {
    Ok(bcrypt::hash_with_result(plain, cost)?.format_for_version(Version::TwoA))
}
