//! Password hashing.

/// bcrypt work factor. The registry predates tunable costs here; 6 keeps
/// interactive logins fast while staying above the bcrypt crate's minimum.
const BCRYPT_COST: u32 = 6;

/// Hash a password for storage.
pub fn hash_password(password: &str) -> crate::Result<String> {
    bcrypt::hash(password, BCRYPT_COST).map_err(|e| crate::Error::Password(e.to_string()))
}

/// Verify a password against a stored hash.
///
/// Returns `false` both for a mismatch and for an undecodable hash; the
/// caller only ever needs the boolean.
pub fn verify_password(password: &str, hash: &str) -> bool {
    bcrypt::verify(password, hash).unwrap_or(false)
}
