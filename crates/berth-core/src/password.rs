//! Password policy and hashing.
//!
//! Policy follows NIST SP 800-63B with production hardening: minimum 12
//! characters, all four character classes, and a blocklist of extremely
//! common passwords. Hashing uses bcrypt at the library default cost;
//! comparison is constant-time inside the bcrypt routine itself.

use std::collections::BTreeMap;

use crate::error::{ApiError, ApiResult};

/// Minimal blocklist of extremely common passwords, matched lowercase.
const COMMON_PASSWORDS: &[&str] = &[
    "password1234",
    "123456789012",
    "qwertyuiop12",
    "password1234!",
    "admin12345678",
    "letmein123456",
    "welcome12345",
    "changeme1234",
    "iloveyou1234",
    "trustno1trust",
];

/// A bcrypt hash is always at least 60 bytes; anything shorter means the
/// account has no usable password (federated-only principals store "").
pub const BCRYPT_MIN_LEN: usize = 60;

/// Validate a password against the policy. Every failing rule is reported
/// under its own `details` key so clients can render all of them at once.
pub fn validate_password(password: &str) -> ApiResult<()> {
    let mut details = BTreeMap::new();

    if password.chars().count() < 12 {
        details.insert(
            "password".to_string(),
            "must be at least 12 characters".to_string(),
        );
    }

    let mut has_upper = false;
    let mut has_lower = false;
    let mut has_digit = false;
    let mut has_special = false;
    for c in password.chars() {
        if c.is_uppercase() {
            has_upper = true;
        } else if c.is_lowercase() {
            has_lower = true;
        } else if c.is_ascii_digit() {
            has_digit = true;
        } else if !c.is_whitespace() {
            has_special = true;
        }
    }

    if !has_upper {
        details.insert(
            "password_uppercase".to_string(),
            "must contain at least one uppercase letter".to_string(),
        );
    }
    if !has_lower {
        details.insert(
            "password_lowercase".to_string(),
            "must contain at least one lowercase letter".to_string(),
        );
    }
    if !has_digit {
        details.insert(
            "password_digit".to_string(),
            "must contain at least one digit".to_string(),
        );
    }
    if !has_special {
        details.insert(
            "password_special".to_string(),
            "must contain at least one special character".to_string(),
        );
    }

    if COMMON_PASSWORDS.contains(&password.to_lowercase().as_str()) {
        details.insert(
            "password_common".to_string(),
            "is too common".to_string(),
        );
    }

    if details.is_empty() {
        Ok(())
    } else {
        Err(ApiError::Validation(details))
    }
}

/// Hash a password with bcrypt at the default cost.
pub fn hash_password(password: &str) -> ApiResult<String> {
    bcrypt::hash(password, bcrypt::DEFAULT_COST)
        .map_err(|e| ApiError::internal(format!("Failed to hash password: {}", e)))
}

/// Verify a password against a stored bcrypt hash. Any error (including a
/// malformed hash, e.g. the empty hash of a federated-only account) counts
/// as a mismatch.
pub fn verify_password(password: &str, hash: &str) -> bool {
    bcrypt::verify(password, hash).unwrap_or(false)
}

/// Whether the stored hash represents a real, usable password.
pub fn has_usable_password(hash: &str) -> bool {
    hash.len() >= BCRYPT_MIN_LEN
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_strong_password() {
        assert!(validate_password("LovelaceBytes#9").is_ok());
    }

    #[test]
    fn test_rejects_short_password_with_length_detail() {
        let err = validate_password("short").unwrap_err();
        match err {
            ApiError::Validation(details) => {
                assert!(details["password"].contains("at least 12 characters"));
            }
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_reports_every_failing_rule() {
        let err = validate_password("alllowercase").unwrap_err();
        match err {
            ApiError::Validation(details) => {
                assert!(details.contains_key("password_uppercase"));
                assert!(details.contains_key("password_digit"));
                assert!(details.contains_key("password_special"));
                assert!(!details.contains_key("password"));
            }
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_blocklist_is_case_insensitive() {
        let err = validate_password("Password1234!").unwrap_err();
        match err {
            ApiError::Validation(details) => {
                assert!(details.contains_key("password_common"));
            }
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_hash_round_trip() {
        let hash = hash_password("LovelaceBytes#9").unwrap();
        assert!(verify_password("LovelaceBytes#9", &hash));
        assert!(!verify_password("WrongPassword#9", &hash));
    }

    #[test]
    fn test_empty_hash_never_verifies() {
        assert!(!verify_password("anything", ""));
        assert!(!has_usable_password(""));
    }

    #[test]
    fn test_bcrypt_hash_counts_as_usable() {
        let hash = hash_password("LovelaceBytes#9").unwrap();
        assert!(has_usable_password(&hash));
    }
}
