//! Webhook signature verification.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Verify an HMAC-SHA256 hex signature over the raw payload, compared in
/// constant time.
pub fn verify_hmac_signature(payload: &[u8], signature: &str, secret: &str) -> bool {
    if signature.is_empty() {
        return false;
    }
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(payload);
    let expected: String = mac
        .finalize()
        .into_bytes()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect();
    expected.as_bytes().ct_eq(signature.as_bytes()).into()
}

/// Constant-time equality for shared-secret callback tokens.
pub fn constant_time_token_eq(a: &str, b: &str) -> bool {
    !a.is_empty() && a.as_bytes().ct_eq(b.as_bytes()).into()
}
