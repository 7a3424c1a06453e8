use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Hex-encoded HMAC-SHA256 over the concatenation of `parts`.
pub fn hmac_sha256_hex(secret: &[u8], parts: &[&[u8]]) -> String {
    hmac_sha256(secret, parts)
        .map(hex::encode)
        .unwrap_or_default()
}

fn hmac_sha256(secret: &[u8], parts: &[&[u8]]) -> Option<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(secret).ok()?;
    for part in parts {
        mac.update(part);
    }
    Some(mac.finalize().into_bytes().to_vec())
}

/// Checks a hex signature against the HMAC of `parts`.
///
/// The comparison runs in constant time over the full digest. Only the
/// length check short-circuits, and a SHA-256 digest length is public.
pub fn verify_hmac_sha256_hex(secret: &[u8], parts: &[&[u8]], provided_hex: &str) -> bool {
    if secret.is_empty() {
        return false;
    }
    let Ok(provided) = hex::decode(provided_hex.trim()) else {
        return false;
    };
    let Some(expected) = hmac_sha256(secret, parts) else {
        return false;
    };
    if expected.len() != provided.len() {
        return false;
    }
    expected.as_slice().ct_eq(provided.as_slice()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_signature_is_accepted() {
        let body = br#"{"event":"payment.completed"}"#;
        let sig = hmac_sha256_hex(b"secret", &[body]);
        assert!(verify_hmac_sha256_hex(b"secret", &[body], &sig));
        assert!(verify_hmac_sha256_hex(b"secret", &[body], &sig.to_uppercase()));
    }

    #[test]
    fn test_tampered_payload_is_rejected() {
        let body = br#"{"amount":25000}"#.to_vec();
        let sig = hmac_sha256_hex(b"secret", &[&body]);
        let mut tampered = body.clone();
        tampered[10] = b'9';
        assert!(!verify_hmac_sha256_hex(b"secret", &[&tampered], &sig));
    }

    #[test]
    fn test_wrong_secret_and_garbage_are_rejected() {
        let body = b"payload";
        let sig = hmac_sha256_hex(b"secret", &[body]);
        assert!(!verify_hmac_sha256_hex(b"other", &[body], &sig));
        assert!(!verify_hmac_sha256_hex(b"secret", &[body], "not-hex"));
        assert!(!verify_hmac_sha256_hex(b"secret", &[body], "abcd"));
        assert!(!verify_hmac_sha256_hex(b"", &[body], &sig));
    }

    #[test]
    fn test_parts_are_concatenated() {
        let joined = hmac_sha256_hex(b"k", &[b"123.", b"body"]);
        assert_eq!(joined, hmac_sha256_hex(b"k", &[b"123.body"]));
    }
}
