//! Webhook signature verification.
//!
//! QuickBooks signs every webhook delivery with the app's verifier token:
//! the `intuit-signature` header carries
//! `base64(HMAC-SHA256(raw_body, verifier_token))`.
//!
//! Verification fails closed: an empty header, body or secret never
//! verifies, and the comparison runs in constant time.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::store::Secret;

type HmacSha256 = Hmac<Sha256>;

/// Compute the signature QuickBooks would send for `body`.
pub fn sign(body: &[u8], secret: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(body);
    BASE64.encode(mac.finalize().into_bytes())
}

/// Check `signature` against the body and shared secret.
pub fn verify(body: &[u8], signature: Option<&str>, secret: &str) -> bool {
    let Some(signature) = signature.map(str::trim).filter(|s| !s.is_empty()) else {
        return false;
    };
    if body.is_empty() || secret.is_empty() {
        return false;
    }

    let expected = sign(body, secret);
    expected.as_bytes().ct_eq(signature.as_bytes()).into()
}

/// Verifies webhook deliveries against a configured shared secret.
#[derive(Clone)]
pub struct SignatureVerifier {
    secret: Secret,
}

impl SignatureVerifier {
    pub fn new(secret: Secret) -> Self {
        Self { secret }
    }

    /// Whether a secret is configured. Without one nothing verifies.
    pub fn is_configured(&self) -> bool {
        !self.secret.is_empty()
    }

    pub fn verify(&self, body: &[u8], signature: Option<&str>) -> bool {
        verify(body, signature, self.secret.expose())
    }
}

impl std::fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureVerifier")
            .field("configured", &self.is_configured())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "verifier-token";
    const BODY: &[u8] = br#"{"eventNotifications":[]}"#;

    #[test]
    fn test_sign_then_verify() {
        let signature = sign(BODY, SECRET);
        assert!(verify(BODY, Some(&signature), SECRET));
    }

    #[test]
    fn test_known_vector() {
        // HMAC-SHA256("The quick brown fox jumps over the lazy dog", "key")
        let signature = sign(b"The quick brown fox jumps over the lazy dog", "key");
        assert_eq!(signature, "97yD9DBThCSxMpjmqm+xQ+9NWaFJRhdZl0edvC0aPNg=");
    }

    #[test]
    fn test_body_bit_flip_fails() {
        let signature = sign(BODY, SECRET);
        for i in 0..BODY.len() {
            let mut tampered = BODY.to_vec();
            tampered[i] ^= 0x01;
            assert!(!verify(&tampered, Some(&signature), SECRET), "flip at byte {}", i);
        }
    }

    #[test]
    fn test_signature_bit_flip_fails() {
        let signature = sign(BODY, SECRET);
        let mut bytes = signature.into_bytes();
        bytes[0] ^= 0x01;
        let tampered = String::from_utf8(bytes).unwrap();
        assert!(!verify(BODY, Some(&tampered), SECRET));
    }

    #[test]
    fn test_fails_closed_on_empty_inputs() {
        let signature = sign(BODY, SECRET);
        assert!(!verify(BODY, None, SECRET));
        assert!(!verify(BODY, Some(""), SECRET));
        assert!(!verify(b"", Some(&sign(b"", SECRET)), SECRET));
        assert!(!verify(BODY, Some(&sign(BODY, "")), ""));
        assert!(!verify(BODY, Some(&signature), "other-secret"));
    }

    #[test]
    fn test_verifier_debug_hides_secret() {
        let verifier = SignatureVerifier::new(Secret::new(SECRET));
        assert!(verifier.verify(BODY, Some(&sign(BODY, SECRET))));
        assert!(!format!("{:?}", verifier).contains(SECRET));
    }
}
