//! Webhook HMAC verification.
//!
//! Accepted signatures are HMAC-SHA256 over the raw body, with a legacy form
//! over `timestamp "." body`. The provided value may be base64 or lowercase
//! hex, raw or wrapped in a structured `signature=...,algorithm=...` header.
//! During rotation the previous secret is accepted until its overlap window
//! expires. All comparisons go through `Mac::verify_slice`, which is
//! constant-time.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Timestamp skew tolerated around server time.
pub const MAX_SKEW_SECS: i64 = 300;

#[derive(Debug, Clone)]
pub struct SignatureKeys {
    pub current: String,
    /// Previous secret, present only while its rotation overlap is unexpired.
    pub previous: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    Valid,
    /// Timestamp outside the skew window.
    Stale,
    /// No candidate digest matched.
    Mismatch,
    MissingSignature,
}

impl VerifyOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerifyOutcome::Valid => "valid",
            VerifyOutcome::Stale => "stale",
            VerifyOutcome::Mismatch => "mismatch",
            VerifyOutcome::MissingSignature => "missing_signature",
        }
    }
}

/// Pull the signature value (and algorithm, when present) out of a header
/// that is either the raw signature or `signature=<v>,algorithm=<a>`.
pub fn parse_signature_header(header: &str) -> (String, Option<String>) {
    if !header.contains('=') || !header.to_ascii_lowercase().contains("signature=") {
        return (header.trim().to_string(), None);
    }
    let mut signature = String::new();
    let mut algorithm = None;
    for part in header.split(',') {
        let Some((name, value)) = part.split_once('=') else {
            continue;
        };
        match name.trim().to_ascii_lowercase().as_str() {
            "signature" => signature = value.trim().to_string(),
            "algorithm" => algorithm = Some(value.trim().to_string()),
            _ => {}
        }
    }
    if signature.is_empty() {
        signature = header.trim().to_string();
    }
    (signature, algorithm)
}

/// Verify a webhook signature against every accepted candidate.
pub fn verify(
    body: &str,
    timestamp: Option<i64>,
    signature_header: &str,
    keys: &SignatureKeys,
    now: i64,
) -> VerifyOutcome {
    if let Some(ts) = timestamp {
        if (now - ts).abs() > MAX_SKEW_SECS {
            return VerifyOutcome::Stale;
        }
    }

    let (signature, _algorithm) = parse_signature_header(signature_header);
    if signature.is_empty() {
        return VerifyOutcome::MissingSignature;
    }

    // The provided value may be base64 or hex; decode both interpretations.
    let mut provided: Vec<Vec<u8>> = Vec::new();
    if let Ok(raw) = BASE64.decode(signature.as_bytes()) {
        provided.push(raw);
    }
    if let Ok(raw) = hex::decode(signature.trim()) {
        provided.push(raw);
    }
    if provided.is_empty() {
        return VerifyOutcome::Mismatch;
    }

    let mut secrets: Vec<&str> = vec![keys.current.as_str()];
    if let Some(previous) = &keys.previous {
        secrets.push(previous.as_str());
    }

    let mut payloads: Vec<String> = vec![body.to_string()];
    if let Some(ts) = timestamp {
        payloads.push(format!("{}.{}", ts, body));
    }

    for secret in secrets {
        for payload in &payloads {
            let Ok(mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
                continue;
            };
            let mut mac = mac;
            mac.update(payload.as_bytes());
            for candidate in &provided {
                if mac.clone().verify_slice(candidate).is_ok() {
                    return VerifyOutcome::Valid;
                }
            }
        }
    }
    VerifyOutcome::Mismatch
}

/// Base64 HMAC-SHA256 of `payload`, the canonical signature form. Used by
/// tests and the replay tooling.
pub fn sign_base64(payload: &str, secret: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key size");
    mac.update(payload.as_bytes());
    BASE64.encode(mac.finalize().into_bytes())
}

/// Lowercase hex form of the same digest.
pub fn sign_hex(payload: &str, secret: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key size");
    mac.update(payload.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &str = r#"{"type":"inventory.update","data":{"product_id":123}}"#;
    const SECRET: &str = "whsec_current";

    fn keys() -> SignatureKeys {
        SignatureKeys {
            current: SECRET.to_string(),
            previous: None,
        }
    }

    #[test]
    fn accepts_base64_signature_of_body() {
        let sig = sign_base64(BODY, SECRET);
        assert_eq!(verify(BODY, None, &sig, &keys(), 1000), VerifyOutcome::Valid);
    }

    #[test]
    fn accepts_hex_signature_of_body() {
        let sig = sign_hex(BODY, SECRET);
        assert_eq!(verify(BODY, None, &sig, &keys(), 1000), VerifyOutcome::Valid);
    }

    #[test]
    fn accepts_legacy_timestamp_dot_body_form() {
        let now = 1_700_000_000;
        let sig = sign_base64(&format!("{}.{}", now, BODY), SECRET);
        assert_eq!(
            verify(BODY, Some(now), &sig, &keys(), now),
            VerifyOutcome::Valid
        );
    }

    #[test]
    fn accepts_structured_header_form() {
        let sig = sign_base64(BODY, SECRET);
        let header = format!("signature={},algorithm=HMAC-SHA256", sig);
        assert_eq!(
            verify(BODY, None, &header, &keys(), 1000),
            VerifyOutcome::Valid
        );
    }

    #[test]
    fn accepts_previous_secret_during_overlap() {
        let sig = sign_base64(BODY, "whsec_old");
        let keys = SignatureKeys {
            current: SECRET.to_string(),
            previous: Some("whsec_old".to_string()),
        };
        assert_eq!(verify(BODY, None, &sig, &keys, 1000), VerifyOutcome::Valid);
    }

    #[test]
    fn rejects_wrong_secret() {
        let sig = sign_base64(BODY, "whsec_wrong");
        assert_eq!(
            verify(BODY, None, &sig, &keys(), 1000),
            VerifyOutcome::Mismatch
        );
    }

    #[test]
    fn rejects_stale_timestamp_before_checking_digest() {
        let now = 1_700_000_000;
        let sig = sign_base64(BODY, SECRET);
        assert_eq!(
            verify(BODY, Some(now - MAX_SKEW_SECS - 1), &sig, &keys(), now),
            VerifyOutcome::Stale
        );
        assert_eq!(
            verify(BODY, Some(now + MAX_SKEW_SECS + 1), &sig, &keys(), now),
            VerifyOutcome::Stale
        );
    }

    #[test]
    fn timestamp_inside_window_is_accepted() {
        let now = 1_700_000_000;
        let sig = sign_base64(BODY, SECRET);
        assert_eq!(
            verify(BODY, Some(now - MAX_SKEW_SECS), &sig, &keys(), now),
            VerifyOutcome::Valid
        );
    }

    #[test]
    fn parse_header_handles_both_forms() {
        assert_eq!(parse_signature_header("abc=="), ("abc==".to_string(), None));
        let (sig, alg) = parse_signature_header("signature=abc==,algorithm=HMAC-SHA256");
        assert_eq!(sig, "abc==");
        assert_eq!(alg.as_deref(), Some("HMAC-SHA256"));
    }

    #[test]
    fn garbage_signature_is_a_mismatch() {
        assert_eq!(
            verify(BODY, None, "!!not-decodable!!", &keys(), 1000),
            VerifyOutcome::Mismatch
        );
    }
}
