//! HMAC-SHA256 signature checks for inbound webhooks and payment proofs.
//!
//! Two schemes are supported:
//! - [Standard Webhooks](https://www.standardwebhooks.com/): the signature is computed over
//!   `{msg_id}.{timestamp}.{payload}` with a `whsec_` secret and sent base64-encoded as
//!   `v1,<sig>` in `webhook-signature` (several space-separated signatures during key rotation),
//!   together with `webhook-id` and `webhook-timestamp`.
//! - Hex HMAC: a lowercase hex HMAC-SHA256 over a message, as used by payment gateways for both
//!   payment proofs and webhook bodies.
//!
//! All comparisons go through [`Mac::verify_slice`], which is constant time.

use axum::http::HeaderMap;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64_STANDARD};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::Duration;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Prefix for webhook secrets
pub const SECRET_PREFIX: &str = "whsec_";

pub const WEBHOOK_ID_HEADER: &str = "webhook-id";
pub const WEBHOOK_TIMESTAMP_HEADER: &str = "webhook-timestamp";
pub const WEBHOOK_SIGNATURE_HEADER: &str = "webhook-signature";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SignatureError {
    #[error("Missing {0} header")]
    MissingHeader(&'static str),

    #[error("Malformed webhook timestamp")]
    InvalidTimestamp,

    #[error("Webhook timestamp outside the accepted window")]
    Expired,

    #[error("Signing secret is not usable")]
    InvalidSecret,

    #[error("Signature mismatch")]
    Mismatch,
}

/// Generate a new webhook secret.
///
/// Returns a `whsec_` prefixed base64-encoded 32-byte random secret.
pub fn generate_secret() -> String {
    use rand::RngCore;

    let mut secret_bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut secret_bytes);

    format!("{}{}", SECRET_PREFIX, BASE64_STANDARD.encode(secret_bytes))
}

/// Extract the raw secret bytes from a `whsec_` prefixed secret.
pub fn decode_secret(secret: &str) -> Option<Vec<u8>> {
    let encoded = secret.strip_prefix(SECRET_PREFIX)?;
    BASE64_STANDARD.decode(encoded).ok()
}

fn standard_mac(msg_id: &str, timestamp: i64, payload: &str, secret: &str) -> Option<HmacSha256> {
    let secret_bytes = decode_secret(secret)?;
    let mut mac = HmacSha256::new_from_slice(&secret_bytes).ok()?;
    mac.update(format!("{msg_id}.{timestamp}.{payload}").as_bytes());
    Some(mac)
}

/// Sign a payload the way a Standard Webhooks sender does; returns `v1,{base64}`.
pub fn sign_payload(msg_id: &str, timestamp: i64, payload: &str, secret: &str) -> Option<String> {
    let signature = standard_mac(msg_id, timestamp, payload, secret)?.finalize().into_bytes();
    Some(format!("v1,{}", BASE64_STANDARD.encode(signature)))
}

/// Verify a Standard Webhooks request and return its message id.
///
/// The timestamp must be within `tolerance` of `now` in either direction, and at least one of the
/// `v1` signatures in the header must match.
pub fn verify_standard_webhook(
    headers: &HeaderMap,
    payload: &str,
    secret: &str,
    tolerance: Duration,
    now: DateTime<Utc>,
) -> Result<String, SignatureError> {
    let header = |name: &'static str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .ok_or(SignatureError::MissingHeader(name))
    };
    let msg_id = header(WEBHOOK_ID_HEADER)?;
    let timestamp: i64 = header(WEBHOOK_TIMESTAMP_HEADER)?
        .trim()
        .parse()
        .map_err(|_| SignatureError::InvalidTimestamp)?;
    let signatures = header(WEBHOOK_SIGNATURE_HEADER)?;

    if (now.timestamp() - timestamp).unsigned_abs() > tolerance.as_secs() {
        return Err(SignatureError::Expired);
    }

    let mac = standard_mac(msg_id, timestamp, payload, secret).ok_or(SignatureError::InvalidSecret)?;
    let matched = signatures
        .split_whitespace()
        .filter_map(|candidate| candidate.strip_prefix("v1,"))
        .filter_map(|encoded| BASE64_STANDARD.decode(encoded).ok())
        .any(|candidate| mac.clone().verify_slice(&candidate).is_ok());

    if matched { Ok(msg_id.to_string()) } else { Err(SignatureError::Mismatch) }
}

/// Lowercase hex HMAC-SHA256 of `message`.
pub fn hmac_sha256_hex(secret: &[u8], message: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(message);
    hex::encode(mac.finalize().into_bytes())
}

/// Check a hex HMAC-SHA256 signature of `message`. Fails closed on malformed input.
pub fn verify_hex_signature(secret: &[u8], message: &[u8], signature_hex: &str) -> bool {
    let Ok(signature) = hex::decode(signature_hex.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(message);
    mac.verify_slice(&signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn signed_headers(msg_id: &str, timestamp: i64, signature: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(WEBHOOK_ID_HEADER, HeaderValue::from_str(msg_id).unwrap());
        headers.insert(WEBHOOK_TIMESTAMP_HEADER, HeaderValue::from_str(&timestamp.to_string()).unwrap());
        headers.insert(WEBHOOK_SIGNATURE_HEADER, HeaderValue::from_str(signature).unwrap());
        headers
    }

    const TOLERANCE: Duration = Duration::from_secs(300);

    #[test]
    fn test_generate_secret() {
        let secret = generate_secret();
        assert!(secret.starts_with(SECRET_PREFIX));
        assert_eq!(decode_secret(&secret).unwrap().len(), 32);
    }

    #[test]
    fn test_decode_secret_rejects_bad_input() {
        assert!(decode_secret("invalid_secret").is_none());
        assert!(decode_secret("whsec_not-valid-base64!!!").is_none());
    }

    #[test]
    fn test_verify_standard_webhook() {
        let secret = generate_secret();
        let now = Utc::now();
        let payload = r#"{"id":"pred-1","status":"succeeded"}"#;
        let signature = sign_payload("msg_1", now.timestamp(), payload, &secret).unwrap();
        let headers = signed_headers("msg_1", now.timestamp(), &signature);

        assert_eq!(verify_standard_webhook(&headers, payload, &secret, TOLERANCE, now), Ok("msg_1".to_string()));
        assert_eq!(
            verify_standard_webhook(&headers, "tampered", &secret, TOLERANCE, now),
            Err(SignatureError::Mismatch)
        );
        assert_eq!(
            verify_standard_webhook(&headers, payload, &generate_secret(), TOLERANCE, now),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn test_any_of_several_signatures_may_match() {
        let secret = generate_secret();
        let now = Utc::now();
        let payload = "{}";
        let valid = sign_payload("msg_2", now.timestamp(), payload, &secret).unwrap();
        let stale = sign_payload("msg_2", now.timestamp(), payload, &generate_secret()).unwrap();
        let headers = signed_headers("msg_2", now.timestamp(), &format!("{stale} v2,ignored {valid}"));

        assert!(verify_standard_webhook(&headers, payload, &secret, TOLERANCE, now).is_ok());
    }

    #[test]
    fn test_old_timestamps_are_rejected() {
        let secret = generate_secret();
        let now = Utc::now();
        let sent_at = now.timestamp() - 3600;
        let signature = sign_payload("msg_3", sent_at, "{}", &secret).unwrap();
        let headers = signed_headers("msg_3", sent_at, &signature);

        assert_eq!(
            verify_standard_webhook(&headers, "{}", &secret, TOLERANCE, now),
            Err(SignatureError::Expired)
        );
    }

    #[test]
    fn test_missing_headers() {
        let secret = generate_secret();
        let mut headers = signed_headers("msg_4", Utc::now().timestamp(), "v1,abc");
        headers.remove(WEBHOOK_SIGNATURE_HEADER);
        assert_eq!(
            verify_standard_webhook(&headers, "{}", &secret, TOLERANCE, Utc::now()),
            Err(SignatureError::MissingHeader(WEBHOOK_SIGNATURE_HEADER))
        );

        let mut headers = signed_headers("msg_4", 0, "v1,abc");
        headers.insert(WEBHOOK_TIMESTAMP_HEADER, HeaderValue::from_static("yesterday"));
        assert_eq!(
            verify_standard_webhook(&headers, "{}", &secret, TOLERANCE, Utc::now()),
            Err(SignatureError::InvalidTimestamp)
        );
    }

    #[test]
    fn test_hex_signatures() {
        let secret = b"key_secret";
        let message = b"order_123|pay_456";
        let signature = hmac_sha256_hex(secret, message);

        assert_eq!(signature.len(), 64);
        assert!(verify_hex_signature(secret, message, &signature));
        assert!(verify_hex_signature(secret, message, &signature.to_uppercase()));
        assert!(!verify_hex_signature(secret, b"order_123|pay_457", &signature));
        assert!(!verify_hex_signature(b"other", message, &signature));
        assert!(!verify_hex_signature(secret, message, "not hex"));
        assert!(!verify_hex_signature(secret, message, ""));
    }

    #[test]
    fn test_standard_webhooks_reference_vector() {
        // Published example from the Standard Webhooks reference implementation
        let secret = "whsec_MfKQ9r8GKYqrTwjUPD8ILPZIo2LaLaSw";
        let signature = sign_payload("msg_p5jXN8AQM9LWM0D4loKWxJek", 1614265330, r#"{"test": 2432232314}"#, secret).unwrap();
        assert_eq!(signature, "v1,g0hM9SsE+OTPJTGt/tmIKtSyZlE3uFJELVlNIOLJ1OE=");
    }
}
