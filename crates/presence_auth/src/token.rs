//! Manager-token decoding and HMAC verification.
//!
//! Token shape: `base64url(header) . base64url(payload) . base64url(sig)`
//! with `sig = HMAC-SHA256(secret, header_segment + "." + payload_segment)`.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use officeproto::token::ManagerTokenPayload;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("token is not three base64url segments")]
    InvalidFormat,
    #[error("token segment is not valid base64url/JSON")]
    InvalidSegmentEncoding,
    #[error("token signature does not match")]
    InvalidSignature,
    #[error("token is expired")]
    TokenExpired,
    #[error("no verification secret available")]
    SecretMissing,
}

fn is_base64url_segment(s: &str) -> bool {
    !s.is_empty()
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// Verify `token` against `secret` at the current wall clock.
pub fn verify_manager_token(
    token: &str,
    secret: &str,
) -> Result<ManagerTokenPayload, TokenError> {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;
    verify_manager_token_at(token, secret, now)
}

/// Verify `token` against `secret`, with the clock injected for tests.
pub fn verify_manager_token_at(
    token: &str,
    secret: &str,
    now_secs: i64,
) -> Result<ManagerTokenPayload, TokenError> {
    if secret.is_empty() {
        return Err(TokenError::SecretMissing);
    }

    let mut parts = token.split('.');
    let (Some(h), Some(b), Some(s), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(TokenError::InvalidFormat);
    };
    if !is_base64url_segment(h) || !is_base64url_segment(b) || !is_base64url_segment(s) {
        return Err(TokenError::InvalidFormat);
    }

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| TokenError::SecretMissing)?;
    mac.update(h.as_bytes());
    mac.update(b".");
    mac.update(b.as_bytes());
    let expected = mac.finalize().into_bytes();

    let got = URL_SAFE_NO_PAD
        .decode(s)
        .map_err(|_| TokenError::InvalidSegmentEncoding)?;
    // A wrong-length signature can fail fast; equal-length comparison is
    // constant-time.
    if got.len() != expected.len() {
        return Err(TokenError::InvalidSignature);
    }
    if !bool::from(expected.as_slice().ct_eq(&got)) {
        return Err(TokenError::InvalidSignature);
    }

    let payload_bytes = URL_SAFE_NO_PAD
        .decode(b)
        .map_err(|_| TokenError::InvalidSegmentEncoding)?;
    let payload: ManagerTokenPayload = serde_json::from_slice(&payload_bytes)
        .map_err(|_| TokenError::InvalidSegmentEncoding)?;

    if let Some(exp) = payload.exp {
        if now_secs > exp {
            return Err(TokenError::TokenExpired);
        }
    }

    Ok(payload)
}

/// Produce a token of the verified format. Used by tests and by officectl's
/// smoke-test minting; the production issuer lives elsewhere.
pub fn sign_manager_token(payload: &ManagerTokenPayload, secret: &str) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let body = URL_SAFE_NO_PAD.encode(
        serde_json::to_vec(payload).expect("token payload serializes"),
    );
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(header.as_bytes());
    mac.update(b".");
    mac.update(body.as_bytes());
    let sig = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
    format!("{header}.{body}.{sig}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(agent: &str, ns: &str) -> ManagerTokenPayload {
        ManagerTokenPayload {
            agent_id: Some(agent.to_string()),
            namespace: Some(ns.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn round_trip_verifies() {
        let p = payload("ada.acme.office.xyz", "acme");
        let t = sign_manager_token(&p, "s3cret");
        let got = verify_manager_token_at(&t, "s3cret", 1_700_000_000).unwrap();
        assert_eq!(got, p);
    }

    #[test]
    fn wrong_secret_fails() {
        let t = sign_manager_token(&payload("a", "ns"), "right");
        assert_eq!(
            verify_manager_token_at(&t, "wrong", 0),
            Err(TokenError::InvalidSignature)
        );
    }

    #[test]
    fn tampered_payload_fails() {
        let t = sign_manager_token(&payload("a", "ns"), "k");
        let mut parts = t.split('.').map(String::from).collect::<Vec<_>>();
        parts[1] = URL_SAFE_NO_PAD.encode(br#"{"agentId":"evil"}"#);
        let t = parts.join(".");
        assert_eq!(
            verify_manager_token_at(&t, "k", 0),
            Err(TokenError::InvalidSignature)
        );
    }

    #[test]
    fn expiry_is_enforced() {
        let mut p = payload("a", "ns");
        p.exp = Some(1_000);
        let t = sign_manager_token(&p, "k");
        assert_eq!(
            verify_manager_token_at(&t, "k", 1_001),
            Err(TokenError::TokenExpired)
        );
        // exp == now is still valid.
        assert!(verify_manager_token_at(&t, "k", 1_000).is_ok());
    }

    #[test]
    fn malformed_tokens_are_rejected_by_kind() {
        assert_eq!(
            verify_manager_token_at("onlyonesegment", "k", 0),
            Err(TokenError::InvalidFormat)
        );
        assert_eq!(
            verify_manager_token_at("a.b.c.d", "k", 0),
            Err(TokenError::InvalidFormat)
        );
        assert_eq!(
            verify_manager_token_at("a..c", "k", 0),
            Err(TokenError::InvalidFormat)
        );
        assert_eq!(
            verify_manager_token_at("a!.b.c", "k", 0),
            Err(TokenError::InvalidFormat)
        );
        assert_eq!(
            verify_manager_token_at("a.b.c", "", 0),
            Err(TokenError::SecretMissing)
        );
    }

    #[test]
    fn truncated_signature_fails_on_length() {
        let t = sign_manager_token(&payload("a", "ns"), "k");
        let truncated = &t[..t.len() - 4];
        assert_eq!(
            verify_manager_token_at(truncated, "k", 0),
            Err(TokenError::InvalidSignature)
        );
    }
}
