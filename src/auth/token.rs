//! Bearer token inspection.
//!
//! Tokens are JWT-shaped (`header.payload.signature`). Only the payload is
//! read and the signature is never checked here: the backend verifies
//! signatures, the console only needs the expiry to decide when to refresh.

use base64::Engine;
use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, NO_PAD};
use base64::engine::DecodePaddingMode;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Default safety margin subtracted from a token's `exp`.
pub const DEFAULT_EXPIRY_MARGIN_MS: i64 = 5_000;

/// URL-safe alphabet that accepts payloads with or without `=` padding.
const URL_SAFE_LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    NO_PAD.with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Claims carried in a token payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Expiry, seconds since the Unix epoch.
    #[serde(default)]
    pub exp: Option<f64>,
    /// Subject (the provider's user id).
    #[serde(default)]
    pub sub: Option<String>,
    /// Everything else in the payload.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Decode the payload segment of a token.
///
/// Returns `None` for anything that is not exactly three dot-separated
/// segments whose middle one is base64url-encoded JSON object.
pub fn decode(token: &str) -> Option<TokenClaims> {
    let mut parts = token.split('.');
    let (_header, payload, _signature) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() || payload.is_empty() {
        return None;
    }

    let bytes = URL_SAFE_LENIENT.decode(payload).ok()?;
    let value: Value = serde_json::from_slice(&bytes).ok()?;
    if !value.is_object() {
        return None;
    }
    serde_json::from_value(value).ok()
}

/// Expiry of `token` in milliseconds since the epoch, or `0` when unknown.
pub fn expires_at_ms(token: &str) -> i64 {
    decode(token)
        .and_then(|claims| claims.exp)
        .filter(|exp| exp.is_finite())
        .map(|exp| (exp * 1000.0) as i64)
        .unwrap_or(0)
}

/// Whether `token` should be treated as expired right now.
pub fn is_expired(token: Option<&str>, margin_ms: i64) -> bool {
    is_expired_at(token, margin_ms, now_ms())
}

/// Whether `token` should be treated as expired at `now_ms`.
///
/// A missing token, or one without a decodable `exp`, is always expired.
pub fn is_expired_at(token: Option<&str>, margin_ms: i64, now_ms: i64) -> bool {
    let Some(token) = token else {
        return true;
    };

    let expires_at = expires_at_ms(token);
    if expires_at == 0 {
        return true;
    }

    now_ms >= expires_at - margin_ms
}

/// Milliseconds until `token` enters its margin, clamped at zero.
pub fn millis_until_expiry(token: &str, margin_ms: i64, now_ms: i64) -> u64 {
    (expires_at_ms(token) - now_ms - margin_ms).max(0) as u64
}

/// Current wall-clock time in milliseconds since the epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Build an unsigned JWT-shaped token expiring at `exp` (seconds).
#[cfg(test)]
pub(crate) fn mint_token(exp: i64) -> String {
    mint_token_with(serde_json::json!({ "exp": exp, "sub": "user-1" }))
}

/// Build an unsigned JWT-shaped token around an arbitrary payload.
#[cfg(test)]
pub(crate) fn mint_token_with(payload: Value) -> String {
    let header = URL_SAFE_LENIENT.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let body = URL_SAFE_LENIENT.encode(payload.to_string());
    format!("{header}.{body}.sig")
}
