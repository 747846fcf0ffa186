//! Token generation and cookie helpers shared by the federation handlers.

use anyhow::{Context, Result};
use axum::http::{
    HeaderMap, HeaderValue,
    header::{AUTHORIZATION, COOKIE, InvalidHeaderValue},
};
use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::{DateTime, Utc};
use rand::{RngCore, rngs::OsRng};

use super::{errors::ApiError, state::InstanceConfig};
use crate::store::{
    StoreTx,
    models::{Client, Session},
};

pub const CLIENT_COOKIE_NAME: &str = "__client";
pub const CSRF_COOKIE_NAME: &str = "__csrf";

/// Random URL-safe token (rotating client tokens, nonces, CSRF tokens).
pub fn generate_token() -> Result<String> {
    let mut bytes = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("failed to generate random token")?;
    Ok(Base64UrlUnpadded::encode_string(&bytes))
}

pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.to_string())
        .filter(|value| !value.is_empty())
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then(|| token.to_string())
}

/// Client rotating token from the `__client` cookie, or the bearer header
/// native clients send instead.
pub fn client_token(headers: &HeaderMap) -> Option<String> {
    cookie_value(headers, CLIENT_COOKIE_NAME).or_else(|| bearer_token(headers))
}

/// Build a cookie scoped to the instance.
pub fn build_cookie(
    instance: &InstanceConfig,
    name: &str,
    value: &str,
    max_age_seconds: i64,
    http_only: bool,
) -> Result<HeaderValue, InvalidHeaderValue> {
    let mut cookie = format!("{name}={value}; Path=/; SameSite=Lax; Max-Age={max_age_seconds}");
    if http_only {
        cookie.push_str("; HttpOnly");
    }
    if let Some(domain) = instance.cookie_domain() {
        cookie.push_str("; Domain=");
        cookie.push_str(domain);
    }
    if instance.secure_cookies() {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie)
}

/// Resolve the requesting client and its active session.
///
/// # Errors
/// `NotSignedIn` when the client is unknown or has no active session.
pub async fn authenticate(
    tx: &mut dyn StoreTx,
    instance: &InstanceConfig,
    headers: &HeaderMap,
    now: DateTime<Utc>,
) -> Result<(Client, Session), ApiError> {
    let token = client_token(headers).ok_or(ApiError::NotSignedIn)?;
    let client = tx
        .client_by_rotating_token(instance.id(), &token)
        .await?
        .ok_or(ApiError::NotSignedIn)?;
    let session_id = client.last_active_session_id.ok_or(ApiError::NotSignedIn)?;
    let session = tx
        .session(session_id)
        .await?
        .filter(|session| session.is_active(now))
        .ok_or(ApiError::NotSignedIn)?;
    Ok((client, session))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::handlers::oauth::state::Environment;
    use ed25519_dalek::SigningKey;

    #[test]
    fn generated_tokens_are_unique_and_url_safe() -> Result<()> {
        let a = generate_token()?;
        let b = generate_token()?;
        assert_ne!(a, b);
        assert_eq!(a.len(), 43);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        Ok(())
    }

    #[test]
    fn reads_cookie_among_many() {
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_static("theme=dark; __client=abc123; __csrf=zzz"),
        );
        assert_eq!(cookie_value(&headers, "__client").as_deref(), Some("abc123"));
        assert_eq!(cookie_value(&headers, "missing"), None);
    }

    #[test]
    fn falls_back_to_bearer_token() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer native-token"));
        assert_eq!(client_token(&headers).as_deref(), Some("native-token"));
    }

    #[test]
    fn production_cookies_are_secure_and_scoped() -> anyhow::Result<()> {
        let instance = InstanceConfig::new(
            "ins_test",
            Environment::Production,
            SigningKey::from_bytes(&[9; 32]),
        )
        .with_cookie_domain(Some("example.com".to_string()));
        let cookie = build_cookie(&instance, CLIENT_COOKIE_NAME, "tok", 60, true)?;
        let cookie = cookie.to_str()?;
        assert!(cookie.starts_with("__client=tok; Path=/"));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("Domain=example.com"));
        assert!(cookie.ends_with("; Secure"));
        Ok(())
    }
}
