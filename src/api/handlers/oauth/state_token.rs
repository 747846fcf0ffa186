//! Signed OAuth/SAML state token.
//!
//! The token travels through the identity provider in the `state` parameter
//! and comes back on the callback. It is a compact JWS
//! (`base64url(header).base64url(claims).base64url(signature)`) signed with
//! the instance's Ed25519 key. Nothing in it is persisted; the Verification it
//! points at is the durable half of the flow.

use base64ct::{Base64UrlUnpadded, Encoding};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;
use uuid::Uuid;

const ALG_EDDSA: &str = "EdDSA";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateTokenHeader {
    pub alg: String,
    pub typ: String,
    pub kid: String,
}

impl StateTokenHeader {
    fn eddsa(kid: impl Into<String>) -> Self {
        Self {
            alg: ALG_EDDSA.to_string(),
            typ: "JWT".to_string(),
            kid: kid.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    SignIn,
    SignUp,
    Connect,
    Reauthorize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ClientType {
    #[default]
    Browser,
    Native,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateClaims {
    /// Instance id.
    pub ins: String,
    /// Verification id.
    pub vid: Uuid,
    pub nonce: String,
    pub source_type: SourceType,
    /// SignIn, SignUp or User id, depending on `source_type`.
    pub source_id: Uuid,
    pub client_id: Uuid,
    #[serde(default)]
    pub client_type: ClientType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
    pub redirect_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_complete_redirect_url: Option<String>,
    pub iat: i64,
    pub exp: i64,
}

impl StateClaims {
    #[must_use]
    pub fn is_native(&self) -> bool {
        self.client_type == ClientType::Native
    }
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("invalid token format")]
    TokenFormat,
    #[error("invalid base64url encoding")]
    Base64,
    #[error("invalid json")]
    Json(#[from] serde_json::Error),
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlg(String),
    #[error("invalid signature")]
    InvalidSignature,
    #[error("token expired")]
    TokenExpired,
    #[error("token issued for another instance")]
    InstanceMismatch,
}

fn b64e_json<T: Serialize>(value: &T) -> Result<String, TokenError> {
    let json = serde_json::to_vec(value)?;
    Ok(Base64UrlUnpadded::encode_string(&json))
}

fn b64d_json<T: for<'de> Deserialize<'de>>(s: &str) -> Result<T, TokenError> {
    let bytes = Base64UrlUnpadded::decode_vec(s).map_err(|_| TokenError::Base64)?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Sign the claims into a state token.
///
/// # Errors
/// Returns an error if the header or claims cannot be serialized.
pub fn encode(
    claims: &StateClaims,
    signing_key: &SigningKey,
    kid: impl Into<String>,
) -> Result<String, TokenError> {
    let header_b64 = b64e_json(&StateTokenHeader::eddsa(kid))?;
    let claims_b64 = b64e_json(claims)?;
    let signing_input = format!("{header_b64}.{claims_b64}");
    let signature: Signature = signing_key.sign(signing_input.as_bytes());
    let signature_b64 = Base64UrlUnpadded::encode_string(&signature.to_bytes());
    Ok(format!("{signing_input}.{signature_b64}"))
}

/// Verify a state token and return its claims.
///
/// The signature is checked before any claim is trusted; expiry and instance
/// scope are checked afterwards.
///
/// # Errors
/// Any malformed part, a bad signature, an expired token, or a token issued
/// for a different instance.
pub fn decode(
    token: &str,
    verifying_key: &VerifyingKey,
    instance_id: &str,
    now_unix_seconds: i64,
) -> Result<StateClaims, TokenError> {
    let mut parts = token.split('.');
    let header_b64 = parts.next().ok_or(TokenError::TokenFormat)?;
    let claims_b64 = parts.next().ok_or(TokenError::TokenFormat)?;
    let sig_b64 = parts.next().ok_or(TokenError::TokenFormat)?;
    if parts.next().is_some() {
        return Err(TokenError::TokenFormat);
    }

    let header: StateTokenHeader = b64d_json(header_b64)?;
    if header.alg != ALG_EDDSA {
        return Err(TokenError::UnsupportedAlg(header.alg));
    }

    let sig_bytes = Base64UrlUnpadded::decode_vec(sig_b64).map_err(|_| TokenError::Base64)?;
    let signature =
        Signature::from_slice(&sig_bytes).map_err(|_| TokenError::InvalidSignature)?;
    let signing_input = format!("{header_b64}.{claims_b64}");
    verifying_key
        .verify_strict(signing_input.as_bytes(), &signature)
        .map_err(|_| TokenError::InvalidSignature)?;

    let claims: StateClaims = b64d_json(claims_b64)?;
    if now_unix_seconds >= claims.exp {
        return Err(TokenError::TokenExpired);
    }
    if claims.ins != instance_id {
        return Err(TokenError::InstanceMismatch);
    }
    Ok(claims)
}
