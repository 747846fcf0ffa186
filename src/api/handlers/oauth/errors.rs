//! API error taxonomy for the federation endpoints.
//!
//! Every variant has a stable string code. Business errors describe a valid,
//! persisted outcome (the finalizer commits its transaction); only
//! [`ApiError::Unexpected`] rolls back.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::error;
use utoipa::ToSchema;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("authorization invalid")]
    AuthorizationInvalid,
    #[error("state token client does not match the requesting client")]
    ClientMismatch,
    #[error("strategy {0} is not enabled for this instance")]
    StrategyNotEnabled(String),
    #[error("access denied by the identity provider")]
    OAuthAccessDenied,
    #[error("identity provider rejected the redirect uri")]
    InvalidRedirectUri,
    #[error("redirect url {0} is not allowed for this instance")]
    RedirectUrlMismatch(String),
    #[error("token exchange with the identity provider failed: {0}")]
    TokenExchange(String),
    #[error("fetching the external profile failed: {0}")]
    FetchUser(String),
    #[error("identifier not allowed: {0}")]
    IdentifierNotAllowed(String),
    #[error("no account is linked to this external identity")]
    ExternalAccountNotFound,
    #[error("an account already exists for this identity")]
    IdentificationExists,
    #[error("client already has an active session")]
    AlreadySignedIn,
    #[error("user is locked")]
    UserLocked,
    #[error("user is banned")]
    UserBanned,
    #[error("external account already connected")]
    ExternalAccountExists,
    #[error("identification claimed by another user")]
    IdentificationClaimed,
    #[error("no active session")]
    NotSignedIn,
    #[error("cannot remove the last identification of a user")]
    LastIdentification,
    #[error("{0} not found")]
    ResourceNotFound(&'static str),
    #[error("verification failed")]
    VerificationFailed,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct ErrorEntry {
    pub code: String,
    pub message: String,
    pub long_message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct ErrorBody {
    pub errors: Vec<ErrorEntry>,
}

impl ApiError {
    /// Stable machine readable code. Protocol failures all collapse to
    /// `authorization_invalid` so callers cannot tell which check failed.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::AuthorizationInvalid | Self::ClientMismatch => "authorization_invalid",
            Self::StrategyNotEnabled(_) => "strategy_not_enabled",
            Self::OAuthAccessDenied => "oauth_access_denied",
            Self::InvalidRedirectUri => "oauth_invalid_redirect_uri",
            Self::RedirectUrlMismatch(_) => "redirect_url_mismatch",
            Self::TokenExchange(_) => "oauth_token_exchange_error",
            Self::FetchUser(_) => "oauth_fetch_user_error",
            Self::IdentifierNotAllowed(_) => "identifier_not_allowed",
            Self::ExternalAccountNotFound => "external_account_not_found",
            Self::IdentificationExists => "identification_exists",
            Self::AlreadySignedIn => "session_exists",
            Self::UserLocked => "user_locked",
            Self::UserBanned => "user_banned",
            Self::ExternalAccountExists => "external_account_exists",
            Self::IdentificationClaimed => "identification_claimed",
            Self::NotSignedIn => "signed_out",
            Self::LastIdentification => "last_identification",
            Self::ResourceNotFound(_) => "resource_not_found",
            Self::VerificationFailed => "verification_failed",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Unexpected(_) => "internal_error",
        }
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotSignedIn => StatusCode::UNAUTHORIZED,
            Self::UserLocked | Self::UserBanned => StatusCode::FORBIDDEN,
            Self::ResourceNotFound(_) => StatusCode::NOT_FOUND,
            Self::IdentificationExists
            | Self::ExternalAccountExists
            | Self::IdentificationClaimed => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Unexpected(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    /// Known conditions that may commit the surrounding transaction.
    /// A missing record is never one of them.
    #[must_use]
    pub fn is_business(&self) -> bool {
        match self {
            Self::AuthorizationInvalid
            | Self::ClientMismatch
            | Self::StrategyNotEnabled(_)
            | Self::OAuthAccessDenied
            | Self::InvalidRedirectUri
            | Self::RedirectUrlMismatch(_)
            | Self::TokenExchange(_)
            | Self::FetchUser(_)
            | Self::IdentifierNotAllowed(_)
            | Self::ExternalAccountNotFound
            | Self::IdentificationExists
            | Self::AlreadySignedIn
            | Self::UserLocked
            | Self::UserBanned
            | Self::ExternalAccountExists
            | Self::IdentificationClaimed
            | Self::NotSignedIn
            | Self::LastIdentification
            | Self::VerificationFailed
            | Self::InvalidRequest(_) => true,
            Self::ResourceNotFound(_) | Self::Unexpected(_) => false,
        }
    }

    fn message(&self) -> &'static str {
        match self {
            Self::AuthorizationInvalid | Self::ClientMismatch => "Authorization invalid",
            Self::StrategyNotEnabled(_) => "Strategy not enabled",
            Self::OAuthAccessDenied => "Access denied",
            Self::InvalidRedirectUri => "Invalid redirect URI",
            Self::RedirectUrlMismatch(_) => "Redirect URL not allowed",
            Self::TokenExchange(_) => "Token exchange failed",
            Self::FetchUser(_) => "Could not fetch user",
            Self::IdentifierNotAllowed(_) => "Identifier not allowed",
            Self::ExternalAccountNotFound => "External account not found",
            Self::IdentificationExists => "Account already exists",
            Self::AlreadySignedIn => "Already signed in",
            Self::UserLocked => "Account locked",
            Self::UserBanned => "Account banned",
            Self::ExternalAccountExists => "External account exists",
            Self::IdentificationClaimed => "Identification claimed",
            Self::NotSignedIn => "Signed out",
            Self::LastIdentification => "Cannot remove last identification",
            Self::ResourceNotFound(_) => "Not found",
            Self::VerificationFailed => "Verification failed",
            Self::InvalidRequest(_) => "Invalid request",
            Self::Unexpected(_) => "Unexpected error",
        }
    }

    fn long_message(&self) -> String {
        match self {
            Self::AuthorizationInvalid | Self::ClientMismatch => {
                "The authorization could not be completed. Please start over.".to_string()
            }
            Self::ExternalAccountNotFound => {
                "The external account was not found. Continue by signing up.".to_string()
            }
            Self::IdentificationExists => {
                "An account with this identity already exists. Continue by signing in.".to_string()
            }
            Self::AlreadySignedIn => "You're already signed in.".to_string(),
            Self::Unexpected(_) => "An unexpected error occurred.".to_string(),
            other => other.to_string(),
        }
    }

    /// Public error entry. Never includes the internal cause.
    #[must_use]
    pub fn entry(&self) -> ErrorEntry {
        ErrorEntry {
            code: self.code().to_string(),
            message: self.message().to_string(),
            long_message: self.long_message(),
        }
    }

    #[must_use]
    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            errors: vec![self.entry()],
        }
    }

    /// JSON form persisted on a Verification.
    #[must_use]
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self.entry()).unwrap_or(Value::Null)
    }

    /// Internal description persisted alongside the public error.
    #[must_use]
    pub fn cause(&self) -> String {
        format!("{self:#}")
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => Self::ResourceNotFound("record"),
            StoreError::Conflict(message) => Self::Unexpected(anyhow::anyhow!(message)),
            StoreError::Unexpected(err) => Self::Unexpected(err),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let Self::Unexpected(err) = &self {
            error!("unexpected error: {err:#}");
        }
        (self.status(), Json(self.body())).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_mismatch_is_indistinguishable_from_invalid_authorization() {
        assert_eq!(
            ApiError::ClientMismatch.entry(),
            ApiError::AuthorizationInvalid.entry()
        );
    }

    #[test]
    fn only_unexpected_errors_roll_back() {
        assert!(ApiError::ExternalAccountNotFound.is_business());
        assert!(ApiError::AlreadySignedIn.is_business());
        assert!(!ApiError::Unexpected(anyhow::anyhow!("db down")).is_business());
    }

    #[test]
    fn unexpected_error_hides_cause_in_public_entry() {
        let err = ApiError::Unexpected(anyhow::anyhow!("password=hunter2"));
        let json = err.to_json().to_string();
        assert!(!json.contains("hunter2"));
        assert!(err.cause().contains("hunter2"));
    }

    #[test]
    fn store_conflicts_roll_back() {
        let err: ApiError = StoreError::Conflict("dup".to_string()).into();
        assert!(!err.is_business());
        let err: ApiError = StoreError::NotFound.into();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
        assert!(!err.is_business());
        assert!(!ApiError::ResourceNotFound("user").is_business());
    }

    #[test]
    fn body_has_errors_array() {
        let value = serde_json::to_value(ApiError::NotSignedIn.body()).unwrap_or_default();
        assert_eq!(value["errors"][0]["code"], "signed_out");
        assert_eq!(ApiError::NotSignedIn.status(), StatusCode::UNAUTHORIZED);
    }
}
