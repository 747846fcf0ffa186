//! Identity provider clients.
//!
//! The callback only needs a normalized [`UserProfile`]; how a provider gets
//! there (OAuth2 code exchange, OAuth1 request-token exchange, SAML assertion)
//! is hidden behind [`IdentityProvider`].

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::Client as HttpClient;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::{collections::HashMap, path::Path, sync::Arc};
use thiserror::Error;
use tracing::debug;
use url::Url;

use super::errors::ApiError;
use crate::{
    APP_USER_AGENT,
    store::models::{IdentificationType, OAuth1RequestToken},
};

/// External profile normalized across providers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserProfile {
    /// Provider id without the `oauth_` prefix, e.g. `google`.
    pub provider: String,
    pub provider_user_id: String,
    pub email_address: String,
    pub email_address_verified: bool,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub username: Option<String>,
    pub avatar_url: Option<String>,
    pub approved_scopes: Vec<String>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub token_expires_at: Option<DateTime<Utc>>,
}

impl UserProfile {
    /// Identification type of the external identity (`oauth_<provider>` or `saml`).
    #[must_use]
    pub fn identification_type(&self) -> IdentificationType {
        if self.provider == "saml" {
            IdentificationType::Saml
        } else {
            IdentificationType::OAuth(self.provider.clone())
        }
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("token exchange failed: {0}")]
    TokenExchange(String),
    #[error("fetching user failed: {0}")]
    FetchUser(String),
    #[error("access denied by provider")]
    AccessDenied,
    #[error("provider reported redirect uri mismatch")]
    RedirectUriMismatch,
    #[error("provider reported error: {0}")]
    Reported(String),
    #[error("provider does not support {0}")]
    Unsupported(&'static str),
}

impl From<ProviderError> for ApiError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::TokenExchange(cause) => Self::TokenExchange(cause),
            ProviderError::FetchUser(cause) => Self::FetchUser(cause),
            ProviderError::AccessDenied => Self::OAuthAccessDenied,
            ProviderError::RedirectUriMismatch => Self::InvalidRedirectUri,
            ProviderError::Reported(code) => Self::FetchUser(format!("provider error {code}")),
            ProviderError::Unsupported(what) => {
                Self::Unexpected(anyhow::anyhow!("provider does not support {what}"))
            }
        }
    }
}

/// Map an `error` query parameter returned by a provider.
#[must_use]
pub fn classify_provider_error(code: &str) -> ProviderError {
    match code {
        "access_denied" | "user_cancelled_login" | "user_denied" => ProviderError::AccessDenied,
        "redirect_uri_mismatch" | "invalid_redirect_uri" => ProviderError::RedirectUriMismatch,
        other => ProviderError::Reported(other.to_string()),
    }
}

/// Raw parameters the provider sent back on the callback.
#[derive(Debug, Clone, Default)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub oauth_token: Option<String>,
    pub oauth_verifier: Option<String>,
    pub scope: Option<String>,
    pub saml_response: Option<String>,
}

#[derive(Debug)]
pub enum ProviderOutcome {
    Profile(UserProfile),
    /// The provider needs another round trip (SAML IdP redirect).
    Redirect(Url),
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Provider id, e.g. `google`.
    fn id(&self) -> &str;

    /// Strategy name used in instance settings and identification types.
    fn strategy(&self) -> String {
        format!("oauth_{}", self.id())
    }

    fn is_oauth1(&self) -> bool {
        false
    }

    /// Fetch an OAuth1 request token before redirecting to the provider.
    async fn request_token(&self) -> Result<OAuth1RequestToken, ProviderError> {
        Err(ProviderError::Unsupported("oauth1 request tokens"))
    }

    /// Where to send the browser to start the flow.
    ///
    /// # Errors
    /// Returns an error if the configured endpoint is not a valid URL.
    fn authorize_url(
        &self,
        state: &str,
        scopes: &[String],
        request_token: Option<&OAuth1RequestToken>,
    ) -> Result<Url, ProviderError>;

    /// Exchange the callback parameters for a profile.
    async fn fetch_user(
        &self,
        params: &CallbackParams,
        request_token: Option<OAuth1RequestToken>,
    ) -> Result<ProviderOutcome, ProviderError>;
}

/// Providers keyed by strategy (`oauth_google`).
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn IdentityProvider>>,
}

impl ProviderRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_provider(mut self, provider: Arc<dyn IdentityProvider>) -> Self {
        self.providers.insert(provider.strategy(), provider);
        self
    }

    #[must_use]
    pub fn get(&self, strategy: &str) -> Option<Arc<dyn IdentityProvider>> {
        self.providers.get(strategy).cloned()
    }

    pub fn strategies(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }

    /// Load OAuth2 providers from a JSON file (an array of provider configs).
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read providers file {}", path.display()))?;
        let configs: Vec<OAuth2ProviderConfig> =
            serde_json::from_str(&raw).context("failed to parse providers file")?;
        let http = HttpClient::builder()
            .user_agent(APP_USER_AGENT)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("failed to build provider http client")?;
        let mut registry = Self::new();
        for config in configs {
            registry = registry.with_provider(Arc::new(OAuth2Provider::new(config, http.clone())));
        }
        Ok(registry)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OAuth2ProviderConfig {
    pub id: String,
    pub client_id: String,
    pub client_secret: String,
    pub authorize_url: String,
    pub token_url: String,
    pub userinfo_url: String,
    /// Callback URL registered with the provider.
    pub callback_url: String,
    #[serde(default)]
    pub default_scopes: Vec<String>,
}

/// Generic OAuth2 / OIDC provider: authorization code exchange followed by a
/// userinfo request.
pub struct OAuth2Provider {
    id: String,
    client_id: String,
    client_secret: SecretString,
    authorize_url: String,
    token_url: String,
    userinfo_url: String,
    callback_url: String,
    default_scopes: Vec<String>,
    http: HttpClient,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    scope: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OidcUserInfo {
    sub: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    email_verified: Option<bool>,
    #[serde(default)]
    given_name: Option<String>,
    #[serde(default)]
    family_name: Option<String>,
    #[serde(default)]
    preferred_username: Option<String>,
    #[serde(default)]
    picture: Option<String>,
}

impl OAuth2Provider {
    #[must_use]
    pub fn new(config: OAuth2ProviderConfig, http: HttpClient) -> Self {
        Self {
            id: config.id,
            client_id: config.client_id,
            client_secret: SecretString::from(config.client_secret),
            authorize_url: config.authorize_url,
            token_url: config.token_url,
            userinfo_url: config.userinfo_url,
            callback_url: config.callback_url,
            default_scopes: config.default_scopes,
            http,
        }
    }

    async fn exchange_code(&self, code: &str) -> Result<TokenResponse, ProviderError> {
        let form = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.callback_url.as_str()),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.expose_secret()),
        ];
        let response = self
            .http
            .post(&self.token_url)
            .header("Accept", "application/json")
            .form(&form)
            .send()
            .await
            .map_err(|err| ProviderError::TokenExchange(err.to_string()))?;
        if !response.status().is_success() {
            return Err(ProviderError::TokenExchange(format!(
                "token endpoint returned {}",
                response.status()
            )));
        }
        response
            .json::<TokenResponse>()
            .await
            .map_err(|err| ProviderError::TokenExchange(err.to_string()))
    }

    async fn userinfo(&self, access_token: &str) -> Result<OidcUserInfo, ProviderError> {
        let response = self
            .http
            .get(&self.userinfo_url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|err| ProviderError::FetchUser(err.to_string()))?;
        if !response.status().is_success() {
            return Err(ProviderError::FetchUser(format!(
                "userinfo endpoint returned {}",
                response.status()
            )));
        }
        response
            .json::<OidcUserInfo>()
            .await
            .map_err(|err| ProviderError::FetchUser(err.to_string()))
    }
}

#[async_trait]
impl IdentityProvider for OAuth2Provider {
    fn id(&self) -> &str {
        &self.id
    }

    fn authorize_url(
        &self,
        state: &str,
        scopes: &[String],
        _request_token: Option<&OAuth1RequestToken>,
    ) -> Result<Url, ProviderError> {
        let scopes = if scopes.is_empty() {
            self.default_scopes.as_slice()
        } else {
            scopes
        };
        let mut url = Url::parse(&self.authorize_url)
            .map_err(|err| ProviderError::Reported(format!("invalid authorize url: {err}")))?;
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.client_id)
            .append_pair("redirect_uri", &self.callback_url)
            .append_pair("scope", &scopes.join(" "))
            .append_pair("state", state);
        Ok(url)
    }

    async fn fetch_user(
        &self,
        params: &CallbackParams,
        _request_token: Option<OAuth1RequestToken>,
    ) -> Result<ProviderOutcome, ProviderError> {
        let code = params
            .code
            .as_deref()
            .ok_or_else(|| ProviderError::TokenExchange("missing code".to_string()))?;
        let token = self.exchange_code(code).await?;
        let info = self.userinfo(&token.access_token).await?;
        debug!(provider = %self.id, "fetched external profile");

        let scope = token.scope.or_else(|| params.scope.clone()).unwrap_or_default();
        Ok(ProviderOutcome::Profile(UserProfile {
            provider: self.id.clone(),
            provider_user_id: info.sub,
            email_address: info.email.unwrap_or_default().trim().to_lowercase(),
            email_address_verified: info.email_verified.unwrap_or(false),
            first_name: info.given_name,
            last_name: info.family_name,
            username: info.preferred_username,
            avatar_url: info.picture,
            approved_scopes: scope
                .split([' ', ','])
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            access_token: Some(token.access_token),
            refresh_token: token.refresh_token,
            token_expires_at: token
                .expires_in
                .map(|seconds| Utc::now() + Duration::seconds(seconds)),
        }))
    }
}
