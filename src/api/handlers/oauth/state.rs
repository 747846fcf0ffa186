//! Instance configuration and shared handler state.

use anyhow::{Result, anyhow};
use chrono::Duration;
use ed25519_dalek::{SigningKey, VerifyingKey};
use std::{fmt, str::FromStr, sync::Arc};
use url::Url;

use super::{providers::ProviderRegistry, restrictions::Restrictions};
use crate::store::Store;

const DEFAULT_SESSION_LIFETIME_SECONDS: i64 = 7 * 24 * 60 * 60;
const DEFAULT_SESSION_INACTIVITY_SECONDS: i64 = 24 * 60 * 60;
// Outlives the verification so an expired flow still decodes and can be
// redirected back instead of rejected.
const DEFAULT_STATE_TOKEN_TTL_SECONDS: i64 = 60 * 60;
const DEFAULT_KEY_ID: &str = "state-1";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Environment {
    Production,
    Development,
    Staging,
}

impl Environment {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Production => "production",
            Self::Development => "development",
            Self::Staging => "staging",
        }
    }

    #[must_use]
    pub fn is_production(self) -> bool {
        self == Self::Production
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "production" | "prod" => Ok(Self::Production),
            "development" | "dev" => Ok(Self::Development),
            "staging" => Ok(Self::Staging),
            other => Err(anyhow!("unknown environment: {other}")),
        }
    }
}

/// Settings of the single instance this process serves.
#[derive(Clone)]
pub struct InstanceConfig {
    id: String,
    environment: Environment,
    signing_key: SigningKey,
    key_id: String,
    strategies: Vec<String>,
    allowed_redirect_urls: Vec<Url>,
    single_session_mode: bool,
    session_lifetime: Duration,
    session_inactivity_timeout: Duration,
    state_token_ttl: Duration,
    cookie_domain: Option<String>,
    dev_cookie_hop_url: Option<String>,
    secure_cookies: bool,
}

impl fmt::Debug for InstanceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceConfig")
            .field("id", &self.id)
            .field("environment", &self.environment)
            .field("key_id", &self.key_id)
            .field("strategies", &self.strategies)
            .field("single_session_mode", &self.single_session_mode)
            .finish_non_exhaustive()
    }
}

impl InstanceConfig {
    #[must_use]
    pub fn new(id: impl Into<String>, environment: Environment, signing_key: SigningKey) -> Self {
        Self {
            id: id.into(),
            environment,
            signing_key,
            key_id: DEFAULT_KEY_ID.to_string(),
            strategies: Vec::new(),
            allowed_redirect_urls: Vec::new(),
            single_session_mode: false,
            session_lifetime: Duration::seconds(DEFAULT_SESSION_LIFETIME_SECONDS),
            session_inactivity_timeout: Duration::seconds(DEFAULT_SESSION_INACTIVITY_SECONDS),
            state_token_ttl: Duration::seconds(DEFAULT_STATE_TOKEN_TTL_SECONDS),
            cookie_domain: None,
            dev_cookie_hop_url: None,
            secure_cookies: environment.is_production(),
        }
    }

    #[must_use]
    pub fn with_key_id(mut self, key_id: impl Into<String>) -> Self {
        self.key_id = key_id.into();
        self
    }

    #[must_use]
    pub fn with_strategies(mut self, strategies: Vec<String>) -> Self {
        self.strategies = strategies;
        self
    }

    /// Redirect URLs that cannot be parsed are dropped.
    #[must_use]
    pub fn with_allowed_redirect_urls(mut self, urls: &[String]) -> Self {
        self.allowed_redirect_urls = urls.iter().filter_map(|url| Url::parse(url).ok()).collect();
        self
    }

    #[must_use]
    pub fn with_single_session_mode(mut self, enabled: bool) -> Self {
        self.single_session_mode = enabled;
        self
    }

    #[must_use]
    pub fn with_session_lifetime_seconds(mut self, seconds: i64) -> Self {
        self.session_lifetime = Duration::seconds(seconds);
        self
    }

    #[must_use]
    pub fn with_session_inactivity_seconds(mut self, seconds: i64) -> Self {
        self.session_inactivity_timeout = Duration::seconds(seconds);
        self
    }

    #[must_use]
    pub fn with_cookie_domain(mut self, domain: Option<String>) -> Self {
        self.cookie_domain = domain;
        self
    }

    #[must_use]
    pub fn with_dev_cookie_hop_url(mut self, url: Option<String>) -> Self {
        self.dev_cookie_hop_url = url;
        self
    }

    #[must_use]
    pub fn with_secure_cookies(mut self, secure: bool) -> Self {
        self.secure_cookies = secure;
        self
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn environment(&self) -> Environment {
        self.environment
    }

    #[must_use]
    pub fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    #[must_use]
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    #[must_use]
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    #[must_use]
    pub fn is_strategy_enabled(&self, strategy: &str) -> bool {
        self.strategies.iter().any(|enabled| enabled == strategy)
    }

    #[must_use]
    pub fn single_session_mode(&self) -> bool {
        self.single_session_mode
    }

    #[must_use]
    pub fn session_lifetime(&self) -> Duration {
        self.session_lifetime
    }

    #[must_use]
    pub fn session_inactivity_timeout(&self) -> Duration {
        self.session_inactivity_timeout
    }

    #[must_use]
    pub fn state_token_ttl(&self) -> Duration {
        self.state_token_ttl
    }

    #[must_use]
    pub fn cookie_domain(&self) -> Option<&str> {
        self.cookie_domain.as_deref()
    }

    #[must_use]
    pub fn dev_cookie_hop_url(&self) -> Option<&str> {
        self.dev_cookie_hop_url.as_deref()
    }

    #[must_use]
    pub fn secure_cookies(&self) -> bool {
        self.secure_cookies
    }

    /// A URL is allowed when it shares scheme, host and port with a
    /// registered URL and its path is the registered path or lies below it.
    #[must_use]
    pub fn is_redirect_url_allowed(&self, candidate: &str) -> bool {
        let Ok(candidate) = Url::parse(candidate) else {
            return false;
        };
        self.allowed_redirect_urls.iter().any(|allowed| {
            allowed.scheme() == candidate.scheme()
                && allowed.host_str() == candidate.host_str()
                && allowed.port_or_known_default() == candidate.port_or_known_default()
                && path_within(allowed.path(), candidate.path())
        })
    }

    /// Production instances only redirect to registered URLs; development and
    /// staging instances accept any URL.
    #[must_use]
    pub fn is_redirect_url_trusted(&self, candidate: &str) -> bool {
        !self.environment.is_production() || self.is_redirect_url_allowed(candidate)
    }
}

/// `/callback` covers `/callback` and `/callback/...` but not `/callbackevil`.
fn path_within(registered: &str, candidate: &str) -> bool {
    match candidate.strip_prefix(registered) {
        Some(rest) => rest.is_empty() || registered.ends_with('/') || rest.starts_with('/'),
        None => false,
    }
}

/// Shared state for the federation handlers.
pub struct OAuthState {
    instance: InstanceConfig,
    store: Arc<dyn Store>,
    providers: ProviderRegistry,
    restrictions: Restrictions,
}

impl OAuthState {
    #[must_use]
    pub fn new(
        instance: InstanceConfig,
        store: Arc<dyn Store>,
        providers: ProviderRegistry,
        restrictions: Restrictions,
    ) -> Self {
        Self {
            instance,
            store,
            providers,
            restrictions,
        }
    }

    #[must_use]
    pub fn instance(&self) -> &InstanceConfig {
        &self.instance
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    #[must_use]
    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    #[must_use]
    pub fn restrictions(&self) -> &Restrictions {
        &self.restrictions
    }
}
