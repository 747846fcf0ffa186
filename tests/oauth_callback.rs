//! End-to-end federation flows through the HTTP router, backed by the
//! in-memory store and a scripted identity provider.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use authgate::{
    api::{
        self, ServerConfig,
        handlers::oauth::{
            providers::{
                CallbackParams, IdentityProvider, ProviderError, ProviderOutcome,
                ProviderRegistry, UserProfile,
            },
            restrictions::Restrictions,
            state::{Environment, InstanceConfig, OAuthState},
            state_token::{self, StateClaims},
        },
    },
    store::{
        Store,
        memory::{MemoryState, MemoryStore},
        models::{
            Identification, IdentificationStatus, IdentificationType, JobKind, OAuth1RequestToken,
            SessionStatus, User, VerificationStatus,
        },
    },
};
use axum::{
    Router,
    body::Body,
    http::{
        Request, Response, StatusCode,
        header::{CONTENT_TYPE, COOKIE, LOCATION, SET_COOKIE},
    },
};
use chrono::{Duration, Utc};
use ed25519_dalek::SigningKey;
use http_body_util::BodyExt;
use serde_json::{Value, json};
use std::sync::Arc;
use tower::ServiceExt;
use url::Url;
use uuid::Uuid;

const INSTANCE: &str = "ins_e2e";
const EMAIL: &str = "jane@example.com";
const REDIRECT_URL: &str = "https://app.example.com/sso/done";

/// Provider that returns a fixed profile for any callback.
struct ScriptedProvider {
    profile: UserProfile,
}

#[async_trait]
impl IdentityProvider for ScriptedProvider {
    fn id(&self) -> &str {
        "google"
    }

    fn authorize_url(
        &self,
        state: &str,
        _scopes: &[String],
        _request_token: Option<&OAuth1RequestToken>,
    ) -> Result<Url, ProviderError> {
        let mut url = Url::parse("https://accounts.example.com/o/oauth2/auth")
            .map_err(|err| ProviderError::Reported(err.to_string()))?;
        url.query_pairs_mut().append_pair("state", state);
        Ok(url)
    }

    async fn fetch_user(
        &self,
        params: &CallbackParams,
        _request_token: Option<OAuth1RequestToken>,
    ) -> Result<ProviderOutcome, ProviderError> {
        if params.code.is_none() {
            return Err(ProviderError::TokenExchange("missing code".to_string()));
        }
        Ok(ProviderOutcome::Profile(self.profile.clone()))
    }
}

struct TestApp {
    store: MemoryStore,
    instance: InstanceConfig,
    router: Router,
}

impl TestApp {
    fn new() -> Result<Self> {
        let store = MemoryStore::new();
        let instance = InstanceConfig::new(
            INSTANCE,
            Environment::Production,
            SigningKey::from_bytes(&[3u8; 32]),
        )
        .with_strategies(vec!["oauth_google".to_string()])
        .with_allowed_redirect_urls(&["https://app.example.com/sso".to_string()]);
        let providers = ProviderRegistry::new().with_provider(Arc::new(ScriptedProvider {
            profile: UserProfile {
                provider: "google".to_string(),
                provider_user_id: "g-123".to_string(),
                email_address: EMAIL.to_string(),
                email_address_verified: true,
                first_name: Some("Jane".to_string()),
                access_token: Some("access-1".to_string()),
                ..UserProfile::default()
            },
        }));
        let state = Arc::new(OAuthState::new(
            instance.clone(),
            Arc::new(store.clone()),
            providers,
            Restrictions::new(),
        ));
        let router = api::app(state, &ServerConfig::new(0))?;
        Ok(Self {
            store,
            instance,
            router,
        })
    }

    async fn send(&self, request: Request<Body>) -> Result<Response<Body>> {
        Ok(self.router.clone().oneshot(request).await?)
    }

    /// Seed a user owning the email and the Google identity.
    async fn linked_user(&self) -> Result<User> {
        let now = Utc::now();
        let mut user = User::new(INSTANCE, now);
        let mut email = Identification::new(
            INSTANCE,
            IdentificationType::EmailAddress,
            EMAIL,
            IdentificationStatus::Verified,
            now,
        );
        email.user_id = Some(user.id);
        user.primary_email_address_id = Some(email.id);
        let mut google = Identification::new(
            INSTANCE,
            IdentificationType::OAuth("google".to_string()),
            "g-123",
            IdentificationStatus::Verified,
            now,
        );
        google.user_id = Some(user.id);

        let mut tx = self.store.begin().await?;
        tx.save_user(&user).await?;
        tx.save_identification(&email).await?;
        tx.save_identification(&google).await?;
        tx.commit().await?;
        Ok(user)
    }

    /// Start a flow and return the response body plus the client cookie.
    async fn authorize(&self, body: Value) -> Result<(Value, Option<String>)> {
        let response = self
            .send(
                Request::post("/v1/oauth/authorize")
                    .header(CONTENT_TYPE, "application/json")
                    .body(Body::from(body.to_string()))?,
            )
            .await?;
        assert_eq!(response.status(), StatusCode::OK);
        let cookie = response
            .headers()
            .get(SET_COOKIE)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(';').next())
            .map(str::to_string);
        Ok((json_body(response).await?, cookie))
    }

    async fn callback(&self, state: &str, cookie: Option<&str>) -> Result<Response<Body>> {
        self.callback_with(&format!("state={state}&code=auth-code"), cookie)
            .await
    }

    async fn callback_with(&self, query: &str, cookie: Option<&str>) -> Result<Response<Body>> {
        let mut request = Request::get(format!("/v1/oauth_callback?{query}"));
        if let Some(cookie) = cookie {
            request = request.header(COOKIE, cookie);
        }
        self.send(request.body(Body::empty())?).await
    }

    /// Re-sign an issued state token after changing its claims.
    fn resign(&self, state: &str, change: impl FnOnce(&mut StateClaims)) -> Result<String> {
        let mut claims = state_token::decode(
            state,
            &self.instance.verifying_key(),
            INSTANCE,
            Utc::now().timestamp(),
        )?;
        change(&mut claims);
        Ok(state_token::encode(
            &claims,
            self.instance.signing_key(),
            self.instance.key_id(),
        )?)
    }
}

fn browser_sign_in() -> Value {
    json!({
        "strategy": "oauth_google",
        "source_type": "sign_in",
        "redirect_url": REDIRECT_URL,
    })
}

async fn json_body(response: Response<Body>) -> Result<Value> {
    let bytes = response.into_body().collect().await?.to_bytes();
    Ok(serde_json::from_slice(&bytes)?)
}

fn state_param(body: &Value) -> Result<String> {
    let url = body["external_verification_redirect_url"]
        .as_str()
        .context("missing provider url")?;
    Url::parse(url)?
        .query_pairs()
        .find(|(key, _)| key == "state")
        .map(|(_, value)| value.into_owned())
        .ok_or_else(|| anyhow!("provider url without state"))
}

fn location(response: &Response<Body>) -> Result<Url> {
    let location = response
        .headers()
        .get(LOCATION)
        .context("missing location")?
        .to_str()?;
    Ok(Url::parse(location)?)
}

fn query_value(url: &Url, key: &str) -> Option<String> {
    url.query_pairs()
        .find(|(name, _)| name == key)
        .map(|(_, value)| value.into_owned())
}

fn verification_id(body: &Value) -> Result<Uuid> {
    Ok(body["verification_id"]
        .as_str()
        .context("missing verification_id")?
        .parse()?)
}

fn session_jobs(state: &MemoryState) -> usize {
    state
        .jobs
        .values()
        .filter(|job| job.kind == JobKind::SessionCreated)
        .count()
}

#[tokio::test]
async fn unknown_account_redirects_with_transfer() -> Result<()> {
    let app = TestApp::new()?;
    let (body, cookie) = app.authorize(browser_sign_in()).await?;
    let state = state_param(&body)?;

    let response = app.callback(&state, cookie.as_deref()).await?;

    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    let target = location(&response)?;
    assert_eq!(target.as_str(), REDIRECT_URL);
    assert!(query_value(&target, "created_session_id").is_none());

    let snapshot = app.store.snapshot().await;
    let verification = &snapshot.verifications[&verification_id(&body)?];
    assert!(verification.account_transfer_id.is_some());
    let error = verification.error.clone().unwrap_or_default();
    assert_eq!(error["code"], "external_account_not_found");
    assert!(snapshot.sessions.is_empty());
    Ok(())
}

#[tokio::test]
async fn linked_account_creates_session_and_replay_does_not() -> Result<()> {
    let app = TestApp::new()?;
    let user = app.linked_user().await?;
    let (body, cookie) = app.authorize(browser_sign_in()).await?;
    let state = state_param(&body)?;

    let response = app.callback(&state, cookie.as_deref()).await?;

    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    let target = location(&response)?;
    let session_id: Uuid = query_value(&target, "created_session_id")
        .context("missing created_session_id")?
        .parse()?;
    let cookies: Vec<_> = response.headers().get_all(SET_COOKIE).iter().collect();
    assert_eq!(cookies.len(), 2);

    let snapshot = app.store.snapshot().await;
    let session = &snapshot.sessions[&session_id];
    assert_eq!(session.user_id, user.id);
    assert_eq!(session.status, SessionStatus::Active);
    assert_eq!(session_jobs(&snapshot), 1);
    let verification = &snapshot.verifications[&verification_id(&body)?];
    assert_eq!(verification.status(Utc::now()), VerificationStatus::Verified);

    // Same state token again: redirected, no second session.
    let replay = app.callback(&state, cookie.as_deref()).await?;
    assert_eq!(replay.status(), StatusCode::SEE_OTHER);
    assert!(query_value(&location(&replay)?, "created_session_id").is_none());

    let snapshot = app.store.snapshot().await;
    assert_eq!(snapshot.sessions.len(), 1);
    assert_eq!(session_jobs(&snapshot), 1);
    Ok(())
}

#[tokio::test]
async fn concurrent_replay_creates_one_session() -> Result<()> {
    let app = TestApp::new()?;
    app.linked_user().await?;
    let (body, cookie) = app.authorize(browser_sign_in()).await?;
    let state = state_param(&body)?;

    let (first, second) = tokio::join!(
        app.callback(&state, cookie.as_deref()),
        app.callback(&state, cookie.as_deref())
    );
    let mut statuses = vec![first?.status(), second?.status()];
    statuses.sort_by_key(|status| status.as_u16());

    assert_eq!(
        statuses,
        vec![StatusCode::SEE_OTHER, StatusCode::TEMPORARY_REDIRECT]
    );
    let snapshot = app.store.snapshot().await;
    assert_eq!(snapshot.sessions.len(), 1);
    assert_eq!(session_jobs(&snapshot), 1);
    assert_eq!(snapshot.verifications[&verification_id(&body)?].attempts, 2);
    Ok(())
}

#[tokio::test]
async fn expired_verification_redirects_without_error() -> Result<()> {
    let app = TestApp::new()?;
    app.linked_user().await?;
    let (body, cookie) = app.authorize(browser_sign_in()).await?;
    let state = state_param(&body)?;
    let id = verification_id(&body)?;
    {
        let mut tx = app.store.begin().await?;
        let mut verification = tx.verification(id).await?.context("verification")?;
        verification.expire_at = Utc::now() - Duration::minutes(1);
        tx.save_verification(&verification).await?;
        tx.commit().await?;
    }

    let response = app.callback(&state, cookie.as_deref()).await?;

    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&response)?.as_str(), REDIRECT_URL);
    let snapshot = app.store.snapshot().await;
    let verification = &snapshot.verifications[&id];
    assert_eq!(verification.attempts, 1);
    assert!(verification.error.is_none());
    assert!(snapshot.sessions.is_empty());
    Ok(())
}

#[tokio::test]
async fn provider_errors_are_stored_on_the_verification() -> Result<()> {
    let app = TestApp::new()?;
    for (provider_code, code) in [
        ("redirect_uri_mismatch", "oauth_invalid_redirect_uri"),
        ("access_denied", "oauth_access_denied"),
    ] {
        let (body, cookie) = app.authorize(browser_sign_in()).await?;
        let state = state_param(&body)?;

        let response = app
            .callback_with(
                &format!("state={state}&error={provider_code}"),
                cookie.as_deref(),
            )
            .await?;

        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(location(&response)?.as_str(), REDIRECT_URL);
        let snapshot = app.store.snapshot().await;
        let verification = &snapshot.verifications[&verification_id(&body)?];
        let error = verification.error.clone().unwrap_or_default();
        assert_eq!(error["code"], code);
        assert!(verification.verified_at.is_none());
    }
    assert!(app.store.snapshot().await.sessions.is_empty());
    Ok(())
}

#[tokio::test]
async fn native_session_is_not_handed_to_untrusted_redirect() -> Result<()> {
    let app = TestApp::new()?;
    app.linked_user().await?;
    let (body, _cookie) = app
        .authorize(json!({
            "strategy": "oauth_google",
            "source_type": "sign_in",
            "redirect_url": REDIRECT_URL,
            "client_type": "native",
        }))
        .await?;
    let state = app.resign(&state_param(&body)?, |claims| {
        claims.redirect_url = "https://evil.example.net/steal".to_string();
    })?;

    let response = app.callback(&state, None).await?;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(response.headers().get(LOCATION).is_none());
    let error = json_body(response).await?;
    assert_eq!(error["errors"][0]["code"], "redirect_url_mismatch");

    let snapshot = app.store.snapshot().await;
    assert_eq!(snapshot.sessions.len(), 1);
    assert!(
        snapshot
            .clients
            .values()
            .all(|client| client.rotating_token_nonce.is_none())
    );
    let verification = &snapshot.verifications[&verification_id(&body)?];
    let stored = verification.error.clone().unwrap_or_default();
    assert_eq!(stored["code"], "redirect_url_mismatch");
    Ok(())
}

#[tokio::test]
async fn tampered_state_is_rejected() -> Result<()> {
    let app = TestApp::new()?;
    let (body, cookie) = app.authorize(browser_sign_in()).await?;
    let mut state = state_param(&body)?;
    state.push('x');

    let response = app.callback(&state, cookie.as_deref()).await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let error = json_body(response).await?;
    assert_eq!(error["errors"][0]["code"], "authorization_invalid");

    let missing = app
        .send(Request::get("/v1/oauth_callback?code=abc").body(Body::empty())?)
        .await?;
    assert_eq!(missing.status(), StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn browser_callback_requires_the_issuing_client() -> Result<()> {
    let app = TestApp::new()?;
    app.linked_user().await?;
    let (body, _cookie) = app.authorize(browser_sign_in()).await?;
    let state = state_param(&body)?;

    let without_cookie = app.callback(&state, None).await?;
    assert_eq!(without_cookie.status(), StatusCode::BAD_REQUEST);

    // A cookie from another client does not match the state token either.
    let (_other, other_cookie) = app.authorize(browser_sign_in()).await?;
    let mismatched = app.callback(&state, other_cookie.as_deref()).await?;
    assert_eq!(mismatched.status(), StatusCode::BAD_REQUEST);

    assert!(app.store.snapshot().await.sessions.is_empty());
    Ok(())
}

#[tokio::test]
async fn native_flow_uses_nonce_handshake() -> Result<()> {
    let app = TestApp::new()?;
    let user = app.linked_user().await?;
    let (body, cookie) = app
        .authorize(json!({
            "strategy": "oauth_google",
            "source_type": "sign_in",
            "redirect_url": REDIRECT_URL,
            "client_type": "native",
        }))
        .await?;
    assert!(cookie.is_none());
    let client_token = body["client_token"]
        .as_str()
        .context("native clients get the token in the body")?
        .to_string();
    let state = state_param(&body)?;

    // No cookie: the state token identifies the native client.
    let response = app.callback(&state, None).await?;
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    let target = location(&response)?;
    let nonce = query_value(&target, "rotating_token_nonce").context("missing nonce")?;
    let session_id: Uuid = query_value(&target, "created_session_id")
        .context("missing created_session_id")?
        .parse()?;
    let snapshot = app.store.snapshot().await;
    assert_eq!(
        snapshot.sessions[&session_id].status,
        SessionStatus::PendingActivation
    );
    assert_eq!(session_jobs(&snapshot), 0);

    let handshake = app
        .send(
            Request::post("/v1/client/handshake")
                .header(CONTENT_TYPE, "application/json")
                .body(Body::from(json!({ "nonce": nonce }).to_string()))?,
        )
        .await?;
    assert_eq!(handshake.status(), StatusCode::OK);
    let handshake = json_body(handshake).await?;
    assert_ne!(handshake["client_token"], client_token.as_str());
    assert_eq!(handshake["session_ids"][0], session_id.to_string());

    let snapshot = app.store.snapshot().await;
    let session = &snapshot.sessions[&session_id];
    assert_eq!(session.status, SessionStatus::Active);
    assert_eq!(session.user_id, user.id);
    assert_eq!(session_jobs(&snapshot), 1);

    // The nonce is single use.
    let again = app
        .send(
            Request::post("/v1/client/handshake")
                .header(CONTENT_TYPE, "application/json")
                .body(Body::from(json!({ "nonce": nonce }).to_string()))?,
        )
        .await?;
    assert_eq!(again.status(), StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn authorize_rejects_untrusted_redirect_in_production() -> Result<()> {
    let app = TestApp::new()?;
    let response = app
        .send(
            Request::post("/v1/oauth/authorize")
                .header(CONTENT_TYPE, "application/json")
                .body(Body::from(
                    json!({
                        "strategy": "oauth_google",
                        "source_type": "sign_in",
                        "redirect_url": "https://evil.example.net/steal",
                        "client_type": "native",
                    })
                    .to_string(),
                ))?,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let error = json_body(response).await?;
    assert_eq!(error["errors"][0]["code"], "redirect_url_mismatch");
    assert!(app.store.snapshot().await.verifications.is_empty());
    Ok(())
}

#[tokio::test]
async fn form_post_callback_bounces_to_get() -> Result<()> {
    let app = TestApp::new()?;
    let response = app
        .send(
            Request::post("/v1/oauth_callback")
                .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from("state=abc.def&code=xyz"))?,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    let location = response
        .headers()
        .get(LOCATION)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    assert_eq!(location, "/v1/oauth_callback?state=abc.def&code=xyz");
    Ok(())
}

#[tokio::test]
async fn health_reports_memory_store() -> Result<()> {
    let app = TestApp::new()?;
    let response = app
        .send(Request::get("/health").body(Body::empty())?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));
    let body = json_body(response).await?;
    assert_eq!(body["store"], "memory");
    assert_eq!(body["database"], "ok");
    Ok(())
}
