//! OAuth/SAML callback controller.
//!
//! Once the state token has been decoded, failures are never reported in the
//! response body: the error is stored on the Verification and the browser is
//! sent back to the caller's redirect URL, where the frontend reads it.

use axum::{
    Form,
    extract::{Extension, Query},
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use super::{
    errors::{ApiError, ErrorBody},
    finalize::{FlowContext, FlowOutcome, finalize},
    providers::{CallbackParams, ProviderOutcome, classify_provider_error},
    redirect::{completion_target, outcome_redirect, see_other, session_redirect},
    state::OAuthState,
    state_token::{self, StateClaims},
    utils::client_token,
};
use crate::store::{
    Store, StoreResult,
    models::{Client, Verification, VerificationStatus},
};

pub const CALLBACK_PATH: &str = "/v1/oauth_callback";

#[derive(Debug, Clone, Default, Serialize, Deserialize, IntoParams, ToSchema)]
#[into_params(parameter_in = Query)]
pub struct CallbackQuery {
    /// Signed state token issued by `/v1/oauth/authorize`.
    pub state: Option<String>,
    pub code: Option<String>,
    pub oauth_token: Option<String>,
    pub oauth_verifier: Option<String>,
    pub scope: Option<String>,
    /// Error code reported by the identity provider.
    pub error: Option<String>,
    #[serde(rename = "SAMLResponse")]
    pub saml_response: Option<String>,
}

impl CallbackQuery {
    fn params(&self) -> CallbackParams {
        CallbackParams {
            code: self.code.clone(),
            oauth_token: self.oauth_token.clone(),
            oauth_verifier: self.oauth_verifier.clone(),
            scope: self.scope.clone(),
            saml_response: self.saml_response.clone(),
        }
    }
}

/// Providers that POST back (`form_post`, SAML) are bounced to a same-origin
/// GET so the `SameSite=Lax` client cookie is sent.
#[utoipa::path(
    post,
    path = "/v1/oauth_callback",
    request_body(content = CallbackQuery, content_type = "application/x-www-form-urlencoded"),
    responses(
        (status = 303, description = "Redirect to the GET callback")
    ),
    tag = "oauth"
)]
pub async fn oauth_callback_post(Form(form): Form<CallbackQuery>) -> Response {
    see_other(&format!("{CALLBACK_PATH}?{}", query_string(&form)))
}

fn query_string(form: &CallbackQuery) -> String {
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    let pairs = [
        ("state", &form.state),
        ("code", &form.code),
        ("oauth_token", &form.oauth_token),
        ("oauth_verifier", &form.oauth_verifier),
        ("scope", &form.scope),
        ("error", &form.error),
        ("SAMLResponse", &form.saml_response),
    ];
    for (key, value) in pairs {
        if let Some(value) = value {
            serializer.append_pair(key, value);
        }
    }
    serializer.finish()
}

#[utoipa::path(
    get,
    path = "/v1/oauth_callback",
    params(CallbackQuery),
    responses(
        (status = 303, description = "Flow finished without a session, or the error was stored on the verification"),
        (status = 307, description = "Session created, redirect with created_session_id"),
        (status = 400, description = "Invalid authorization", body = ErrorBody)
    ),
    tag = "oauth"
)]
pub async fn oauth_callback(
    headers: HeaderMap,
    Query(query): Query<CallbackQuery>,
    Extension(state): Extension<Arc<OAuthState>>,
) -> Response {
    let now = Utc::now();

    let Some(token) = query.state.as_deref().filter(|token| !token.is_empty()) else {
        warn!("oauth callback without state");
        return ApiError::AuthorizationInvalid.into_response();
    };
    let claims = match state_token::decode(
        token,
        &state.instance().verifying_key(),
        state.instance().id(),
        now.timestamp(),
    ) {
        Ok(claims) => claims,
        Err(err) => {
            warn!("rejecting oauth state token: {err}");
            return ApiError::AuthorizationInvalid.into_response();
        }
    };

    let (verification, client) = match load_flow(&state, &claims, &headers).await {
        Ok(loaded) => loaded,
        Err(err) => {
            if err.is_business() {
                warn!(verification_id = %claims.vid, "oauth callback rejected: {err}");
            }
            return err.into_response();
        }
    };

    match run_callback(&state, &claims, &query, verification, client, now).await {
        Ok(response) => response,
        Err(err) => {
            if err.is_business() {
                info!(verification_id = %claims.vid, code = err.code(), "oauth flow ended with error");
            } else {
                error!(verification_id = %claims.vid, "oauth flow failed: {err:#}");
            }
            persist_error(state.store().as_ref(), claims.vid, &err).await;
            see_other(&claims.redirect_url)
        }
    }
}

/// Load the verification and the client the flow belongs to.
async fn load_flow(
    state: &OAuthState,
    claims: &StateClaims,
    headers: &HeaderMap,
) -> Result<(Verification, Client), ApiError> {
    let instance_id = state.instance().id();
    let mut tx = state.store().begin().await?;

    let verification = tx
        .verification(claims.vid)
        .await?
        .filter(|verification| verification.instance_id == instance_id)
        .ok_or(ApiError::AuthorizationInvalid)?;
    if verification.nonce != claims.nonce {
        return Err(ApiError::AuthorizationInvalid);
    }

    // Native clients come back without the cookie; the state token is
    // their only link to the client.
    let client = if claims.is_native() {
        tx.client(claims.client_id).await?
    } else {
        match client_token(headers) {
            Some(token) => tx.client_by_rotating_token(instance_id, &token).await?,
            None => None,
        }
    };
    tx.commit().await?;

    match client {
        Some(client) if claims.is_native() || client.id == claims.client_id => {
            Ok((verification, client))
        }
        _ => {
            warn!(
                expected_client_id = %claims.client_id,
                "oauth state token issued for another client"
            );
            Err(ApiError::ClientMismatch)
        }
    }
}

async fn run_callback(
    state: &OAuthState,
    claims: &StateClaims,
    query: &CallbackQuery,
    verification: Verification,
    client: Client,
    now: DateTime<Utc>,
) -> Result<Response, ApiError> {
    let strategy = verification.strategy.clone();
    if !state.instance().is_strategy_enabled(&strategy) {
        return Err(ApiError::StrategyNotEnabled(strategy));
    }
    let provider = state
        .providers()
        .get(&strategy)
        .ok_or_else(|| ApiError::StrategyNotEnabled(strategy.clone()))?;
    if let Some(code) = query.error.as_deref() {
        let err = ApiError::from(classify_provider_error(code));
        warn!(strategy = %strategy, provider_error = code, "identity provider reported an error");
        return Err(err);
    }

    // Persist the attempt before looking at the status so a replayed state
    // token can never observe `unverified` twice.
    let verification = {
        let mut tx = state.store().begin().await?;
        let verification = tx.increment_verification_attempts(verification.id).await?;
        tx.commit().await?;
        verification
    };

    match verification.status(now) {
        VerificationStatus::Unverified => {}
        VerificationStatus::Expired => {
            debug!(verification_id = %verification.id, "verification expired");
            return Ok(see_other(&claims.redirect_url));
        }
        VerificationStatus::Verified => {
            debug!(verification_id = %verification.id, "verification already completed");
            return Ok(see_other(completion_target(claims)));
        }
        VerificationStatus::Failed => {
            // Keep whatever error the first attempt stored.
            info!(verification_id = %verification.id, attempts = verification.attempts, "verification attempts exhausted");
            return Ok(see_other(&claims.redirect_url));
        }
    }

    let request_token = if provider.is_oauth1() {
        let token = query.oauth_token.as_deref().unwrap_or_default();
        let mut tx = state.store().begin().await?;
        let request_token = tx
            .take_oauth1_request_token(state.instance().id(), token)
            .await?;
        tx.commit().await?;
        Some(request_token.ok_or_else(|| {
            ApiError::TokenExchange("oauth1 request token not found".to_string())
        })?)
    } else {
        None
    };

    let profile = match provider.fetch_user(&query.params(), request_token).await {
        Ok(ProviderOutcome::Profile(profile)) => profile,
        Ok(ProviderOutcome::Redirect(url)) => return Ok(see_other(url.as_str())),
        Err(err) => {
            warn!(strategy = %strategy, "fetching external profile failed: {err}");
            return Err(err.into());
        }
    };

    let signed_in_user = signed_in_user(state.store().as_ref(), &client, now).await?;

    let mut ctx = FlowContext {
        instance: state.instance(),
        restrictions: state.restrictions(),
        claims,
        client,
        verification,
        profile,
        now,
        signed_in_user,
    };

    let mut tx = state.store().begin().await?;
    let outcome = match finalize(tx.as_mut(), &mut ctx).await {
        Ok(outcome) => {
            tx.commit().await?;
            outcome
        }
        Err(err) if err.is_business() => {
            // Business outcomes keep their writes, account transfers included.
            ctx.verification.error = Some(err.to_json());
            ctx.verification.error_cause = Some(err.cause());
            ctx.verification.updated_at = now;
            tx.save_verification(&ctx.verification).await?;
            tx.commit().await?;
            info!(verification_id = %ctx.verification.id, code = err.code(), "oauth flow ended with error");
            return Ok(see_other(&claims.redirect_url));
        }
        Err(err) => {
            if let Err(rollback) = tx.rollback().await {
                error!("failed to roll back oauth flow: {rollback:#}");
            }
            return Err(err);
        }
    };

    debug!(verification_id = %ctx.verification.id, outcome = outcome_name(&outcome), "oauth flow finalized");

    match outcome {
        FlowOutcome::SessionCreated(session) => {
            match session_redirect(state, claims, ctx.client, &session, now).await {
                Ok(response) => Ok(response),
                Err(err @ ApiError::RedirectUrlMismatch(_)) => {
                    warn!(session_id = %session.id, "session created for an untrusted native redirect");
                    persist_error(state.store().as_ref(), claims.vid, &err).await;
                    Ok(err.into_response())
                }
                Err(err) => Err(err),
            }
        }
        _ => Ok(outcome_redirect(claims)),
    }
}

fn outcome_name(outcome: &FlowOutcome) -> &'static str {
    match outcome {
        FlowOutcome::SessionCreated(_) => "session_created",
        FlowOutcome::PendingFirstFactor => "pending_first_factor",
        FlowOutcome::NeedsSecondFactor => "needs_second_factor",
        FlowOutcome::SignUpPending => "sign_up_pending",
        FlowOutcome::Connected => "connected",
        FlowOutcome::Reauthorized => "reauthorized",
    }
}

/// User of the client's active session. Read outside the flow transaction.
async fn signed_in_user(
    store: &dyn Store,
    client: &Client,
    now: DateTime<Utc>,
) -> Result<Option<Uuid>, ApiError> {
    let Some(session_id) = client.last_active_session_id else {
        return Ok(None);
    };
    let mut tx = store.begin().await?;
    let session = tx.session(session_id).await?;
    tx.commit().await?;
    Ok(session
        .filter(|session| session.is_active(now))
        .map(|session| session.user_id))
}

/// Store the error on the verification in its own transaction. Failures are
/// logged; the caller redirects regardless.
async fn persist_error(store: &dyn Store, verification_id: Uuid, err: &ApiError) {
    let result: StoreResult<()> = async {
        let mut tx = store.begin().await?;
        if let Some(mut verification) = tx.verification(verification_id).await? {
            verification.error = Some(err.to_json());
            verification.error_cause = Some(err.cause());
            verification.updated_at = Utc::now();
            tx.save_verification(&verification).await?;
        }
        tx.commit().await
    }
    .await;
    if let Err(store_err) = result {
        error!(verification_id = %verification_id, "failed to persist verification error: {store_err:#}");
    }
}
