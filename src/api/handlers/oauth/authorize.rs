//! Start a federation flow: create the Verification, sign the state token and
//! hand back the provider authorization URL.

use axum::{
    Json,
    extract::Extension,
    http::{HeaderMap, StatusCode, header::SET_COOKIE},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};
use utoipa::ToSchema;
use uuid::Uuid;

use super::{
    errors::{ApiError, ErrorBody},
    state::OAuthState,
    state_token::{self, ClientType, SourceType, StateClaims},
    utils::{CLIENT_COOKIE_NAME, build_cookie, client_token, generate_token},
};
use crate::store::{
    StoreTx,
    models::{Client, SignIn, SignUp, Verification},
};

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AuthorizeRequest {
    /// Strategy to use, e.g. `oauth_google`.
    pub strategy: String,
    pub source_type: SourceType,
    /// Existing sign-in or sign-up to continue. Ignored for connect and reauthorize.
    #[serde(default)]
    pub source_id: Option<Uuid>,
    pub redirect_url: String,
    #[serde(default)]
    pub action_complete_redirect_url: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub client_type: ClientType,
    /// Opt the client into linking through an unverified provider email.
    #[serde(default)]
    pub supports_email_link_flow: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AuthorizeResponse {
    pub verification_id: Uuid,
    pub external_verification_redirect_url: String,
    pub expire_at: DateTime<Utc>,
    pub client_id: Uuid,
    pub source_id: Uuid,
    /// Rotating token for native clients, which do not keep cookies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_token: Option<String>,
}

#[utoipa::path(
    post,
    path = "/v1/oauth/authorize",
    request_body = AuthorizeRequest,
    responses(
        (status = 200, description = "Flow started", body = AuthorizeResponse),
        (status = 400, description = "Strategy disabled or redirect URL not allowed", body = ErrorBody),
        (status = 401, description = "Connect or reauthorize without an active session", body = ErrorBody)
    ),
    tag = "oauth"
)]
pub async fn authorize(
    headers: HeaderMap,
    Extension(state): Extension<Arc<OAuthState>>,
    payload: Option<Json<AuthorizeRequest>>,
) -> Response {
    let Some(Json(request)) = payload else {
        return ApiError::InvalidRequest("missing payload".to_string()).into_response();
    };

    match start_flow(&state, &headers, request, Utc::now()).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn start_flow(
    state: &OAuthState,
    headers: &HeaderMap,
    request: AuthorizeRequest,
    now: DateTime<Utc>,
) -> Result<Response, ApiError> {
    let instance = state.instance();
    if !instance.is_strategy_enabled(&request.strategy) {
        return Err(ApiError::StrategyNotEnabled(request.strategy));
    }
    let provider = state
        .providers()
        .get(&request.strategy)
        .ok_or_else(|| ApiError::StrategyNotEnabled(request.strategy.clone()))?;

    for url in std::iter::once(&request.redirect_url).chain(&request.action_complete_redirect_url)
    {
        if !instance.is_redirect_url_trusted(url) {
            return Err(ApiError::RedirectUrlMismatch(url.clone()));
        }
    }

    // Provider round trip before the transaction is opened.
    let request_token = if provider.is_oauth1() {
        Some(provider.request_token().await?)
    } else {
        None
    };

    let mut tx = state.store().begin().await?;

    let existing = match client_token(headers) {
        Some(token) => tx.client_by_rotating_token(instance.id(), &token).await?,
        None => None,
    };
    let is_new_client = existing.is_none();
    let mut client = match existing {
        Some(client) => client,
        None => Client::new(instance.id(), generate_token()?, now),
    };
    if let Some(flag) = request.supports_email_link_flow {
        client.supports_email_link_flow = flag;
    }

    let source_id = resolve_source(tx.as_mut(), &mut client, &request, now).await?;
    client.updated_at = now;
    tx.save_client(&client).await?;

    let verification = Verification::new(instance.id(), &request.strategy, generate_token()?, now);
    tx.save_verification(&verification).await?;
    if let Some(request_token) = &request_token {
        tx.save_oauth1_request_token(request_token).await?;
    }

    let claims = StateClaims {
        ins: instance.id().to_string(),
        vid: verification.id,
        nonce: verification.nonce.clone(),
        source_type: request.source_type,
        source_id,
        client_id: client.id,
        client_type: request.client_type,
        scopes: request.scopes.clone(),
        redirect_url: request.redirect_url.clone(),
        action_complete_redirect_url: request.action_complete_redirect_url.clone(),
        iat: now.timestamp(),
        exp: (now + instance.state_token_ttl()).timestamp(),
    };
    let token = state_token::encode(&claims, instance.signing_key(), instance.key_id())
        .map_err(|err| ApiError::Unexpected(err.into()))?;
    let authorize_url = provider.authorize_url(&token, &request.scopes, request_token.as_ref())?;

    tx.commit().await?;

    info!(
        verification_id = %verification.id,
        strategy = %request.strategy,
        source_type = ?request.source_type,
        "oauth flow started"
    );

    let native = request.client_type == ClientType::Native;
    let body = AuthorizeResponse {
        verification_id: verification.id,
        external_verification_redirect_url: authorize_url.to_string(),
        expire_at: verification.expire_at,
        client_id: client.id,
        source_id,
        client_token: native.then(|| client.rotating_token.clone()),
    };

    let mut response_headers = HeaderMap::new();
    if is_new_client && !native {
        let cookie = build_cookie(
            instance,
            CLIENT_COOKIE_NAME,
            &client.rotating_token,
            instance.session_lifetime().num_seconds(),
            true,
        )
        .map_err(|err| ApiError::Unexpected(err.into()))?;
        response_headers.insert(SET_COOKIE, cookie);
    }

    Ok((StatusCode::OK, response_headers, Json(body)).into_response())
}

/// Find or create the record the flow will finish: a sign-in, a sign-up, or
/// the signed-in user for connect and reauthorize.
async fn resolve_source(
    tx: &mut dyn StoreTx,
    client: &mut Client,
    request: &AuthorizeRequest,
    now: DateTime<Utc>,
) -> Result<Uuid, ApiError> {
    match request.source_type {
        SourceType::SignIn => {
            let existing = match request.source_id {
                Some(id) => Some(
                    tx.sign_in(id)
                        .await?
                        .filter(|sign_in| sign_in.client_id == client.id)
                        .ok_or(ApiError::ResourceNotFound("sign_in"))?,
                ),
                None => None,
            };
            let sign_in = match existing {
                Some(sign_in) => sign_in,
                None => {
                    let sign_in = SignIn::new(&client.instance_id, client.id, now);
                    tx.save_sign_in(&sign_in).await?;
                    debug!(sign_in_id = %sign_in.id, "sign-in created");
                    sign_in
                }
            };
            client.sign_in_id = Some(sign_in.id);
            Ok(sign_in.id)
        }
        SourceType::SignUp => {
            let existing = match request.source_id {
                Some(id) => Some(
                    tx.sign_up(id)
                        .await?
                        .filter(|sign_up| sign_up.client_id == client.id)
                        .ok_or(ApiError::ResourceNotFound("sign_up"))?,
                ),
                None => None,
            };
            let sign_up = match existing {
                Some(sign_up) => sign_up,
                None => {
                    let sign_up = SignUp::new(&client.instance_id, client.id, now);
                    tx.save_sign_up(&sign_up).await?;
                    debug!(sign_up_id = %sign_up.id, "sign-up created");
                    sign_up
                }
            };
            client.sign_up_id = Some(sign_up.id);
            Ok(sign_up.id)
        }
        SourceType::Connect | SourceType::Reauthorize => {
            let session_id = client.last_active_session_id.ok_or(ApiError::NotSignedIn)?;
            let session = tx
                .session(session_id)
                .await?
                .filter(|session| session.is_active(now))
                .ok_or(ApiError::NotSignedIn)?;
            Ok(session.user_id)
        }
    }
}
