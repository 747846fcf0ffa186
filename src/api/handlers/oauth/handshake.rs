use axum::{
    Json,
    extract::Extension,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use super::{
    errors::{ApiError, ErrorBody},
    sessions::activate,
    state::OAuthState,
};
use crate::store::models::SessionStatus;

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HandshakeRequest {
    /// `rotating_token_nonce` received on the native redirect.
    pub nonce: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HandshakeResponse {
    pub client_id: Uuid,
    pub client_token: String,
    /// Sessions activated by this handshake.
    pub session_ids: Vec<Uuid>,
}

/// Exchange a one-time nonce for the client's rotating token.
#[utoipa::path(
    post,
    path = "/v1/client/handshake",
    request_body = HandshakeRequest,
    responses(
        (status = 200, description = "Client token issued", body = HandshakeResponse),
        (status = 400, description = "Unknown or used nonce", body = ErrorBody)
    ),
    tag = "oauth"
)]
pub async fn handshake(
    Extension(state): Extension<Arc<OAuthState>>,
    payload: Option<Json<HandshakeRequest>>,
) -> Response {
    let nonce = match payload {
        Some(Json(request)) if !request.nonce.trim().is_empty() => request.nonce,
        _ => return ApiError::InvalidRequest("missing nonce".to_string()).into_response(),
    };

    match exchange(&state, nonce.trim(), Utc::now()).await {
        Ok(body) => (StatusCode::OK, Json(body)).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn exchange(
    state: &OAuthState,
    nonce: &str,
    now: DateTime<Utc>,
) -> Result<HandshakeResponse, ApiError> {
    let mut tx = state.store().begin().await?;
    let Some(mut client) = tx
        .client_by_rotating_token_nonce(state.instance().id(), nonce)
        .await?
    else {
        warn!("handshake with unknown nonce");
        return Err(ApiError::AuthorizationInvalid);
    };

    client.rotating_token_nonce = None;

    let mut session_ids = Vec::new();
    for session in tx.client_sessions(client.id).await? {
        if session.status == SessionStatus::PendingActivation && now < session.expire_at {
            let session = activate(tx.as_mut(), &mut client, session, now).await?;
            session_ids.push(session.id);
        }
    }

    client.updated_at = now;
    tx.save_client(&client).await?;
    tx.commit().await?;

    info!(client_id = %client.id, activated = session_ids.len(), "client handshake completed");

    Ok(HandshakeResponse {
        client_id: client.id,
        client_token: client.rotating_token,
        session_ids,
    })
}
