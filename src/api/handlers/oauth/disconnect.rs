use axum::{
    extract::{Extension, Path},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use super::{
    errors::{ApiError, ErrorBody},
    state::OAuthState,
    utils::authenticate,
};
use crate::{
    api::jobs,
    store::{StoreTx, models::JobKind},
};

/// Remove an external account from the signed-in user.
#[utoipa::path(
    delete,
    path = "/v1/me/external_accounts/{id}",
    params(
        ("id" = Uuid, Path, description = "External account id")
    ),
    responses(
        (status = 204, description = "External account removed"),
        (status = 400, description = "Last identification of the user", body = ErrorBody),
        (status = 401, description = "No active session", body = ErrorBody),
        (status = 404, description = "External account not found", body = ErrorBody)
    ),
    tag = "oauth"
)]
pub async fn disconnect_external_account(
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Extension(state): Extension<Arc<OAuthState>>,
) -> Response {
    let now = Utc::now();
    let result = async {
        let mut tx = state.store().begin().await?;
        remove(tx.as_mut(), &state, &headers, id, now).await?;
        tx.commit().await?;
        Ok::<(), ApiError>(())
    }
    .await;

    match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => err.into_response(),
    }
}

async fn remove(
    tx: &mut dyn StoreTx,
    state: &OAuthState,
    headers: &HeaderMap,
    id: Uuid,
    now: DateTime<Utc>,
) -> Result<(), ApiError> {
    let (_client, session) = authenticate(tx, state.instance(), headers, now).await?;

    // Row lock first: concurrent removals must not both see two identifications.
    let mut user = tx
        .lock_user(session.user_id)
        .await?
        .ok_or(ApiError::NotSignedIn)?;

    let account = tx
        .external_account(id)
        .await?
        .filter(|account| account.instance_id == state.instance().id())
        .ok_or(ApiError::ResourceNotFound("external_account"))?;
    let identification = tx
        .identification(account.identification_id)
        .await?
        .filter(|identification| identification.user_id == Some(user.id))
        .ok_or(ApiError::ResourceNotFound("external_account"))?;

    let remaining = tx
        .user_identifications(user.id)
        .await?
        .into_iter()
        .filter(|other| other.is_claimed() && other.id != identification.id)
        .count();
    if remaining == 0 {
        return Err(ApiError::LastIdentification);
    }

    tx.delete_external_account(account.id).await?;
    tx.delete_identification(identification.id).await?;

    user.updated_at = now;
    tx.save_user(&user).await?;
    jobs::enqueue(
        tx,
        state.instance().id(),
        JobKind::UserUpdated,
        json!({
            "user_id": user.id,
            "removed_external_account_id": account.id,
        }),
        now,
    )
    .await?;

    info!(user_id = %user.id, external_account_id = %account.id, "external account disconnected");
    Ok(())
}
