use serde_json::json;

use super::{FlowContext, FlowOutcome, check_restrictions, mark_verified, upsert_external};
use crate::{
    api::{
        handlers::oauth::{errors::ApiError, resolver::resolve},
        jobs,
    },
    store::{StoreTx, models::JobKind},
};

/// Attach the external identity to the signed-in user.
pub(super) async fn run(
    tx: &mut dyn StoreTx,
    ctx: &mut FlowContext<'_>,
) -> Result<FlowOutcome, ApiError> {
    let mut user = tx
        .user(ctx.claims.source_id)
        .await?
        .ok_or(ApiError::ResourceNotFound("user"))?;
    if ctx.signed_in_user != Some(user.id) {
        return Err(ApiError::NotSignedIn);
    }

    check_restrictions(ctx)?;

    let resolution = resolve(tx, &ctx.profile, ctx.instance.id(), false).await?;

    if let Some(owner) = resolution.external.as_ref().and_then(|ident| ident.user_id) {
        return Err(if owner == user.id {
            ApiError::ExternalAccountExists
        } else {
            ApiError::IdentificationClaimed
        });
    }
    if resolution
        .email
        .as_ref()
        .and_then(|ident| ident.user_id)
        .is_some_and(|owner| owner != user.id)
    {
        return Err(ApiError::IdentificationClaimed);
    }

    // One verified account per provider and user.
    let provider_kind = ctx.profile.identification_type();
    if tx
        .user_identifications(user.id)
        .await?
        .iter()
        .any(|ident| ident.is_verified() && ident.kind == provider_kind)
    {
        return Err(ApiError::ExternalAccountExists);
    }

    let external = upsert_external(tx, ctx, resolution.external, Some(user.id)).await?;
    mark_verified(tx, ctx, external.id).await?;

    if user.profile_image_url.is_none() {
        user.profile_image_url.clone_from(&ctx.profile.avatar_url);
    }
    user.updated_at = ctx.now;
    tx.save_user(&user).await?;

    jobs::enqueue(
        tx,
        ctx.instance.id(),
        JobKind::UserUpdated,
        json!({
            "user_id": user.id,
            "external_account_identification_id": external.id,
        }),
        ctx.now,
    )
    .await?;

    Ok(FlowOutcome::Connected)
}
