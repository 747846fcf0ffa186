use super::{
    FlowContext, FlowOutcome, check_restrictions, create_transfer, enforce_single_session,
    mark_verified, upsert_external,
};
use crate::{
    api::handlers::oauth::{
        errors::ApiError,
        resolver::{MatchedVia, Resolution, resolve},
        sessions::{SessionOptions, create_session},
    },
    store::{
        StoreTx,
        models::{Identification, SignIn},
    },
};

pub(super) async fn run(
    tx: &mut dyn StoreTx,
    ctx: &mut FlowContext<'_>,
) -> Result<FlowOutcome, ApiError> {
    check_restrictions(ctx)?;

    let mut sign_in = tx
        .sign_in(ctx.claims.source_id)
        .await?
        .ok_or(ApiError::ResourceNotFound("sign_in"))?;

    let resolution = resolve(
        tx,
        &ctx.profile,
        ctx.instance.id(),
        ctx.client.supports_email_link_flow,
    )
    .await?;

    match resolution.user_id {
        None => without_user(tx, ctx, &mut sign_in, resolution).await,
        Some(_) => with_user(tx, ctx, &mut sign_in, resolution).await,
    }
}

async fn without_user(
    tx: &mut dyn StoreTx,
    ctx: &mut FlowContext<'_>,
    sign_in: &mut SignIn,
    resolution: Resolution,
) -> Result<FlowOutcome, ApiError> {
    let external = upsert_external(tx, ctx, resolution.external, None).await?;

    // An unverified email cannot identify the account, but the owner can
    // confirm the link by verifying the email they already have.
    let owned_email = resolution
        .email
        .filter(|email| email.user_id.is_some() && !ctx.profile.email_address_verified);
    if let Some(email) = owned_email {
        return defer_to_email(tx, ctx, sign_in, external, &email).await;
    }

    create_transfer(tx, ctx, external.id, None).await?;
    mark_verified(tx, ctx, external.id).await?;
    Err(ApiError::ExternalAccountNotFound)
}

async fn with_user(
    tx: &mut dyn StoreTx,
    ctx: &mut FlowContext<'_>,
    sign_in: &mut SignIn,
    resolution: Resolution,
) -> Result<FlowOutcome, ApiError> {
    enforce_single_session(ctx, resolution.user_id)?;

    let user_id = resolution
        .user_id
        .ok_or(ApiError::ResourceNotFound("user"))?;
    let mut user = tx
        .user(user_id)
        .await?
        .ok_or(ApiError::ResourceNotFound("user"))?;
    if user.is_locked(ctx.now) {
        return Err(ApiError::UserLocked);
    }
    if user.banned {
        return Err(ApiError::UserBanned);
    }

    // Matched only through the link flow: the email must be re-verified
    // before the external account is attached.
    if resolution.matched_via == Some(MatchedVia::EmailAddress)
        && !ctx.profile.email_address_verified
    {
        let external = upsert_external(tx, ctx, resolution.external, None).await?;
        let email = resolution
            .email
            .ok_or(ApiError::ResourceNotFound("identification"))?;
        return defer_to_email(tx, ctx, sign_in, external, &email).await;
    }

    let external = upsert_external(tx, ctx, resolution.external, Some(user.id)).await?;

    sign_in.identification_id = Some(external.id);
    sign_in.first_factor_success_identification_id = Some(external.id);
    sign_in.to_link_identification_id = None;
    sign_in.reset_password_pending = false;
    sign_in.updated_at = ctx.now;

    user.failed_verification_attempts = 0;
    user.password_reset_required = false;
    user.updated_at = ctx.now;
    tx.save_user(&user).await?;

    mark_verified(tx, ctx, external.id).await?;

    if user.two_factor_enabled {
        tx.save_sign_in(sign_in).await?;
        return Ok(FlowOutcome::NeedsSecondFactor);
    }

    let options = SessionOptions {
        pending_activation: ctx.claims.is_native(),
        ..SessionOptions::default()
    };
    let session = create_session(
        tx,
        ctx.instance,
        &mut ctx.client,
        &mut user,
        options,
        ctx.now,
    )
    .await?;

    sign_in.created_session_id = Some(session.id);
    tx.save_sign_in(sign_in).await?;

    Ok(FlowOutcome::SessionCreated(session))
}

/// Park the external identification behind the email identification.
async fn defer_to_email(
    tx: &mut dyn StoreTx,
    ctx: &mut FlowContext<'_>,
    sign_in: &mut SignIn,
    mut external: Identification,
    email: &Identification,
) -> Result<FlowOutcome, ApiError> {
    external.requires_verification = true;
    external.target_identification_id = Some(email.id);
    external.updated_at = ctx.now;
    tx.save_identification(&external).await?;

    sign_in.identification_id = Some(email.id);
    sign_in.to_link_identification_id = Some(external.id);
    sign_in.updated_at = ctx.now;
    tx.save_sign_in(sign_in).await?;

    mark_verified(tx, ctx, external.id).await?;
    Ok(FlowOutcome::PendingFirstFactor)
}
