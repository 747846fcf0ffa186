use serde_json::json;

use super::{
    FlowContext, FlowOutcome, check_restrictions, create_transfer, enforce_single_session,
    mark_verified, upsert_external,
};
use crate::{
    api::{
        handlers::oauth::{
            errors::ApiError,
            resolver::{MatchedVia, dedup_identifications, resolve},
            sessions::{SessionOptions, create_session},
        },
        jobs,
    },
    store::{
        StoreTx,
        models::{Identification, IdentificationStatus, IdentificationType, JobKind, User},
    },
};

pub(super) async fn run(
    tx: &mut dyn StoreTx,
    ctx: &mut FlowContext<'_>,
) -> Result<FlowOutcome, ApiError> {
    check_restrictions(ctx)?;

    let mut sign_up = tx
        .sign_up(ctx.claims.source_id)
        .await?
        .ok_or(ApiError::ResourceNotFound("sign_up"))?;

    let resolution = resolve(
        tx,
        &ctx.profile,
        ctx.instance.id(),
        ctx.client.supports_email_link_flow,
    )
    .await?;

    // The identity already belongs to someone: continue as a sign-in.
    if resolution.user_exists() {
        let external = upsert_external(tx, ctx, resolution.external, None).await?;
        let to_link = match (resolution.matched_via, &resolution.email) {
            (Some(MatchedVia::EmailAddress), Some(email)) => Some(email.id),
            _ => None,
        };
        create_transfer(tx, ctx, external.id, to_link).await?;
        mark_verified(tx, ctx, external.id).await?;
        return Err(ApiError::IdentificationExists);
    }

    enforce_single_session(ctx, None)?;

    // Owned by another user, but the profile cannot prove it.
    if resolution
        .email
        .as_ref()
        .is_some_and(|email| email.user_id.is_some())
    {
        return Err(ApiError::IdentificationClaimed);
    }

    let now = ctx.now;
    let external = upsert_external(tx, ctx, resolution.external, None).await?;

    let email_status = if ctx.profile.email_address_verified {
        IdentificationStatus::Verified
    } else {
        IdentificationStatus::Reserved
    };
    let email = if ctx.profile.email_address.is_empty() {
        None
    } else {
        // An unlinked claim left behind by an abandoned sign-up is reused.
        let mut email = resolution.email.unwrap_or_else(|| {
            Identification::new(
                ctx.instance.id(),
                IdentificationType::EmailAddress,
                &ctx.profile.email_address,
                email_status,
                now,
            )
        });
        email.status = email_status;
        email.updated_at = now;
        Some(email)
    };

    // A resumed sign-up may already carry a stale copy of the same address.
    let previous_email = match sign_up.email_address_id {
        Some(id) => tx
            .identification(id)
            .await?
            .filter(|previous| {
                previous.kind == IdentificationType::EmailAddress
                    && previous.user_id.is_none()
                    && previous.identifier == ctx.profile.email_address
            }),
        None => None,
    };

    sign_up.external_account_identification_id = Some(external.id);
    sign_up.email_address_id = email.as_ref().map(|email| email.id);
    sign_up.updated_at = now;

    if email_status == IdentificationStatus::Reserved {
        if let Some(email) = &email {
            tx.save_identification(email).await?;
        }
        tx.save_sign_up(&sign_up).await?;
        mark_verified(tx, ctx, external.id).await?;
        return Ok(FlowOutcome::SignUpPending);
    }

    let mut user = User::new(ctx.instance.id(), now);
    user.first_name.clone_from(&ctx.profile.first_name);
    user.last_name.clone_from(&ctx.profile.last_name);
    user.profile_image_url.clone_from(&ctx.profile.avatar_url);
    tx.save_user(&user).await?;

    let candidates: Vec<Identification> = previous_email
        .into_iter()
        .chain(email)
        .chain([external.clone()])
        .collect();
    for mut identification in dedup_identifications(candidates) {
        identification.user_id = Some(user.id);
        if identification.kind == IdentificationType::EmailAddress
            && user.primary_email_address_id.is_none()
        {
            user.primary_email_address_id = Some(identification.id);
        }
        tx.save_identification(&identification).await?;
    }
    tx.save_user(&user).await?;

    jobs::enqueue(
        tx,
        ctx.instance.id(),
        JobKind::UserCreated,
        json!({
            "user_id": user.id,
            "primary_email_address_id": user.primary_email_address_id,
            "external_account_identification_id": external.id,
        }),
        now,
    )
    .await?;

    mark_verified(tx, ctx, external.id).await?;

    let options = SessionOptions {
        pending_activation: ctx.claims.is_native(),
        ..SessionOptions::default()
    };
    let session = create_session(tx, ctx.instance, &mut ctx.client, &mut user, options, now).await?;

    sign_up.created_user_id = Some(user.id);
    sign_up.created_session_id = Some(session.id);
    tx.save_sign_up(&sign_up).await?;

    Ok(FlowOutcome::SessionCreated(session))
}
