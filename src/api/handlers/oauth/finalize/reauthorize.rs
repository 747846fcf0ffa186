use super::{FlowContext, FlowOutcome, mark_verified, upsert_external};
use crate::{
    api::handlers::oauth::{errors::ApiError, resolver::resolve},
    store::StoreTx,
};

/// Refresh tokens and scopes of an already linked external account.
pub(super) async fn run(
    tx: &mut dyn StoreTx,
    ctx: &mut FlowContext<'_>,
) -> Result<FlowOutcome, ApiError> {
    let resolution = resolve(tx, &ctx.profile, ctx.instance.id(), false).await?;

    let Some(external) = resolution.external.filter(|ident| ident.user_id.is_some()) else {
        return Err(ApiError::ExternalAccountNotFound);
    };
    let owner = external.user_id;
    if owner != Some(ctx.claims.source_id) || ctx.signed_in_user != owner {
        return Err(ApiError::NotSignedIn);
    }

    let external = upsert_external(tx, ctx, Some(external), owner).await?;
    mark_verified(tx, ctx, external.id).await?;

    Ok(FlowOutcome::Reauthorized)
}
