//! Terminal transitions of a federation flow.
//!
//! Each transition runs once per callback inside the caller's transaction.
//! A business [`ApiError`] still leaves its writes (account transfers,
//! verified identifications) in the transaction for the caller to commit;
//! only unexpected errors are meant to be rolled back.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{
    errors::ApiError,
    providers::UserProfile,
    restrictions::Restrictions,
    state::InstanceConfig,
    state_token::{SourceType, StateClaims},
};
use crate::store::{
    StoreTx,
    models::{
        AccountTransfer, Client, ExternalAccount, Identification, IdentificationStatus, Session,
        Verification,
    },
};

mod connect;
mod reauthorize;
mod sign_in;
mod sign_up;

/// Everything a transition needs, owned so the caller can read the updated
/// client and verification back once the transition returns.
pub struct FlowContext<'a> {
    pub instance: &'a InstanceConfig,
    pub restrictions: &'a Restrictions,
    pub claims: &'a StateClaims,
    pub client: Client,
    pub verification: Verification,
    pub profile: UserProfile,
    pub now: DateTime<Utc>,
    /// User of the client's active session, read before the transaction.
    pub signed_in_user: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FlowOutcome {
    SessionCreated(Session),
    /// The external account waits for the email identification to be verified.
    PendingFirstFactor,
    NeedsSecondFactor,
    /// The sign-up still needs its email address verified.
    SignUpPending,
    Connected,
    Reauthorized,
}

impl FlowOutcome {
    #[must_use]
    pub fn session(&self) -> Option<&Session> {
        match self {
            Self::SessionCreated(session) => Some(session),
            _ => None,
        }
    }
}

/// Run the transition selected by the state token's source type.
///
/// # Errors
/// Business errors describe a persisted outcome; `ApiError::Unexpected`
/// means the transaction must be rolled back.
pub async fn finalize(
    tx: &mut dyn StoreTx,
    ctx: &mut FlowContext<'_>,
) -> Result<FlowOutcome, ApiError> {
    match ctx.claims.source_type {
        SourceType::SignIn => sign_in::run(tx, ctx).await,
        SourceType::SignUp => sign_up::run(tx, ctx).await,
        SourceType::Connect => connect::run(tx, ctx).await,
        SourceType::Reauthorize => reauthorize::run(tx, ctx).await,
    }
}

fn check_restrictions(ctx: &FlowContext<'_>) -> Result<(), ApiError> {
    if ctx.profile.email_address.is_empty() {
        return Ok(());
    }
    ctx.restrictions
        .check_email(&ctx.profile.email_address)
        .map_err(|violation| ApiError::IdentifierNotAllowed(violation.as_str().to_string()))
}

/// Single-session instances refuse a second user on a signed-in client.
fn enforce_single_session(ctx: &FlowContext<'_>, user_id: Option<Uuid>) -> Result<(), ApiError> {
    match ctx.signed_in_user {
        Some(current) if ctx.instance.single_session_mode() && Some(current) != user_id => {
            Err(ApiError::AlreadySignedIn)
        }
        _ => Ok(()),
    }
}

fn apply_profile(account: &mut ExternalAccount, profile: &UserProfile, now: DateTime<Utc>) {
    account.email_address.clone_from(&profile.email_address);
    account.email_address_verified = profile.email_address_verified;
    account.first_name.clone_from(&profile.first_name);
    account.last_name.clone_from(&profile.last_name);
    account.username.clone_from(&profile.username);
    account.avatar_url.clone_from(&profile.avatar_url);
    account.approved_scopes.clone_from(&profile.approved_scopes);
    account.access_token.clone_from(&profile.access_token);
    if profile.refresh_token.is_some() {
        account.refresh_token.clone_from(&profile.refresh_token);
    }
    account.token_expires_at = profile.token_expires_at;
    account.updated_at = now;
}

/// Create or refresh the external identification and its account.
/// `user_id` links the identification when given; otherwise the current
/// link (if any) is kept.
async fn upsert_external(
    tx: &mut dyn StoreTx,
    ctx: &FlowContext<'_>,
    existing: Option<Identification>,
    user_id: Option<Uuid>,
) -> Result<Identification, ApiError> {
    let now = ctx.now;
    let mut identification = existing.unwrap_or_else(|| {
        Identification::new(
            ctx.instance.id(),
            ctx.profile.identification_type(),
            &ctx.profile.provider_user_id,
            IdentificationStatus::Verified,
            now,
        )
    });
    if user_id.is_some() {
        identification.user_id = user_id;
    }
    identification.status = IdentificationStatus::Verified;
    identification.verification_id = Some(ctx.verification.id);
    identification.updated_at = now;
    tx.save_identification(&identification).await?;

    let mut account = match tx.external_account_by_identification(identification.id).await? {
        Some(account) => account,
        None => ExternalAccount {
            id: Uuid::now_v7(),
            instance_id: ctx.instance.id().to_string(),
            identification_id: identification.id,
            provider: ctx.profile.provider.clone(),
            provider_user_id: ctx.profile.provider_user_id.clone(),
            email_address: String::new(),
            email_address_verified: false,
            first_name: None,
            last_name: None,
            username: None,
            avatar_url: None,
            approved_scopes: Vec::new(),
            access_token: None,
            refresh_token: None,
            token_expires_at: None,
            created_at: now,
            updated_at: now,
        },
    };
    apply_profile(&mut account, &ctx.profile, now);
    tx.save_external_account(&account).await?;

    Ok(identification)
}

/// Record that the provider identity behind this verification was accepted.
async fn mark_verified(
    tx: &mut dyn StoreTx,
    ctx: &mut FlowContext<'_>,
    identification_id: Uuid,
) -> Result<(), ApiError> {
    ctx.verification.verified_at = Some(ctx.now);
    ctx.verification.identification_id = Some(identification_id);
    ctx.verification.updated_at = ctx.now;
    tx.save_verification(&ctx.verification).await?;
    Ok(())
}

/// Hand the identity over to the opposite flow. The caller still has to
/// persist the verification, which now points at the transfer.
async fn create_transfer(
    tx: &mut dyn StoreTx,
    ctx: &mut FlowContext<'_>,
    identification_id: Uuid,
    to_link_identification_id: Option<Uuid>,
) -> Result<AccountTransfer, ApiError> {
    let mut transfer = AccountTransfer::new(ctx.instance.id(), identification_id, ctx.now);
    transfer.to_link_identification_id = to_link_identification_id;
    tx.save_account_transfer(&transfer).await?;
    ctx.verification.account_transfer_id = Some(transfer.id);
    Ok(transfer)
}

#[cfg(test)]
mod tests;
