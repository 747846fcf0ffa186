use super::*;
use crate::{
    api::handlers::oauth::{state::Environment, state_token::ClientType},
    store::{
        Store,
        memory::{MemoryState, MemoryStore},
        models::{
            EXPIRY_TIME_TRANSACTIONAL, IdentificationType, JobKind, SessionStatus, SignIn, SignUp,
            User,
        },
    },
};
use anyhow::Result;
use chrono::Duration;
use ed25519_dalek::SigningKey;

const INSTANCE: &str = "ins_test";
const EMAIL: &str = "jane@example.com";

struct Harness {
    store: MemoryStore,
    instance: InstanceConfig,
    restrictions: Restrictions,
    now: DateTime<Utc>,
}

struct Run {
    result: Result<FlowOutcome, ApiError>,
    verification: Verification,
    state: MemoryState,
}

impl Harness {
    fn new() -> Self {
        Self {
            store: MemoryStore::new(),
            instance: InstanceConfig::new(
                INSTANCE,
                Environment::Production,
                SigningKey::from_bytes(&[5; 32]),
            ),
            restrictions: Restrictions::new(),
            now: Utc::now(),
        }
    }

    async fn client(&self) -> Result<Client> {
        let client = Client::new(INSTANCE, "token".to_string(), self.now);
        let mut tx = self.store.begin().await?;
        tx.save_client(&client).await?;
        tx.commit().await?;
        Ok(client)
    }

    async fn user_with_email(&self, email_verified: bool) -> Result<User> {
        let mut user = User::new(INSTANCE, self.now);
        let mut email = Identification::new(
            INSTANCE,
            IdentificationType::EmailAddress,
            EMAIL,
            if email_verified {
                IdentificationStatus::Verified
            } else {
                IdentificationStatus::Reserved
            },
            self.now,
        );
        email.user_id = Some(user.id);
        user.primary_email_address_id = Some(email.id);
        let mut tx = self.store.begin().await?;
        tx.save_user(&user).await?;
        tx.save_identification(&email).await?;
        tx.commit().await?;
        Ok(user)
    }

    async fn link_google(&self, user_id: Uuid) -> Result<Identification> {
        let mut ident = Identification::new(
            INSTANCE,
            IdentificationType::OAuth("google".to_string()),
            "g-123",
            IdentificationStatus::Verified,
            self.now,
        );
        ident.user_id = Some(user_id);
        let mut tx = self.store.begin().await?;
        tx.save_identification(&ident).await?;
        tx.commit().await?;
        Ok(ident)
    }

    async fn sign_in(&self, client: &Client) -> Result<Uuid> {
        let sign_in = SignIn::new(INSTANCE, client.id, self.now);
        let mut tx = self.store.begin().await?;
        tx.save_sign_in(&sign_in).await?;
        tx.commit().await?;
        Ok(sign_in.id)
    }

    async fn sign_up(&self, client: &Client) -> Result<Uuid> {
        let sign_up = SignUp::new(INSTANCE, client.id, self.now);
        let mut tx = self.store.begin().await?;
        tx.save_sign_up(&sign_up).await?;
        tx.commit().await?;
        Ok(sign_up.id)
    }

    fn claims(&self, source_type: SourceType, source_id: Uuid, client: &Client) -> StateClaims {
        StateClaims {
            ins: INSTANCE.to_string(),
            vid: Uuid::now_v7(),
            nonce: "nonce".to_string(),
            source_type,
            source_id,
            client_id: client.id,
            client_type: ClientType::Browser,
            scopes: Vec::new(),
            redirect_url: "https://app.example.com/callback".to_string(),
            action_complete_redirect_url: None,
            iat: self.now.timestamp(),
            exp: (self.now + Duration::minutes(10)).timestamp(),
        }
    }

    /// Run a transition and commit or roll back the way the callback does.
    async fn run(
        &self,
        claims: &StateClaims,
        client: Client,
        profile: UserProfile,
        signed_in_user: Option<Uuid>,
    ) -> Result<Run> {
        let verification = Verification::new(INSTANCE, "oauth_google", "nonce".to_string(), self.now);
        let mut ctx = FlowContext {
            instance: &self.instance,
            restrictions: &self.restrictions,
            claims,
            client,
            verification,
            profile,
            now: self.now,
            signed_in_user,
        };
        let mut tx = self.store.begin().await?;
        let result = finalize(tx.as_mut(), &mut ctx).await;
        match &result {
            Err(err) if !err.is_business() => tx.rollback().await?,
            _ => tx.commit().await?,
        }
        Ok(Run {
            result,
            verification: ctx.verification,
            state: self.store.snapshot().await,
        })
    }
}

fn profile(email_verified: bool) -> UserProfile {
    UserProfile {
        provider: "google".to_string(),
        provider_user_id: "g-123".to_string(),
        email_address: EMAIL.to_string(),
        email_address_verified: email_verified,
        first_name: Some("Jane".to_string()),
        avatar_url: Some("https://img.example.com/jane.png".to_string()),
        access_token: Some("access-1".to_string()),
        approved_scopes: vec!["openid".to_string()],
        ..UserProfile::default()
    }
}

fn job_kinds(state: &MemoryState) -> Vec<JobKind> {
    state.jobs.values().map(|job| job.kind).collect()
}

fn google_identifications(state: &MemoryState) -> Vec<Identification> {
    state
        .identifications
        .values()
        .filter(|ident| ident.kind == IdentificationType::OAuth("google".to_string()))
        .cloned()
        .collect()
}

#[tokio::test]
async fn sign_in_without_any_identification_creates_transfer() -> Result<()> {
    let h = Harness::new();
    let client = h.client().await?;
    let source = h.sign_in(&client).await?;
    let claims = h.claims(SourceType::SignIn, source, &client);

    let run = h.run(&claims, client, profile(true), None).await?;

    assert!(matches!(run.result, Err(ApiError::ExternalAccountNotFound)));
    let transfer_id = run.verification.account_transfer_id.ok_or_else(|| anyhow::anyhow!("no transfer"))?;
    let transfer = &run.state.account_transfers[&transfer_id];
    assert_eq!(transfer.expire_at, h.now + EXPIRY_TIME_TRANSACTIONAL);
    let external = google_identifications(&run.state);
    assert_eq!(external.len(), 1);
    assert_eq!(external[0].user_id, None);
    assert_eq!(transfer.identification_id, external[0].id);
    assert!(run.verification.verified_at.is_some());
    assert!(run.state.sessions.is_empty());
    Ok(())
}

#[tokio::test]
async fn sign_in_via_verified_email_creates_active_session() -> Result<()> {
    let h = Harness::new();
    let user = h.user_with_email(true).await?;
    let client = h.client().await?;
    let source = h.sign_in(&client).await?;
    let claims = h.claims(SourceType::SignIn, source, &client);

    let run = h.run(&claims, client, profile(true), None).await?;

    let FlowOutcome::SessionCreated(session) = run.result? else {
        anyhow::bail!("expected a session");
    };
    assert_eq!(session.status, SessionStatus::Active);
    assert_eq!(session.user_id, user.id);
    assert_eq!(job_kinds(&run.state), vec![JobKind::SessionCreated]);
    assert_eq!(run.state.sign_ins[&source].created_session_id, Some(session.id));
    assert!(run.state.account_transfers.is_empty());
    let external = google_identifications(&run.state);
    assert_eq!(external[0].user_id, Some(user.id));
    assert_eq!(
        run.state.clients[&session.client_id].last_active_session_id,
        Some(session.id)
    );
    Ok(())
}

#[tokio::test]
async fn sign_in_with_unverified_email_defers_to_email_verification() -> Result<()> {
    let h = Harness::new();
    let user = h.user_with_email(true).await?;
    let client = h.client().await?;
    let source = h.sign_in(&client).await?;
    let claims = h.claims(SourceType::SignIn, source, &client);

    let run = h.run(&claims, client, profile(false), None).await?;

    assert_eq!(run.result?, FlowOutcome::PendingFirstFactor);
    let external = google_identifications(&run.state);
    assert_eq!(external[0].user_id, None);
    assert!(external[0].requires_verification);
    assert_eq!(
        external[0].target_identification_id,
        user.primary_email_address_id
    );
    let sign_in = &run.state.sign_ins[&source];
    assert_eq!(sign_in.identification_id, user.primary_email_address_id);
    assert_eq!(sign_in.to_link_identification_id, Some(external[0].id));
    assert!(run.state.account_transfers.is_empty());
    assert!(run.state.sessions.is_empty());
    Ok(())
}

#[tokio::test]
async fn sign_in_decisions_are_mutually_exclusive() -> Result<()> {
    for (existing_user, email_verified) in [(false, true), (true, true), (true, false)] {
        let h = Harness::new();
        if existing_user {
            h.user_with_email(true).await?;
        }
        let client = h.client().await?;
        let source = h.sign_in(&client).await?;
        let claims = h.claims(SourceType::SignIn, source, &client);

        let run = h.run(&claims, client, profile(email_verified), None).await?;

        let transfers = run.state.account_transfers.len();
        let sessions = run.state.sessions.len();
        let pending = usize::from(matches!(run.result, Ok(FlowOutcome::PendingFirstFactor)));
        assert_eq!(transfers + sessions + pending, 1);
    }
    Ok(())
}

#[tokio::test]
async fn sign_in_syncs_lockout_and_password_reset() -> Result<()> {
    let h = Harness::new();
    let mut user = h.user_with_email(true).await?;
    user.failed_verification_attempts = 3;
    user.password_reset_required = true;
    let mut tx = h.store.begin().await?;
    tx.save_user(&user).await?;
    tx.commit().await?;
    let client = h.client().await?;
    let source = h.sign_in(&client).await?;
    let claims = h.claims(SourceType::SignIn, source, &client);

    let run = h.run(&claims, client, profile(true), None).await?;

    assert!(run.result?.session().is_some());
    let stored = &run.state.users[&user.id];
    assert_eq!(stored.failed_verification_attempts, 0);
    assert!(!stored.password_reset_required);
    assert!(!run.state.sign_ins[&source].reset_password_pending);
    Ok(())
}

#[tokio::test]
async fn sign_in_stops_for_second_factor() -> Result<()> {
    let h = Harness::new();
    let mut user = h.user_with_email(true).await?;
    user.two_factor_enabled = true;
    let mut tx = h.store.begin().await?;
    tx.save_user(&user).await?;
    tx.commit().await?;
    let client = h.client().await?;
    let source = h.sign_in(&client).await?;
    let claims = h.claims(SourceType::SignIn, source, &client);

    let run = h.run(&claims, client, profile(true), None).await?;

    assert_eq!(run.result?, FlowOutcome::NeedsSecondFactor);
    assert!(run.state.sessions.is_empty());
    assert!(run.state.sign_ins[&source].first_factor_success_identification_id.is_some());
    Ok(())
}

#[tokio::test]
async fn sign_in_refuses_locked_users() -> Result<()> {
    let h = Harness::new();
    let mut user = h.user_with_email(true).await?;
    user.locked_until = Some(h.now + Duration::minutes(5));
    let mut tx = h.store.begin().await?;
    tx.save_user(&user).await?;
    tx.commit().await?;
    let client = h.client().await?;
    let source = h.sign_in(&client).await?;
    let claims = h.claims(SourceType::SignIn, source, &client);

    let run = h.run(&claims, client, profile(true), None).await?;

    assert!(matches!(run.result, Err(ApiError::UserLocked)));
    assert!(google_identifications(&run.state).is_empty());
    Ok(())
}

#[tokio::test]
async fn single_session_mode_rejects_another_user() -> Result<()> {
    let mut h = Harness::new();
    h.instance = h.instance.clone().with_single_session_mode(true);
    h.user_with_email(true).await?;
    let client = h.client().await?;
    let source = h.sign_in(&client).await?;
    let claims = h.claims(SourceType::SignIn, source, &client);

    let run = h
        .run(&claims, client, profile(true), Some(Uuid::now_v7()))
        .await?;

    assert!(matches!(run.result, Err(ApiError::AlreadySignedIn)));
    assert!(run.state.sessions.is_empty());
    assert!(google_identifications(&run.state).is_empty());
    Ok(())
}

#[tokio::test]
async fn blocked_identifiers_leave_no_trace() -> Result<()> {
    let mut h = Harness::new();
    h.restrictions = Restrictions::new().with_blocklist(vec!["example.com".to_string()]);
    let client = h.client().await?;
    let source = h.sign_in(&client).await?;
    let claims = h.claims(SourceType::SignIn, source, &client);

    let run = h.run(&claims, client, profile(true), None).await?;

    assert!(matches!(run.result, Err(ApiError::IdentifierNotAllowed(_))));
    assert!(run.state.identifications.is_empty());
    assert!(run.verification.verified_at.is_none());
    Ok(())
}

#[tokio::test]
async fn native_sign_in_creates_pending_session() -> Result<()> {
    let h = Harness::new();
    h.user_with_email(true).await?;
    let client = h.client().await?;
    let source = h.sign_in(&client).await?;
    let mut claims = h.claims(SourceType::SignIn, source, &client);
    claims.client_type = ClientType::Native;

    let run = h.run(&claims, client, profile(true), None).await?;

    let FlowOutcome::SessionCreated(session) = run.result? else {
        anyhow::bail!("expected a session");
    };
    assert_eq!(session.status, SessionStatus::PendingActivation);
    assert!(run.state.jobs.is_empty());
    Ok(())
}

#[tokio::test]
async fn missing_records_roll_back_the_transition() -> Result<()> {
    let h = Harness::new();
    let mut ident = Identification::new(
        INSTANCE,
        IdentificationType::OAuth("google".to_string()),
        "g-123",
        IdentificationStatus::Verified,
        h.now,
    );
    // Linked to a user row that does not exist.
    ident.user_id = Some(Uuid::now_v7());
    let mut tx = h.store.begin().await?;
    tx.save_identification(&ident).await?;
    tx.commit().await?;
    let client = h.client().await?;
    let source = h.sign_in(&client).await?;
    let claims = h.claims(SourceType::SignIn, source, &client);
    let before = h.store.snapshot().await;

    let run = h.run(&claims, client, profile(true), None).await?;

    let err = match run.result {
        Err(err) => err,
        Ok(outcome) => anyhow::bail!("expected an error, got {outcome:?}"),
    };
    assert!(matches!(err, ApiError::ResourceNotFound(_)));
    assert!(!err.is_business());
    assert_eq!(run.state.identifications, before.identifications);
    assert_eq!(run.state.sign_ins, before.sign_ins);
    assert!(run.state.sessions.is_empty());
    assert!(run.state.verifications.is_empty());
    Ok(())
}

#[tokio::test]
async fn sign_up_creates_user_identifications_and_session() -> Result<()> {
    let h = Harness::new();
    let client = h.client().await?;
    let source = h.sign_up(&client).await?;
    let claims = h.claims(SourceType::SignUp, source, &client);

    let run = h.run(&claims, client, profile(true), None).await?;

    let FlowOutcome::SessionCreated(session) = run.result? else {
        anyhow::bail!("expected a session");
    };
    let user = &run.state.users[&session.user_id];
    assert_eq!(user.first_name.as_deref(), Some("Jane"));
    let primary = user
        .primary_email_address_id
        .ok_or_else(|| anyhow::anyhow!("no primary email"))?;
    let email = &run.state.identifications[&primary];
    assert_eq!(email.identifier, EMAIL);
    assert!(email.is_verified());
    assert_eq!(email.user_id, Some(user.id));
    assert_eq!(google_identifications(&run.state)[0].user_id, Some(user.id));
    let mut kinds = job_kinds(&run.state);
    kinds.sort_by_key(|kind| kind.as_str());
    assert_eq!(kinds, vec![JobKind::SessionCreated, JobKind::UserCreated]);
    let sign_up = &run.state.sign_ups[&source];
    assert_eq!(sign_up.created_user_id, Some(user.id));
    assert_eq!(sign_up.created_session_id, Some(session.id));
    Ok(())
}

#[tokio::test]
async fn sign_up_for_existing_user_transfers_to_sign_in() -> Result<()> {
    let h = Harness::new();
    let user = h.user_with_email(true).await?;
    let client = h.client().await?;
    let source = h.sign_up(&client).await?;
    let claims = h.claims(SourceType::SignUp, source, &client);

    let run = h.run(&claims, client, profile(true), None).await?;

    assert!(matches!(run.result, Err(ApiError::IdentificationExists)));
    let transfer_id = run.verification.account_transfer_id.ok_or_else(|| anyhow::anyhow!("no transfer"))?;
    let transfer = &run.state.account_transfers[&transfer_id];
    assert_eq!(transfer.to_link_identification_id, user.primary_email_address_id);
    assert_eq!(run.state.users.len(), 1);
    assert!(run.state.sessions.is_empty());
    Ok(())
}

#[tokio::test]
async fn sign_up_with_unverified_email_waits_for_verification() -> Result<()> {
    let h = Harness::new();
    let client = h.client().await?;
    let source = h.sign_up(&client).await?;
    let claims = h.claims(SourceType::SignUp, source, &client);

    let run = h.run(&claims, client, profile(false), None).await?;

    assert_eq!(run.result?, FlowOutcome::SignUpPending);
    assert!(run.state.users.is_empty());
    let sign_up = &run.state.sign_ups[&source];
    let email_id = sign_up
        .email_address_id
        .ok_or_else(|| anyhow::anyhow!("no email"))?;
    assert_eq!(
        run.state.identifications[&email_id].status,
        IdentificationStatus::Reserved
    );
    Ok(())
}

#[tokio::test]
async fn resumed_sign_up_links_one_email_identification() -> Result<()> {
    let h = Harness::new();
    let client = h.client().await?;
    let source = h.sign_up(&client).await?;
    let claims = h.claims(SourceType::SignUp, source, &client);

    let first = h.run(&claims, client.clone(), profile(false), None).await?;
    assert_eq!(first.result?, FlowOutcome::SignUpPending);

    let run = h.run(&claims, client, profile(true), None).await?;

    let FlowOutcome::SessionCreated(session) = run.result? else {
        anyhow::bail!("expected a session");
    };
    let emails: Vec<&Identification> = run
        .state
        .identifications
        .values()
        .filter(|ident| ident.kind == IdentificationType::EmailAddress)
        .collect();
    assert_eq!(emails.len(), 1);
    assert!(emails[0].is_verified());
    assert_eq!(emails[0].user_id, Some(session.user_id));
    assert_eq!(
        run.state.users[&session.user_id].primary_email_address_id,
        Some(emails[0].id)
    );
    assert_eq!(google_identifications(&run.state).len(), 1);
    Ok(())
}

#[tokio::test]
async fn sign_up_refuses_email_owned_by_someone_else() -> Result<()> {
    let h = Harness::new();
    h.user_with_email(true).await?;
    let client = h.client().await?;
    let source = h.sign_up(&client).await?;
    let claims = h.claims(SourceType::SignUp, source, &client);

    let run = h.run(&claims, client, profile(false), None).await?;

    assert!(matches!(run.result, Err(ApiError::IdentificationClaimed)));
    assert_eq!(run.state.users.len(), 1);
    Ok(())
}

#[tokio::test]
async fn connect_links_account_and_backfills_avatar() -> Result<()> {
    let h = Harness::new();
    let user = h.user_with_email(true).await?;
    let client = h.client().await?;
    let claims = h.claims(SourceType::Connect, user.id, &client);

    let run = h.run(&claims, client, profile(true), Some(user.id)).await?;

    assert_eq!(run.result?, FlowOutcome::Connected);
    let stored = &run.state.users[&user.id];
    assert_eq!(
        stored.profile_image_url.as_deref(),
        Some("https://img.example.com/jane.png")
    );
    assert_eq!(google_identifications(&run.state)[0].user_id, Some(user.id));
    assert_eq!(job_kinds(&run.state), vec![JobKind::UserUpdated]);
    Ok(())
}

#[tokio::test]
async fn connect_requires_the_users_session() -> Result<()> {
    let h = Harness::new();
    let user = h.user_with_email(true).await?;
    let client = h.client().await?;
    let claims = h.claims(SourceType::Connect, user.id, &client);

    let run = h.run(&claims, client, profile(true), None).await?;

    assert!(matches!(run.result, Err(ApiError::NotSignedIn)));
    Ok(())
}

#[tokio::test]
async fn connect_rejects_already_connected_or_foreign_accounts() -> Result<()> {
    let h = Harness::new();
    let user = h.user_with_email(true).await?;
    h.link_google(user.id).await?;
    let client = h.client().await?;
    let claims = h.claims(SourceType::Connect, user.id, &client);
    let run = h.run(&claims, client, profile(true), Some(user.id)).await?;
    assert!(matches!(run.result, Err(ApiError::ExternalAccountExists)));

    let h = Harness::new();
    let other = User::new(INSTANCE, h.now);
    h.link_google(other.id).await?;
    let user = h.user_with_email(true).await?;
    let client = h.client().await?;
    let claims = h.claims(SourceType::Connect, user.id, &client);
    let run = h.run(&claims, client, profile(true), Some(user.id)).await?;
    assert!(matches!(run.result, Err(ApiError::IdentificationClaimed)));
    Ok(())
}

#[tokio::test]
async fn connect_rejects_second_account_of_a_linked_provider() -> Result<()> {
    let h = Harness::new();
    let user = h.user_with_email(true).await?;
    h.link_google(user.id).await?;
    let client = h.client().await?;
    let claims = h.claims(SourceType::Connect, user.id, &client);
    let mut other_account = profile(true);
    other_account.provider_user_id = "g-999".to_string();

    let run = h.run(&claims, client, other_account, Some(user.id)).await?;

    assert!(matches!(run.result, Err(ApiError::ExternalAccountExists)));
    let external = google_identifications(&run.state);
    assert_eq!(external.len(), 1);
    assert_eq!(external[0].identifier, "g-123");
    assert!(run.state.external_accounts.is_empty());
    assert!(run.state.jobs.is_empty());
    Ok(())
}

#[tokio::test]
async fn reauthorize_refreshes_linked_account() -> Result<()> {
    let h = Harness::new();
    let user = h.user_with_email(true).await?;
    let ident = h.link_google(user.id).await?;
    let client = h.client().await?;
    let claims = h.claims(SourceType::Reauthorize, user.id, &client);
    let mut refreshed = profile(true);
    refreshed.access_token = Some("access-2".to_string());
    refreshed.approved_scopes = vec!["openid".to_string(), "calendar".to_string()];

    let run = h.run(&claims, client, refreshed, Some(user.id)).await?;

    assert_eq!(run.result?, FlowOutcome::Reauthorized);
    let account = run
        .state
        .external_accounts
        .values()
        .find(|account| account.identification_id == ident.id)
        .ok_or_else(|| anyhow::anyhow!("account missing"))?;
    assert_eq!(account.access_token.as_deref(), Some("access-2"));
    assert_eq!(account.approved_scopes.len(), 2);
    assert_eq!(run.verification.identification_id, Some(ident.id));
    Ok(())
}

#[tokio::test]
async fn reauthorize_without_link_fails() -> Result<()> {
    let h = Harness::new();
    let user = h.user_with_email(true).await?;
    let client = h.client().await?;
    let claims = h.claims(SourceType::Reauthorize, user.id, &client);

    let run = h.run(&claims, client, profile(true), Some(user.id)).await?;

    assert!(matches!(run.result, Err(ApiError::ExternalAccountNotFound)));
    Ok(())
}
