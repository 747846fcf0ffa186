//! Session issuance for completed sign-ins and sign-ups.

use chrono::{DateTime, Duration, Utc};
use serde_json::{Value, json};
use tracing::debug;
use uuid::Uuid;

use super::{errors::ApiError, state::InstanceConfig, utils::generate_token};
use crate::{
    api::jobs,
    store::{
        StoreTx,
        models::{Client, JobKind, Session, SessionStatus, User},
    },
};

/// Impersonation sessions never outlive this, whatever the instance allows.
pub const ACTOR_SESSION_LIFETIME: Duration = Duration::hours(1);

#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Impersonator claims for actor sessions.
    pub actor: Option<Value>,
    /// Native clients receive the session only after the handshake.
    pub pending_activation: bool,
}

fn session_created_payload(session: &Session) -> Value {
    json!({
        "session_id": session.id,
        "user_id": session.user_id,
        "client_id": session.client_id,
        "status": session.status.as_str(),
        "expire_at": session.expire_at,
    })
}

/// Create a session for `user` on `client` and rotate the client token.
///
/// # Errors
/// `UserBanned` for banned users, store failures otherwise.
pub async fn create_session(
    tx: &mut dyn StoreTx,
    instance: &InstanceConfig,
    client: &mut Client,
    user: &mut User,
    options: SessionOptions,
    now: DateTime<Utc>,
) -> Result<Session, ApiError> {
    if user.banned {
        return Err(ApiError::UserBanned);
    }

    let lifetime = if options.actor.is_some() {
        instance.session_lifetime().min(ACTOR_SESSION_LIFETIME)
    } else {
        instance.session_lifetime()
    };
    let expire_at = now + lifetime;
    let abandon_at = (now + instance.session_inactivity_timeout()).min(expire_at);

    let status = if options.pending_activation {
        SessionStatus::PendingActivation
    } else {
        SessionStatus::Active
    };

    let session = Session {
        id: Uuid::now_v7(),
        instance_id: instance.id().to_string(),
        client_id: client.id,
        user_id: user.id,
        status,
        actor: options.actor,
        expire_at,
        abandon_at,
        last_active_at: now,
        created_at: now,
        updated_at: now,
    };

    // The impersonated user's activity is not touched by an actor.
    if session.actor.is_none() {
        user.last_active_at = Some(now);
        user.updated_at = now;
        tx.save_user(user).await?;
    }

    client.rotating_token = generate_token()?;
    client.updated_at = now;
    if status == SessionStatus::Active {
        client.last_active_session_id = Some(session.id);
    }

    tx.save_session(&session).await?;
    tx.save_client(client).await?;

    if status == SessionStatus::Active {
        jobs::enqueue(
            tx,
            instance.id(),
            JobKind::SessionCreated,
            session_created_payload(&session),
            now,
        )
        .await?;
    }

    debug!(session_id = %session.id, status = status.as_str(), "session created");
    Ok(session)
}

/// Move a pending session to active and fire `session.created`.
///
/// # Errors
/// Store failures. Sessions that are not pending are returned unchanged.
pub async fn activate(
    tx: &mut dyn StoreTx,
    client: &mut Client,
    mut session: Session,
    now: DateTime<Utc>,
) -> Result<Session, ApiError> {
    if session.status != SessionStatus::PendingActivation {
        return Ok(session);
    }

    session.status = SessionStatus::Active;
    session.last_active_at = now;
    session.updated_at = now;
    tx.save_session(&session).await?;

    client.last_active_session_id = Some(session.id);
    client.updated_at = now;
    tx.save_client(client).await?;

    jobs::enqueue(
        tx,
        &session.instance_id,
        JobKind::SessionCreated,
        session_created_payload(&session),
        now,
    )
    .await?;
    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::handlers::oauth::state::Environment;
    use crate::store::{Store, memory::MemoryStore};
    use anyhow::Result;
    use ed25519_dalek::SigningKey;

    fn instance() -> InstanceConfig {
        InstanceConfig::new(
            "ins_test",
            Environment::Production,
            SigningKey::from_bytes(&[3; 32]),
        )
        .with_session_lifetime_seconds(7200)
        .with_session_inactivity_seconds(600)
    }

    fn fixtures(now: DateTime<Utc>) -> (Client, User) {
        (
            Client::new("ins_test", "initial".to_string(), now),
            User::new("ins_test", now),
        )
    }

    #[tokio::test]
    async fn active_session_rotates_token_and_fires_event() -> Result<()> {
        let store = MemoryStore::new();
        let now = Utc::now();
        let (mut client, mut user) = fixtures(now);

        let mut tx = store.begin().await?;
        let session = create_session(
            tx.as_mut(),
            &instance(),
            &mut client,
            &mut user,
            SessionOptions::default(),
            now,
        )
        .await?;
        tx.commit().await?;

        assert_eq!(session.status, SessionStatus::Active);
        assert_eq!(session.expire_at, now + Duration::seconds(7200));
        assert_eq!(session.abandon_at, now + Duration::seconds(600));
        assert_ne!(client.rotating_token, "initial");
        assert_eq!(client.last_active_session_id, Some(session.id));
        assert_eq!(user.last_active_at, Some(now));

        let state = store.snapshot().await;
        let events: Vec<_> = state.jobs.values().map(|job| job.kind).collect();
        assert_eq!(events, vec![JobKind::SessionCreated]);
        Ok(())
    }

    #[tokio::test]
    async fn pending_session_fires_on_activation_only() -> Result<()> {
        let store = MemoryStore::new();
        let now = Utc::now();
        let (mut client, mut user) = fixtures(now);

        let mut tx = store.begin().await?;
        let session = create_session(
            tx.as_mut(),
            &instance(),
            &mut client,
            &mut user,
            SessionOptions {
                pending_activation: true,
                ..SessionOptions::default()
            },
            now,
        )
        .await?;
        assert_eq!(client.last_active_session_id, None);
        let session = activate(tx.as_mut(), &mut client, session, now).await?;
        tx.commit().await?;

        assert_eq!(session.status, SessionStatus::Active);
        assert_eq!(client.last_active_session_id, Some(session.id));
        assert_eq!(store.snapshot().await.jobs.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn actor_sessions_are_capped_and_do_not_touch_user() -> Result<()> {
        let store = MemoryStore::new();
        let now = Utc::now();
        let (mut client, mut user) = fixtures(now);

        let mut tx = store.begin().await?;
        let session = create_session(
            tx.as_mut(),
            &instance(),
            &mut client,
            &mut user,
            SessionOptions {
                actor: Some(json!({"sub": "admin_1"})),
                ..SessionOptions::default()
            },
            now,
        )
        .await?;

        assert_eq!(session.expire_at, now + ACTOR_SESSION_LIFETIME);
        assert_eq!(user.last_active_at, None);
        Ok(())
    }

    #[tokio::test]
    async fn banned_users_get_no_session() -> Result<()> {
        let store = MemoryStore::new();
        let now = Utc::now();
        let (mut client, mut user) = fixtures(now);
        user.banned = true;

        let mut tx = store.begin().await?;
        let result = create_session(
            tx.as_mut(),
            &instance(),
            &mut client,
            &mut user,
            SessionOptions::default(),
            now,
        )
        .await;
        assert!(matches!(result, Err(ApiError::UserBanned)));
        assert_eq!(client.rotating_token, "initial");
        Ok(())
    }
}
