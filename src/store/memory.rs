//! In-memory implementation of the store.
//!
//! State lives in `HashMap`s behind a single `tokio::sync::Mutex`. A transaction
//! takes the lock for its whole lifetime and works on a private copy, which is
//! written back on `commit`. Transactions are therefore fully serialized, which
//! gives the same isolation the finalizer expects from Postgres row locks.
//!
//! Not durable: everything is lost on restart. Used by tests and by local runs
//! started without a DSN. A task must not open a second transaction while it
//! still holds one.

use super::{
    Store, StoreError, StoreResult, StoreTx,
    models::{
        AccountTransfer, Client, ExternalAccount, Identification, IdentificationType, Job,
        JobStatus, OAuth1RequestToken, Session, SignIn, SignUp, User, Verification,
    },
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

#[derive(Clone, Debug, Default)]
pub struct MemoryState {
    pub verifications: HashMap<Uuid, Verification>,
    pub identifications: HashMap<Uuid, Identification>,
    pub external_accounts: HashMap<Uuid, ExternalAccount>,
    pub account_transfers: HashMap<Uuid, AccountTransfer>,
    pub sign_ins: HashMap<Uuid, SignIn>,
    pub sign_ups: HashMap<Uuid, SignUp>,
    pub users: HashMap<Uuid, User>,
    pub sessions: HashMap<Uuid, Session>,
    pub clients: HashMap<Uuid, Client>,
    pub oauth1_tokens: HashMap<(String, String), OAuth1RequestToken>,
    pub jobs: HashMap<Uuid, Job>,
}

#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the committed state.
    pub async fn snapshot(&self) -> MemoryState {
        self.state.lock().await.clone()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> StoreResult<Box<dyn StoreTx>> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryTx { guard, working }))
    }

    async fn health_check(&self) -> StoreResult<()> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

pub struct MemoryTx {
    guard: OwnedMutexGuard<MemoryState>,
    working: MemoryState,
}

impl MemoryTx {
    fn claimed_matching<'a>(
        &'a self,
        instance_id: &'a str,
        kind: &'a IdentificationType,
        identifier: &'a str,
    ) -> impl Iterator<Item = &'a Identification> + 'a {
        self.working.identifications.values().filter(move |ident| {
            ident.is_claimed()
                && ident.instance_id == instance_id
                && &ident.kind == kind
                && ident.identifier == identifier
        })
    }
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let MemoryTx { mut guard, working } = *self;
        *guard = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        Ok(())
    }

    async fn save_verification(&mut self, verification: &Verification) -> StoreResult<()> {
        self.working
            .verifications
            .insert(verification.id, verification.clone());
        Ok(())
    }

    async fn verification(&mut self, id: Uuid) -> StoreResult<Option<Verification>> {
        Ok(self.working.verifications.get(&id).cloned())
    }

    async fn increment_verification_attempts(&mut self, id: Uuid) -> StoreResult<Verification> {
        let verification = self
            .working
            .verifications
            .get_mut(&id)
            .ok_or(StoreError::NotFound)?;
        verification.attempts += 1;
        verification.updated_at = Utc::now();
        Ok(verification.clone())
    }

    async fn save_identification(&mut self, identification: &Identification) -> StoreResult<()> {
        if identification.is_claimed() {
            let taken = self
                .claimed_matching(
                    &identification.instance_id,
                    &identification.kind,
                    &identification.identifier,
                )
                .any(|other| other.id != identification.id);
            if taken {
                return Err(StoreError::Conflict(format!(
                    "identification {} ({}) already claimed",
                    identification.identifier, identification.kind
                )));
            }
        }
        self.working
            .identifications
            .insert(identification.id, identification.clone());
        Ok(())
    }

    async fn identification(&mut self, id: Uuid) -> StoreResult<Option<Identification>> {
        Ok(self.working.identifications.get(&id).cloned())
    }

    async fn latest_claimed_identification(
        &mut self,
        instance_id: &str,
        kind: &IdentificationType,
        identifier: &str,
    ) -> StoreResult<Option<Identification>> {
        Ok(self
            .claimed_matching(instance_id, kind, identifier)
            .max_by_key(|ident| (ident.updated_at, ident.id))
            .cloned())
    }

    async fn claimed_identifications(
        &mut self,
        instance_id: &str,
        kind: &IdentificationType,
        identifier: &str,
    ) -> StoreResult<Vec<Identification>> {
        let mut found: Vec<Identification> = self
            .claimed_matching(instance_id, kind, identifier)
            .cloned()
            .collect();
        found.sort_by(|a, b| (b.updated_at, b.id).cmp(&(a.updated_at, a.id)));
        Ok(found)
    }

    async fn user_identifications(&mut self, user_id: Uuid) -> StoreResult<Vec<Identification>> {
        let mut found: Vec<Identification> = self
            .working
            .identifications
            .values()
            .filter(|ident| ident.user_id == Some(user_id))
            .cloned()
            .collect();
        found.sort_by_key(|ident| (ident.created_at, ident.id));
        Ok(found)
    }

    async fn delete_identification(&mut self, id: Uuid) -> StoreResult<()> {
        self.working
            .identifications
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::NotFound)
    }

    async fn save_external_account(&mut self, account: &ExternalAccount) -> StoreResult<()> {
        self.working
            .external_accounts
            .insert(account.id, account.clone());
        Ok(())
    }

    async fn external_account(&mut self, id: Uuid) -> StoreResult<Option<ExternalAccount>> {
        Ok(self.working.external_accounts.get(&id).cloned())
    }

    async fn external_account_by_identification(
        &mut self,
        identification_id: Uuid,
    ) -> StoreResult<Option<ExternalAccount>> {
        Ok(self
            .working
            .external_accounts
            .values()
            .find(|account| account.identification_id == identification_id)
            .cloned())
    }

    async fn delete_external_account(&mut self, id: Uuid) -> StoreResult<()> {
        self.working
            .external_accounts
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::NotFound)
    }

    async fn save_account_transfer(&mut self, transfer: &AccountTransfer) -> StoreResult<()> {
        self.working
            .account_transfers
            .insert(transfer.id, transfer.clone());
        Ok(())
    }

    async fn account_transfer(&mut self, id: Uuid) -> StoreResult<Option<AccountTransfer>> {
        Ok(self.working.account_transfers.get(&id).cloned())
    }

    async fn save_sign_in(&mut self, sign_in: &SignIn) -> StoreResult<()> {
        self.working.sign_ins.insert(sign_in.id, sign_in.clone());
        Ok(())
    }

    async fn sign_in(&mut self, id: Uuid) -> StoreResult<Option<SignIn>> {
        Ok(self.working.sign_ins.get(&id).cloned())
    }

    async fn save_sign_up(&mut self, sign_up: &SignUp) -> StoreResult<()> {
        self.working.sign_ups.insert(sign_up.id, sign_up.clone());
        Ok(())
    }

    async fn sign_up(&mut self, id: Uuid) -> StoreResult<Option<SignUp>> {
        Ok(self.working.sign_ups.get(&id).cloned())
    }

    async fn save_user(&mut self, user: &User) -> StoreResult<()> {
        self.working.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn user(&mut self, id: Uuid) -> StoreResult<Option<User>> {
        Ok(self.working.users.get(&id).cloned())
    }

    async fn lock_user(&mut self, id: Uuid) -> StoreResult<Option<User>> {
        // The transaction already holds the global lock.
        Ok(self.working.users.get(&id).cloned())
    }

    async fn save_session(&mut self, session: &Session) -> StoreResult<()> {
        self.working.sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn session(&mut self, id: Uuid) -> StoreResult<Option<Session>> {
        Ok(self.working.sessions.get(&id).cloned())
    }

    async fn client_sessions(&mut self, client_id: Uuid) -> StoreResult<Vec<Session>> {
        let mut found: Vec<Session> = self
            .working
            .sessions
            .values()
            .filter(|session| session.client_id == client_id)
            .cloned()
            .collect();
        found.sort_by_key(|session| (session.created_at, session.id));
        Ok(found)
    }

    async fn save_client(&mut self, client: &Client) -> StoreResult<()> {
        self.working.clients.insert(client.id, client.clone());
        Ok(())
    }

    async fn client(&mut self, id: Uuid) -> StoreResult<Option<Client>> {
        Ok(self.working.clients.get(&id).cloned())
    }

    async fn client_by_rotating_token(
        &mut self,
        instance_id: &str,
        token: &str,
    ) -> StoreResult<Option<Client>> {
        Ok(self
            .working
            .clients
            .values()
            .find(|client| client.instance_id == instance_id && client.rotating_token == token)
            .cloned())
    }

    async fn client_by_rotating_token_nonce(
        &mut self,
        instance_id: &str,
        nonce: &str,
    ) -> StoreResult<Option<Client>> {
        Ok(self
            .working
            .clients
            .values()
            .find(|client| {
                client.instance_id == instance_id
                    && client.rotating_token_nonce.as_deref() == Some(nonce)
            })
            .cloned())
    }

    async fn save_oauth1_request_token(&mut self, token: &OAuth1RequestToken) -> StoreResult<()> {
        self.working.oauth1_tokens.insert(
            (token.instance_id.clone(), token.token.clone()),
            token.clone(),
        );
        Ok(())
    }

    async fn take_oauth1_request_token(
        &mut self,
        instance_id: &str,
        token: &str,
    ) -> StoreResult<Option<OAuth1RequestToken>> {
        Ok(self
            .working
            .oauth1_tokens
            .remove(&(instance_id.to_string(), token.to_string())))
    }

    async fn enqueue_job(&mut self, job: &Job) -> StoreResult<()> {
        if self.working.jobs.contains_key(&job.id) {
            return Err(StoreError::Conflict(format!("job {} already enqueued", job.id)));
        }
        self.working.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn save_job(&mut self, job: &Job) -> StoreResult<()> {
        self.working.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn pending_jobs(&mut self, limit: usize, now: DateTime<Utc>) -> StoreResult<Vec<Job>> {
        let mut due: Vec<Job> = self
            .working
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Pending && job.next_attempt_at <= now)
            .cloned()
            .collect();
        due.sort_by_key(|job| (job.next_attempt_at, job.id));
        due.truncate(limit);
        Ok(due)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::models::{IdentificationStatus, JobKind};
    use anyhow::Result;

    fn email(identifier: &str, status: IdentificationStatus) -> Identification {
        Identification::new(
            "ins_test",
            IdentificationType::EmailAddress,
            identifier,
            status,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn rollback_discards_writes() -> Result<()> {
        let store = MemoryStore::new();
        let mut tx = store.begin().await?;
        tx.save_user(&User::new("ins_test", Utc::now())).await?;
        tx.rollback().await?;
        assert!(store.snapshot().await.users.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn dropped_transaction_discards_writes() -> Result<()> {
        let store = MemoryStore::new();
        {
            let mut tx = store.begin().await?;
            tx.save_user(&User::new("ins_test", Utc::now())).await?;
        }
        assert!(store.snapshot().await.users.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn commit_persists_writes() -> Result<()> {
        let store = MemoryStore::new();
        let user = User::new("ins_test", Utc::now());
        let mut tx = store.begin().await?;
        tx.save_user(&user).await?;
        tx.commit().await?;
        assert_eq!(store.snapshot().await.users.get(&user.id), Some(&user));
        Ok(())
    }

    #[tokio::test]
    async fn claimed_identifications_are_unique_per_key() -> Result<()> {
        let store = MemoryStore::new();
        let mut tx = store.begin().await?;
        tx.save_identification(&email("a@example.com", IdentificationStatus::Verified))
            .await?;
        let duplicate = email("a@example.com", IdentificationStatus::Reserved);
        let err = tx.save_identification(&duplicate).await;
        assert!(matches!(err, Err(StoreError::Conflict(_))));

        // Unclaimed rows do not participate in the uniqueness rule.
        tx.save_identification(&email("a@example.com", IdentificationStatus::NotSet))
            .await?;
        Ok(())
    }

    #[tokio::test]
    async fn increment_attempts_returns_updated_row() -> Result<()> {
        let store = MemoryStore::new();
        let verification =
            Verification::new("ins_test", "oauth_google", "nonce".to_string(), Utc::now());
        let mut tx = store.begin().await?;
        tx.save_verification(&verification).await?;
        let first = tx.increment_verification_attempts(verification.id).await?;
        let second = tx.increment_verification_attempts(verification.id).await?;
        assert_eq!(first.attempts, 1);
        assert_eq!(second.attempts, 2);
        let missing = tx.increment_verification_attempts(Uuid::now_v7()).await;
        assert!(matches!(missing, Err(StoreError::NotFound)));
        Ok(())
    }

    #[tokio::test]
    async fn oauth1_request_token_can_be_taken_once() -> Result<()> {
        let store = MemoryStore::new();
        let mut tx = store.begin().await?;
        tx.save_oauth1_request_token(&OAuth1RequestToken {
            token: "req".to_string(),
            secret: "secret".to_string(),
            instance_id: "ins_test".to_string(),
            created_at: Utc::now(),
        })
        .await?;
        assert!(tx.take_oauth1_request_token("ins_test", "req").await?.is_some());
        assert!(tx.take_oauth1_request_token("ins_test", "req").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn pending_jobs_skip_future_and_sent_jobs() -> Result<()> {
        let store = MemoryStore::new();
        let now = Utc::now();
        let due = Job::new("ins_test", JobKind::UserCreated, serde_json::json!({}), now);
        let mut later = Job::new("ins_test", JobKind::UserUpdated, serde_json::json!({}), now);
        later.next_attempt_at = now + chrono::Duration::minutes(5);
        let mut sent = Job::new("ins_test", JobKind::SessionCreated, serde_json::json!({}), now);
        sent.status = JobStatus::Sent;

        let mut tx = store.begin().await?;
        for job in [&due, &later, &sent] {
            tx.enqueue_job(job).await?;
        }
        let pending = tx.pending_jobs(10, now).await?;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, due.id);
        Ok(())
    }
}
