//! Storage abstraction for the federation flow.
//!
//! Every write goes through a [`StoreTx`]: callers open one with
//! [`Store::begin`], perform reads and upserts, and either `commit` or
//! `rollback`. Dropping a transaction without committing discards it.
//!
//! Two backends exist: [`postgres::PgStore`] for production and
//! [`memory::MemoryStore`] for tests and local runs without a DSN.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

pub mod memory;
pub mod models;
pub mod postgres;

use models::{
    AccountTransfer, Client, ExternalAccount, Identification, IdentificationType, Job,
    OAuth1RequestToken, Session, SignIn, SignUp, User, Verification,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait Store: Send + Sync {
    /// Open a new transaction.
    async fn begin(&self) -> StoreResult<Box<dyn StoreTx>>;

    async fn health_check(&self) -> StoreResult<()>;

    fn backend_name(&self) -> &'static str;
}

/// Unit of atomicity. All methods are instance scoped by the records they touch.
#[async_trait]
pub trait StoreTx: Send {
    async fn commit(self: Box<Self>) -> StoreResult<()>;
    async fn rollback(self: Box<Self>) -> StoreResult<()>;

    // verifications
    async fn save_verification(&mut self, verification: &Verification) -> StoreResult<()>;
    async fn verification(&mut self, id: Uuid) -> StoreResult<Option<Verification>>;
    /// Atomically bump `attempts` and return the updated row.
    async fn increment_verification_attempts(&mut self, id: Uuid) -> StoreResult<Verification>;

    // identifications
    async fn save_identification(&mut self, identification: &Identification) -> StoreResult<()>;
    async fn identification(&mut self, id: Uuid) -> StoreResult<Option<Identification>>;
    /// Most recently claimed (reserved or verified) identification for a key.
    async fn latest_claimed_identification(
        &mut self,
        instance_id: &str,
        kind: &IdentificationType,
        identifier: &str,
    ) -> StoreResult<Option<Identification>>;
    /// All claimed identifications for a key, newest first.
    async fn claimed_identifications(
        &mut self,
        instance_id: &str,
        kind: &IdentificationType,
        identifier: &str,
    ) -> StoreResult<Vec<Identification>>;
    async fn user_identifications(&mut self, user_id: Uuid) -> StoreResult<Vec<Identification>>;
    async fn delete_identification(&mut self, id: Uuid) -> StoreResult<()>;

    // external accounts
    async fn save_external_account(&mut self, account: &ExternalAccount) -> StoreResult<()>;
    async fn external_account(&mut self, id: Uuid) -> StoreResult<Option<ExternalAccount>>;
    async fn external_account_by_identification(
        &mut self,
        identification_id: Uuid,
    ) -> StoreResult<Option<ExternalAccount>>;
    async fn delete_external_account(&mut self, id: Uuid) -> StoreResult<()>;

    // account transfers
    async fn save_account_transfer(&mut self, transfer: &AccountTransfer) -> StoreResult<()>;
    async fn account_transfer(&mut self, id: Uuid) -> StoreResult<Option<AccountTransfer>>;

    // sign-ins / sign-ups
    async fn save_sign_in(&mut self, sign_in: &SignIn) -> StoreResult<()>;
    async fn sign_in(&mut self, id: Uuid) -> StoreResult<Option<SignIn>>;
    async fn save_sign_up(&mut self, sign_up: &SignUp) -> StoreResult<()>;
    async fn sign_up(&mut self, id: Uuid) -> StoreResult<Option<SignUp>>;

    // users
    async fn save_user(&mut self, user: &User) -> StoreResult<()>;
    async fn user(&mut self, id: Uuid) -> StoreResult<Option<User>>;
    /// Read a user and hold its row lock until the transaction ends.
    async fn lock_user(&mut self, id: Uuid) -> StoreResult<Option<User>>;

    // sessions
    async fn save_session(&mut self, session: &Session) -> StoreResult<()>;
    async fn session(&mut self, id: Uuid) -> StoreResult<Option<Session>>;
    async fn client_sessions(&mut self, client_id: Uuid) -> StoreResult<Vec<Session>>;

    // clients
    async fn save_client(&mut self, client: &Client) -> StoreResult<()>;
    async fn client(&mut self, id: Uuid) -> StoreResult<Option<Client>>;
    async fn client_by_rotating_token(
        &mut self,
        instance_id: &str,
        token: &str,
    ) -> StoreResult<Option<Client>>;
    async fn client_by_rotating_token_nonce(
        &mut self,
        instance_id: &str,
        nonce: &str,
    ) -> StoreResult<Option<Client>>;

    // oauth1 request tokens
    async fn save_oauth1_request_token(&mut self, token: &OAuth1RequestToken) -> StoreResult<()>;
    /// Remove and return a request token. A token can be taken once.
    async fn take_oauth1_request_token(
        &mut self,
        instance_id: &str,
        token: &str,
    ) -> StoreResult<Option<OAuth1RequestToken>>;

    // jobs
    async fn enqueue_job(&mut self, job: &Job) -> StoreResult<()>;
    async fn save_job(&mut self, job: &Job) -> StoreResult<()>;
    /// Pending jobs due at `now`, locked against concurrent workers.
    async fn pending_jobs(&mut self, limit: usize, now: DateTime<Utc>) -> StoreResult<Vec<Job>>;
}
