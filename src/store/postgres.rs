//! Postgres implementation of the store (`sqlx`).
//!
//! Each [`PgTx`] wraps one `sqlx::Transaction`. Enums are stored as text and
//! parsed back through their `FromStr` impls; the schema lives in
//! `sql/schema.sql`. Every statement runs inside a `db.query` span.

use super::{
    Store, StoreError, StoreResult, StoreTx,
    models::{
        AccountTransfer, Client, ExternalAccount, Identification, IdentificationType, Job,
        OAuth1RequestToken, Session, SignIn, SignUp, User, Verification,
    },
};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{FromRow, PgPool, Postgres, Transaction, postgres::PgPoolOptions};
use std::time::Duration;
use tracing::{Instrument, Span, info_span};
use uuid::Uuid;

fn db_span(operation: &'static str, statement: &'static str) -> Span {
    info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = operation,
        db.statement = statement
    )
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| code.as_ref() == "23505"),
        _ => false,
    }
}

#[derive(Clone, Debug)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect to Postgres.
    /// # Errors
    /// Returns an error if the pool cannot be established.
    pub async fn connect(dsn: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .min_connections(1)
            .max_connections(10)
            .max_lifetime(Duration::from_secs(60 * 2))
            .test_before_acquire(true)
            .connect(dsn)
            .await
            .context("Failed to connect to database")?;
        Ok(Self { pool })
    }

    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn begin(&self) -> StoreResult<Box<dyn StoreTx>> {
        let tx = self
            .pool
            .begin()
            .await
            .context("failed to begin transaction")?;
        Ok(Box::new(PgTx { tx }))
    }

    async fn health_check(&self) -> StoreResult<()> {
        let query = "SELECT 1";
        sqlx::query(query)
            .execute(&self.pool)
            .instrument(db_span("SELECT", query))
            .await
            .context("database health check failed")?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}

pub struct PgTx {
    tx: Transaction<'static, Postgres>,
}

// Row mirrors. Domain enums are parsed on the way out.

#[derive(FromRow)]
struct DbVerification {
    id: Uuid,
    instance_id: String,
    strategy: String,
    attempts: i32,
    expire_at: DateTime<Utc>,
    verified_at: Option<DateTime<Utc>>,
    nonce: String,
    error: Option<Value>,
    error_cause: Option<String>,
    account_transfer_id: Option<Uuid>,
    identification_id: Option<Uuid>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<DbVerification> for Verification {
    fn from(row: DbVerification) -> Self {
        Self {
            id: row.id,
            instance_id: row.instance_id,
            strategy: row.strategy,
            attempts: row.attempts,
            expire_at: row.expire_at,
            verified_at: row.verified_at,
            nonce: row.nonce,
            error: row.error,
            error_cause: row.error_cause,
            account_transfer_id: row.account_transfer_id,
            identification_id: row.identification_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(FromRow)]
struct DbIdentification {
    id: Uuid,
    instance_id: String,
    user_id: Option<Uuid>,
    kind: String,
    identifier: String,
    status: String,
    verification_id: Option<Uuid>,
    target_identification_id: Option<Uuid>,
    requires_verification: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<DbIdentification> for Identification {
    type Error = StoreError;

    fn try_from(row: DbIdentification) -> StoreResult<Self> {
        Ok(Self {
            id: row.id,
            instance_id: row.instance_id,
            user_id: row.user_id,
            kind: row.kind.parse()?,
            identifier: row.identifier,
            status: row.status.parse()?,
            verification_id: row.verification_id,
            target_identification_id: row.target_identification_id,
            requires_verification: row.requires_verification,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct DbExternalAccount {
    id: Uuid,
    instance_id: String,
    identification_id: Uuid,
    provider: String,
    provider_user_id: String,
    email_address: String,
    email_address_verified: bool,
    first_name: Option<String>,
    last_name: Option<String>,
    username: Option<String>,
    avatar_url: Option<String>,
    approved_scopes: String,
    access_token: Option<String>,
    refresh_token: Option<String>,
    token_expires_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<DbExternalAccount> for ExternalAccount {
    fn from(row: DbExternalAccount) -> Self {
        Self {
            id: row.id,
            instance_id: row.instance_id,
            identification_id: row.identification_id,
            provider: row.provider,
            provider_user_id: row.provider_user_id,
            email_address: row.email_address,
            email_address_verified: row.email_address_verified,
            first_name: row.first_name,
            last_name: row.last_name,
            username: row.username,
            avatar_url: row.avatar_url,
            approved_scopes: row
                .approved_scopes
                .split_whitespace()
                .map(str::to_string)
                .collect(),
            access_token: row.access_token,
            refresh_token: row.refresh_token,
            token_expires_at: row.token_expires_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(FromRow)]
struct DbAccountTransfer {
    id: Uuid,
    instance_id: String,
    identification_id: Uuid,
    to_link_identification_id: Option<Uuid>,
    expire_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl From<DbAccountTransfer> for AccountTransfer {
    fn from(row: DbAccountTransfer) -> Self {
        Self {
            id: row.id,
            instance_id: row.instance_id,
            identification_id: row.identification_id,
            to_link_identification_id: row.to_link_identification_id,
            expire_at: row.expire_at,
            created_at: row.created_at,
        }
    }
}

#[derive(FromRow)]
struct DbSignIn {
    id: Uuid,
    instance_id: String,
    client_id: Uuid,
    identification_id: Option<Uuid>,
    first_factor_success_identification_id: Option<Uuid>,
    to_link_identification_id: Option<Uuid>,
    created_session_id: Option<Uuid>,
    reset_password_pending: bool,
    abandon_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<DbSignIn> for SignIn {
    fn from(row: DbSignIn) -> Self {
        Self {
            id: row.id,
            instance_id: row.instance_id,
            client_id: row.client_id,
            identification_id: row.identification_id,
            first_factor_success_identification_id: row.first_factor_success_identification_id,
            to_link_identification_id: row.to_link_identification_id,
            created_session_id: row.created_session_id,
            reset_password_pending: row.reset_password_pending,
            abandon_at: row.abandon_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(FromRow)]
struct DbSignUp {
    id: Uuid,
    instance_id: String,
    client_id: Uuid,
    email_address_id: Option<Uuid>,
    external_account_identification_id: Option<Uuid>,
    to_link_identification_id: Option<Uuid>,
    created_user_id: Option<Uuid>,
    created_session_id: Option<Uuid>,
    abandon_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<DbSignUp> for SignUp {
    fn from(row: DbSignUp) -> Self {
        Self {
            id: row.id,
            instance_id: row.instance_id,
            client_id: row.client_id,
            email_address_id: row.email_address_id,
            external_account_identification_id: row.external_account_identification_id,
            to_link_identification_id: row.to_link_identification_id,
            created_user_id: row.created_user_id,
            created_session_id: row.created_session_id,
            abandon_at: row.abandon_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(FromRow)]
struct DbUser {
    id: Uuid,
    instance_id: String,
    primary_email_address_id: Option<Uuid>,
    first_name: Option<String>,
    last_name: Option<String>,
    profile_image_url: Option<String>,
    banned: bool,
    locked_until: Option<DateTime<Utc>>,
    failed_verification_attempts: i32,
    two_factor_enabled: bool,
    password_reset_required: bool,
    last_active_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<DbUser> for User {
    fn from(row: DbUser) -> Self {
        Self {
            id: row.id,
            instance_id: row.instance_id,
            primary_email_address_id: row.primary_email_address_id,
            first_name: row.first_name,
            last_name: row.last_name,
            profile_image_url: row.profile_image_url,
            banned: row.banned,
            locked_until: row.locked_until,
            failed_verification_attempts: row.failed_verification_attempts,
            two_factor_enabled: row.two_factor_enabled,
            password_reset_required: row.password_reset_required,
            last_active_at: row.last_active_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(FromRow)]
struct DbSession {
    id: Uuid,
    instance_id: String,
    client_id: Uuid,
    user_id: Uuid,
    status: String,
    actor: Option<Value>,
    expire_at: DateTime<Utc>,
    abandon_at: DateTime<Utc>,
    last_active_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<DbSession> for Session {
    type Error = StoreError;

    fn try_from(row: DbSession) -> StoreResult<Self> {
        Ok(Self {
            id: row.id,
            instance_id: row.instance_id,
            client_id: row.client_id,
            user_id: row.user_id,
            status: row.status.parse()?,
            actor: row.actor,
            expire_at: row.expire_at,
            abandon_at: row.abandon_at,
            last_active_at: row.last_active_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct DbClient {
    id: Uuid,
    instance_id: String,
    rotating_token: String,
    rotating_token_nonce: Option<String>,
    sign_in_id: Option<Uuid>,
    sign_up_id: Option<Uuid>,
    last_active_session_id: Option<Uuid>,
    supports_email_link_flow: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<DbClient> for Client {
    fn from(row: DbClient) -> Self {
        Self {
            id: row.id,
            instance_id: row.instance_id,
            rotating_token: row.rotating_token,
            rotating_token_nonce: row.rotating_token_nonce,
            sign_in_id: row.sign_in_id,
            sign_up_id: row.sign_up_id,
            last_active_session_id: row.last_active_session_id,
            supports_email_link_flow: row.supports_email_link_flow,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(FromRow)]
struct DbOAuth1Token {
    token: String,
    secret: String,
    instance_id: String,
    created_at: DateTime<Utc>,
}

impl From<DbOAuth1Token> for OAuth1RequestToken {
    fn from(row: DbOAuth1Token) -> Self {
        Self {
            token: row.token,
            secret: row.secret,
            instance_id: row.instance_id,
            created_at: row.created_at,
        }
    }
}

#[derive(FromRow)]
struct DbJob {
    id: Uuid,
    instance_id: String,
    kind: String,
    payload: Value,
    status: String,
    attempts: i32,
    last_error: Option<String>,
    next_attempt_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl TryFrom<DbJob> for Job {
    type Error = StoreError;

    fn try_from(row: DbJob) -> StoreResult<Self> {
        Ok(Self {
            id: row.id,
            instance_id: row.instance_id,
            kind: row.kind.parse()?,
            payload: row.payload,
            status: row.status.parse()?,
            attempts: row.attempts,
            last_error: row.last_error,
            next_attempt_at: row.next_attempt_at,
            created_at: row.created_at,
        })
    }
}

#[async_trait]
impl StoreTx for PgTx {
    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let PgTx { tx } = *self;
        tx.commit().await.context("failed to commit transaction")?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        let PgTx { tx } = *self;
        tx.rollback()
            .await
            .context("failed to rollback transaction")?;
        Ok(())
    }

    async fn save_verification(&mut self, verification: &Verification) -> StoreResult<()> {
        let query = r"
            INSERT INTO verifications
                (id, instance_id, strategy, attempts, expire_at, verified_at, nonce, error,
                 error_cause, account_transfer_id, identification_id, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, NOW())
            ON CONFLICT (id) DO UPDATE SET
                attempts = EXCLUDED.attempts,
                expire_at = EXCLUDED.expire_at,
                verified_at = EXCLUDED.verified_at,
                error = EXCLUDED.error,
                error_cause = EXCLUDED.error_cause,
                account_transfer_id = EXCLUDED.account_transfer_id,
                identification_id = EXCLUDED.identification_id,
                updated_at = NOW()
        ";
        sqlx::query(query)
            .bind(verification.id)
            .bind(&verification.instance_id)
            .bind(&verification.strategy)
            .bind(verification.attempts)
            .bind(verification.expire_at)
            .bind(verification.verified_at)
            .bind(&verification.nonce)
            .bind(&verification.error)
            .bind(&verification.error_cause)
            .bind(verification.account_transfer_id)
            .bind(verification.identification_id)
            .bind(verification.created_at)
            .execute(&mut *self.tx)
            .instrument(db_span("INSERT", query))
            .await
            .context("failed to save verification")?;
        Ok(())
    }

    async fn verification(&mut self, id: Uuid) -> StoreResult<Option<Verification>> {
        let query = "SELECT id, instance_id, strategy, attempts, expire_at, verified_at, nonce, error, error_cause, account_transfer_id, identification_id, created_at, updated_at FROM verifications WHERE id = $1";
        let row = sqlx::query_as::<_, DbVerification>(query)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .instrument(db_span("SELECT", query))
            .await
            .context("failed to load verification")?;
        Ok(row.map(Verification::from))
    }

    async fn increment_verification_attempts(&mut self, id: Uuid) -> StoreResult<Verification> {
        let query = "UPDATE verifications SET attempts = attempts + 1, updated_at = NOW() WHERE id = $1 RETURNING id, instance_id, strategy, attempts, expire_at, verified_at, nonce, error, error_cause, account_transfer_id, identification_id, created_at, updated_at";
        let row = sqlx::query_as::<_, DbVerification>(query)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .instrument(db_span("UPDATE", query))
            .await
            .context("failed to increment verification attempts")?;
        row.map(Verification::from).ok_or(StoreError::NotFound)
    }

    async fn save_identification(&mut self, identification: &Identification) -> StoreResult<()> {
        let query = r"
            INSERT INTO identifications
                (id, instance_id, user_id, kind, identifier, status, verification_id,
                 target_identification_id, requires_verification, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NOW())
            ON CONFLICT (id) DO UPDATE SET
                user_id = EXCLUDED.user_id,
                status = EXCLUDED.status,
                verification_id = EXCLUDED.verification_id,
                target_identification_id = EXCLUDED.target_identification_id,
                requires_verification = EXCLUDED.requires_verification,
                updated_at = NOW()
        ";
        let result = sqlx::query(query)
            .bind(identification.id)
            .bind(&identification.instance_id)
            .bind(identification.user_id)
            .bind(identification.kind.to_string())
            .bind(&identification.identifier)
            .bind(identification.status.as_str())
            .bind(identification.verification_id)
            .bind(identification.target_identification_id)
            .bind(identification.requires_verification)
            .bind(identification.created_at)
            .execute(&mut *self.tx)
            .instrument(db_span("INSERT", query))
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => Err(StoreError::Conflict(format!(
                "identification {} ({}) already claimed",
                identification.identifier, identification.kind
            ))),
            Err(err) => Err(anyhow::Error::new(err)
                .context("failed to save identification")
                .into()),
        }
    }

    async fn identification(&mut self, id: Uuid) -> StoreResult<Option<Identification>> {
        let query = "SELECT id, instance_id, user_id, kind, identifier, status, verification_id, target_identification_id, requires_verification, created_at, updated_at FROM identifications WHERE id = $1";
        let row = sqlx::query_as::<_, DbIdentification>(query)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .instrument(db_span("SELECT", query))
            .await
            .context("failed to load identification")?;
        row.map(Identification::try_from).transpose()
    }

    async fn latest_claimed_identification(
        &mut self,
        instance_id: &str,
        kind: &IdentificationType,
        identifier: &str,
    ) -> StoreResult<Option<Identification>> {
        Ok(self
            .claimed_identifications(instance_id, kind, identifier)
            .await?
            .into_iter()
            .next())
    }

    async fn claimed_identifications(
        &mut self,
        instance_id: &str,
        kind: &IdentificationType,
        identifier: &str,
    ) -> StoreResult<Vec<Identification>> {
        let query = r"
            SELECT id, instance_id, user_id, kind, identifier, status, verification_id,
                   target_identification_id, requires_verification, created_at, updated_at
            FROM identifications
            WHERE instance_id = $1 AND kind = $2 AND identifier = $3
              AND status IN ('reserved', 'verified')
            ORDER BY updated_at DESC, id DESC
        ";
        let rows = sqlx::query_as::<_, DbIdentification>(query)
            .bind(instance_id)
            .bind(kind.to_string())
            .bind(identifier)
            .fetch_all(&mut *self.tx)
            .instrument(db_span("SELECT", query))
            .await
            .context("failed to load claimed identifications")?;
        rows.into_iter().map(Identification::try_from).collect()
    }

    async fn user_identifications(&mut self, user_id: Uuid) -> StoreResult<Vec<Identification>> {
        let query = r"
            SELECT id, instance_id, user_id, kind, identifier, status, verification_id,
                   target_identification_id, requires_verification, created_at, updated_at
            FROM identifications
            WHERE user_id = $1
            ORDER BY created_at, id
        ";
        let rows = sqlx::query_as::<_, DbIdentification>(query)
            .bind(user_id)
            .fetch_all(&mut *self.tx)
            .instrument(db_span("SELECT", query))
            .await
            .context("failed to load user identifications")?;
        rows.into_iter().map(Identification::try_from).collect()
    }

    async fn delete_identification(&mut self, id: Uuid) -> StoreResult<()> {
        let query = "DELETE FROM identifications WHERE id = $1";
        let result = sqlx::query(query)
            .bind(id)
            .execute(&mut *self.tx)
            .instrument(db_span("DELETE", query))
            .await
            .context("failed to delete identification")?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn save_external_account(&mut self, account: &ExternalAccount) -> StoreResult<()> {
        let query = r"
            INSERT INTO external_accounts
                (id, instance_id, identification_id, provider, provider_user_id, email_address,
                 email_address_verified, first_name, last_name, username, avatar_url,
                 approved_scopes, access_token, refresh_token, token_expires_at, created_at,
                 updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, NOW())
            ON CONFLICT (id) DO UPDATE SET
                email_address = EXCLUDED.email_address,
                email_address_verified = EXCLUDED.email_address_verified,
                first_name = EXCLUDED.first_name,
                last_name = EXCLUDED.last_name,
                username = EXCLUDED.username,
                avatar_url = EXCLUDED.avatar_url,
                approved_scopes = EXCLUDED.approved_scopes,
                access_token = EXCLUDED.access_token,
                refresh_token = EXCLUDED.refresh_token,
                token_expires_at = EXCLUDED.token_expires_at,
                updated_at = NOW()
        ";
        sqlx::query(query)
            .bind(account.id)
            .bind(&account.instance_id)
            .bind(account.identification_id)
            .bind(&account.provider)
            .bind(&account.provider_user_id)
            .bind(&account.email_address)
            .bind(account.email_address_verified)
            .bind(&account.first_name)
            .bind(&account.last_name)
            .bind(&account.username)
            .bind(&account.avatar_url)
            .bind(account.approved_scopes.join(" "))
            .bind(&account.access_token)
            .bind(&account.refresh_token)
            .bind(account.token_expires_at)
            .bind(account.created_at)
            .execute(&mut *self.tx)
            .instrument(db_span("INSERT", query))
            .await
            .context("failed to save external account")?;
        Ok(())
    }

    async fn external_account(&mut self, id: Uuid) -> StoreResult<Option<ExternalAccount>> {
        let query = r"
            SELECT id, instance_id, identification_id, provider, provider_user_id, email_address,
                   email_address_verified, first_name, last_name, username, avatar_url,
                   approved_scopes, access_token, refresh_token, token_expires_at, created_at,
                   updated_at
            FROM external_accounts WHERE id = $1
        ";
        let row = sqlx::query_as::<_, DbExternalAccount>(query)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .instrument(db_span("SELECT", query))
            .await
            .context("failed to load external account")?;
        Ok(row.map(ExternalAccount::from))
    }

    async fn external_account_by_identification(
        &mut self,
        identification_id: Uuid,
    ) -> StoreResult<Option<ExternalAccount>> {
        let query = r"
            SELECT id, instance_id, identification_id, provider, provider_user_id, email_address,
                   email_address_verified, first_name, last_name, username, avatar_url,
                   approved_scopes, access_token, refresh_token, token_expires_at, created_at,
                   updated_at
            FROM external_accounts WHERE identification_id = $1
        ";
        let row = sqlx::query_as::<_, DbExternalAccount>(query)
            .bind(identification_id)
            .fetch_optional(&mut *self.tx)
            .instrument(db_span("SELECT", query))
            .await
            .context("failed to load external account by identification")?;
        Ok(row.map(ExternalAccount::from))
    }

    async fn delete_external_account(&mut self, id: Uuid) -> StoreResult<()> {
        let query = "DELETE FROM external_accounts WHERE id = $1";
        let result = sqlx::query(query)
            .bind(id)
            .execute(&mut *self.tx)
            .instrument(db_span("DELETE", query))
            .await
            .context("failed to delete external account")?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn save_account_transfer(&mut self, transfer: &AccountTransfer) -> StoreResult<()> {
        let query = r"
            INSERT INTO account_transfers
                (id, instance_id, identification_id, to_link_identification_id, expire_at,
                 created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE SET
                to_link_identification_id = EXCLUDED.to_link_identification_id,
                expire_at = EXCLUDED.expire_at
        ";
        sqlx::query(query)
            .bind(transfer.id)
            .bind(&transfer.instance_id)
            .bind(transfer.identification_id)
            .bind(transfer.to_link_identification_id)
            .bind(transfer.expire_at)
            .bind(transfer.created_at)
            .execute(&mut *self.tx)
            .instrument(db_span("INSERT", query))
            .await
            .context("failed to save account transfer")?;
        Ok(())
    }

    async fn account_transfer(&mut self, id: Uuid) -> StoreResult<Option<AccountTransfer>> {
        let query = "SELECT id, instance_id, identification_id, to_link_identification_id, expire_at, created_at FROM account_transfers WHERE id = $1";
        let row = sqlx::query_as::<_, DbAccountTransfer>(query)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .instrument(db_span("SELECT", query))
            .await
            .context("failed to load account transfer")?;
        Ok(row.map(AccountTransfer::from))
    }

    async fn save_sign_in(&mut self, sign_in: &SignIn) -> StoreResult<()> {
        let query = r"
            INSERT INTO sign_ins
                (id, instance_id, client_id, identification_id,
                 first_factor_success_identification_id, to_link_identification_id,
                 created_session_id, reset_password_pending, abandon_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NOW())
            ON CONFLICT (id) DO UPDATE SET
                identification_id = EXCLUDED.identification_id,
                first_factor_success_identification_id =
                    EXCLUDED.first_factor_success_identification_id,
                to_link_identification_id = EXCLUDED.to_link_identification_id,
                created_session_id = EXCLUDED.created_session_id,
                reset_password_pending = EXCLUDED.reset_password_pending,
                abandon_at = EXCLUDED.abandon_at,
                updated_at = NOW()
        ";
        sqlx::query(query)
            .bind(sign_in.id)
            .bind(&sign_in.instance_id)
            .bind(sign_in.client_id)
            .bind(sign_in.identification_id)
            .bind(sign_in.first_factor_success_identification_id)
            .bind(sign_in.to_link_identification_id)
            .bind(sign_in.created_session_id)
            .bind(sign_in.reset_password_pending)
            .bind(sign_in.abandon_at)
            .bind(sign_in.created_at)
            .execute(&mut *self.tx)
            .instrument(db_span("INSERT", query))
            .await
            .context("failed to save sign-in")?;
        Ok(())
    }

    async fn sign_in(&mut self, id: Uuid) -> StoreResult<Option<SignIn>> {
        let query = r"
            SELECT id, instance_id, client_id, identification_id,
                   first_factor_success_identification_id, to_link_identification_id,
                   created_session_id, reset_password_pending, abandon_at, created_at, updated_at
            FROM sign_ins WHERE id = $1
        ";
        let row = sqlx::query_as::<_, DbSignIn>(query)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .instrument(db_span("SELECT", query))
            .await
            .context("failed to load sign-in")?;
        Ok(row.map(SignIn::from))
    }

    async fn save_sign_up(&mut self, sign_up: &SignUp) -> StoreResult<()> {
        let query = r"
            INSERT INTO sign_ups
                (id, instance_id, client_id, email_address_id,
                 external_account_identification_id, to_link_identification_id,
                 created_user_id, created_session_id, abandon_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NOW())
            ON CONFLICT (id) DO UPDATE SET
                email_address_id = EXCLUDED.email_address_id,
                external_account_identification_id = EXCLUDED.external_account_identification_id,
                to_link_identification_id = EXCLUDED.to_link_identification_id,
                created_user_id = EXCLUDED.created_user_id,
                created_session_id = EXCLUDED.created_session_id,
                abandon_at = EXCLUDED.abandon_at,
                updated_at = NOW()
        ";
        sqlx::query(query)
            .bind(sign_up.id)
            .bind(&sign_up.instance_id)
            .bind(sign_up.client_id)
            .bind(sign_up.email_address_id)
            .bind(sign_up.external_account_identification_id)
            .bind(sign_up.to_link_identification_id)
            .bind(sign_up.created_user_id)
            .bind(sign_up.created_session_id)
            .bind(sign_up.abandon_at)
            .bind(sign_up.created_at)
            .execute(&mut *self.tx)
            .instrument(db_span("INSERT", query))
            .await
            .context("failed to save sign-up")?;
        Ok(())
    }

    async fn sign_up(&mut self, id: Uuid) -> StoreResult<Option<SignUp>> {
        let query = r"
            SELECT id, instance_id, client_id, email_address_id,
                   external_account_identification_id, to_link_identification_id,
                   created_user_id, created_session_id, abandon_at, created_at, updated_at
            FROM sign_ups WHERE id = $1
        ";
        let row = sqlx::query_as::<_, DbSignUp>(query)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .instrument(db_span("SELECT", query))
            .await
            .context("failed to load sign-up")?;
        Ok(row.map(SignUp::from))
    }

    async fn save_user(&mut self, user: &User) -> StoreResult<()> {
        let query = r"
            INSERT INTO users
                (id, instance_id, primary_email_address_id, first_name, last_name,
                 profile_image_url, banned, locked_until, failed_verification_attempts,
                 two_factor_enabled, password_reset_required, last_active_at, created_at,
                 updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, NOW())
            ON CONFLICT (id) DO UPDATE SET
                primary_email_address_id = EXCLUDED.primary_email_address_id,
                first_name = EXCLUDED.first_name,
                last_name = EXCLUDED.last_name,
                profile_image_url = EXCLUDED.profile_image_url,
                banned = EXCLUDED.banned,
                locked_until = EXCLUDED.locked_until,
                failed_verification_attempts = EXCLUDED.failed_verification_attempts,
                two_factor_enabled = EXCLUDED.two_factor_enabled,
                password_reset_required = EXCLUDED.password_reset_required,
                last_active_at = EXCLUDED.last_active_at,
                updated_at = NOW()
        ";
        sqlx::query(query)
            .bind(user.id)
            .bind(&user.instance_id)
            .bind(user.primary_email_address_id)
            .bind(&user.first_name)
            .bind(&user.last_name)
            .bind(&user.profile_image_url)
            .bind(user.banned)
            .bind(user.locked_until)
            .bind(user.failed_verification_attempts)
            .bind(user.two_factor_enabled)
            .bind(user.password_reset_required)
            .bind(user.last_active_at)
            .bind(user.created_at)
            .execute(&mut *self.tx)
            .instrument(db_span("INSERT", query))
            .await
            .context("failed to save user")?;
        Ok(())
    }

    async fn user(&mut self, id: Uuid) -> StoreResult<Option<User>> {
        let query = r"
            SELECT id, instance_id, primary_email_address_id, first_name, last_name,
                   profile_image_url, banned, locked_until, failed_verification_attempts,
                   two_factor_enabled, password_reset_required, last_active_at, created_at,
                   updated_at
            FROM users WHERE id = $1
        ";
        let row = sqlx::query_as::<_, DbUser>(query)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .instrument(db_span("SELECT", query))
            .await
            .context("failed to load user")?;
        Ok(row.map(User::from))
    }

    async fn lock_user(&mut self, id: Uuid) -> StoreResult<Option<User>> {
        let query = r"
            SELECT id, instance_id, primary_email_address_id, first_name, last_name,
                   profile_image_url, banned, locked_until, failed_verification_attempts,
                   two_factor_enabled, password_reset_required, last_active_at, created_at,
                   updated_at
            FROM users WHERE id = $1
            FOR UPDATE
        ";
        let row = sqlx::query_as::<_, DbUser>(query)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .instrument(db_span("SELECT", query))
            .await
            .context("failed to lock user")?;
        Ok(row.map(User::from))
    }

    async fn save_session(&mut self, session: &Session) -> StoreResult<()> {
        let query = r"
            INSERT INTO sessions
                (id, instance_id, client_id, user_id, status, actor, expire_at, abandon_at,
                 last_active_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NOW())
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                expire_at = EXCLUDED.expire_at,
                abandon_at = EXCLUDED.abandon_at,
                last_active_at = EXCLUDED.last_active_at,
                updated_at = NOW()
        ";
        sqlx::query(query)
            .bind(session.id)
            .bind(&session.instance_id)
            .bind(session.client_id)
            .bind(session.user_id)
            .bind(session.status.as_str())
            .bind(&session.actor)
            .bind(session.expire_at)
            .bind(session.abandon_at)
            .bind(session.last_active_at)
            .bind(session.created_at)
            .execute(&mut *self.tx)
            .instrument(db_span("INSERT", query))
            .await
            .context("failed to save session")?;
        Ok(())
    }

    async fn session(&mut self, id: Uuid) -> StoreResult<Option<Session>> {
        let query = r"
            SELECT id, instance_id, client_id, user_id, status, actor, expire_at, abandon_at,
                   last_active_at, created_at, updated_at
            FROM sessions WHERE id = $1
        ";
        let row = sqlx::query_as::<_, DbSession>(query)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .instrument(db_span("SELECT", query))
            .await
            .context("failed to load session")?;
        row.map(Session::try_from).transpose()
    }

    async fn client_sessions(&mut self, client_id: Uuid) -> StoreResult<Vec<Session>> {
        let query = r"
            SELECT id, instance_id, client_id, user_id, status, actor, expire_at, abandon_at,
                   last_active_at, created_at, updated_at
            FROM sessions WHERE client_id = $1
            ORDER BY created_at, id
        ";
        let rows = sqlx::query_as::<_, DbSession>(query)
            .bind(client_id)
            .fetch_all(&mut *self.tx)
            .instrument(db_span("SELECT", query))
            .await
            .context("failed to load client sessions")?;
        rows.into_iter().map(Session::try_from).collect()
    }

    async fn save_client(&mut self, client: &Client) -> StoreResult<()> {
        let query = r"
            INSERT INTO clients
                (id, instance_id, rotating_token, rotating_token_nonce, sign_in_id, sign_up_id,
                 last_active_session_id, supports_email_link_flow, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW())
            ON CONFLICT (id) DO UPDATE SET
                rotating_token = EXCLUDED.rotating_token,
                rotating_token_nonce = EXCLUDED.rotating_token_nonce,
                sign_in_id = EXCLUDED.sign_in_id,
                sign_up_id = EXCLUDED.sign_up_id,
                last_active_session_id = EXCLUDED.last_active_session_id,
                supports_email_link_flow = EXCLUDED.supports_email_link_flow,
                updated_at = NOW()
        ";
        sqlx::query(query)
            .bind(client.id)
            .bind(&client.instance_id)
            .bind(&client.rotating_token)
            .bind(&client.rotating_token_nonce)
            .bind(client.sign_in_id)
            .bind(client.sign_up_id)
            .bind(client.last_active_session_id)
            .bind(client.supports_email_link_flow)
            .bind(client.created_at)
            .execute(&mut *self.tx)
            .instrument(db_span("INSERT", query))
            .await
            .context("failed to save client")?;
        Ok(())
    }

    async fn client(&mut self, id: Uuid) -> StoreResult<Option<Client>> {
        let query = r"
            SELECT id, instance_id, rotating_token, rotating_token_nonce, sign_in_id, sign_up_id,
                   last_active_session_id, supports_email_link_flow, created_at, updated_at
            FROM clients WHERE id = $1
        ";
        let row = sqlx::query_as::<_, DbClient>(query)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .instrument(db_span("SELECT", query))
            .await
            .context("failed to load client")?;
        Ok(row.map(Client::from))
    }

    async fn client_by_rotating_token(
        &mut self,
        instance_id: &str,
        token: &str,
    ) -> StoreResult<Option<Client>> {
        let query = r"
            SELECT id, instance_id, rotating_token, rotating_token_nonce, sign_in_id, sign_up_id,
                   last_active_session_id, supports_email_link_flow, created_at, updated_at
            FROM clients WHERE instance_id = $1 AND rotating_token = $2
        ";
        let row = sqlx::query_as::<_, DbClient>(query)
            .bind(instance_id)
            .bind(token)
            .fetch_optional(&mut *self.tx)
            .instrument(db_span("SELECT", query))
            .await
            .context("failed to load client by rotating token")?;
        Ok(row.map(Client::from))
    }

    async fn client_by_rotating_token_nonce(
        &mut self,
        instance_id: &str,
        nonce: &str,
    ) -> StoreResult<Option<Client>> {
        let query = r"
            SELECT id, instance_id, rotating_token, rotating_token_nonce, sign_in_id, sign_up_id,
                   last_active_session_id, supports_email_link_flow, created_at, updated_at
            FROM clients WHERE instance_id = $1 AND rotating_token_nonce = $2
            FOR UPDATE
        ";
        let row = sqlx::query_as::<_, DbClient>(query)
            .bind(instance_id)
            .bind(nonce)
            .fetch_optional(&mut *self.tx)
            .instrument(db_span("SELECT", query))
            .await
            .context("failed to load client by rotating token nonce")?;
        Ok(row.map(Client::from))
    }

    async fn save_oauth1_request_token(&mut self, token: &OAuth1RequestToken) -> StoreResult<()> {
        let query = r"
            INSERT INTO oauth1_request_tokens (token, secret, instance_id, created_at)
            VALUES ($1, $2, $3, $4)
        ";
        sqlx::query(query)
            .bind(&token.token)
            .bind(&token.secret)
            .bind(&token.instance_id)
            .bind(token.created_at)
            .execute(&mut *self.tx)
            .instrument(db_span("INSERT", query))
            .await
            .context("failed to save oauth1 request token")?;
        Ok(())
    }

    async fn take_oauth1_request_token(
        &mut self,
        instance_id: &str,
        token: &str,
    ) -> StoreResult<Option<OAuth1RequestToken>> {
        let query = r"
            DELETE FROM oauth1_request_tokens
            WHERE instance_id = $1 AND token = $2
            RETURNING token, secret, instance_id, created_at
        ";
        let row = sqlx::query_as::<_, DbOAuth1Token>(query)
            .bind(instance_id)
            .bind(token)
            .fetch_optional(&mut *self.tx)
            .instrument(db_span("DELETE", query))
            .await
            .context("failed to take oauth1 request token")?;
        Ok(row.map(OAuth1RequestToken::from))
    }

    async fn enqueue_job(&mut self, job: &Job) -> StoreResult<()> {
        let query = r"
            INSERT INTO jobs
                (id, instance_id, kind, payload, status, attempts, last_error, next_attempt_at,
                 created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ";
        let result = sqlx::query(query)
            .bind(job.id)
            .bind(&job.instance_id)
            .bind(job.kind.as_str())
            .bind(&job.payload)
            .bind(job.status.as_str())
            .bind(job.attempts)
            .bind(&job.last_error)
            .bind(job.next_attempt_at)
            .bind(job.created_at)
            .execute(&mut *self.tx)
            .instrument(db_span("INSERT", query))
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => {
                Err(StoreError::Conflict(format!("job {} already enqueued", job.id)))
            }
            Err(err) => Err(anyhow::Error::new(err)
                .context("failed to enqueue job")
                .into()),
        }
    }

    async fn save_job(&mut self, job: &Job) -> StoreResult<()> {
        let query = r"
            UPDATE jobs
            SET status = $2, attempts = $3, last_error = $4, next_attempt_at = $5
            WHERE id = $1
        ";
        let result = sqlx::query(query)
            .bind(job.id)
            .bind(job.status.as_str())
            .bind(job.attempts)
            .bind(&job.last_error)
            .bind(job.next_attempt_at)
            .execute(&mut *self.tx)
            .instrument(db_span("UPDATE", query))
            .await
            .context("failed to update job")?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn pending_jobs(&mut self, limit: usize, now: DateTime<Utc>) -> StoreResult<Vec<Job>> {
        let query = r"
            SELECT id, instance_id, kind, payload, status, attempts, last_error, next_attempt_at,
                   created_at
            FROM jobs
            WHERE status = 'pending' AND next_attempt_at <= $1
            ORDER BY next_attempt_at, id
            LIMIT $2
            FOR UPDATE SKIP LOCKED
        ";
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query_as::<_, DbJob>(query)
            .bind(now)
            .bind(limit)
            .fetch_all(&mut *self.tx)
            .instrument(db_span("SELECT", query))
            .await
            .context("failed to load pending jobs")?;
        rows.into_iter().map(Job::try_from).collect()
    }
}
