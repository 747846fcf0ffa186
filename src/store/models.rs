//! Persistent records shared by the storage backends and the OAuth flow.

use anyhow::{Result, anyhow};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{fmt, str::FromStr};
use uuid::Uuid;

/// Callbacks allowed per verification before it is considered spent.
pub const MAX_VERIFICATION_ATTEMPTS: i32 = 1;

/// Lifetime of short-lived transactional records such as account transfers.
pub const EXPIRY_TIME_TRANSACTIONAL: Duration = Duration::minutes(30);

/// Lifetime of an external verification between redirect and callback.
pub const EXPIRY_TIME_VERIFICATION: Duration = Duration::minutes(10);

const OAUTH_PREFIX: &str = "oauth_";

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum IdentificationType {
    EmailAddress,
    OAuth(String),
    Saml,
    Username,
    PhoneNumber,
    Passkey,
}

impl IdentificationType {
    /// Identification type for an external strategy (`oauth_google`, `saml`).
    #[must_use]
    pub fn for_strategy(strategy: &str) -> Self {
        strategy.parse().unwrap_or_else(|_| Self::OAuth(strategy.to_string()))
    }

    #[must_use]
    pub fn is_external(&self) -> bool {
        matches!(self, Self::OAuth(_) | Self::Saml)
    }
}

impl fmt::Display for IdentificationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmailAddress => f.write_str("email_address"),
            Self::OAuth(provider) => write!(f, "{OAUTH_PREFIX}{provider}"),
            Self::Saml => f.write_str("saml"),
            Self::Username => f.write_str("username"),
            Self::PhoneNumber => f.write_str("phone_number"),
            Self::Passkey => f.write_str("passkey"),
        }
    }
}

impl FromStr for IdentificationType {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "email_address" => Ok(Self::EmailAddress),
            "saml" => Ok(Self::Saml),
            "username" => Ok(Self::Username),
            "phone_number" => Ok(Self::PhoneNumber),
            "passkey" => Ok(Self::Passkey),
            other => match other.strip_prefix(OAUTH_PREFIX) {
                Some(provider) if !provider.is_empty() => Ok(Self::OAuth(provider.to_string())),
                _ => Err(anyhow!("unknown identification type: {other}")),
            },
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdentificationStatus {
    NotSet,
    Reserved,
    Verified,
}

impl IdentificationStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotSet => "not_set",
            Self::Reserved => "reserved",
            Self::Verified => "verified",
        }
    }
}

impl FromStr for IdentificationStatus {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "not_set" => Ok(Self::NotSet),
            "reserved" => Ok(Self::Reserved),
            "verified" => Ok(Self::Verified),
            other => Err(anyhow!("unknown identification status: {other}")),
        }
    }
}

/// Claimable proof of ownership of an identifier.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identification {
    pub id: Uuid,
    pub instance_id: String,
    pub user_id: Option<Uuid>,
    pub kind: IdentificationType,
    pub identifier: String,
    pub status: IdentificationStatus,
    pub verification_id: Option<Uuid>,
    pub target_identification_id: Option<Uuid>,
    pub requires_verification: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Identification {
    #[must_use]
    pub fn new(
        instance_id: &str,
        kind: IdentificationType,
        identifier: &str,
        status: IdentificationStatus,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            instance_id: instance_id.to_string(),
            user_id: None,
            kind,
            identifier: identifier.to_string(),
            status,
            verification_id: None,
            target_identification_id: None,
            requires_verification: false,
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn is_claimed(&self) -> bool {
        self.status != IdentificationStatus::NotSet
    }

    #[must_use]
    pub fn is_verified(&self) -> bool {
        self.status == IdentificationStatus::Verified
    }
}

/// Profile data from an OAuth/SAML provider, 1:1 with an external identification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExternalAccount {
    pub id: Uuid,
    pub instance_id: String,
    pub identification_id: Uuid,
    pub provider: String,
    pub provider_user_id: String,
    pub email_address: String,
    pub email_address_verified: bool,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub username: Option<String>,
    pub avatar_url: Option<String>,
    pub approved_scopes: Vec<String>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Short-lived hand-off from one flow to the other (sign-in <-> sign-up).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccountTransfer {
    pub id: Uuid,
    pub instance_id: String,
    pub identification_id: Uuid,
    pub to_link_identification_id: Option<Uuid>,
    pub expire_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl AccountTransfer {
    #[must_use]
    pub fn new(instance_id: &str, identification_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            instance_id: instance_id.to_string(),
            identification_id,
            to_link_identification_id: None,
            expire_at: now + EXPIRY_TIME_TRANSACTIONAL,
            created_at: now,
        }
    }

    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expire_at
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignIn {
    pub id: Uuid,
    pub instance_id: String,
    pub client_id: Uuid,
    pub identification_id: Option<Uuid>,
    pub first_factor_success_identification_id: Option<Uuid>,
    pub to_link_identification_id: Option<Uuid>,
    pub created_session_id: Option<Uuid>,
    pub reset_password_pending: bool,
    pub abandon_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SignIn {
    #[must_use]
    pub fn new(instance_id: &str, client_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            instance_id: instance_id.to_string(),
            client_id,
            identification_id: None,
            first_factor_success_identification_id: None,
            to_link_identification_id: None,
            created_session_id: None,
            reset_password_pending: false,
            abandon_at: now + Duration::hours(24),
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignUp {
    pub id: Uuid,
    pub instance_id: String,
    pub client_id: Uuid,
    pub email_address_id: Option<Uuid>,
    pub external_account_identification_id: Option<Uuid>,
    pub to_link_identification_id: Option<Uuid>,
    pub created_user_id: Option<Uuid>,
    pub created_session_id: Option<Uuid>,
    pub abandon_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SignUp {
    #[must_use]
    pub fn new(instance_id: &str, client_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            instance_id: instance_id.to_string(),
            client_id,
            email_address_id: None,
            external_account_identification_id: None,
            to_link_identification_id: None,
            created_user_id: None,
            created_session_id: None,
            abandon_at: now + Duration::hours(24),
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct User {
    pub id: Uuid,
    pub instance_id: String,
    pub primary_email_address_id: Option<Uuid>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub profile_image_url: Option<String>,
    pub banned: bool,
    pub locked_until: Option<DateTime<Utc>>,
    pub failed_verification_attempts: i32,
    pub two_factor_enabled: bool,
    pub password_reset_required: bool,
    pub last_active_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    #[must_use]
    pub fn new(instance_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            instance_id: instance_id.to_string(),
            primary_email_address_id: None,
            first_name: None,
            last_name: None,
            profile_image_url: None,
            banned: false,
            locked_until: None,
            failed_verification_attempts: 0,
            two_factor_enabled: false,
            password_reset_required: false,
            last_active_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.locked_until.is_some_and(|until| until > now)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionStatus {
    PendingActivation,
    Active,
    Ended,
    Revoked,
    Removed,
    Abandoned,
    Expired,
}

impl SessionStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PendingActivation => "pending_activation",
            Self::Active => "active",
            Self::Ended => "ended",
            Self::Revoked => "revoked",
            Self::Removed => "removed",
            Self::Abandoned => "abandoned",
            Self::Expired => "expired",
        }
    }
}

impl FromStr for SessionStatus {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "pending_activation" => Ok(Self::PendingActivation),
            "active" => Ok(Self::Active),
            "ended" => Ok(Self::Ended),
            "revoked" => Ok(Self::Revoked),
            "removed" => Ok(Self::Removed),
            "abandoned" => Ok(Self::Abandoned),
            "expired" => Ok(Self::Expired),
            other => Err(anyhow!("unknown session status: {other}")),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Session {
    pub id: Uuid,
    pub instance_id: String,
    pub client_id: Uuid,
    pub user_id: Uuid,
    pub status: SessionStatus,
    pub actor: Option<Value>,
    pub expire_at: DateTime<Utc>,
    pub abandon_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// Active and neither past its lifetime nor its inactivity deadline.
    #[must_use]
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.status == SessionStatus::Active && now < self.expire_at && now < self.abandon_at
    }
}

/// Device or browser scoped container for sign-ins, sign-ups and sessions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Client {
    pub id: Uuid,
    pub instance_id: String,
    pub rotating_token: String,
    pub rotating_token_nonce: Option<String>,
    pub sign_in_id: Option<Uuid>,
    pub sign_up_id: Option<Uuid>,
    pub last_active_session_id: Option<Uuid>,
    pub supports_email_link_flow: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Client {
    #[must_use]
    pub fn new(instance_id: &str, rotating_token: String, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            instance_id: instance_id.to_string(),
            rotating_token,
            rotating_token_nonce: None,
            sign_in_id: None,
            sign_up_id: None,
            last_active_session_id: None,
            supports_email_link_flow: false,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Unverified,
    Verified,
    Expired,
    Failed,
}

/// One attempt to prove control of an external identity.
#[derive(Clone, Debug, PartialEq)]
pub struct Verification {
    pub id: Uuid,
    pub instance_id: String,
    pub strategy: String,
    pub attempts: i32,
    pub expire_at: DateTime<Utc>,
    pub verified_at: Option<DateTime<Utc>>,
    pub nonce: String,
    pub error: Option<Value>,
    pub error_cause: Option<String>,
    pub account_transfer_id: Option<Uuid>,
    pub identification_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Verification {
    #[must_use]
    pub fn new(instance_id: &str, strategy: &str, nonce: String, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            instance_id: instance_id.to_string(),
            strategy: strategy.to_string(),
            attempts: 0,
            expire_at: now + EXPIRY_TIME_VERIFICATION,
            verified_at: None,
            nonce,
            error: None,
            error_cause: None,
            account_transfer_id: None,
            identification_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Status is derived, never stored: verified wins over expiry, expiry over failure.
    #[must_use]
    pub fn status(&self, now: DateTime<Utc>) -> VerificationStatus {
        if self.verified_at.is_some() {
            VerificationStatus::Verified
        } else if now > self.expire_at {
            VerificationStatus::Expired
        } else if self.attempts > MAX_VERIFICATION_ATTEMPTS || self.error.is_some() {
            VerificationStatus::Failed
        } else {
            VerificationStatus::Unverified
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobKind {
    #[serde(rename = "session.created")]
    SessionCreated,
    #[serde(rename = "user.created")]
    UserCreated,
    #[serde(rename = "user.updated")]
    UserUpdated,
}

impl JobKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SessionCreated => "session.created",
            Self::UserCreated => "user.created",
            Self::UserUpdated => "user.updated",
        }
    }
}

impl FromStr for JobKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "session.created" => Ok(Self::SessionCreated),
            "user.created" => Ok(Self::UserCreated),
            "user.updated" => Ok(Self::UserUpdated),
            other => Err(anyhow!("unknown job kind: {other}")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Sent,
    Failed,
}

impl JobStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "pending" => Ok(Self::Pending),
            "sent" => Ok(Self::Sent),
            "failed" => Ok(Self::Failed),
            other => Err(anyhow!("unknown job status: {other}")),
        }
    }
}

/// Side effect enqueued in the same transaction as the write that caused it.
#[derive(Clone, Debug, PartialEq)]
pub struct Job {
    pub id: Uuid,
    pub instance_id: String,
    pub kind: JobKind,
    pub payload: Value,
    pub status: JobStatus,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub next_attempt_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    #[must_use]
    pub fn new(instance_id: &str, kind: JobKind, payload: Value, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            instance_id: instance_id.to_string(),
            kind,
            payload,
            status: JobStatus::Pending,
            attempts: 0,
            last_error: None,
            next_attempt_at: now,
            created_at: now,
        }
    }
}

/// OAuth1 request token fetched before redirecting to the provider. Single use.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OAuth1RequestToken {
    pub token: String,
    pub secret: String,
    pub instance_id: String,
    pub created_at: DateTime<Utc>,
}
