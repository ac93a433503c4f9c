//! Persistence interfaces consumed by the pipeline.
//!
//! Two implementations ship with the crate: [`memory`] for tests and embedding,
//! and the SeaORM repositories in [`crate::repositories`].

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::crypto::CryptoError;
use crate::domain::{
    Connection, Credential, Cursor, EvidenceEntry, OwnerId, Provider, SkillRecord, WebhookEvent,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record already exists: {0}")]
    Conflict(String),
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("database error: {0}")]
    Database(#[from] sea_orm::DbErr),
    #[error("credential encryption failed: {0}")]
    Crypto(#[from] CryptoError),
    #[error("stored record is corrupt: {0}")]
    Corrupt(String),
}

#[async_trait]
pub trait ConnectionStore: Send + Sync {
    /// Inserts or replaces the connection with the same id.
    async fn save(&self, connection: &Connection) -> Result<(), StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<Connection>, StoreError>;

    async fn find_active(
        &self,
        owner_id: OwnerId,
        provider: Provider,
    ) -> Result<Option<Connection>, StoreError>;

    /// Any connection, whatever its status, for one owner's provider account.
    async fn find_by_account(
        &self,
        owner_id: OwnerId,
        provider: Provider,
        external_account_id: &str,
    ) -> Result<Option<Connection>, StoreError>;

    /// The active connection for a provider account, used to attribute webhook activity.
    async fn find_active_by_account(
        &self,
        provider: Provider,
        external_account_id: &str,
    ) -> Result<Option<Connection>, StoreError>;

    /// Replaces only the credential, and only while the connection is
    /// active. Returns `false` when no active row was updated.
    async fn save_credential(&self, id: Uuid, credential: &Credential)
    -> Result<bool, StoreError>;

    /// Sets the status to revoked, leaving the credential and checkpoint as
    /// they are.
    async fn mark_revoked(&self, id: Uuid) -> Result<(), StoreError>;

    /// Moves a connection into the error state. A revoked connection stays
    /// revoked.
    async fn mark_error(&self, id: Uuid, reason: &str) -> Result<(), StoreError>;

    async fn save_checkpoint(
        &self,
        id: Uuid,
        cursor: &Cursor,
        synced_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Active, refreshable connections whose credential expires by `before`,
    /// soonest first.
    async fn list_expiring(
        &self,
        before: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<Connection>, StoreError>;
}

#[async_trait]
pub trait SkillStore: Send + Sync {
    /// Insert or update the record keyed by `(owner_id, skill_name, source)`.
    async fn upsert(&self, record: &SkillRecord) -> Result<(), StoreError>;

    async fn find_by_owner(&self, owner_id: OwnerId) -> Result<Vec<SkillRecord>, StoreError>;

    /// All sources' records for one skill.
    async fn find_skill(
        &self,
        owner_id: OwnerId,
        skill_name: &str,
    ) -> Result<Vec<SkillRecord>, StoreError>;

    /// Inserts entries not yet in the ledger and returns how many were new.
    async fn record_evidence(&self, entries: &[EvidenceEntry]) -> Result<usize, StoreError>;

    async fn evidence_for(
        &self,
        owner_id: OwnerId,
        skill_name: &str,
    ) -> Result<Vec<EvidenceEntry>, StoreError>;
}

#[async_trait]
pub trait WebhookLog: Send + Sync {
    /// Whether a verified delivery with this id has already been logged.
    async fn exists(&self, provider: Provider, delivery_id: &str) -> Result<bool, StoreError>;

    /// Fails with [`StoreError::Conflict`] when the delivery is already logged.
    async fn append(&self, event: &WebhookEvent) -> Result<(), StoreError>;

    /// `None` marks the event processed; `Some(error)` records a retryable failure.
    async fn mark_processed(&self, id: Uuid, error: Option<&str>) -> Result<(), StoreError>;

    /// Records a permanent failure; the event is never retried.
    async fn mark_rejected(&self, id: Uuid, reason: &str) -> Result<(), StoreError>;

    /// Records the subject once the payload has been normalized.
    async fn set_subject(&self, id: Uuid, subject: &str) -> Result<(), StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<WebhookEvent>, StoreError>;

    /// Whether an event for the same provider and subject, received before
    /// `id`, is still waiting for a retry below `max_attempts`.
    async fn has_earlier_pending(
        &self,
        id: Uuid,
        subject: &str,
        max_attempts: u32,
    ) -> Result<bool, StoreError>;

    /// Unprocessed, retryable events below `max_attempts`, oldest first.
    async fn list_retryable(
        &self,
        max_attempts: u32,
        limit: u64,
    ) -> Result<Vec<WebhookEvent>, StoreError>;
}

/// Time-bounded claim on a connection's sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncLease {
    pub connection_id: Uuid,
    pub token: Uuid,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Claims the lease unless another holder's lease has not yet expired.
    async fn try_acquire(
        &self,
        connection_id: Uuid,
        ttl: Duration,
    ) -> Result<Option<SyncLease>, StoreError>;

    /// Extends a held lease; `None` when it was lost to another holder.
    async fn renew(&self, lease: &SyncLease, ttl: Duration)
    -> Result<Option<SyncLease>, StoreError>;

    /// Releases a held lease. Releasing a lease already taken over is a no-op.
    async fn release(&self, lease: &SyncLease) -> Result<(), StoreError>;
}

pub(crate) fn lease_expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(900))
}

/// Detects unique-constraint violations across the supported backends.
pub(crate) fn is_unique_violation(error: &sea_orm::DbErr) -> bool {
    use sea_orm::RuntimeErr;

    const PG_UNIQUE: &str = "23505";
    const SQLITE_DUPLICATE_CODES: &[&str] = &["1555", "2067"];

    let sqlx_err = match error {
        sea_orm::DbErr::Query(RuntimeErr::SqlxError(sqlx_err))
        | sea_orm::DbErr::Exec(RuntimeErr::SqlxError(sqlx_err)) => sqlx_err,
        _ => return false,
    };

    let Some(db_error) = sqlx_err.as_database_error() else {
        return false;
    };

    if db_error.is_unique_violation() {
        return true;
    }

    db_error
        .code()
        .is_some_and(|code| code == PG_UNIQUE || SQLITE_DUPLICATE_CODES.contains(&code.as_ref()))
}
