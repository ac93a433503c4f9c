//! Sync lease repository.
//!
//! Acquisition is a single conditional write so two processes cannot both
//! observe an expired lease and claim it.

use async_trait::async_trait;
use chrono::Utc;
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::to_db_time;
use crate::models::sync_lease::{self, Entity as SyncLeaseEntity};
use crate::store::{LeaseStore, StoreError, SyncLease, lease_expiry};

#[derive(Debug, Clone)]
pub struct LeaseRepository {
    pub db: Arc<DatabaseConnection>,
}

impl LeaseRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl LeaseStore for LeaseRepository {
    async fn try_acquire(
        &self,
        connection_id: Uuid,
        ttl: Duration,
    ) -> Result<Option<SyncLease>, StoreError> {
        let now = Utc::now();
        let lease = SyncLease {
            connection_id,
            token: Uuid::new_v4(),
            expires_at: lease_expiry(now, ttl),
        };

        let inserted = SyncLeaseEntity::insert(sync_lease::ActiveModel {
            connection_id: Set(connection_id),
            token: Set(lease.token),
            expires_at: Set(to_db_time(lease.expires_at)),
            acquired_at: Set(to_db_time(now)),
        })
        .on_conflict(
            OnConflict::column(sync_lease::Column::ConnectionId)
                .do_nothing()
                .to_owned(),
        )
        .exec_without_returning(&*self.db)
        .await?;
        if inserted == 1 {
            return Ok(Some(lease));
        }

        // Row exists: take it over only if the previous holder let it lapse.
        let taken = SyncLeaseEntity::update_many()
            .col_expr(sync_lease::Column::Token, Expr::value(lease.token))
            .col_expr(
                sync_lease::Column::ExpiresAt,
                Expr::value(to_db_time(lease.expires_at)),
            )
            .col_expr(sync_lease::Column::AcquiredAt, Expr::value(to_db_time(now)))
            .filter(sync_lease::Column::ConnectionId.eq(connection_id))
            .filter(sync_lease::Column::ExpiresAt.lte(to_db_time(now)))
            .exec(&*self.db)
            .await?;

        if taken.rows_affected == 1 {
            tracing::debug!(connection_id = %connection_id, "Took over expired sync lease");
            Ok(Some(lease))
        } else {
            Ok(None)
        }
    }

    async fn renew(
        &self,
        lease: &SyncLease,
        ttl: Duration,
    ) -> Result<Option<SyncLease>, StoreError> {
        let expires_at = lease_expiry(Utc::now(), ttl);
        let result = SyncLeaseEntity::update_many()
            .col_expr(sync_lease::Column::ExpiresAt, Expr::value(to_db_time(expires_at)))
            .filter(sync_lease::Column::ConnectionId.eq(lease.connection_id))
            .filter(sync_lease::Column::Token.eq(lease.token))
            .exec(&*self.db)
            .await?;

        if result.rows_affected == 0 {
            return Ok(None);
        }
        Ok(Some(SyncLease {
            expires_at,
            ..lease.clone()
        }))
    }

    async fn release(&self, lease: &SyncLease) -> Result<(), StoreError> {
        SyncLeaseEntity::delete_many()
            .filter(sync_lease::Column::ConnectionId.eq(lease.connection_id))
            .filter(sync_lease::Column::Token.eq(lease.token))
            .exec(&*self.db)
            .await?;
        Ok(())
    }
}

