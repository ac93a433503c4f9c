//! Connection repository.
//!
//! Tokens are sealed with the connection's identity as associated data before
//! they reach the database and opened again on read.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, Set,
};
use std::sync::Arc;
use uuid::Uuid;

use super::{from_db_time, to_db_time};
use crate::crypto::{CryptoKey, TokenBinding, open_token, seal_token};
use crate::domain::{Connection, ConnectionStatus, Credential, Cursor, OwnerId, Provider};
use crate::models::connection::{self, Entity as ConnectionEntity};
use crate::store::{ConnectionStore, StoreError, is_unique_violation};

#[derive(Debug, Clone)]
pub struct ConnectionRepository {
    pub db: Arc<DatabaseConnection>,
    pub crypto_key: CryptoKey,
}

impl ConnectionRepository {
    pub fn new(db: Arc<DatabaseConnection>, crypto_key: CryptoKey) -> Self {
        Self { db, crypto_key }
    }

    fn to_active_model(&self, conn: &Connection) -> Result<connection::ActiveModel, StoreError> {
        let binding = TokenBinding {
            owner_id: conn.owner_id,
            provider: conn.provider,
            external_account_id: &conn.external_account_id,
        };
        let access = seal_token(&self.crypto_key, binding, &conn.credential.access_token)?;
        let refresh = conn
            .credential
            .refresh_token
            .as_deref()
            .map(|token| seal_token(&self.crypto_key, binding, token))
            .transpose()?;

        Ok(connection::ActiveModel {
            id: Set(conn.id),
            owner_id: Set(conn.owner_id.as_uuid()),
            provider: Set(conn.provider.slug().to_string()),
            external_account_id: Set(conn.external_account_id.clone()),
            status: Set(conn.status.as_str().to_string()),
            error_reason: Set(conn.error_reason.clone()),
            access_token_ciphertext: Set(access),
            refresh_token_ciphertext: Set(refresh),
            expires_at: Set(conn.credential.expires_at.map(to_db_time)),
            scopes: Set(Some(serde_json::json!(conn.credential.scopes))),
            last_sync_at: Set(conn.last_sync_at.map(to_db_time)),
            last_sync_cursor: Set(conn.last_sync_cursor.as_ref().map(|c| c.as_json().clone())),
            created_at: Set(to_db_time(conn.created_at)),
            updated_at: Set(to_db_time(conn.updated_at)),
        })
    }

    fn from_model(&self, model: connection::Model) -> Result<Connection, StoreError> {
        let provider: Provider = model
            .provider
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("{e}")))?;
        let status: ConnectionStatus = model.status.parse().map_err(StoreError::Corrupt)?;
        let owner_id = OwnerId(model.owner_id);

        let binding = TokenBinding {
            owner_id,
            provider,
            external_account_id: &model.external_account_id,
        };
        let access_token = open_token(&self.crypto_key, binding, &model.access_token_ciphertext)
            .inspect_err(|error| {
                tracing::error!(
                    connection_id = %model.id,
                    provider = %provider,
                    error = %error,
                    "Failed to open stored access token"
                );
            })?;
        let refresh_token = model
            .refresh_token_ciphertext
            .as_deref()
            .map(|sealed| open_token(&self.crypto_key, binding, sealed))
            .transpose()?;

        let scopes: Vec<String> = match model.scopes {
            Some(value) => serde_json::from_value(value)
                .map_err(|e| StoreError::Corrupt(format!("scopes: {e}")))?,
            None => Vec::new(),
        };

        Ok(Connection {
            id: model.id,
            owner_id,
            provider,
            credential: Credential {
                access_token,
                refresh_token,
                expires_at: model.expires_at.map(from_db_time),
                scopes,
            },
            external_account_id: model.external_account_id,
            status,
            error_reason: model.error_reason,
            last_sync_at: model.last_sync_at.map(from_db_time),
            last_sync_cursor: model.last_sync_cursor.map(Cursor::from_json),
            created_at: from_db_time(model.created_at),
            updated_at: from_db_time(model.updated_at),
        })
    }

    async fn update_columns(
        &self,
        id: Uuid,
        columns: Vec<(connection::Column, sea_orm::sea_query::SimpleExpr)>,
    ) -> Result<(), StoreError> {
        let mut update = ConnectionEntity::update_many()
            .col_expr(connection::Column::UpdatedAt, Expr::value(to_db_time(Utc::now())));
        for (column, value) in columns {
            update = update.col_expr(column, value);
        }
        let result = update
            .filter(connection::Column::Id.eq(id))
            .exec(&*self.db)
            .await?;
        if result.rows_affected == 0 {
            return Err(StoreError::NotFound(format!("connection {id}")));
        }
        Ok(())
    }
}

#[async_trait]
impl ConnectionStore for ConnectionRepository {
    async fn save(&self, conn: &Connection) -> Result<(), StoreError> {
        let model = self.to_active_model(conn)?;
        let existing = ConnectionEntity::find_by_id(conn.id).one(&*self.db).await?;

        let result = match existing {
            Some(_) => model.update(&*self.db).await.map(|_| ()),
            None => ConnectionEntity::insert(model)
                .exec_without_returning(&*self.db)
                .await
                .map(|_| ()),
        };

        result.map_err(|error| {
            if is_unique_violation(&error) {
                tracing::warn!(
                    owner_id = %conn.owner_id,
                    provider = %conn.provider,
                    "Connection already exists for provider account"
                );
                StoreError::Conflict(format!(
                    "{} account {} is already connected",
                    conn.provider, conn.external_account_id
                ))
            } else {
                StoreError::Database(error)
            }
        })
    }

    async fn get(&self, id: Uuid) -> Result<Option<Connection>, StoreError> {
        ConnectionEntity::find_by_id(id)
            .one(&*self.db)
            .await?
            .map(|model| self.from_model(model))
            .transpose()
    }

    async fn find_active(
        &self,
        owner_id: OwnerId,
        provider: Provider,
    ) -> Result<Option<Connection>, StoreError> {
        ConnectionEntity::find()
            .filter(connection::Column::OwnerId.eq(owner_id.as_uuid()))
            .filter(connection::Column::Provider.eq(provider.slug()))
            .filter(connection::Column::Status.eq(ConnectionStatus::Active.as_str()))
            .order_by_desc(connection::Column::UpdatedAt)
            .one(&*self.db)
            .await?
            .map(|model| self.from_model(model))
            .transpose()
    }

    async fn find_by_account(
        &self,
        owner_id: OwnerId,
        provider: Provider,
        external_account_id: &str,
    ) -> Result<Option<Connection>, StoreError> {
        ConnectionEntity::find()
            .filter(connection::Column::OwnerId.eq(owner_id.as_uuid()))
            .filter(connection::Column::Provider.eq(provider.slug()))
            .filter(connection::Column::ExternalAccountId.eq(external_account_id))
            .one(&*self.db)
            .await?
            .map(|model| self.from_model(model))
            .transpose()
    }

    async fn find_active_by_account(
        &self,
        provider: Provider,
        external_account_id: &str,
    ) -> Result<Option<Connection>, StoreError> {
        ConnectionEntity::find()
            .filter(connection::Column::Provider.eq(provider.slug()))
            .filter(connection::Column::ExternalAccountId.eq(external_account_id))
            .filter(connection::Column::Status.eq(ConnectionStatus::Active.as_str()))
            .order_by_desc(connection::Column::UpdatedAt)
            .one(&*self.db)
            .await?
            .map(|model| self.from_model(model))
            .transpose()
    }

    async fn save_credential(
        &self,
        id: Uuid,
        credential: &Credential,
    ) -> Result<bool, StoreError> {
        let Some(model) = ConnectionEntity::find_by_id(id).one(&*self.db).await? else {
            return Ok(false);
        };
        let provider: Provider = model
            .provider
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("{e}")))?;
        let binding = TokenBinding {
            owner_id: OwnerId(model.owner_id),
            provider,
            external_account_id: &model.external_account_id,
        };
        let access = seal_token(&self.crypto_key, binding, &credential.access_token)?;
        let refresh = credential
            .refresh_token
            .as_deref()
            .map(|token| seal_token(&self.crypto_key, binding, token))
            .transpose()?;

        // Conditional on status so a concurrent disconnect is never undone.
        let result = ConnectionEntity::update_many()
            .col_expr(connection::Column::AccessTokenCiphertext, Expr::value(access))
            .col_expr(connection::Column::RefreshTokenCiphertext, Expr::value(refresh))
            .col_expr(
                connection::Column::ExpiresAt,
                Expr::value(credential.expires_at.map(to_db_time)),
            )
            .col_expr(
                connection::Column::Scopes,
                Expr::value(Some(serde_json::json!(credential.scopes))),
            )
            .col_expr(connection::Column::UpdatedAt, Expr::value(to_db_time(Utc::now())))
            .filter(connection::Column::Id.eq(id))
            .filter(connection::Column::Status.eq(ConnectionStatus::Active.as_str()))
            .exec(&*self.db)
            .await?;
        Ok(result.rows_affected > 0)
    }

    async fn mark_revoked(&self, id: Uuid) -> Result<(), StoreError> {
        self.update_columns(
            id,
            vec![(
                connection::Column::Status,
                Expr::value(ConnectionStatus::Revoked.as_str()),
            )],
        )
        .await
    }

    async fn mark_error(&self, id: Uuid, reason: &str) -> Result<(), StoreError> {
        let result = ConnectionEntity::update_many()
            .col_expr(
                connection::Column::Status,
                Expr::value(ConnectionStatus::Error.as_str()),
            )
            .col_expr(connection::Column::ErrorReason, Expr::value(reason))
            .col_expr(connection::Column::UpdatedAt, Expr::value(to_db_time(Utc::now())))
            .filter(connection::Column::Id.eq(id))
            .filter(connection::Column::Status.ne(ConnectionStatus::Revoked.as_str()))
            .exec(&*self.db)
            .await?;
        if result.rows_affected == 0
            && ConnectionEntity::find_by_id(id).one(&*self.db).await?.is_none()
        {
            return Err(StoreError::NotFound(format!("connection {id}")));
        }
        Ok(())
    }

    async fn save_checkpoint(
        &self,
        id: Uuid,
        cursor: &Cursor,
        synced_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.update_columns(
            id,
            vec![
                (
                    connection::Column::LastSyncCursor,
                    Expr::value(cursor.as_json().clone()),
                ),
                (
                    connection::Column::LastSyncAt,
                    Expr::value(to_db_time(synced_at)),
                ),
            ],
        )
        .await
    }

    async fn list_expiring(
        &self,
        before: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<Connection>, StoreError> {
        let models = ConnectionEntity::find()
            .filter(connection::Column::Status.eq(ConnectionStatus::Active.as_str()))
            .filter(connection::Column::RefreshTokenCiphertext.is_not_null())
            .filter(connection::Column::ExpiresAt.is_not_null())
            .filter(connection::Column::ExpiresAt.lte(to_db_time(before)))
            .order_by_asc(connection::Column::ExpiresAt)
            .limit(limit)
            .all(&*self.db)
            .await?;

        models
            .into_iter()
            .map(|model| self.from_model(model))
            .collect()
    }
}
