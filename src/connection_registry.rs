//! # Connection Registry
//!
//! Owns connection lifecycle: connect, disconnect, credential refresh and sync
//! checkpoints. Everything that changes a connection row outside of the
//! repositories goes through here.

use std::sync::Arc;

use chrono::{Duration, Utc};
use metrics::counter;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::domain::{
    Connection, ConnectionStatus, Credential, Cursor, OwnerId, Provider,
};
use crate::locks::KeyedLocks;
use crate::providers::ProviderRegistry;
use crate::store::{ConnectionStore, StoreError};

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("owner {owner_id} already has an active {provider} connection")]
    Duplicate { owner_id: OwnerId, provider: Provider },

    #[error("credential for connection {connection_id} is expired and cannot be refreshed: {reason}")]
    Expired { connection_id: Uuid, reason: String },

    #[error("connection {0} not found")]
    NotFound(Uuid),

    #[error("connection {connection_id} is {status}")]
    Inactive {
        connection_id: Uuid,
        status: ConnectionStatus,
    },

    #[error("provider '{0}' is not registered")]
    UnknownProvider(Provider),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct ConnectionRegistry {
    store: Arc<dyn ConnectionStore>,
    providers: ProviderRegistry,
    refresh_margin: Duration,
    connect_lock: Mutex<()>,
    refresh_locks: KeyedLocks<Uuid>,
}

impl ConnectionRegistry {
    pub fn new(
        store: Arc<dyn ConnectionStore>,
        providers: ProviderRegistry,
        refresh_margin: std::time::Duration,
    ) -> Self {
        Self {
            store,
            providers,
            refresh_margin: Duration::from_std(refresh_margin)
                .unwrap_or_else(|_| Duration::seconds(120)),
            connect_lock: Mutex::new(()),
            refresh_locks: KeyedLocks::new(),
        }
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    /// Activates a connection for `(owner_id, provider)`.
    ///
    /// A revoked or errored connection for the same account is reactivated
    /// with the new credential rather than duplicated.
    #[instrument(skip_all, fields(owner_id = %owner_id, provider = %provider))]
    pub async fn connect(
        &self,
        owner_id: OwnerId,
        provider: Provider,
        external_account_id: &str,
        credential: Credential,
    ) -> Result<Connection, ConnectionError> {
        if !self.providers.contains(provider) {
            return Err(ConnectionError::UnknownProvider(provider));
        }

        let _guard = self.connect_lock.lock().await;

        if self.store.find_active(owner_id, provider).await?.is_some() {
            return Err(ConnectionError::Duplicate { owner_id, provider });
        }

        let connection = match self
            .store
            .find_by_account(owner_id, provider, external_account_id)
            .await?
        {
            Some(mut previous) => {
                info!(connection_id = %previous.id, status = %previous.status, "Reactivating connection");
                previous.credential = credential;
                previous.status = ConnectionStatus::Active;
                previous.error_reason = None;
                previous.updated_at = Utc::now();
                previous
            }
            None => Connection::new(owner_id, provider, external_account_id, credential),
        };

        match self.store.save(&connection).await {
            Ok(()) => {}
            Err(StoreError::Conflict(_)) => {
                return Err(ConnectionError::Duplicate { owner_id, provider });
            }
            Err(e) => return Err(e.into()),
        }

        counter!("connections_connected_total", "provider" => provider.slug()).increment(1);
        info!(connection_id = %connection.id, "Connection activated");
        Ok(connection)
    }

    /// Revokes the connection. Skill records and webhook history are kept.
    #[instrument(skip_all, fields(connection_id = %connection_id))]
    pub async fn disconnect(&self, connection_id: Uuid) -> Result<Connection, ConnectionError> {
        let connection = self.get(connection_id).await?;
        if connection.status == ConnectionStatus::Revoked {
            return Ok(connection);
        }
        self.store.mark_revoked(connection_id).await?;
        info!(provider = %connection.provider, "Connection revoked");
        self.get(connection_id).await
    }

    pub async fn get(&self, connection_id: Uuid) -> Result<Connection, ConnectionError> {
        self.store
            .get(connection_id)
            .await?
            .ok_or(ConnectionError::NotFound(connection_id))
    }

    pub async fn get_active(
        &self,
        owner_id: OwnerId,
        provider: Provider,
    ) -> Result<Option<Connection>, ConnectionError> {
        Ok(self.store.find_active(owner_id, provider).await?)
    }

    /// Refreshes the credential when it expires within the refresh margin.
    pub async fn refresh_if_needed(
        &self,
        connection: &Connection,
    ) -> Result<Connection, ConnectionError> {
        ensure_active(connection)?;
        if !connection
            .credential
            .expires_within(Utc::now(), self.refresh_margin)
        {
            return Ok(connection.clone());
        }
        self.refresh(connection, false).await
    }

    /// Refreshes regardless of expiry, after the provider rejected the token.
    pub async fn force_refresh(
        &self,
        connection: &Connection,
    ) -> Result<Connection, ConnectionError> {
        ensure_active(connection)?;
        self.refresh(connection, true).await
    }

    #[instrument(skip_all, fields(connection_id = %connection.id, provider = %connection.provider, force))]
    async fn refresh(
        &self,
        connection: &Connection,
        force: bool,
    ) -> Result<Connection, ConnectionError> {
        let _flight = self.refresh_locks.lock(&connection.id).await;

        // Whoever held the lock before us may already have refreshed.
        let current = self.get(connection.id).await?;
        ensure_active(&current)?;
        let now = Utc::now();
        let already_refreshed = if force {
            current.credential != connection.credential
        } else {
            !current.credential.expires_within(now, self.refresh_margin)
        };
        if already_refreshed {
            return Ok(current);
        }

        let adapter = self
            .providers
            .get(current.provider)
            .map_err(|_| ConnectionError::UnknownProvider(current.provider))?;

        match adapter.refresh_credential(&current.credential).await {
            Ok(credential) => {
                if !self.store.save_credential(current.id, &credential).await? {
                    // Disconnected while the grant was in flight.
                    let latest = self.get(current.id).await?;
                    info!(status = %latest.status, "Discarding refreshed credential for inactive connection");
                    ensure_active(&latest)?;
                    return Ok(latest);
                }
                let refreshed = self.get(current.id).await?;
                counter!("token_refresh_total", "provider" => refreshed.provider.slug(), "outcome" => "success")
                    .increment(1);
                info!(expires_at = ?refreshed.credential.expires_at, "Credential refreshed");
                Ok(refreshed)
            }
            Err(error) if !error.is_retryable() => {
                let reason = error.to_string();
                self.store.mark_error(current.id, &reason).await?;
                counter!("token_refresh_total", "provider" => current.provider.slug(), "outcome" => "failure")
                    .increment(1);
                warn!(error = %reason, "Credential refresh failed permanently; connection marked error");
                Err(ConnectionError::Expired {
                    connection_id: current.id,
                    reason,
                })
            }
            Err(error) => {
                counter!("token_refresh_total", "provider" => current.provider.slug(), "outcome" => "transient")
                    .increment(1);
                warn!(error = %error, "Transient credential refresh failure");
                if !force && !current.credential.is_expired(now) {
                    Ok(current)
                } else {
                    Err(ConnectionError::Expired {
                        connection_id: current.id,
                        reason: error.to_string(),
                    })
                }
            }
        }
    }

    pub async fn record_checkpoint(
        &self,
        connection_id: Uuid,
        cursor: &Cursor,
    ) -> Result<(), ConnectionError> {
        self.store
            .save_checkpoint(connection_id, cursor, Utc::now())
            .await
            .map_err(|e| match e {
                StoreError::NotFound(_) => ConnectionError::NotFound(connection_id),
                other => other.into(),
            })
    }

    pub async fn mark_error(&self, connection_id: Uuid, reason: &str) -> Result<(), ConnectionError> {
        warn!(connection_id = %connection_id, reason, "Marking connection as error");
        self.store
            .mark_error(connection_id, reason)
            .await
            .map_err(|e| match e {
                StoreError::NotFound(_) => ConnectionError::NotFound(connection_id),
                other => other.into(),
            })
    }

    /// Active connections whose credentials expire within `lead_time`.
    pub async fn list_expiring(
        &self,
        lead_time: Duration,
        limit: u64,
    ) -> Result<Vec<Connection>, ConnectionError> {
        Ok(self
            .store
            .list_expiring(Utc::now() + lead_time, limit)
            .await?)
    }
}

fn ensure_active(connection: &Connection) -> Result<(), ConnectionError> {
    if connection.is_active() {
        Ok(())
    } else {
        Err(ConnectionError::Inactive {
            connection_id: connection.id,
            status: connection.status,
        })
    }
}
