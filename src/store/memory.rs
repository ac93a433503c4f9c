//! In-process store implementations backed by `tokio::sync::RwLock`.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    ConnectionStore, LeaseStore, SkillStore, StoreError, SyncLease, WebhookLog, lease_expiry,
};
use crate::domain::{
    Connection, ConnectionStatus, Credential, Cursor, EvidenceEntry, OwnerId, Provider, SkillRecord,
    SkillSource, WebhookEvent,
};

#[derive(Debug, Default)]
pub struct MemoryConnectionStore {
    connections: RwLock<HashMap<Uuid, Connection>>,
}

impl MemoryConnectionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConnectionStore for MemoryConnectionStore {
    async fn save(&self, connection: &Connection) -> Result<(), StoreError> {
        let mut connections = self.connections.write().await;
        let clash = connections.values().any(|c| {
            c.id != connection.id
                && c.owner_id == connection.owner_id
                && c.provider == connection.provider
                && (c.external_account_id == connection.external_account_id
                    || (c.is_active() && connection.is_active()))
        });
        if clash {
            return Err(StoreError::Conflict(format!(
                "connection for {}/{}/{}",
                connection.owner_id, connection.provider, connection.external_account_id
            )));
        }
        connections.insert(connection.id, connection.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Connection>, StoreError> {
        Ok(self.connections.read().await.get(&id).cloned())
    }

    async fn find_active(
        &self,
        owner_id: OwnerId,
        provider: Provider,
    ) -> Result<Option<Connection>, StoreError> {
        Ok(self
            .connections
            .read()
            .await
            .values()
            .find(|c| c.owner_id == owner_id && c.provider == provider && c.is_active())
            .cloned())
    }

    async fn find_by_account(
        &self,
        owner_id: OwnerId,
        provider: Provider,
        external_account_id: &str,
    ) -> Result<Option<Connection>, StoreError> {
        Ok(self
            .connections
            .read()
            .await
            .values()
            .find(|c| {
                c.owner_id == owner_id
                    && c.provider == provider
                    && c.external_account_id == external_account_id
            })
            .cloned())
    }

    async fn find_active_by_account(
        &self,
        provider: Provider,
        external_account_id: &str,
    ) -> Result<Option<Connection>, StoreError> {
        Ok(self
            .connections
            .read()
            .await
            .values()
            .find(|c| {
                c.provider == provider
                    && c.external_account_id == external_account_id
                    && c.is_active()
            })
            .cloned())
    }

    async fn save_credential(
        &self,
        id: Uuid,
        credential: &Credential,
    ) -> Result<bool, StoreError> {
        let mut connections = self.connections.write().await;
        match connections.get_mut(&id) {
            Some(connection) if connection.is_active() => {
                connection.credential = credential.clone();
                connection.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_revoked(&self, id: Uuid) -> Result<(), StoreError> {
        let mut connections = self.connections.write().await;
        let connection = connections
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("connection {id}")))?;
        connection.status = ConnectionStatus::Revoked;
        connection.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_error(&self, id: Uuid, reason: &str) -> Result<(), StoreError> {
        let mut connections = self.connections.write().await;
        let connection = connections
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("connection {id}")))?;
        if connection.status == ConnectionStatus::Revoked {
            return Ok(());
        }
        connection.status = ConnectionStatus::Error;
        connection.error_reason = Some(reason.to_string());
        connection.updated_at = Utc::now();
        Ok(())
    }

    async fn save_checkpoint(
        &self,
        id: Uuid,
        cursor: &Cursor,
        synced_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut connections = self.connections.write().await;
        let connection = connections
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("connection {id}")))?;
        connection.last_sync_cursor = Some(cursor.clone());
        connection.last_sync_at = Some(synced_at);
        connection.updated_at = synced_at;
        Ok(())
    }

    async fn list_expiring(
        &self,
        before: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<Connection>, StoreError> {
        let mut expiring: Vec<Connection> = self
            .connections
            .read()
            .await
            .values()
            .filter(|c| {
                c.is_active()
                    && c.credential.refresh_token.is_some()
                    && c.credential.expires_at.is_some_and(|exp| exp <= before)
            })
            .cloned()
            .collect();
        expiring.sort_by_key(|c| c.credential.expires_at);
        expiring.truncate(limit as usize);
        Ok(expiring)
    }
}

type SkillKey = (OwnerId, String, SkillSource);
type EvidenceKey = (OwnerId, String, Provider, String);

#[derive(Debug, Default)]
pub struct MemorySkillStore {
    records: RwLock<HashMap<SkillKey, SkillRecord>>,
    evidence: RwLock<HashMap<EvidenceKey, EvidenceEntry>>,
}

impl MemorySkillStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn evidence_count(&self) -> usize {
        self.evidence.read().await.len()
    }
}

#[async_trait]
impl SkillStore for MemorySkillStore {
    async fn upsert(&self, record: &SkillRecord) -> Result<(), StoreError> {
        let key = (record.owner_id, record.skill_name.clone(), record.source);
        self.records.write().await.insert(key, record.clone());
        Ok(())
    }

    async fn find_by_owner(&self, owner_id: OwnerId) -> Result<Vec<SkillRecord>, StoreError> {
        let mut records: Vec<SkillRecord> = self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.owner_id == owner_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            a.skill_name
                .cmp(&b.skill_name)
                .then_with(|| a.source.as_str().cmp(b.source.as_str()))
        });
        Ok(records)
    }

    async fn find_skill(
        &self,
        owner_id: OwnerId,
        skill_name: &str,
    ) -> Result<Vec<SkillRecord>, StoreError> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.owner_id == owner_id && r.skill_name == skill_name)
            .cloned()
            .collect())
    }

    async fn record_evidence(&self, entries: &[EvidenceEntry]) -> Result<usize, StoreError> {
        let mut ledger = self.evidence.write().await;
        let mut inserted = 0;
        for entry in entries {
            let key = (
                entry.owner_id,
                entry.skill_name.clone(),
                entry.provider,
                entry.activity_key.clone(),
            );
            if let std::collections::hash_map::Entry::Vacant(slot) = ledger.entry(key) {
                slot.insert(entry.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn evidence_for(
        &self,
        owner_id: OwnerId,
        skill_name: &str,
    ) -> Result<Vec<EvidenceEntry>, StoreError> {
        Ok(self
            .evidence
            .read()
            .await
            .values()
            .filter(|e| e.owner_id == owner_id && e.skill_name == skill_name)
            .cloned()
            .collect())
    }
}

#[derive(Debug, Default)]
pub struct MemoryWebhookLog {
    events: RwLock<Vec<WebhookEvent>>,
}

impl MemoryWebhookLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every logged event in append order.
    pub async fn all(&self) -> Vec<WebhookEvent> {
        self.events.read().await.clone()
    }

    async fn update<F>(&self, id: Uuid, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut WebhookEvent),
    {
        let mut events = self.events.write().await;
        let event = events
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("webhook event {id}")))?;
        f(event);
        Ok(())
    }
}

#[async_trait]
impl WebhookLog for MemoryWebhookLog {
    async fn exists(&self, provider: Provider, delivery_id: &str) -> Result<bool, StoreError> {
        Ok(self
            .events
            .read()
            .await
            .iter()
            .any(|e| e.verified && e.provider == provider && e.delivery_id == delivery_id))
    }

    async fn append(&self, event: &WebhookEvent) -> Result<(), StoreError> {
        let mut events = self.events.write().await;
        if events.iter().any(|e| {
            e.provider == event.provider
                && e.delivery_id == event.delivery_id
                && e.verified == event.verified
        }) {
            return Err(StoreError::Conflict(format!(
                "webhook delivery {}/{}",
                event.provider, event.delivery_id
            )));
        }
        events.push(event.clone());
        Ok(())
    }

    async fn mark_processed(&self, id: Uuid, error: Option<&str>) -> Result<(), StoreError> {
        self.update(id, |event| match error {
            None => {
                event.processed = true;
                event.processed_at = Some(Utc::now());
                event.error_message = None;
            }
            Some(message) => {
                event.processed = false;
                event.attempts += 1;
                event.error_message = Some(message.to_string());
            }
        })
        .await
    }

    async fn mark_rejected(&self, id: Uuid, reason: &str) -> Result<(), StoreError> {
        self.update(id, |event| {
            event.processed = false;
            event.retryable = false;
            event.error_message = Some(reason.to_string());
        })
        .await
    }

    async fn set_subject(&self, id: Uuid, subject: &str) -> Result<(), StoreError> {
        self.update(id, |event| event.subject = Some(subject.to_string()))
            .await
    }

    async fn get(&self, id: Uuid) -> Result<Option<WebhookEvent>, StoreError> {
        Ok(self.events.read().await.iter().find(|e| e.id == id).cloned())
    }

    async fn has_earlier_pending(
        &self,
        id: Uuid,
        subject: &str,
        max_attempts: u32,
    ) -> Result<bool, StoreError> {
        let events = self.events.read().await;
        let Some(event) = events.iter().find(|e| e.id == id) else {
            return Err(StoreError::NotFound(format!("webhook event {id}")));
        };
        Ok(events.iter().any(|e| {
            e.id != id
                && e.provider == event.provider
                && e.subject.as_deref() == Some(subject)
                && e.received_at < event.received_at
                && e.verified
                && !e.processed
                && e.retryable
                && e.attempts < max_attempts
        }))
    }

    async fn list_retryable(
        &self,
        max_attempts: u32,
        limit: u64,
    ) -> Result<Vec<WebhookEvent>, StoreError> {
        let mut pending: Vec<WebhookEvent> = self
            .events
            .read()
            .await
            .iter()
            .filter(|e| e.verified && !e.processed && e.retryable && e.attempts < max_attempts)
            .cloned()
            .collect();
        pending.sort_by_key(|e| e.received_at);
        pending.truncate(limit as usize);
        Ok(pending)
    }
}

#[derive(Debug, Default)]
pub struct MemoryLeaseStore {
    leases: RwLock<HashMap<Uuid, SyncLease>>,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn try_acquire(
        &self,
        connection_id: Uuid,
        ttl: Duration,
    ) -> Result<Option<SyncLease>, StoreError> {
        let now = Utc::now();
        let mut leases = self.leases.write().await;
        if leases
            .get(&connection_id)
            .is_some_and(|held| held.expires_at > now)
        {
            return Ok(None);
        }
        let lease = SyncLease {
            connection_id,
            token: Uuid::new_v4(),
            expires_at: lease_expiry(now, ttl),
        };
        leases.insert(connection_id, lease.clone());
        Ok(Some(lease))
    }

    async fn renew(
        &self,
        lease: &SyncLease,
        ttl: Duration,
    ) -> Result<Option<SyncLease>, StoreError> {
        let mut leases = self.leases.write().await;
        match leases.get_mut(&lease.connection_id) {
            Some(held) if held.token == lease.token => {
                held.expires_at = lease_expiry(Utc::now(), ttl);
                Ok(Some(held.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn release(&self, lease: &SyncLease) -> Result<(), StoreError> {
        let mut leases = self.leases.write().await;
        if leases
            .get(&lease.connection_id)
            .is_some_and(|held| held.token == lease.token)
        {
            leases.remove(&lease.connection_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Credential, WebhookEnvelope};
    use serde_json::json;

    fn envelope(id: &str) -> WebhookEnvelope {
        WebhookEnvelope {
            delivery_id: id.to_string(),
            event_type: "push".to_string(),
            action: None,
        }
    }

    #[tokio::test]
    async fn rejected_delivery_does_not_count_as_existing() {
        let log = MemoryWebhookLog::new();
        let forged = WebhookEvent::rejected(Provider::Github, &envelope("d-1"), json!({}), "bad sig");
        log.append(&forged).await.unwrap();
        assert!(!log.exists(Provider::Github, "d-1").await.unwrap());

        let genuine = WebhookEvent::received(Provider::Github, &envelope("d-1"), json!({}));
        log.append(&genuine).await.unwrap();
        assert!(log.exists(Provider::Github, "d-1").await.unwrap());

        let replay = WebhookEvent::received(Provider::Github, &envelope("d-1"), json!({}));
        assert!(matches!(
            log.append(&replay).await,
            Err(StoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn failed_dispatch_stays_retryable_until_attempts_exhausted() {
        let log = MemoryWebhookLog::new();
        let event = WebhookEvent::received(Provider::Slack, &envelope("e-1"), json!({}));
        log.append(&event).await.unwrap();

        log.mark_processed(event.id, Some("queue full")).await.unwrap();
        assert_eq!(log.list_retryable(2, 10).await.unwrap().len(), 1);

        log.mark_processed(event.id, Some("queue full")).await.unwrap();
        assert!(log.list_retryable(2, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn lease_is_exclusive_until_released() {
        let leases = MemoryLeaseStore::new();
        let id = Uuid::new_v4();
        let ttl = Duration::from_secs(60);

        let held = leases.try_acquire(id, ttl).await.unwrap().unwrap();
        assert!(leases.try_acquire(id, ttl).await.unwrap().is_none());
        assert!(leases.renew(&held, ttl).await.unwrap().is_some());

        leases.release(&held).await.unwrap();
        assert!(leases.try_acquire(id, ttl).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn expired_lease_can_be_taken_over() {
        let leases = MemoryLeaseStore::new();
        let id = Uuid::new_v4();
        let stale = leases.try_acquire(id, Duration::ZERO).await.unwrap().unwrap();

        let fresh = leases
            .try_acquire(id, Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert_ne!(stale.token, fresh.token);
        assert!(leases.renew(&stale, Duration::from_secs(60)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn evidence_ledger_ignores_repeated_activity() {
        let store = MemorySkillStore::new();
        let entry = EvidenceEntry {
            owner_id: OwnerId::new(),
            skill_name: "Rust".into(),
            category: crate::domain::SkillCategory::Language,
            provider: Provider::Github,
            activity_key: "github:code-change:abc".into(),
            observed_at: Utc::now(),
            weight: 1.0,
        };
        assert_eq!(store.record_evidence(&[entry.clone()]).await.unwrap(), 1);
        assert_eq!(store.record_evidence(&[entry]).await.unwrap(), 0);
        assert_eq!(store.evidence_count().await, 1);
    }

    #[tokio::test]
    async fn expiring_connections_sorted_soonest_first() {
        let store = MemoryConnectionStore::new();
        let now = Utc::now();
        let owner = OwnerId::new();
        let late = Connection::new(
            owner,
            Provider::Github,
            "a",
            Credential::new("t").with_expiry(now + chrono::Duration::minutes(9)),
        );
        let soon = Connection::new(
            owner,
            Provider::Jira,
            "b",
            Credential::new("t").with_expiry(now + chrono::Duration::minutes(1)),
        );
        let never = Connection::new(owner, Provider::Slack, "c", Credential::new("t"));
        for c in [&late, &soon, &never] {
            store.save(c).await.unwrap();
        }

        let expiring = store
            .list_expiring(now + chrono::Duration::minutes(10), 10)
            .await
            .unwrap();
        let ids: Vec<Uuid> = expiring.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![soon.id, late.id]);
    }
}
