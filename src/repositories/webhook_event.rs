//! Webhook event log repository.

use async_trait::async_trait;
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, QuerySelect, Set,
};
use std::sync::Arc;
use uuid::Uuid;

use super::{from_db_time, to_db_time};
use crate::domain::{Provider, WebhookEvent};
use crate::models::webhook_event::{self, Entity as WebhookEventEntity};
use crate::store::{StoreError, WebhookLog, is_unique_violation};

#[derive(Debug, Clone)]
pub struct WebhookEventRepository {
    pub db: Arc<DatabaseConnection>,
}

impl WebhookEventRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    async fn find_model(&self, id: Uuid) -> Result<webhook_event::Model, StoreError> {
        WebhookEventEntity::find_by_id(id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("webhook event {id}")))
    }
}

fn from_model(model: webhook_event::Model) -> Result<WebhookEvent, StoreError> {
    Ok(WebhookEvent {
        id: model.id,
        provider: model
            .provider
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("{e}")))?,
        delivery_id: model.delivery_id,
        event_type: model.event_type,
        action: model.action,
        subject: model.subject,
        raw_payload: model.raw_payload,
        received_at: from_db_time(model.received_at),
        verified: model.verified,
        processed: model.processed,
        processed_at: model.processed_at.map(from_db_time),
        error_message: model.error_message,
        retryable: model.retryable,
        attempts: u32::try_from(model.attempts).unwrap_or_default(),
    })
}

#[async_trait]
impl WebhookLog for WebhookEventRepository {
    async fn exists(&self, provider: Provider, delivery_id: &str) -> Result<bool, StoreError> {
        let count = WebhookEventEntity::find()
            .filter(webhook_event::Column::Provider.eq(provider.slug()))
            .filter(webhook_event::Column::DeliveryId.eq(delivery_id))
            .filter(webhook_event::Column::Verified.eq(true))
            .count(&*self.db)
            .await?;
        Ok(count > 0)
    }

    async fn append(&self, event: &WebhookEvent) -> Result<(), StoreError> {
        let model = webhook_event::ActiveModel {
            id: Set(event.id),
            provider: Set(event.provider.slug().to_string()),
            delivery_id: Set(event.delivery_id.clone()),
            event_type: Set(event.event_type.clone()),
            action: Set(event.action.clone()),
            subject: Set(event.subject.clone()),
            raw_payload: Set(event.raw_payload.clone()),
            verified: Set(event.verified),
            processed: Set(event.processed),
            retryable: Set(event.retryable),
            attempts: Set(i32::try_from(event.attempts).unwrap_or(i32::MAX)),
            error_message: Set(event.error_message.clone()),
            received_at: Set(to_db_time(event.received_at)),
            processed_at: Set(event.processed_at.map(to_db_time)),
        };

        WebhookEventEntity::insert(model)
            .exec_without_returning(&*self.db)
            .await
            .map_err(|error| {
                if is_unique_violation(&error) {
                    StoreError::Conflict(format!(
                        "{} delivery {} already logged",
                        event.provider, event.delivery_id
                    ))
                } else {
                    StoreError::Database(error)
                }
            })?;
        Ok(())
    }

    async fn mark_processed(&self, id: Uuid, error: Option<&str>) -> Result<(), StoreError> {
        let model = self.find_model(id).await?;
        let attempts = model.attempts;
        let mut active: webhook_event::ActiveModel = model.into();
        match error {
            None => {
                active.processed = Set(true);
                active.processed_at = Set(Some(to_db_time(Utc::now())));
                active.error_message = Set(None);
            }
            Some(message) => {
                active.processed = Set(false);
                active.attempts = Set(attempts.saturating_add(1));
                active.error_message = Set(Some(message.to_string()));
            }
        }
        active.update(&*self.db).await?;
        Ok(())
    }

    async fn mark_rejected(&self, id: Uuid, reason: &str) -> Result<(), StoreError> {
        let mut active: webhook_event::ActiveModel = self.find_model(id).await?.into();
        active.processed = Set(false);
        active.retryable = Set(false);
        active.error_message = Set(Some(reason.to_string()));
        active.update(&*self.db).await?;
        Ok(())
    }

    async fn set_subject(&self, id: Uuid, subject: &str) -> Result<(), StoreError> {
        let mut active: webhook_event::ActiveModel = self.find_model(id).await?.into();
        active.subject = Set(Some(subject.to_string()));
        active.update(&*self.db).await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<WebhookEvent>, StoreError> {
        WebhookEventEntity::find_by_id(id)
            .one(&*self.db)
            .await?
            .map(from_model)
            .transpose()
    }

    async fn has_earlier_pending(
        &self,
        id: Uuid,
        subject: &str,
        max_attempts: u32,
    ) -> Result<bool, StoreError> {
        let event = self.find_model(id).await?;
        let max_attempts = i32::try_from(max_attempts).unwrap_or(i32::MAX);
        let earlier = WebhookEventEntity::find()
            .filter(webhook_event::Column::Id.ne(id))
            .filter(webhook_event::Column::Provider.eq(event.provider))
            .filter(webhook_event::Column::Subject.eq(subject))
            .filter(webhook_event::Column::ReceivedAt.lt(event.received_at))
            .filter(webhook_event::Column::Verified.eq(true))
            .filter(webhook_event::Column::Processed.eq(false))
            .filter(webhook_event::Column::Retryable.eq(true))
            .filter(webhook_event::Column::Attempts.lt(max_attempts))
            .count(&*self.db)
            .await?;
        Ok(earlier > 0)
    }

    async fn list_retryable(
        &self,
        max_attempts: u32,
        limit: u64,
    ) -> Result<Vec<WebhookEvent>, StoreError> {
        let max_attempts = i32::try_from(max_attempts).unwrap_or(i32::MAX);
        WebhookEventEntity::find()
            .filter(webhook_event::Column::Verified.eq(true))
            .filter(webhook_event::Column::Processed.eq(false))
            .filter(webhook_event::Column::Retryable.eq(true))
            .filter(webhook_event::Column::Attempts.lt(max_attempts))
            .order_by_asc(webhook_event::Column::ReceivedAt)
            .limit(limit)
            .all(&*self.db)
            .await?
            .into_iter()
            .map(from_model)
            .collect()
    }
}
