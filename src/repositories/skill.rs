//! Skill record and evidence ledger repository.

use async_trait::async_trait;
use chrono::Utc;
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
    TransactionTrait,
};
use std::sync::Arc;
use uuid::Uuid;

use super::{from_db_time, to_db_time};
use crate::domain::{EvidenceEntry, OwnerId, SkillRecord};
use crate::models::skill_evidence::{self, Entity as SkillEvidenceEntity};
use crate::models::skill_record::{self, Entity as SkillRecordEntity};
use crate::store::{SkillStore, StoreError};

#[derive(Debug, Clone)]
pub struct SkillRepository {
    pub db: Arc<DatabaseConnection>,
}

impl SkillRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

fn corrupt(e: impl std::fmt::Display) -> StoreError {
    StoreError::Corrupt(e.to_string())
}

fn record_from_model(model: skill_record::Model) -> Result<SkillRecord, StoreError> {
    Ok(SkillRecord {
        owner_id: OwnerId(model.owner_id),
        skill_name: model.skill_name,
        category: model.category.parse().map_err(corrupt)?,
        level: model.level.parse().map_err(corrupt)?,
        confidence: model.confidence,
        source: model.source.parse().map_err(corrupt)?,
        evidence_count: u64::try_from(model.evidence_count).unwrap_or_default(),
        last_observed_at: from_db_time(model.last_observed_at),
        last_updated_at: from_db_time(model.last_updated_at),
    })
}

fn evidence_from_model(model: skill_evidence::Model) -> Result<EvidenceEntry, StoreError> {
    Ok(EvidenceEntry {
        owner_id: OwnerId(model.owner_id),
        skill_name: model.skill_name,
        category: model.category.parse().map_err(corrupt)?,
        provider: model.provider.parse().map_err(corrupt)?,
        activity_key: model.activity_key,
        observed_at: from_db_time(model.observed_at),
        weight: model.weight,
    })
}

#[async_trait]
impl SkillStore for SkillRepository {
    async fn upsert(&self, record: &SkillRecord) -> Result<(), StoreError> {
        let txn = self.db.begin().await?;

        let existing = SkillRecordEntity::find()
            .filter(skill_record::Column::OwnerId.eq(record.owner_id.as_uuid()))
            .filter(skill_record::Column::SkillName.eq(record.skill_name.as_str()))
            .filter(skill_record::Column::Source.eq(record.source.as_str()))
            .one(&txn)
            .await?;

        let id = existing.as_ref().map(|m| m.id).unwrap_or_else(Uuid::new_v4);
        let model = skill_record::ActiveModel {
            id: Set(id),
            owner_id: Set(record.owner_id.as_uuid()),
            skill_name: Set(record.skill_name.clone()),
            category: Set(record.category.as_str().to_string()),
            level: Set(record.level.as_str().to_string()),
            confidence: Set(record.confidence),
            source: Set(record.source.as_str().to_string()),
            evidence_count: Set(i64::try_from(record.evidence_count).unwrap_or(i64::MAX)),
            last_observed_at: Set(to_db_time(record.last_observed_at)),
            last_updated_at: Set(to_db_time(record.last_updated_at)),
        };

        if existing.is_some() {
            model.update(&txn).await?;
        } else {
            SkillRecordEntity::insert(model)
                .exec_without_returning(&txn)
                .await?;
        }

        txn.commit().await?;
        Ok(())
    }

    async fn find_by_owner(&self, owner_id: OwnerId) -> Result<Vec<SkillRecord>, StoreError> {
        SkillRecordEntity::find()
            .filter(skill_record::Column::OwnerId.eq(owner_id.as_uuid()))
            .order_by_asc(skill_record::Column::SkillName)
            .order_by_asc(skill_record::Column::Source)
            .all(&*self.db)
            .await?
            .into_iter()
            .map(record_from_model)
            .collect()
    }

    async fn find_skill(
        &self,
        owner_id: OwnerId,
        skill_name: &str,
    ) -> Result<Vec<SkillRecord>, StoreError> {
        SkillRecordEntity::find()
            .filter(skill_record::Column::OwnerId.eq(owner_id.as_uuid()))
            .filter(skill_record::Column::SkillName.eq(skill_name))
            .all(&*self.db)
            .await?
            .into_iter()
            .map(record_from_model)
            .collect()
    }

    async fn record_evidence(&self, entries: &[EvidenceEntry]) -> Result<usize, StoreError> {
        if entries.is_empty() {
            return Ok(0);
        }

        let now = to_db_time(Utc::now());
        let txn = self.db.begin().await?;
        let mut inserted = 0usize;

        for entry in entries {
            let model = skill_evidence::ActiveModel {
                id: Set(Uuid::new_v4()),
                owner_id: Set(entry.owner_id.as_uuid()),
                skill_name: Set(entry.skill_name.clone()),
                category: Set(entry.category.as_str().to_string()),
                provider: Set(entry.provider.slug().to_string()),
                activity_key: Set(entry.activity_key.clone()),
                weight: Set(entry.weight),
                observed_at: Set(to_db_time(entry.observed_at)),
                recorded_at: Set(now),
            };

            let rows = SkillEvidenceEntity::insert(model)
                .on_conflict(
                    OnConflict::columns([
                        skill_evidence::Column::OwnerId,
                        skill_evidence::Column::SkillName,
                        skill_evidence::Column::Provider,
                        skill_evidence::Column::ActivityKey,
                    ])
                    .do_nothing()
                    .to_owned(),
                )
                .exec_without_returning(&txn)
                .await?;
            inserted += rows as usize;
        }

        txn.commit().await?;
        Ok(inserted)
    }

    async fn evidence_for(
        &self,
        owner_id: OwnerId,
        skill_name: &str,
    ) -> Result<Vec<EvidenceEntry>, StoreError> {
        SkillEvidenceEntity::find()
            .filter(skill_evidence::Column::OwnerId.eq(owner_id.as_uuid()))
            .filter(skill_evidence::Column::SkillName.eq(skill_name))
            .order_by_asc(skill_evidence::Column::ObservedAt)
            .all(&*self.db)
            .await?
            .into_iter()
            .map(evidence_from_model)
            .collect()
    }
}
