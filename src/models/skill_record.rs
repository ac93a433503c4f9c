//! Skill record entity: the current score per `(owner, skill, source)`.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "skill_records")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub owner_id: Uuid,
    pub skill_name: String,
    pub category: String,
    pub level: String,
    #[sea_orm(column_type = "Double")]
    pub confidence: f64,
    /// Provider slug or `aggregate`
    pub source: String,
    pub evidence_count: i64,
    pub last_observed_at: DateTimeWithTimeZone,
    pub last_updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
