//! Webhook event log entity.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "webhook_events")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub provider: String,
    pub delivery_id: String,
    pub event_type: String,
    pub action: Option<String>,
    pub subject: Option<String>,
    #[sea_orm(column_type = "JsonBinary")]
    pub raw_payload: JsonValue,
    pub verified: bool,
    pub processed: bool,
    pub retryable: bool,
    pub attempts: i32,
    pub error_message: Option<String>,
    pub received_at: DateTimeWithTimeZone,
    pub processed_at: Option<DateTimeWithTimeZone>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
