//! Connection entity model.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;

/// One owner's authorization against one provider account. Tokens are stored sealed.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "connections")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub owner_id: Uuid,

    /// Provider slug (`github`, `jira`, `slack`, `oauth`)
    pub provider: String,

    pub external_account_id: String,

    /// `active`, `revoked` or `error`
    pub status: String,

    pub error_reason: Option<String>,

    pub access_token_ciphertext: Vec<u8>,

    pub refresh_token_ciphertext: Option<Vec<u8>>,

    pub expires_at: Option<DateTimeWithTimeZone>,

    #[sea_orm(column_type = "JsonBinary", nullable)]
    pub scopes: Option<JsonValue>,

    pub last_sync_at: Option<DateTimeWithTimeZone>,

    #[sea_orm(column_type = "JsonBinary", nullable)]
    pub last_sync_cursor: Option<JsonValue>,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
