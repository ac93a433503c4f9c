//! # Data Models
//!
//! SeaORM entities backing the store traits, plus small API payload types.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub mod connection;
pub mod skill_evidence;
pub mod skill_record;
pub mod sync_lease;
pub mod webhook_event;

pub use connection::Entity as ConnectionEntity;
pub use skill_evidence::Entity as SkillEvidenceEntity;
pub use skill_record::Entity as SkillRecordEntity;
pub use sync_lease::Entity as SyncLeaseEntity;
pub use webhook_event::Entity as WebhookEventEntity;

/// Basic service information response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServiceInfo {
    pub service: String,
    pub version: String,
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            service: "skill-sync".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
