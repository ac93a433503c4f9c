//! SeaORM-backed implementations of the store traits.

pub mod connection;
pub mod lease;
pub mod skill;
pub mod webhook_event;

pub use connection::ConnectionRepository;
pub use lease::LeaseRepository;
pub use skill::SkillRepository;
pub use webhook_event::WebhookEventRepository;

use chrono::{DateTime, Utc};
use sea_orm::prelude::DateTimeWithTimeZone;

pub(crate) fn to_db_time(value: DateTime<Utc>) -> DateTimeWithTimeZone {
    value.fixed_offset()
}

pub(crate) fn from_db_time(value: DateTimeWithTimeZone) -> DateTime<Utc> {
    value.with_timezone(&Utc)
}
