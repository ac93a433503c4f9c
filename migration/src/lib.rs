//! Database migrations for the skill sync service.

pub use sea_orm_migration::prelude::*;

mod m2025_01_10_000001_create_connections;
mod m2025_01_10_000002_create_webhook_events;
mod m2025_01_10_000003_create_skill_records;
mod m2025_01_10_000004_create_skill_evidence;
mod m2025_01_10_000005_create_sync_leases;
mod m2025_01_10_000006_unique_active_connection;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2025_01_10_000001_create_connections::Migration),
            Box::new(m2025_01_10_000002_create_webhook_events::Migration),
            Box::new(m2025_01_10_000003_create_skill_records::Migration),
            Box::new(m2025_01_10_000004_create_skill_evidence::Migration),
            Box::new(m2025_01_10_000005_create_sync_leases::Migration),
            Box::new(m2025_01_10_000006_unique_active_connection::Migration),
        ]
    }
}
