//! Creates the skill_evidence ledger.
//!
//! Each activity contributes to a skill at most once; the unique index on
//! `(owner_id, skill_name, provider, activity_key)` enforces it.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(SkillEvidence::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(SkillEvidence::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(SkillEvidence::OwnerId).uuid().not_null())
                    .col(ColumnDef::new(SkillEvidence::SkillName).text().not_null())
                    .col(ColumnDef::new(SkillEvidence::Category).text().not_null())
                    .col(ColumnDef::new(SkillEvidence::Provider).text().not_null())
                    .col(ColumnDef::new(SkillEvidence::ActivityKey).text().not_null())
                    .col(ColumnDef::new(SkillEvidence::Weight).double().not_null())
                    .col(
                        ColumnDef::new(SkillEvidence::ObservedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(SkillEvidence::RecordedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_skill_evidence_activity")
                    .table(SkillEvidence::Table)
                    .col(SkillEvidence::OwnerId)
                    .col(SkillEvidence::SkillName)
                    .col(SkillEvidence::Provider)
                    .col(SkillEvidence::ActivityKey)
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(Index::drop().name("idx_skill_evidence_activity").to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(SkillEvidence::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum SkillEvidence {
    Table,
    Id,
    OwnerId,
    SkillName,
    Category,
    Provider,
    ActivityKey,
    Weight,
    ObservedAt,
    RecordedAt,
}
