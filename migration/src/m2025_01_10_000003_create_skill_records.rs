//! Creates the skill_records table holding the current scored skill per source.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(SkillRecords::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(SkillRecords::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(SkillRecords::OwnerId).uuid().not_null())
                    .col(ColumnDef::new(SkillRecords::SkillName).text().not_null())
                    .col(ColumnDef::new(SkillRecords::Category).text().not_null())
                    .col(ColumnDef::new(SkillRecords::Level).text().not_null())
                    .col(ColumnDef::new(SkillRecords::Confidence).double().not_null())
                    .col(ColumnDef::new(SkillRecords::Source).text().not_null())
                    .col(
                        ColumnDef::new(SkillRecords::EvidenceCount)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(SkillRecords::LastObservedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(SkillRecords::LastUpdatedAt)
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
                    .name("idx_skill_records_owner_skill_source")
                    .table(SkillRecords::Table)
                    .col(SkillRecords::OwnerId)
                    .col(SkillRecords::SkillName)
                    .col(SkillRecords::Source)
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_skill_records_owner_skill_source")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(SkillRecords::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum SkillRecords {
    Table,
    Id,
    OwnerId,
    SkillName,
    Category,
    Level,
    Confidence,
    Source,
    EvidenceCount,
    LastObservedAt,
    LastUpdatedAt,
}
