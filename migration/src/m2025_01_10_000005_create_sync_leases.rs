//! Creates the sync_leases table: one row per connection currently being synced.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(SyncLeases::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(SyncLeases::ConnectionId)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(SyncLeases::Token).uuid().not_null())
                    .col(
                        ColumnDef::new(SyncLeases::ExpiresAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(SyncLeases::AcquiredAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(SyncLeases::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum SyncLeases {
    Table,
    ConnectionId,
    Token,
    ExpiresAt,
    AcquiredAt,
}
