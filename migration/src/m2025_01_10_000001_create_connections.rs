//! Creates the connections table.
//!
//! A connection links one owner (employee or company) to one provider account.
//! Rows are never deleted; status transitions record revocation and failure.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Connections::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Connections::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Connections::OwnerId).uuid().not_null())
                    .col(ColumnDef::new(Connections::Provider).text().not_null())
                    .col(
                        ColumnDef::new(Connections::ExternalAccountId)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Connections::Status)
                            .text()
                            .not_null()
                            .default("active"),
                    )
                    .col(ColumnDef::new(Connections::ErrorReason).text().null())
                    .col(
                        ColumnDef::new(Connections::AccessTokenCiphertext)
                            .binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Connections::RefreshTokenCiphertext)
                            .binary()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Connections::ExpiresAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(ColumnDef::new(Connections::Scopes).json_binary().null())
                    .col(
                        ColumnDef::new(Connections::LastSyncAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Connections::LastSyncCursor)
                            .json_binary()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Connections::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Connections::UpdatedAt)
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
                    .name("idx_connections_owner_provider_account")
                    .table(Connections::Table)
                    .col(Connections::OwnerId)
                    .col(Connections::Provider)
                    .col(Connections::ExternalAccountId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        // Webhook attribution looks connections up by provider account.
        manager
            .create_index(
                Index::create()
                    .name("idx_connections_provider_account")
                    .table(Connections::Table)
                    .col(Connections::Provider)
                    .col(Connections::ExternalAccountId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_connections_owner_provider_account")
                    .to_owned(),
            )
            .await?;
        manager
            .drop_index(
                Index::drop()
                    .name("idx_connections_provider_account")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(Connections::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Connections {
    Table,
    Id,
    OwnerId,
    Provider,
    ExternalAccountId,
    Status,
    ErrorReason,
    AccessTokenCiphertext,
    RefreshTokenCiphertext,
    ExpiresAt,
    Scopes,
    LastSyncAt,
    LastSyncCursor,
    CreatedAt,
    UpdatedAt,
}
