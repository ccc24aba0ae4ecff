//! Migration to create the connections table.
//!
//! Credentials are stored as one sealed blob per row. The natural key
//! (connection_id, provider_config_key, environment_id) is unique among live rows only,
//! so a deleted connection can be recreated while its tombstone is kept for audit.

use sea_orm_migration::prelude::*;
use sea_orm_migration::sea_orm::ConnectionTrait;

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
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Connections::ConnectionId).text().not_null())
                    .col(
                        ColumnDef::new(Connections::ProviderConfigKey)
                            .text()
                            .not_null(),
                    )
                    .col(ColumnDef::new(Connections::Provider).text().not_null())
                    .col(
                        ColumnDef::new(Connections::EnvironmentId)
                            .integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(Connections::ConfigId).integer().not_null())
                    .col(
                        ColumnDef::new(Connections::CredentialsType)
                            .text()
                            .not_null(),
                    )
                    .col(ColumnDef::new(Connections::Credentials).binary().null())
                    .col(
                        ColumnDef::new(Connections::ConnectionConfig)
                            .json_binary()
                            .null(),
                    )
                    .col(ColumnDef::new(Connections::Metadata).json_binary().null())
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
                    .col(
                        ColumnDef::new(Connections::LastFetchedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Connections::Deleted)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(Connections::DeletedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_connections_config_id")
                            .from(Connections::Table, Connections::ConfigId)
                            .to(Integrations::Table, Integrations::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // Partial index: sea-query has no WHERE clause for index creation
        manager
            .get_connection()
            .execute_unprepared(
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_connections_natural_key \
                 ON connections (connection_id, provider_config_key, environment_id) \
                 WHERE deleted = false",
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_connections_environment_id")
                    .table(Connections::Table)
                    .col(Connections::EnvironmentId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_connections_last_fetched_at")
                    .table(Connections::Table)
                    .col(Connections::LastFetchedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        for name in [
            "idx_connections_natural_key",
            "idx_connections_environment_id",
            "idx_connections_last_fetched_at",
        ] {
            manager
                .drop_index(Index::drop().name(name).to_owned())
                .await?;
        }

        manager
            .drop_table(Table::drop().table(Connections::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Connections {
    Table,
    Id,
    ConnectionId,
    ProviderConfigKey,
    Provider,
    EnvironmentId,
    ConfigId,
    CredentialsType,
    Credentials,
    ConnectionConfig,
    Metadata,
    CreatedAt,
    UpdatedAt,
    LastFetchedAt,
    Deleted,
    DeletedAt,
}

#[derive(DeriveIden)]
enum Integrations {
    Table,
    Id,
}
