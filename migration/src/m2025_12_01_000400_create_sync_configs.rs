//! Migration to create the sync_configs table.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(SyncConfigs::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(SyncConfigs::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(SyncConfigs::EnvironmentId)
                            .integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(SyncConfigs::IntegrationId)
                            .integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(SyncConfigs::SyncName).text().not_null())
                    .col(
                        ColumnDef::new(SyncConfigs::Kind)
                            .text()
                            .not_null()
                            .default("sync"),
                    )
                    .col(
                        ColumnDef::new(SyncConfigs::WebhookSubscriptions)
                            .json_binary()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(SyncConfigs::Active)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(
                        ColumnDef::new(SyncConfigs::Deleted)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(SyncConfigs::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_sync_configs_integration_id")
                            .from(SyncConfigs::Table, SyncConfigs::IntegrationId)
                            .to(Integrations::Table, Integrations::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_sync_configs_environment_integration")
                    .table(SyncConfigs::Table)
                    .col(SyncConfigs::EnvironmentId)
                    .col(SyncConfigs::IntegrationId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_sync_configs_environment_integration")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(SyncConfigs::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum SyncConfigs {
    Table,
    Id,
    EnvironmentId,
    IntegrationId,
    SyncName,
    Kind,
    WebhookSubscriptions,
    Active,
    Deleted,
    CreatedAt,
}

#[derive(DeriveIden)]
enum Integrations {
    Table,
    Id,
}
