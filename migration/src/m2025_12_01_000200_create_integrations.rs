//! Migration to create the integrations table.
//!
//! Integrations are provider configs; `unique_key` is the provider config key and is
//! unique within an environment.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Integrations::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Integrations::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(Integrations::EnvironmentId)
                            .integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(Integrations::UniqueKey).text().not_null())
                    .col(ColumnDef::new(Integrations::Provider).text().not_null())
                    .col(ColumnDef::new(Integrations::OauthClientId).text().null())
                    .col(ColumnDef::new(Integrations::OauthClientSecret).text().null())
                    .col(ColumnDef::new(Integrations::Custom).json_binary().null())
                    .col(
                        ColumnDef::new(Integrations::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Integrations::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_integrations_environment_id")
                            .from(Integrations::Table, Integrations::EnvironmentId)
                            .to(Environments::Table, Environments::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_integrations_environment_unique_key")
                    .table(Integrations::Table)
                    .col(Integrations::EnvironmentId)
                    .col(Integrations::UniqueKey)
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
                    .name("idx_integrations_environment_unique_key")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(Integrations::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Integrations {
    Table,
    Id,
    EnvironmentId,
    UniqueKey,
    Provider,
    OauthClientId,
    OauthClientSecret,
    Custom,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Environments {
    Table,
    Id,
}
