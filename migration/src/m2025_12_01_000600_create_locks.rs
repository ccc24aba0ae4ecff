//! Migration to create the locks table used by the database lock store.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Locks::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Locks::Key).text().not_null().primary_key())
                    .col(ColumnDef::new(Locks::Owner).text().not_null())
                    .col(
                        ColumnDef::new(Locks::ExpiresAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Locks::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Locks {
    Table,
    Key,
    Owner,
    ExpiresAt,
}
