//! Migration to create the scheduled_tasks outbox table.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(ScheduledTasks::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ScheduledTasks::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(ScheduledTasks::Kind).text().not_null())
                    .col(ColumnDef::new(ScheduledTasks::Name).text().not_null())
                    .col(
                        ColumnDef::new(ScheduledTasks::ConnectionId)
                            .integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ScheduledTasks::Payload)
                            .json_binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ScheduledTasks::State)
                            .text()
                            .not_null()
                            .default("pending"),
                    )
                    .col(
                        ColumnDef::new(ScheduledTasks::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(ScheduledTasks::DeletedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_scheduled_tasks_connection_id")
                            .from(ScheduledTasks::Table, ScheduledTasks::ConnectionId)
                            .to(Connections::Table, Connections::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_scheduled_tasks_connection_state")
                    .table(ScheduledTasks::Table)
                    .col(ScheduledTasks::ConnectionId)
                    .col(ScheduledTasks::State)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_scheduled_tasks_connection_state")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(ScheduledTasks::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum ScheduledTasks {
    Table,
    Id,
    Kind,
    Name,
    ConnectionId,
    Payload,
    State,
    CreatedAt,
    DeletedAt,
}

#[derive(DeriveIden)]
enum Connections {
    Table,
    Id,
}
