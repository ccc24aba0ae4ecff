//! Database migrations for the credential hub.

pub use sea_orm_migration::prelude::*;

mod m2025_12_01_000100_create_environments;
mod m2025_12_01_000200_create_integrations;
mod m2025_12_01_000300_create_connections;
mod m2025_12_01_000400_create_sync_configs;
mod m2025_12_01_000500_create_scheduled_tasks;
mod m2025_12_01_000600_create_locks;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2025_12_01_000100_create_environments::Migration),
            Box::new(m2025_12_01_000200_create_integrations::Migration),
            Box::new(m2025_12_01_000300_create_connections::Migration),
            Box::new(m2025_12_01_000400_create_sync_configs::Migration),
            Box::new(m2025_12_01_000500_create_scheduled_tasks::Migration),
            Box::new(m2025_12_01_000600_create_locks::Migration),
        ]
    }
}
