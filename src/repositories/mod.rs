//! # Repository Layer
//!
//! SeaORM-backed stores. The engine depends on the traits; the `*Repository` types are
//! the production implementations.

pub mod connection;
pub mod environment;
pub mod integration;
pub mod sync_config;

pub use connection::{
    Connection, ConnectionPatch, ConnectionRef, ConnectionRepository, ConnectionStore,
    NewConnection,
};
pub use environment::EnvironmentRepository;
pub use integration::{Integration, IntegrationRepository, IntegrationStore, NewIntegration};
pub use sync_config::{SyncConfigRepository, SyncConfigStore, WebhookSubscription};
