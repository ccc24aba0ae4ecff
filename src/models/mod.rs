//! # Data Models
//!
//! SeaORM entities for the credential hub tables.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub mod connection;
pub mod environment;
pub mod integration;
pub mod lock;
pub mod scheduled_task;
pub mod sync_config;

pub use connection::Entity as Connection;
pub use environment::Entity as Environment;
pub use integration::Entity as Integration;
pub use lock::Entity as Lock;
pub use scheduled_task::Entity as ScheduledTask;
pub use sync_config::Entity as SyncConfig;

/// Basic service information response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServiceInfo {
    /// The name of the service
    pub service: String,
    /// The version of the service
    pub version: String,
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            service: "credential-hub".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
