//! Connection entity model
//!
//! This module contains the SeaORM entity model for the connections table. A row is a
//! tenant's authorization against one integration, keyed naturally by
//! (`connection_id`, `provider_config_key`, `environment_id`) among non-deleted rows.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "connections")]
pub struct Model {
    /// Surrogate storage key
    #[sea_orm(primary_key)]
    pub id: i32,

    /// Tenant-chosen connection identifier
    pub connection_id: String,

    /// Integration unique key within the environment
    pub provider_config_key: String,

    /// Provider template name, denormalized from the integration
    pub provider: String,

    pub environment_id: i32,

    /// Internal id of the integration
    pub config_id: i32,

    /// Credential variant tag, immutable after creation
    pub credentials_type: String,

    /// AES-256-GCM sealed credential union; NULL once the connection is deleted
    pub credentials: Option<Vec<u8>>,

    /// Tenant and provider parameters supplied at creation
    #[sea_orm(column_type = "JsonBinary")]
    pub connection_config: Option<JsonValue>,

    /// Script-managed metadata
    #[sea_orm(column_type = "JsonBinary")]
    pub metadata: Option<JsonValue>,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,

    /// Last time credentials were read for outbound use
    pub last_fetched_at: Option<DateTimeWithTimeZone>,

    /// Tombstone flag
    pub deleted: bool,

    pub deleted_at: Option<DateTimeWithTimeZone>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::integration::Entity",
        from = "Column::ConfigId",
        to = "super::integration::Column::Id"
    )]
    Integration,
}

impl Related<super::integration::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Integration.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
