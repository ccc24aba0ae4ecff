//! Integration entity model
//!
//! An integration (provider config) binds a provider template to an environment under
//! a `unique_key`, the `provider_config_key` connections and webhook URLs refer to.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "integrations")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,

    pub environment_id: i32,

    /// Provider config key, unique per environment
    pub unique_key: String,

    /// Name of the provider template this integration uses
    pub provider: String,

    pub oauth_client_id: Option<String>,

    pub oauth_client_secret: Option<String>,

    /// Free-form provider settings (`app_id`, `private_key`, `webhook_secret`, ...)
    #[sea_orm(column_type = "JsonBinary")]
    pub custom: Option<JsonValue>,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::environment::Entity",
        from = "Column::EnvironmentId",
        to = "super::environment::Column::Id"
    )]
    Environment,
    #[sea_orm(has_many = "super::connection::Entity")]
    Connection,
}

impl Related<super::environment::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Environment.def()
    }
}

impl Related<super::connection::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Connection.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
