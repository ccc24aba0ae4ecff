//! Sync configuration entity model
//!
//! Deployed syncs and actions per integration, with the webhook types each subscribes to.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "sync_configs")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,

    pub environment_id: i32,

    pub integration_id: i32,

    pub sync_name: String,

    /// `sync` or `action`
    pub kind: String,

    /// JSON array of webhook type strings
    #[sea_orm(column_type = "JsonBinary")]
    pub webhook_subscriptions: Option<JsonValue>,

    pub active: bool,

    pub deleted: bool,

    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::integration::Entity",
        from = "Column::IntegrationId",
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
