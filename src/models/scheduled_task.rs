//! Scheduled task entity model
//!
//! Outbox rows written for the external orchestrator: one per triggered sync, action,
//! webhook, post-connection or sync-abort task.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "scheduled_tasks")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Task kind (`sync`, `action`, `webhook`, `post-connection`, `sync-abort`)
    pub kind: String,

    /// Sync, action or webhook subscription name
    pub name: String,

    /// Surrogate id of the connection the task runs for
    pub connection_id: i32,

    #[sea_orm(column_type = "JsonBinary")]
    pub payload: JsonValue,

    /// `pending` until picked up, `deleted` once its connection is removed
    pub state: String,

    pub created_at: DateTimeWithTimeZone,

    pub deleted_at: Option<DateTimeWithTimeZone>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::connection::Entity",
        from = "Column::ConnectionId",
        to = "super::connection::Column::Id"
    )]
    Connection,
}

impl Related<super::connection::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Connection.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
