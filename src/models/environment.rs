//! Environment entity model
//!
//! An environment is the tenant scope every integration and connection lives in.
//! Webhook URLs address it by its public uuid rather than the numeric id.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "environments")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,

    /// Public identifier used in webhook URLs
    #[sea_orm(unique)]
    pub uuid: Uuid,

    /// Owning account, used for log correlation only
    pub account_id: i32,

    pub name: String,

    /// Per-environment webhook switch
    pub webhooks_enabled: bool,

    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::integration::Entity")]
    Integration,
}

impl Related<super::integration::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Integration.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
