//! # Task scheduler
//!
//! The engine never runs syncs itself. It hands work to a [`TaskScheduler`]: webhook
//! fan-out triggers one task per subscribed sync and connection, and deleting a connection
//! soft-deletes whatever is still queued for it.
//!
//! [`DatabaseTaskScheduler`] writes those tasks to the `scheduled_tasks` outbox table,
//! where the external orchestrator picks them up.

use std::{fmt, str::FromStr, sync::Arc};

use async_trait::async_trait;
use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter,
    QueryOrder, Set,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::error::ServiceError;
use crate::models::scheduled_task::{self, Entity as ScheduledTask};
use crate::repositories::Connection;

const STATE_PENDING: &str = "pending";
const STATE_DELETED: &str = "deleted";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskKind {
    Sync,
    Action,
    Webhook,
    PostConnection,
    SyncAbort,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Sync => "sync",
            TaskKind::Action => "action",
            TaskKind::Webhook => "webhook",
            TaskKind::PostConnection => "post-connection",
            TaskKind::SyncAbort => "sync-abort",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = SchedulerError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "sync" => Ok(TaskKind::Sync),
            "action" => Ok(TaskKind::Action),
            "webhook" => Ok(TaskKind::Webhook),
            "post-connection" => Ok(TaskKind::PostConnection),
            "sync-abort" => Ok(TaskKind::SyncAbort),
            other => Err(SchedulerError::UnknownKind(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskRequest {
    pub kind: TaskKind,
    /// Sync, action or webhook name
    pub name: String,
    /// Surrogate id of the target connection
    pub connection_id: i32,
    pub payload: Value,
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("task store error: {0}")]
    Storage(#[from] DbErr),
    #[error("unknown task kind '{0}'")]
    UnknownKind(String),
}

impl From<SchedulerError> for ServiceError {
    fn from(error: SchedulerError) -> Self {
        match error {
            SchedulerError::Storage(db) => ServiceError::from(db),
            other => ServiceError::storage(other.to_string()),
        }
    }
}

#[async_trait]
pub trait TaskScheduler: Send + Sync {
    /// Queue a task and return its id.
    async fn trigger_task(&self, request: TaskRequest) -> Result<String, SchedulerError>;

    /// Withdraw pending work for a deleted connection. Returns the number of tasks touched.
    async fn soft_delete_by_connection(&self, connection: &Connection)
    -> Result<u64, SchedulerError>;
}

/// Outbox-backed scheduler
#[derive(Debug, Clone)]
pub struct DatabaseTaskScheduler {
    db: Arc<DatabaseConnection>,
}

impl DatabaseTaskScheduler {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Pending tasks for a connection, oldest first
    pub async fn pending_for_connection(
        &self,
        connection_id: i32,
    ) -> Result<Vec<scheduled_task::Model>, SchedulerError> {
        Ok(ScheduledTask::find()
            .filter(scheduled_task::Column::ConnectionId.eq(connection_id))
            .filter(scheduled_task::Column::State.eq(STATE_PENDING))
            .order_by_asc(scheduled_task::Column::CreatedAt)
            .all(&*self.db)
            .await?)
    }
}

#[async_trait]
impl TaskScheduler for DatabaseTaskScheduler {
    #[instrument(skip_all, fields(kind = %request.kind, name = %request.name, connection_id = request.connection_id))]
    async fn trigger_task(&self, request: TaskRequest) -> Result<String, SchedulerError> {
        let id = Uuid::new_v4();
        let task = scheduled_task::ActiveModel {
            id: Set(id),
            kind: Set(request.kind.as_str().to_string()),
            name: Set(request.name),
            connection_id: Set(request.connection_id),
            payload: Set(request.payload),
            state: Set(STATE_PENDING.to_string()),
            created_at: Set(Utc::now().into()),
            deleted_at: Set(None),
        };
        task.insert(&*self.db).await?;

        debug!(task_id = %id, "Task queued");
        Ok(id.to_string())
    }

    async fn soft_delete_by_connection(
        &self,
        connection: &Connection,
    ) -> Result<u64, SchedulerError> {
        let now: sea_orm::prelude::DateTimeWithTimeZone = Utc::now().into();
        let result = ScheduledTask::update_many()
            .col_expr(scheduled_task::Column::State, Expr::value(STATE_DELETED))
            .col_expr(scheduled_task::Column::DeletedAt, Expr::value(now))
            .filter(scheduled_task::Column::ConnectionId.eq(connection.id))
            .filter(scheduled_task::Column::State.eq(STATE_PENDING))
            .exec(&*self.db)
            .await?;

        info!(
            connection = %connection.reference(),
            tasks = result.rows_affected,
            "Soft-deleted pending tasks for connection"
        );
        Ok(result.rows_affected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_wire_names() {
        for kind in [
            TaskKind::Sync,
            TaskKind::Action,
            TaskKind::Webhook,
            TaskKind::PostConnection,
            TaskKind::SyncAbort,
        ] {
            assert_eq!(kind.as_str().parse::<TaskKind>().unwrap(), kind);
            assert_eq!(
                serde_json::to_value(kind).unwrap(),
                Value::String(kind.as_str().to_string())
            );
        }
        assert!("cron".parse::<TaskKind>().is_err());
    }
}
