//! Connection resolution and task fan-out for one webhook event.

use std::sync::Arc;

use metrics::counter;
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use super::handlers::CONNECTION_ID_PROP;
use crate::error::ServiceError;
use crate::repositories::{
    Connection, ConnectionRef, ConnectionStore, Integration, SyncConfigStore,
};
use crate::scheduler::{TaskKind, TaskRequest, TaskScheduler};

/// What a handler extracted from one event
#[derive(Debug, Clone)]
pub struct WebhookEvent<'a> {
    pub event_type: Option<String>,
    pub identifier: Option<String>,
    pub identifier_path: &'a str,
    pub config_prop: &'a str,
    pub body: &'a Value,
}

#[derive(Clone)]
pub struct Dispatcher {
    connections: Arc<dyn ConnectionStore>,
    sync_configs: Arc<dyn SyncConfigStore>,
    scheduler: Arc<dyn TaskScheduler>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(
        connections: Arc<dyn ConnectionStore>,
        sync_configs: Arc<dyn SyncConfigStore>,
        scheduler: Arc<dyn TaskScheduler>,
    ) -> Self {
        Self {
            connections,
            sync_configs,
            scheduler,
        }
    }

    /// Resolve the event's connections and trigger one task per subscribed sync and
    /// connection. Returns the resolved connection ids.
    ///
    /// Scheduler failures are logged and skipped; only store errors propagate.
    pub async fn dispatch(
        &self,
        integration: &Integration,
        event: &WebhookEvent<'_>,
    ) -> Result<Vec<String>, ServiceError> {
        let Some(identifier) = event.identifier.as_deref() else {
            warn!(
                provider_config_key = %integration.unique_key,
                connection_identifier = event.identifier_path,
                "Incoming webhook had the wrong connection identifier"
            );
            return Ok(Vec::new());
        };

        let connections = self.resolve(integration, event.config_prop, identifier).await?;
        if connections.is_empty() {
            warn!(
                provider_config_key = %integration.unique_key,
                prop = event.config_prop,
                connection_identifier = event.identifier_path,
                "Incoming webhook received but no connection found for it"
            );
            return Ok(Vec::new());
        }

        let connection_ids: Vec<String> = connections
            .iter()
            .map(|connection| connection.connection_id.clone())
            .collect();

        let subscriptions = self
            .sync_configs
            .find_with_webhooks(integration.environment_id, integration.id)
            .await?;
        if subscriptions.is_empty() {
            debug!("No syncs subscribe to webhooks for this integration");
            return Ok(connection_ids);
        }

        info!(
            provider_config_key = %integration.unique_key,
            connection_ids = %connection_ids.join(","),
            "Incoming webhook received and connection found for it"
        );

        let Some(event_type) = event.event_type.as_deref() else {
            debug!("Webhook event carries no type");
            return Ok(connection_ids);
        };

        for subscription in &subscriptions {
            for webhook in subscription
                .webhook_subscriptions
                .iter()
                .filter(|webhook| webhook.as_str() == event_type)
            {
                for connection in &connections {
                    self.trigger(integration, &subscription.sync_name, webhook, connection, event.body)
                        .await;
                }
            }
        }

        Ok(connection_ids)
    }

    async fn resolve(
        &self,
        integration: &Integration,
        config_prop: &str,
        identifier: &str,
    ) -> Result<Vec<Connection>, ServiceError> {
        if config_prop == CONNECTION_ID_PROP {
            let reference = ConnectionRef::new(
                identifier,
                &integration.unique_key,
                integration.environment_id,
            );
            return Ok(self.connections.find(&reference).await?.into_iter().collect());
        }

        self.connections
            .find_by_config_value(config_prop, identifier, integration.environment_id)
            .await
    }

    async fn trigger(
        &self,
        integration: &Integration,
        sync_name: &str,
        webhook: &str,
        connection: &Connection,
        body: &Value,
    ) {
        let request = TaskRequest {
            kind: TaskKind::Webhook,
            name: webhook.to_string(),
            connection_id: connection.id,
            payload: json!({
                "parentSyncName": sync_name,
                "webhookName": webhook,
                "connectionId": connection.connection_id,
                "providerConfigKey": integration.unique_key,
                "environmentId": integration.environment_id,
                "input": body,
            }),
        };

        match self.scheduler.trigger_task(request).await {
            Ok(task_id) => {
                counter!("webhook_tasks_triggered_total").increment(1);
                debug!(task_id, sync_name, webhook, connection = %connection.reference(), "Webhook task triggered");
            }
            Err(scheduler_error) => {
                error!(
                    error = %scheduler_error,
                    sync_name,
                    webhook,
                    connection = %connection.reference(),
                    "Failed to trigger webhook task"
                );
            }
        }
    }
}
