//! Per-user/app connection registry. A thin state machine over the
//! `app_connections` table; `upsert` is the single mutating operation and
//! transitions are idempotent.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use valet_schema::ConnectionStatus;

use crate::models::AppConnectionRecord;
use crate::store::Store;

#[derive(Clone)]
pub struct ConnectionRegistry {
    store: Arc<Store>,
}

impl ConnectionRegistry {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub async fn get(&self, user_id: &str, app_name: &str) -> Result<Option<AppConnectionRecord>> {
        self.store.get_connection(user_id, app_name).await
    }

    /// Apply a status transition for `(user_id, app_name)`. Illegal
    /// transitions are ignored (the existing row is returned unchanged) so
    /// that replayed broker callbacks stay harmless.
    pub async fn upsert(
        &self,
        user_id: &str,
        app_name: &str,
        account_id: &str,
        status: ConnectionStatus,
    ) -> Result<AppConnectionRecord> {
        // Connections may arrive (broker callbacks) before the user's first
        // chat turn; the owning row must exist.
        self.store.find_or_create_user(user_id, None, None).await?;

        if let Some(existing) = self.store.get_connection(user_id, app_name).await? {
            if !existing.status.can_transition_to(status) {
                tracing::warn!(
                    user_id,
                    app_name,
                    from = existing.status.as_str(),
                    to = status.as_str(),
                    "ignoring illegal connection transition"
                );
                return Ok(existing);
            }
        }
        self.store
            .upsert_connection_row(user_id, app_name, account_id, status, None)
            .await
    }

    pub async fn list(
        &self,
        user_id: &str,
        status: Option<ConnectionStatus>,
    ) -> Result<Vec<AppConnectionRecord>> {
        self.store.list_connections(user_id, status).await
    }

    /// Map of `appName -> accountId` for connections in the given status
    /// (ACTIVE by default).
    pub async fn user_connections(
        &self,
        user_id: &str,
        status: Option<ConnectionStatus>,
    ) -> Result<HashMap<String, String>> {
        let status = status.unwrap_or(ConnectionStatus::Active);
        let rows = self.store.list_connections(user_id, Some(status)).await?;
        Ok(rows
            .into_iter()
            .map(|r| (r.app_name, r.account_id))
            .collect())
    }
}
