//! Client for the external tool-execution broker: app-scoped account
//! handshakes, tool descriptor listing, and tool execution on behalf of an
//! entity (user).

use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

const GET_TOOLS_DEADLINE: Duration = Duration::from_secs(10);
const EXECUTE_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_url: Option<String>,
    pub connected_account_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerConnection {
    pub id: String,
    pub status: String,
}

/// Filter for tool listing: by app names or by concrete action names.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ToolFilter {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub apps: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<String>,
}

impl ToolFilter {
    pub fn apps(apps: Vec<String>) -> Self {
        Self {
            apps,
            actions: Vec::new(),
        }
    }

    pub fn actions(actions: Vec<String>) -> Self {
        Self {
            apps: Vec::new(),
            actions,
        }
    }
}

/// A concrete tool descriptor fetched from the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerTool {
    pub name: String,
    pub app_name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    pub action: String,
    pub params: serde_json::Value,
    pub connected_account_id: String,
    pub entity_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteOutcome {
    pub successful: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecuteOutcome {
    /// Normalize into the JSON value the dispatcher correlates and
    /// persists. Failures always carry an `error` field.
    pub fn into_result_value(self) -> serde_json::Value {
        if self.successful {
            self.data.unwrap_or_else(|| serde_json::json!({}))
        } else {
            serde_json::json!({
                "success": false,
                "error": self.error.unwrap_or_else(|| "unknown broker error".to_string()),
            })
        }
    }
}

#[async_trait]
pub trait ToolBroker: Send + Sync {
    async fn initiate(&self, app_name: &str, entity_id: &str) -> Result<InitiateResult>;
    async fn get(&self, connected_account_id: &str) -> Result<BrokerConnection>;
    async fn reinitiate(
        &self,
        connected_account_id: &str,
        redirect_uri: &str,
    ) -> Result<InitiateResult>;
    async fn get_tools(&self, filter: ToolFilter, entity_id: &str) -> Result<Vec<BrokerTool>>;
    async fn execute(&self, request: ExecuteRequest) -> Result<ExecuteOutcome>;
}

#[derive(Debug, Clone)]
pub struct HttpBroker {
    client: reqwest::Client,
    api_key: String,
    api_base: String,
}

impl HttpBroker {
    pub fn new(api_key: impl Into<String>, api_base: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
        }
    }

    async fn post_json<B: Serialize, T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &B,
        deadline: Duration,
    ) -> Result<T> {
        let url = format!("{}{path}", self.api_base);
        let resp = self
            .client
            .post(url)
            .timeout(deadline)
            .header("x-api-key", &self.api_key)
            .header("content-type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    anyhow!("broker error (timeout) [retryable]: {path} timed out")
                } else {
                    anyhow!("broker error (connect): {e}")
                }
            })?;

        let status = resp.status();
        if status != StatusCode::OK {
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("broker error ({status}): {text}"));
        }
        Ok(resp.json().await?)
    }
}

#[async_trait]
impl ToolBroker for HttpBroker {
    async fn initiate(&self, app_name: &str, entity_id: &str) -> Result<InitiateResult> {
        self.post_json(
            "/v1/connections/initiate",
            &serde_json::json!({ "appName": app_name, "entityId": entity_id }),
            GET_TOOLS_DEADLINE,
        )
        .await
    }

    async fn get(&self, connected_account_id: &str) -> Result<BrokerConnection> {
        let url = format!("{}/v1/connections/{connected_account_id}", self.api_base);
        let resp = self
            .client
            .get(url)
            .timeout(GET_TOOLS_DEADLINE)
            .header("x-api-key", &self.api_key)
            .send()
            .await
            .map_err(|e| anyhow!("broker error (connect): {e}"))?;
        let status = resp.status();
        if status != StatusCode::OK {
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("broker error ({status}): {text}"));
        }
        Ok(resp.json().await?)
    }

    async fn reinitiate(
        &self,
        connected_account_id: &str,
        redirect_uri: &str,
    ) -> Result<InitiateResult> {
        self.post_json(
            &format!("/v1/connections/{connected_account_id}/reinitiate"),
            &serde_json::json!({ "redirectUri": redirect_uri }),
            GET_TOOLS_DEADLINE,
        )
        .await
    }

    async fn get_tools(&self, filter: ToolFilter, entity_id: &str) -> Result<Vec<BrokerTool>> {
        #[derive(Deserialize)]
        struct ToolListResponse {
            #[serde(default)]
            tools: Vec<BrokerTool>,
        }
        let resp: ToolListResponse = self
            .post_json(
                "/v1/tools/list",
                &serde_json::json!({ "filter": filter, "entityId": entity_id }),
                GET_TOOLS_DEADLINE,
            )
            .await?;
        Ok(resp.tools)
    }

    async fn execute(&self, request: ExecuteRequest) -> Result<ExecuteOutcome> {
        self.post_json("/v1/tools/execute", &request, EXECUTE_DEADLINE)
            .await
    }
}
