//! Stage 3: route the query to candidate apps against the static top-tools
//! catalog, then prepare the minimal tool set per authorized app.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use valet_broker::{BrokerTool, ToolBroker, ToolFilter};
use valet_cache::{keys, Cache};
use valet_catalog::ToolCatalog;
use valet_provider::{LlmMessage, LlmRequest, ModelProvider};
use valet_schema::{ComprehensiveAnalysis, ConnectionStatus};
use valet_store::ConnectionRegistry;

use crate::catalog::TopToolsCatalog;

const ROUTING_TEMPERATURE: f64 = 0.1;
const ROUTING_MAX_TOKENS: u32 = 500;
const TOP_APPS: usize = 3;
const DEFAULT_APP_PRIORITY: u8 = 5;
const VECTOR_TOP_K: usize = 5;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteDecision {
    pub app_names: Vec<String>,
    pub tool_names: Vec<String>,
}

#[derive(Clone)]
pub struct ToolRouter {
    models: Arc<ModelProvider>,
    cache: Cache,
    catalog: TopToolsCatalog,
}

impl ToolRouter {
    pub fn new(models: Arc<ModelProvider>, cache: Cache, catalog: TopToolsCatalog) -> Self {
        Self {
            models,
            cache,
            catalog,
        }
    }

    /// Pick candidate apps and tools from the static catalog. Results not
    /// present in the catalog are filtered out. Cached per query.
    pub async fn route(&self, query: &str) -> Result<RouteDecision> {
        let cache_key = keys::app_routing(query);
        if let Some(cached) = self.cache.get::<RouteDecision>(&cache_key) {
            return Ok(cached);
        }

        let resolved = self.models.analysis_model()?;
        let request = LlmRequest {
            model: String::new(),
            system: Some(format!(
                "You route user requests to third-party apps. The available apps \
                 and their top tools are:\n{}\n\nReturn JSON with the app names \
                 and tool names relevant to the request. Only use names from the \
                 list above.",
                self.catalog.prompt_block()
            )),
            messages: vec![LlmMessage::user(query.to_string())],
            max_tokens: ROUTING_MAX_TOKENS,
            temperature: Some(ROUTING_TEMPERATURE),
            tools: vec![],
            response_schema: Some(routing_schema()),
        };

        let response = resolved.chat(request).await?;
        let decision: RouteDecision = serde_json::from_str(response.text.trim())
            .map_err(|e| anyhow!("routing output failed schema parse: {e}"))?;

        let decision = RouteDecision {
            app_names: decision
                .app_names
                .into_iter()
                .filter(|app| self.catalog.has_app(app))
                .collect(),
            tool_names: decision
                .tool_names
                .into_iter()
                .filter(|tool| self.catalog.has_tool(tool))
                .collect(),
        };

        self.cache.set(&cache_key, &decision, keys::APP_ROUTING_TTL);
        Ok(decision)
    }
}

fn routing_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "appNames": { "type": "array", "items": { "type": "string" } },
            "toolNames": { "type": "array", "items": { "type": "string" } }
        },
        "required": ["appNames", "toolNames"]
    })
}

/// Output of preparation: the merged tool set, the apps still needing a
/// connection, and the broker account per connected app.
#[derive(Debug, Clone, Default)]
pub struct PreparedTools {
    pub tools: Vec<BrokerTool>,
    pub required_connections: Vec<String>,
    pub accounts: HashMap<String, String>,
}

enum AppPreparation {
    Ready {
        app_name: String,
        account_id: String,
        tools: Vec<BrokerTool>,
    },
    NeedsConnection(String),
    Skipped,
}

#[derive(Clone)]
pub struct ToolPreparer {
    router: ToolRouter,
    registry: ConnectionRegistry,
    broker: Arc<dyn ToolBroker>,
    catalog: ToolCatalog,
    cache: Cache,
}

impl ToolPreparer {
    pub fn new(
        router: ToolRouter,
        registry: ConnectionRegistry,
        broker: Arc<dyn ToolBroker>,
        catalog: ToolCatalog,
        cache: Cache,
    ) -> Self {
        Self {
            router,
            registry,
            broker,
            catalog,
            cache,
        }
    }

    /// Prepare tools for the top candidate apps. Per-app work runs
    /// concurrently with all-settled semantics: one app failing never
    /// aborts the others.
    pub async fn prepare(
        &self,
        analysis: &ComprehensiveAnalysis,
        query: &str,
        user_id: &str,
        initial_tool_names: &[String],
    ) -> PreparedTools {
        let decision = match self.router.route(query).await {
            Ok(decision) => decision,
            Err(e) => {
                tracing::warn!("routing failed, falling back to recommended apps: {e}");
                RouteDecision {
                    app_names: analysis.recommended_apps.clone(),
                    tool_names: Vec::new(),
                }
            }
        };

        let mut candidates = decision.app_names;
        let priority_of = |app: &String| {
            analysis
                .tool_priorities
                .iter()
                .find(|tp| &tp.app_name == app)
                .map(|tp| tp.priority)
                .unwrap_or(DEFAULT_APP_PRIORITY)
        };
        candidates.sort_by(|a, b| priority_of(b).cmp(&priority_of(a)));
        candidates.dedup();
        candidates.truncate(TOP_APPS);

        let mut known_tool_names: Vec<String> = decision.tool_names;
        known_tool_names.extend(initial_tool_names.iter().cloned());

        let preparations = join_all(candidates.iter().map(|app| {
            let app = app.clone();
            let known = known_tool_names.clone();
            async move { self.prepare_app(&app, query, user_id, &known).await }
        }))
        .await;

        let mut prepared = PreparedTools::default();
        let mut seen_tools = HashSet::new();
        for preparation in preparations {
            match preparation {
                AppPreparation::Ready {
                    app_name,
                    account_id,
                    tools,
                } => {
                    prepared.accounts.insert(app_name, account_id);
                    for tool in tools {
                        if seen_tools.insert(tool.name.clone()) {
                            prepared.tools.push(tool);
                        }
                    }
                }
                AppPreparation::NeedsConnection(app_name) => {
                    prepared.required_connections.push(app_name);
                }
                AppPreparation::Skipped => {}
            }
        }
        prepared
    }

    async fn prepare_app(
        &self,
        app_name: &str,
        query: &str,
        user_id: &str,
        known_tool_names: &[String],
    ) -> AppPreparation {
        // Connection check, read-through cached. A store failure fails open
        // as "not active" and bypasses the cache.
        let status_key = keys::connection_status(user_id, app_name);
        let connection = match self.cache.get::<(String, String)>(&status_key) {
            Some((status, account_id)) => ConnectionStatus::parse(&status).map(|s| (s, account_id)),
            None => match self.registry.get(user_id, app_name).await {
                Ok(Some(record)) => {
                    self.cache.set(
                        &status_key,
                        &(record.status.as_str().to_string(), record.account_id.clone()),
                        keys::CONNECTION_STATUS_TTL,
                    );
                    Some((record.status, record.account_id))
                }
                Ok(None) => None,
                Err(e) => {
                    tracing::warn!("connection lookup failed for {app_name}, treating as not active: {e}");
                    None
                }
            },
        };

        let Some((status, account_id)) = connection else {
            return AppPreparation::NeedsConnection(app_name.to_string());
        };
        if !status.is_usable() {
            return AppPreparation::NeedsConnection(app_name.to_string());
        }

        let tool_names = self.tools_for_app(app_name, query, known_tool_names).await;
        if tool_names.is_empty() {
            tracing::warn!("no tools resolved for {app_name}, skipping");
            return AppPreparation::Skipped;
        }

        match self
            .broker
            .get_tools(ToolFilter::actions(tool_names), user_id)
            .await
        {
            Ok(tools) => AppPreparation::Ready {
                app_name: app_name.to_string(),
                account_id,
                tools,
            },
            Err(e) => {
                tracing::warn!("tool fetch failed for {app_name}, skipping: {e}");
                AppPreparation::Skipped
            }
        }
    }

    /// Router-named tools win; otherwise fall back to vector similarity
    /// search in the app's namespace (cached per app and query).
    async fn tools_for_app(
        &self,
        app_name: &str,
        query: &str,
        known_tool_names: &[String],
    ) -> Vec<String> {
        let prefix = format!("{app_name}_");
        let named: Vec<String> = known_tool_names
            .iter()
            .filter(|name| name.starts_with(&prefix))
            .cloned()
            .collect();
        if !named.is_empty() {
            return named;
        }

        let cache_key = keys::tool_search(app_name, query);
        if let Some(cached) = self.cache.get::<Vec<String>>(&cache_key) {
            return cached;
        }

        match self.catalog.search(app_name, query, VECTOR_TOP_K).await {
            Ok(matches) => {
                let names: Vec<String> = matches.into_iter().map(|m| m.name).collect();
                self.cache.set(&cache_key, &names, keys::TOOL_SEARCH_TTL);
                names
            }
            Err(e) => {
                tracing::warn!("vector tool search failed for {app_name}: {e}");
                Vec::new()
            }
        }
    }
}
