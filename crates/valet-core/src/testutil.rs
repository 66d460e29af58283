//! Shared test doubles: a scripted LLM provider and an in-memory broker.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use valet_broker::{
    BrokerConnection, BrokerTool, ExecuteOutcome, ExecuteRequest, InitiateResult, ToolBroker,
    ToolFilter,
};
use valet_provider::{
    ContentBlock, LlmProvider, LlmRequest, LlmResponse, ModelProvider, ProviderRegistry,
};

pub(crate) struct ScriptedLlm {
    script: Mutex<VecDeque<LlmResponse>>,
    repeat_error: Option<String>,
    pub calls: AtomicUsize,
    pub requests: Mutex<Vec<LlmRequest>>,
}

impl ScriptedLlm {
    pub fn with_texts(texts: Vec<String>) -> Self {
        Self::with_responses(texts.into_iter().map(text_response).collect())
    }

    pub fn with_responses(responses: Vec<LlmResponse>) -> Self {
        Self {
            script: Mutex::new(responses.into()),
            repeat_error: None,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            repeat_error: Some(message.to_string()),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn last_request(&self) -> Option<LlmRequest> {
        self.requests.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    async fn chat(&self, request: LlmRequest) -> Result<LlmResponse> {
        self.calls
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.requests.lock().unwrap().push(request);
        if let Some(ref message) = self.repeat_error {
            return Err(anyhow!("{message}"));
        }
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow!("scripted llm exhausted"))
    }
}

pub(crate) fn text_response(text: String) -> LlmResponse {
    LlmResponse {
        content: vec![ContentBlock::Text { text: text.clone() }],
        text,
        input_tokens: None,
        output_tokens: None,
        stop_reason: Some("end_turn".into()),
    }
}

pub(crate) fn tool_use_response(calls: Vec<(&str, &str, serde_json::Value)>) -> LlmResponse {
    LlmResponse {
        text: String::new(),
        content: calls
            .into_iter()
            .map(|(id, name, input)| ContentBlock::ToolUse {
                id: id.to_string(),
                name: name.to_string(),
                input,
            })
            .collect(),
        input_tokens: None,
        output_tokens: None,
        stop_reason: Some("tool_use".into()),
    }
}

/// Registry with the scripted analysis model under `google` and the
/// scripted chat model under `openai`, matching the default config.
pub(crate) fn model_provider(
    analysis: Arc<ScriptedLlm>,
    chat: Arc<ScriptedLlm>,
) -> Arc<ModelProvider> {
    let mut registry = ProviderRegistry::new();
    registry.register("google", analysis);
    registry.register("openai", chat);
    Arc::new(ModelProvider::new(
        registry,
        "openai:gpt-4o-mini",
        "google:gemini-2.0-flash",
    ))
}

pub(crate) fn broker_tool(name: &str, app_name: &str) -> BrokerTool {
    BrokerTool {
        name: name.to_string(),
        app_name: app_name.to_string(),
        description: format!("{name} tool"),
        input_schema: serde_json::json!({"type": "object"}),
    }
}

#[derive(Default)]
pub(crate) struct StubBroker {
    pub tools: Vec<BrokerTool>,
    pub outcomes: Mutex<HashMap<String, ExecuteOutcome>>,
    pub executed: Mutex<Vec<ExecuteRequest>>,
    pub fail_get_tools_for: Vec<String>,
    pub get_tools_calls: AtomicUsize,
}

impl StubBroker {
    pub fn with_tools(tools: Vec<BrokerTool>) -> Self {
        Self {
            tools,
            ..Default::default()
        }
    }

    pub fn set_outcome(&self, action: &str, outcome: ExecuteOutcome) {
        self.outcomes
            .lock()
            .unwrap()
            .insert(action.to_string(), outcome);
    }

    pub fn executed_actions(&self) -> Vec<String> {
        self.executed
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.action.clone())
            .collect()
    }
}

#[async_trait]
impl ToolBroker for StubBroker {
    async fn initiate(&self, app_name: &str, entity_id: &str) -> Result<InitiateResult> {
        Ok(InitiateResult {
            redirect_url: Some(format!("https://broker.test/connect/{app_name}")),
            connected_account_id: format!("acct-{app_name}-{entity_id}"),
        })
    }

    async fn get(&self, connected_account_id: &str) -> Result<BrokerConnection> {
        Ok(BrokerConnection {
            id: connected_account_id.to_string(),
            status: "ACTIVE".to_string(),
        })
    }

    async fn reinitiate(
        &self,
        connected_account_id: &str,
        _redirect_uri: &str,
    ) -> Result<InitiateResult> {
        Ok(InitiateResult {
            redirect_url: Some("https://broker.test/reconnect".to_string()),
            connected_account_id: connected_account_id.to_string(),
        })
    }

    async fn get_tools(&self, filter: ToolFilter, _entity_id: &str) -> Result<Vec<BrokerTool>> {
        self.get_tools_calls
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let matches_failing = |tool: &BrokerTool| {
            self.fail_get_tools_for
                .iter()
                .any(|app| app == &tool.app_name)
        };
        let selected: Vec<BrokerTool> = self
            .tools
            .iter()
            .filter(|tool| {
                (filter.actions.is_empty() || filter.actions.contains(&tool.name))
                    && (filter.apps.is_empty() || filter.apps.contains(&tool.app_name))
            })
            .cloned()
            .collect();
        if selected.iter().any(matches_failing)
            || self
                .fail_get_tools_for
                .iter()
                .any(|app| filter.actions.iter().any(|a| a.starts_with(&format!("{app}_"))))
        {
            return Err(anyhow!("broker error (503): tool listing unavailable"));
        }
        Ok(selected)
    }

    async fn execute(&self, request: ExecuteRequest) -> Result<ExecuteOutcome> {
        let outcome = self
            .outcomes
            .lock()
            .unwrap()
            .get(&request.action)
            .cloned()
            .unwrap_or(ExecuteOutcome {
                successful: true,
                data: Some(serde_json::json!({"ok": true})),
                error: None,
            });
        self.executed.lock().unwrap().push(request);
        Ok(outcome)
    }
}
