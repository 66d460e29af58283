//! The per-turn pipeline: context init -> analysis -> tool preparation ->
//! dispatch -> persistence. Turns within a session are serialized by an
//! advisory lock held across all five stages.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use valet_broker::ToolBroker;
use valet_cache::Cache;
use valet_catalog::ToolCatalog;
use valet_provider::ModelProvider;
use valet_schema::{ChatMessage, ChatRequest, ChatResponse};
use valet_store::{ConnectionRegistry, Store};

use crate::analyzer::Analyzer;
use crate::catalog::TopToolsCatalog;
use crate::config::Config;
use crate::context_init::ContextInitializer;
use crate::dispatcher::Dispatcher;
use crate::execution::ExecutionContext;
use crate::persist::PersistWriter;
use crate::router::{PreparedTools, ToolPreparer, ToolRouter};
use crate::session_lock::SessionLockManager;

pub struct ChatPipeline {
    config: Config,
    initializer: ContextInitializer,
    analyzer: Analyzer,
    preparer: ToolPreparer,
    dispatcher: Dispatcher,
    writer: PersistWriter,
    locks: SessionLockManager,
}

impl ChatPipeline {
    pub fn new(
        config: Config,
        store: Arc<Store>,
        cache: Cache,
        models: Arc<ModelProvider>,
        broker: Arc<dyn ToolBroker>,
        catalog: ToolCatalog,
    ) -> Self {
        let registry = ConnectionRegistry::new(store.clone());
        let router = ToolRouter::new(models.clone(), cache.clone(), TopToolsCatalog::default());
        Self {
            initializer: ContextInitializer::new(
                store.clone(),
                cache.clone(),
                config.degraded_mode,
            ),
            analyzer: Analyzer::new(models.clone(), cache.clone()),
            preparer: ToolPreparer::new(router, registry, broker.clone(), catalog, cache.clone()),
            dispatcher: Dispatcher::new(models, broker, config.max_agent_steps),
            writer: PersistWriter::new(store, cache, config.max_conversation_history),
            locks: SessionLockManager::new(),
            config,
        }
    }

    /// Process one user turn end to end. Errors escape only for
    /// validation failures and unrecoverable store failures; everything
    /// else degrades into the response text.
    pub async fn handle(&self, request: ChatRequest) -> Result<ChatResponse> {
        request.validate().map_err(|e| anyhow!(e))?;

        let lock_key = request
            .session_id
            .clone()
            .unwrap_or_else(|| format!("user:{}", request.user_id));
        let _guard = self.locks.acquire(&lock_key).await;

        // Stage 1: identities and context.
        let turn = self
            .initializer
            .init_context(&request.user_id, request.session_id.as_deref(), None, None)
            .await?;

        let mut history = self
            .initializer
            .load_history(&turn.session_id, self.config.max_conversation_history)
            .await;
        if history.is_empty() {
            if let Some(provided) = &request.conversation_history {
                history = provided.clone();
            }
        }
        let prior_summary = self.initializer.load_summary(&turn.session_id).await;

        // Stage 2: analysis.
        let analysis = self
            .analyzer
            .analyze(&request.user_query, &history, prior_summary.as_ref())
            .await;

        // Stage 3: tool preparation, only on the tool-execution tier.
        let tool_tier = analysis.confidence_score >= 0.8 && analysis.requires_tool_execution;
        let prepared = if tool_tier {
            self.preparer
                .prepare(&analysis, &request.user_query, &request.user_id, &[])
                .await
        } else {
            PreparedTools::default()
        };

        // Stage 4: dispatch.
        let mut ctx = ExecutionContext::new();
        let outcome = self
            .dispatcher
            .dispatch(
                &request,
                &analysis,
                prior_summary.as_ref(),
                &history,
                &prepared,
                &mut ctx,
            )
            .await;

        // Stage 5: best-effort persistence.
        let warning = if turn.synthetic {
            Some("Running without a store; this turn was not saved.".to_string())
        } else {
            self.writer
                .commit(
                    &turn,
                    &request.user_query,
                    &outcome.text,
                    &ctx.records(),
                    &analysis,
                )
                .await
        };

        let mut full_history = history;
        full_history.push(ChatMessage::user(
            turn.conversation_id.clone(),
            request.user_query.clone(),
        ));
        full_history.push(ChatMessage::assistant(
            turn.conversation_id.clone(),
            outcome.text.clone(),
        ));

        Ok(ChatResponse {
            response: outcome.text,
            executed_tools: ctx.executed_tools(),
            required_connections: prepared.required_connections,
            conversation_history: Some(full_history),
            analysis: Some(analysis),
            error: warning,
        })
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{
        broker_tool, model_provider, text_response, tool_use_response, ScriptedLlm, StubBroker,
    };
    use std::sync::atomic::Ordering;
    use valet_catalog::{StubEmbeddingProvider, VectorIndex};
    use valet_schema::{ConnectionStatus, MessageRole};

    fn analysis_json(
        confidence: f64,
        requires_tools: bool,
        apps: &[&str],
        clarifications: &[&str],
    ) -> String {
        serde_json::json!({
            "queryAnalysis": "test",
            "isQueryClear": clarifications.is_empty(),
            "confidenceScore": confidence,
            "requiresToolExecution": requires_tools,
            "recommendedApps": apps,
            "toolPriorities": apps
                .iter()
                .map(|a| serde_json::json!({"appName": a, "priority": 8}))
                .collect::<Vec<_>>(),
            "clarificationNeeded": clarifications,
            "conversationSummary": {
                "currentIntent": "testing",
                "state": "information_gathering"
            }
        })
        .to_string()
    }

    fn route_json(apps: &[&str], tools: &[&str]) -> String {
        serde_json::json!({ "appNames": apps, "toolNames": tools }).to_string()
    }

    struct Harness {
        pipeline: ChatPipeline,
        store: Arc<Store>,
        analysis_llm: Arc<ScriptedLlm>,
        chat_llm: Arc<ScriptedLlm>,
        broker: Arc<StubBroker>,
    }

    async fn harness(
        analysis_script: Vec<String>,
        chat_responses: Vec<valet_provider::LlmResponse>,
        broker: StubBroker,
        connections: &[(&str, &str, ConnectionStatus)],
    ) -> Harness {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store.find_or_create_user("u1", None, None).await.unwrap();
        let registry = ConnectionRegistry::new(store.clone());
        for (app, account, status) in connections {
            registry.upsert("u1", app, account, *status).await.unwrap();
        }

        let analysis_llm = Arc::new(ScriptedLlm::with_texts(analysis_script));
        let chat_llm = Arc::new(ScriptedLlm::with_responses(chat_responses));
        let broker = Arc::new(broker);
        let catalog = ToolCatalog::new(
            VectorIndex::open_in_memory().unwrap(),
            Arc::new(StubEmbeddingProvider::new(16)),
        )
        .unwrap();

        let pipeline = ChatPipeline::new(
            Config::default(),
            store.clone(),
            Cache::new(),
            model_provider(analysis_llm.clone(), chat_llm.clone()),
            broker.clone(),
            catalog,
        );

        Harness {
            pipeline,
            store,
            analysis_llm,
            chat_llm,
            broker,
        }
    }

    fn request(query: &str) -> ChatRequest {
        ChatRequest {
            user_query: query.into(),
            user_id: "u1".into(),
            session_id: None,
            conversation_history: None,
        }
    }

    #[tokio::test]
    async fn small_talk_takes_conversational_path() {
        let harness = harness(
            vec![analysis_json(0.2, false, &[], &[])],
            vec![text_response("Happy to help with documents!".into())],
            StubBroker::default(),
            &[],
        )
        .await;

        let response = harness
            .pipeline
            .handle(request("Hello, I need help with creating some documents"))
            .await
            .unwrap();

        assert_eq!(response.response, "Happy to help with documents!");
        assert!(response.executed_tools.is_empty());
        assert!(response.required_connections.is_empty());
        assert!(response.analysis.unwrap().confidence_score < 0.4);

        // Two messages persisted: the user turn and the assistant turn.
        let history = response.conversation_history.unwrap();
        let conversation_id = history.last().unwrap().conversation_id.clone().unwrap();
        let stored = harness
            .store
            .recent_messages(&conversation_id, 10)
            .await
            .unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].role, MessageRole::User);
        assert_eq!(stored[1].role, MessageRole::Assistant);
        assert!(stored[0].timestamp <= stored[1].timestamp);
    }

    #[tokio::test]
    async fn missing_connection_is_surfaced_without_tools() {
        let harness = harness(
            vec![
                analysis_json(0.9, true, &["GOOGLEDOCS"], &[]),
                route_json(&["GOOGLEDOCS"], &["GOOGLEDOCS_CREATE_DOCUMENT"]),
            ],
            vec![],
            StubBroker::with_tools(vec![broker_tool(
                "GOOGLEDOCS_CREATE_DOCUMENT",
                "GOOGLEDOCS",
            )]),
            &[],
        )
        .await;

        let response = harness
            .pipeline
            .handle(request("Create a new Google Doc titled 'Project Proposal'"))
            .await
            .unwrap();

        assert_eq!(
            response.required_connections,
            vec!["GOOGLEDOCS".to_string()]
        );
        assert!(response.response.contains("GOOGLEDOCS"));
        assert!(response.executed_tools.is_empty());
        assert!(harness.broker.executed_actions().is_empty());
        // The chat model was never engaged.
        assert_eq!(harness.chat_llm.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn active_connection_executes_tools_and_persists_them() {
        let harness = harness(
            vec![
                analysis_json(0.9, true, &["GOOGLEDOCS"], &[]),
                route_json(&["GOOGLEDOCS"], &["GOOGLEDOCS_CREATE_DOCUMENT"]),
            ],
            vec![
                tool_use_response(vec![(
                    "call_1",
                    "GOOGLEDOCS_CREATE_DOCUMENT",
                    serde_json::json!({"title": "Project Proposal"}),
                )]),
                text_response("Created 'Project Proposal' for you.".into()),
            ],
            StubBroker::with_tools(vec![broker_tool(
                "GOOGLEDOCS_CREATE_DOCUMENT",
                "GOOGLEDOCS",
            )]),
            &[("GOOGLEDOCS", "acct-1", ConnectionStatus::Active)],
        )
        .await;

        let response = harness
            .pipeline
            .handle(request("Create a new Google Doc titled 'Project Proposal'"))
            .await
            .unwrap();

        assert!(!response.executed_tools.is_empty());
        assert!(response.required_connections.is_empty());
        assert_eq!(response.response, "Created 'Project Proposal' for you.");
        assert_eq!(
            harness.broker.executed_actions(),
            vec!["GOOGLEDOCS_CREATE_DOCUMENT".to_string()]
        );

        let history = response.conversation_history.unwrap();
        let conversation_id = history.last().unwrap().conversation_id.clone().unwrap();
        let stored = harness
            .store
            .recent_messages(&conversation_id, 10)
            .await
            .unwrap();
        let assistant = &stored[1];
        let tool_calls = assistant.tool_calls.as_ref().unwrap();
        assert_eq!(tool_calls[0]["name"], "GOOGLEDOCS_CREATE_DOCUMENT");
    }

    #[tokio::test]
    async fn clarification_tier_returns_numbered_list() {
        let harness = harness(
            vec![analysis_json(
                0.6,
                false,
                &[],
                &["Which meeting do you mean?", "What day and time?"],
            )],
            vec![],
            StubBroker::default(),
            &[],
        )
        .await;

        let response = harness
            .pipeline
            .handle(request("Schedule that meeting"))
            .await
            .unwrap();

        assert!(response.response.contains("1. Which meeting do you mean?"));
        assert!(response.response.contains("2. What day and time?"));
        assert!(response.executed_tools.is_empty());
        assert_eq!(harness.chat_llm.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn reusing_a_session_accumulates_history() {
        let harness = harness(
            vec![
                analysis_json(0.2, false, &[], &[]),
                analysis_json(0.2, false, &[], &[]),
            ],
            vec![
                text_response("First reply".into()),
                text_response("Second reply".into()),
            ],
            StubBroker::default(),
            &[],
        )
        .await;

        let mut req = request("Hello");
        req.session_id = Some("fixed-session".into());
        harness.pipeline.handle(req.clone()).await.unwrap();

        req.user_query = "Hello again".into();
        let second = harness.pipeline.handle(req).await.unwrap();

        let history = second.conversation_history.unwrap();
        // Two persisted turns plus the new pair.
        assert_eq!(history.len(), 4);
        assert_eq!(history[0].content, "Hello");
        assert_eq!(history[3].content, "Second reply");
        // Analysis model ran once per turn (different fingerprints).
        assert_eq!(harness.analysis_llm.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn rejects_blank_query() {
        let harness = harness(vec![], vec![], StubBroker::default(), &[]).await;
        let mut req = request("  ");
        req.user_id = "u1".into();
        assert!(harness.pipeline.handle(req).await.is_err());
    }

    #[tokio::test]
    async fn analysis_fallback_still_yields_a_reply() {
        // Analysis model down entirely: fallback analysis routes to the
        // conversational tier and the turn still completes.
        let store = Arc::new(Store::open_in_memory().unwrap());
        let analysis_llm = Arc::new(ScriptedLlm::failing("analysis down"));
        let chat_llm = Arc::new(ScriptedLlm::with_texts(vec!["Still here to help.".into()]));
        let catalog = ToolCatalog::new(
            VectorIndex::open_in_memory().unwrap(),
            Arc::new(StubEmbeddingProvider::new(16)),
        )
        .unwrap();
        let pipeline = ChatPipeline::new(
            Config::default(),
            store,
            Cache::new(),
            model_provider(analysis_llm, chat_llm),
            Arc::new(StubBroker::default()),
            catalog,
        );

        let response = pipeline.handle(request("Do something complex")).await.unwrap();
        assert_eq!(response.response, "Still here to help.");
        assert!(response.executed_tools.is_empty());
    }
}
