//! Stage 4: classify the turn by confidence tier and run the matching
//! model interaction. The tool tier loops the chat model against the
//! prepared tool set, executing calls through the broker and correlating
//! every call id to its result.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use valet_broker::{ExecuteRequest, ToolBroker};
use valet_provider::{ContentBlock, LlmMessage, LlmRequest, ModelProvider, ToolDef};
use valet_schema::{
    ChatMessage, ChatRequest, ComprehensiveAnalysis, ConversationSummary, ToolCallRecord,
};

use crate::execution::ExecutionContext;
use crate::router::PreparedTools;

const TOOL_TEMPERATURE: f64 = 0.3;
const TOOL_MAX_TOKENS: u32 = 3000;
const CLARIFY_TEMPERATURE: f64 = 0.4;
const CLARIFY_MAX_TOKENS: u32 = 1500;
const CHAT_TEMPERATURE: f64 = 0.5;
const CHAT_MAX_TOKENS: u32 = 1000;
const PER_STEP_DEADLINE: Duration = Duration::from_secs(30);
const TOTAL_TOOL_DEADLINE: Duration = Duration::from_secs(300);

const TOOL_TIER_CONFIDENCE: f64 = 0.8;
const CONVERSATIONAL_CONFIDENCE: f64 = 0.4;

#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub text: String,
}

#[derive(Clone)]
pub struct Dispatcher {
    models: Arc<ModelProvider>,
    broker: Arc<dyn ToolBroker>,
    max_agent_steps: usize,
}

impl Dispatcher {
    pub fn new(
        models: Arc<ModelProvider>,
        broker: Arc<dyn ToolBroker>,
        max_agent_steps: usize,
    ) -> Self {
        Self {
            models,
            broker,
            max_agent_steps,
        }
    }

    pub async fn dispatch(
        &self,
        request: &ChatRequest,
        analysis: &ComprehensiveAnalysis,
        prior_summary: Option<&ConversationSummary>,
        history: &[ChatMessage],
        prepared: &PreparedTools,
        ctx: &mut ExecutionContext,
    ) -> DispatchOutcome {
        let confidence = analysis.confidence_score;

        if confidence >= TOOL_TIER_CONFIDENCE && analysis.requires_tool_execution {
            if prepared.tools.is_empty() {
                if !prepared.required_connections.is_empty() {
                    return DispatchOutcome {
                        text: connection_prompt(&prepared.required_connections),
                    };
                }
                // Nothing to call; answer like the clarification tier.
                return self
                    .clarification_turn(request, analysis, prior_summary, history)
                    .await;
            }
            return self
                .tool_turn(request, analysis, prior_summary, history, prepared, ctx)
                .await;
        }

        if confidence >= CONVERSATIONAL_CONFIDENCE {
            return self
                .clarification_turn(request, analysis, prior_summary, history)
                .await;
        }

        self.conversational_turn(request, analysis).await
    }

    async fn tool_turn(
        &self,
        request: &ChatRequest,
        analysis: &ComprehensiveAnalysis,
        prior_summary: Option<&ConversationSummary>,
        history: &[ChatMessage],
        prepared: &PreparedTools,
        ctx: &mut ExecutionContext,
    ) -> DispatchOutcome {
        let tool_defs: Vec<ToolDef> = prepared
            .tools
            .iter()
            .map(|tool| ToolDef {
                name: tool.name.clone(),
                description: tool.description.clone(),
                input_schema: tool.input_schema.clone(),
            })
            .collect();

        let mut messages = vec![LlmMessage::user(build_optimized_prompt(
            &request.user_query,
            analysis,
            prior_summary,
            history,
        ))];

        let started = Instant::now();
        let mut final_text: Option<String> = None;
        let mut model_failed = false;

        let resolved = match self.models.chat_model() {
            Ok(resolved) => resolved,
            Err(e) => {
                tracing::warn!("chat model unavailable: {e}");
                return DispatchOutcome {
                    text: degraded_text(),
                };
            }
        };

        for _ in 0..self.max_agent_steps {
            if started.elapsed() > TOTAL_TOOL_DEADLINE {
                tracing::warn!("tool dispatch exceeded total deadline, stopping");
                break;
            }

            let llm_request = LlmRequest {
                model: String::new(),
                system: Some(TOOL_SYSTEM_PROMPT.to_string()),
                messages: messages.clone(),
                max_tokens: TOOL_MAX_TOKENS,
                temperature: Some(TOOL_TEMPERATURE),
                tools: tool_defs.clone(),
                response_schema: None,
            };

            let response = match resolved.chat(llm_request).await {
                Ok(response) => response,
                Err(e) => {
                    tracing::warn!("chat model failed during tool turn: {e}");
                    model_failed = true;
                    break;
                }
            };

            let tool_uses: Vec<(String, String, serde_json::Value)> = response
                .tool_uses()
                .into_iter()
                .map(|(id, name, input)| (id.to_string(), name.to_string(), input.clone()))
                .collect();

            if tool_uses.is_empty() || response.stop_reason.as_deref() != Some("tool_use") {
                final_text = Some(response.text);
                break;
            }

            messages.push(LlmMessage {
                role: "assistant".into(),
                content: response.content.clone(),
            });

            let mut result_blocks = Vec::new();
            for (id, name, input) in tool_uses {
                let args = ctx.substitute_args(&input);
                let result = self.execute_tool(&name, &args, prepared, request).await;
                let failed = is_failure(&result);
                result_blocks.push(ContentBlock::ToolResult {
                    tool_use_id: id.clone(),
                    content: serde_json::to_string(&result)
                        .unwrap_or_else(|_| "{}".to_string()),
                    is_error: failed,
                });
                let step_number = ctx.next_step_number();
                ctx.record(
                    step_number,
                    ToolCallRecord {
                        name,
                        args,
                        result,
                        tool_call_id: id,
                    },
                );
            }

            messages.push(LlmMessage {
                role: "user".into(),
                content: result_blocks,
            });
        }

        let failures = tool_failures(&ctx.records());
        let text = if !failures.is_empty() {
            compose_failure_text(&failures)
        } else if model_failed {
            degraded_text()
        } else {
            match final_text {
                Some(text) if !text.trim().is_empty() => text,
                _ => "I've completed your request successfully.".to_string(),
            }
        };

        DispatchOutcome { text }
    }

    async fn execute_tool(
        &self,
        name: &str,
        args: &serde_json::Value,
        prepared: &PreparedTools,
        request: &ChatRequest,
    ) -> serde_json::Value {
        let Some(tool) = prepared.tools.iter().find(|t| t.name == name) else {
            return serde_json::json!({
                "success": false,
                "error": format!("unknown tool: {name}"),
            });
        };
        let Some(account_id) = prepared.accounts.get(&tool.app_name) else {
            return serde_json::json!({
                "success": false,
                "error": format!("no connected account for {}", tool.app_name),
            });
        };

        let execute = self.broker.execute(ExecuteRequest {
            action: name.to_string(),
            params: args.clone(),
            connected_account_id: account_id.clone(),
            entity_id: request.user_id.clone(),
        });

        match tokio::time::timeout(PER_STEP_DEADLINE, execute).await {
            Ok(Ok(outcome)) => outcome.into_result_value(),
            Ok(Err(e)) => serde_json::json!({
                "success": false,
                "error": format!("{e}"),
            }),
            Err(_) => serde_json::json!({
                "success": false,
                "error": format!("{name} timed out after {}s", PER_STEP_DEADLINE.as_secs()),
            }),
        }
    }

    async fn clarification_turn(
        &self,
        request: &ChatRequest,
        analysis: &ComprehensiveAnalysis,
        prior_summary: Option<&ConversationSummary>,
        history: &[ChatMessage],
    ) -> DispatchOutcome {
        if !analysis.clarification_needed.is_empty() {
            let mut lines =
                vec!["I need a bit more information before I can proceed:".to_string()];
            for (i, item) in analysis.clarification_needed.iter().enumerate() {
                lines.push(format!("{}. {item}", i + 1));
            }
            return DispatchOutcome {
                text: lines.join("\n"),
            };
        }

        let llm_request = LlmRequest {
            model: String::new(),
            system: Some(ASSISTANT_SYSTEM_PROMPT.to_string()),
            messages: vec![LlmMessage::user(build_optimized_prompt(
                &request.user_query,
                analysis,
                prior_summary,
                history,
            ))],
            max_tokens: CLARIFY_MAX_TOKENS,
            temperature: Some(CLARIFY_TEMPERATURE),
            tools: vec![],
            response_schema: None,
        };
        self.plain_reply(llm_request).await
    }

    async fn conversational_turn(
        &self,
        request: &ChatRequest,
        analysis: &ComprehensiveAnalysis,
    ) -> DispatchOutcome {
        let intent = &analysis.conversation_summary.current_intent;
        let mut prompt = String::new();
        if !intent.is_empty() {
            prompt.push_str(&format!("Current intent: {intent}\n\n"));
        }
        prompt.push_str(&request.user_query);

        let llm_request = LlmRequest {
            model: String::new(),
            system: Some(ASSISTANT_SYSTEM_PROMPT.to_string()),
            messages: vec![LlmMessage::user(prompt)],
            max_tokens: CHAT_MAX_TOKENS,
            temperature: Some(CHAT_TEMPERATURE),
            tools: vec![],
            response_schema: None,
        };
        self.plain_reply(llm_request).await
    }

    async fn plain_reply(&self, llm_request: LlmRequest) -> DispatchOutcome {
        let resolved = match self.models.chat_model() {
            Ok(resolved) => resolved,
            Err(e) => {
                tracing::warn!("chat model unavailable: {e}");
                return DispatchOutcome {
                    text: degraded_text(),
                };
            }
        };
        match resolved.chat(llm_request).await {
            Ok(response) if !response.text.trim().is_empty() => DispatchOutcome {
                text: response.text,
            },
            Ok(_) => DispatchOutcome {
                text: "How can I help you further?".to_string(),
            },
            Err(e) => {
                tracing::warn!("chat model failed: {e}");
                DispatchOutcome {
                    text: degraded_text(),
                }
            }
        }
    }
}

/// A tool result is a failure iff it is an object carrying an `error`
/// field, or `success=false`. Everything else, including `{}`, succeeded.
pub fn is_failure(result: &serde_json::Value) -> bool {
    let Some(map) = result.as_object() else {
        return false;
    };
    if map.contains_key("error") {
        return true;
    }
    matches!(map.get("success"), Some(serde_json::Value::Bool(false)))
}

fn tool_failures(records: &[ToolCallRecord]) -> Vec<(String, Option<String>)> {
    records
        .iter()
        .filter(|record| is_failure(&record.result))
        .map(|record| {
            let reason = record
                .result
                .get("error")
                .and_then(|e| e.as_str())
                .map(str::to_string);
            (record.name.clone(), reason)
        })
        .collect()
}

fn compose_failure_text(failures: &[(String, Option<String>)]) -> String {
    let names: Vec<&str> = failures.iter().map(|(name, _)| name.as_str()).collect();
    let details: Vec<String> = failures
        .iter()
        .map(|(name, reason)| {
            format!(
                "{name} failed: {}",
                reason.as_deref().unwrap_or("unknown error")
            )
        })
        .collect();
    format!(
        "I attempted to complete your request, but encountered issues with: {}. Details: {}.",
        names.join(", "),
        details.join("; ")
    )
}

fn connection_prompt(required: &[String]) -> String {
    format!(
        "To complete this request I need access to the following apps: {}. \
         Please connect them and try again.",
        required.join(", ")
    )
}

fn degraded_text() -> String {
    "I wasn't able to complete that request right now. Please try again in a moment.".to_string()
}

fn build_optimized_prompt(
    query: &str,
    analysis: &ComprehensiveAnalysis,
    prior_summary: Option<&ConversationSummary>,
    history: &[ChatMessage],
) -> String {
    let summary = prior_summary.unwrap_or(&analysis.conversation_summary);
    let mut sections = Vec::new();

    sections.push(format!("Date: {}", Utc::now().format("%Y-%m-%d")));
    sections.push(format!("Confidence: {:.2}", analysis.confidence_score));
    if !summary.current_intent.is_empty() {
        sections.push(format!(
            "Intent: {} (state: {})",
            summary.current_intent,
            serde_json::to_value(summary.state)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default()
        ));
    }

    let ordered_steps: Vec<String> = match analysis.execution_order() {
        Ok(steps) => steps
            .iter()
            .map(|step| {
                let app = step
                    .app_name
                    .as_deref()
                    .map(|a| format!(" [{a}]"))
                    .unwrap_or_default();
                format!("{}.{app} {}", step.step_number, step.description)
            })
            .collect(),
        Err(_) => Vec::new(),
    };
    if !ordered_steps.is_empty() {
        sections.push(format!("Plan:\n{}", ordered_steps.join("\n")));
    }

    let details = &summary.contextual_details;
    if !details.gathered.is_empty() {
        sections.push(format!("Known: {}", details.gathered.join("; ")));
    }
    if !details.missing.is_empty() {
        sections.push(format!("Missing: {}", details.missing.join("; ")));
    }
    if !summary.key_entities.is_empty() {
        let entities: Vec<String> = summary
            .key_entities
            .iter()
            .map(|e| format!("{}={}", e.entity_type, e.value))
            .collect();
        sections.push(format!("Entities: {}", entities.join(", ")));
    }

    let recent: Vec<String> = history
        .iter()
        .rev()
        .take(2)
        .rev()
        .map(|m| format!("{}: {}", m.role.as_str(), m.content))
        .collect();
    if !recent.is_empty() {
        sections.push(format!("Last turns:\n{}", recent.join("\n")));
    }

    sections.push(format!("Request: {query}"));
    sections.join("\n\n")
}

const TOOL_SYSTEM_PROMPT: &str = "You are a personal assistant that completes the user's request \
by calling the provided tools. Follow the plan in order. When a tool \
parameter depends on the result of an earlier step, pass the string \
$step_<n> where <n> is that step's number. When every needed call has been \
made, reply with a short confirmation of what was done.";

const ASSISTANT_SYSTEM_PROMPT: &str = "You are a helpful personal assistant for email, calendar, \
files, documents and notes. Answer briefly and ask for specifics when the \
request is ambiguous.";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{
        broker_tool, model_provider, text_response, tool_use_response, ScriptedLlm, StubBroker,
    };
    use std::sync::atomic::Ordering;
    use valet_broker::ExecuteOutcome;

    fn chat_request(query: &str) -> ChatRequest {
        ChatRequest {
            user_query: query.into(),
            user_id: "u1".into(),
            session_id: None,
            conversation_history: None,
        }
    }

    fn tool_analysis(confidence: f64) -> ComprehensiveAnalysis {
        let mut analysis = ComprehensiveAnalysis::fallback("q");
        analysis.confidence_score = confidence;
        analysis.requires_tool_execution = true;
        analysis
    }

    fn prepared_docs() -> PreparedTools {
        let mut prepared = PreparedTools {
            tools: vec![broker_tool("GOOGLEDOCS_CREATE_DOCUMENT", "GOOGLEDOCS")],
            required_connections: Vec::new(),
            accounts: Default::default(),
        };
        prepared
            .accounts
            .insert("GOOGLEDOCS".to_string(), "acct-1".to_string());
        prepared
    }

    fn dispatcher_with(
        chat: Arc<ScriptedLlm>,
        broker: Arc<StubBroker>,
    ) -> Dispatcher {
        let analysis_llm = Arc::new(ScriptedLlm::with_texts(vec![]));
        Dispatcher::new(model_provider(analysis_llm, chat), broker, 8)
    }

    #[tokio::test]
    async fn tool_turn_executes_and_returns_final_text() {
        let chat = Arc::new(ScriptedLlm::with_responses(vec![
            tool_use_response(vec![(
                "call_1",
                "GOOGLEDOCS_CREATE_DOCUMENT",
                serde_json::json!({"title": "Project Proposal"}),
            )]),
            text_response("Created the document for you.".into()),
        ]));
        let broker = Arc::new(StubBroker::default());
        let dispatcher = dispatcher_with(chat, broker.clone());

        let mut ctx = ExecutionContext::new();
        let outcome = dispatcher
            .dispatch(
                &chat_request("Create a doc"),
                &tool_analysis(0.9),
                None,
                &[],
                &prepared_docs(),
                &mut ctx,
            )
            .await;

        assert_eq!(outcome.text, "Created the document for you.");
        assert_eq!(
            broker.executed_actions(),
            vec!["GOOGLEDOCS_CREATE_DOCUMENT".to_string()]
        );
        let executed = ctx.executed_tools();
        assert_eq!(executed.len(), 1);
        assert_eq!(executed[0].step_number, 1);

        let records = ctx.records();
        assert_eq!(records[0].tool_call_id, "call_1");
        assert_eq!(records[0].args["title"], "Project Proposal");
    }

    #[tokio::test]
    async fn partial_failure_names_tool_and_reason() {
        let chat = Arc::new(ScriptedLlm::with_responses(vec![
            tool_use_response(vec![
                (
                    "call_1",
                    "GOOGLEDOCS_CREATE_DOCUMENT",
                    serde_json::json!({"title": "A"}),
                ),
                (
                    "call_2",
                    "GMAIL_SEND_EMAIL",
                    serde_json::json!({"to": "x@y.z"}),
                ),
            ]),
            text_response("All done!".into()),
        ]));
        let broker = Arc::new(StubBroker::default());
        broker.set_outcome(
            "GMAIL_SEND_EMAIL",
            ExecuteOutcome {
                successful: false,
                data: None,
                error: Some("rate limited".into()),
            },
        );
        let mut prepared = prepared_docs();
        prepared.tools.push(broker_tool("GMAIL_SEND_EMAIL", "GMAIL"));
        prepared
            .accounts
            .insert("GMAIL".to_string(), "acct-2".to_string());

        let dispatcher = dispatcher_with(chat, broker);
        let mut ctx = ExecutionContext::new();
        let outcome = dispatcher
            .dispatch(
                &chat_request("Doc then email"),
                &tool_analysis(0.95),
                None,
                &[],
                &prepared,
                &mut ctx,
            )
            .await;

        assert!(outcome.text.contains("GMAIL_SEND_EMAIL"));
        assert!(outcome.text.contains("rate limited"));
        assert!(outcome
            .text
            .starts_with("I attempted to complete your request"));
        // Both outcomes are recorded.
        assert_eq!(ctx.executed_tools().len(), 2);
    }

    #[tokio::test]
    async fn step_results_substitute_into_later_calls() {
        let chat = Arc::new(ScriptedLlm::with_responses(vec![
            tool_use_response(vec![(
                "call_1",
                "GOOGLEDOCS_CREATE_DOCUMENT",
                serde_json::json!({"title": "A"}),
            )]),
            tool_use_response(vec![(
                "call_2",
                "GMAIL_SEND_EMAIL",
                serde_json::json!({"attachment": "$step_1"}),
            )]),
            text_response("Sent.".into()),
        ]));
        let broker = Arc::new(StubBroker::default());
        broker.set_outcome(
            "GOOGLEDOCS_CREATE_DOCUMENT",
            ExecuteOutcome {
                successful: true,
                data: Some(serde_json::json!({"documentId": "d42"})),
                error: None,
            },
        );
        let mut prepared = prepared_docs();
        prepared.tools.push(broker_tool("GMAIL_SEND_EMAIL", "GMAIL"));
        prepared
            .accounts
            .insert("GMAIL".to_string(), "acct-2".to_string());

        let dispatcher = dispatcher_with(chat, broker.clone());
        let mut ctx = ExecutionContext::new();
        dispatcher
            .dispatch(
                &chat_request("Doc then email it"),
                &tool_analysis(0.9),
                None,
                &[],
                &prepared,
                &mut ctx,
            )
            .await;

        let executed = broker.executed.lock().unwrap();
        assert_eq!(executed.len(), 2);
        assert_eq!(executed[1].params["attachment"]["documentId"], "d42");
    }

    #[tokio::test]
    async fn clarification_tier_lists_items_numbered() {
        let chat = Arc::new(ScriptedLlm::with_texts(vec![]));
        let dispatcher = dispatcher_with(chat.clone(), Arc::new(StubBroker::default()));

        let mut analysis = tool_analysis(0.6);
        analysis.requires_tool_execution = false;
        analysis.clarification_needed =
            vec!["Which meeting?".to_string(), "What time?".to_string()];

        let mut ctx = ExecutionContext::new();
        let outcome = dispatcher
            .dispatch(
                &chat_request("Schedule that meeting"),
                &analysis,
                None,
                &[],
                &PreparedTools::default(),
                &mut ctx,
            )
            .await;

        assert!(outcome.text.contains("1. Which meeting?"));
        assert!(outcome.text.contains("2. What time?"));
        assert_eq!(chat.calls.load(Ordering::SeqCst), 0);
        assert!(ctx.is_empty());
    }

    #[tokio::test]
    async fn clarification_tier_without_items_uses_model() {
        let chat = Arc::new(ScriptedLlm::with_texts(vec!["Could you tell me more?".into()]));
        let dispatcher = dispatcher_with(chat.clone(), Arc::new(StubBroker::default()));

        let mut analysis = tool_analysis(0.6);
        analysis.requires_tool_execution = false;

        let mut ctx = ExecutionContext::new();
        let outcome = dispatcher
            .dispatch(
                &chat_request("Handle my stuff"),
                &analysis,
                None,
                &[],
                &PreparedTools::default(),
                &mut ctx,
            )
            .await;

        assert_eq!(outcome.text, "Could you tell me more?");
        let request = chat.last_request().unwrap();
        assert_eq!(request.temperature, Some(CLARIFY_TEMPERATURE));
        assert!(request.tools.is_empty());
    }

    #[tokio::test]
    async fn conversational_tier_uses_minimal_prompt() {
        let chat = Arc::new(ScriptedLlm::with_texts(vec!["Hello! Happy to help.".into()]));
        let dispatcher = dispatcher_with(chat.clone(), Arc::new(StubBroker::default()));

        let mut analysis = ComprehensiveAnalysis::fallback("Hello");
        analysis.conversation_summary.current_intent = "greeting".into();

        let mut ctx = ExecutionContext::new();
        let outcome = dispatcher
            .dispatch(
                &chat_request("Hello"),
                &analysis,
                None,
                &[],
                &PreparedTools::default(),
                &mut ctx,
            )
            .await;

        assert_eq!(outcome.text, "Hello! Happy to help.");
        let request = chat.last_request().unwrap();
        assert_eq!(request.temperature, Some(CHAT_TEMPERATURE));
        let prompt = request.messages[0].text();
        assert!(prompt.contains("greeting"));
        assert!(prompt.contains("Hello"));
    }

    #[tokio::test]
    async fn missing_connections_short_circuit() {
        let chat = Arc::new(ScriptedLlm::with_texts(vec![]));
        let dispatcher = dispatcher_with(chat.clone(), Arc::new(StubBroker::default()));

        let prepared = PreparedTools {
            tools: Vec::new(),
            required_connections: vec!["GOOGLEDOCS".to_string()],
            accounts: Default::default(),
        };

        let mut ctx = ExecutionContext::new();
        let outcome = dispatcher
            .dispatch(
                &chat_request("Create a doc"),
                &tool_analysis(0.9),
                None,
                &[],
                &prepared,
                &mut ctx,
            )
            .await;

        assert!(outcome.text.contains("GOOGLEDOCS"));
        assert_eq!(chat.calls.load(Ordering::SeqCst), 0);
        assert!(ctx.is_empty());
    }

    #[tokio::test]
    async fn step_budget_exhaustion_still_reports() {
        // The model keeps asking for tools and never produces a final
        // answer; the loop stops at max steps.
        let responses: Vec<_> = (0..10)
            .map(|i| {
                tool_use_response(vec![(
                    Box::leak(format!("call_{i}").into_boxed_str()) as &str,
                    "GOOGLEDOCS_CREATE_DOCUMENT",
                    serde_json::json!({"title": format!("doc {i}")}),
                )])
            })
            .collect();
        let chat = Arc::new(ScriptedLlm::with_responses(responses));
        let broker = Arc::new(StubBroker::default());
        let analysis_llm = Arc::new(ScriptedLlm::with_texts(vec![]));
        let dispatcher = Dispatcher::new(
            model_provider(analysis_llm, chat.clone()),
            broker.clone(),
            3,
        );

        let mut ctx = ExecutionContext::new();
        let outcome = dispatcher
            .dispatch(
                &chat_request("Make docs forever"),
                &tool_analysis(0.9),
                None,
                &[],
                &prepared_docs(),
                &mut ctx,
            )
            .await;

        assert_eq!(chat.calls.load(Ordering::SeqCst), 3);
        assert_eq!(ctx.executed_tools().len(), 3);
        assert_eq!(outcome.text, "I've completed your request successfully.");
    }

    #[tokio::test]
    async fn unknown_tool_call_is_a_recorded_failure() {
        let chat = Arc::new(ScriptedLlm::with_responses(vec![
            tool_use_response(vec![(
                "call_1",
                "TOTALLY_UNKNOWN_TOOL",
                serde_json::json!({}),
            )]),
            text_response("done".into()),
        ]));
        let dispatcher = dispatcher_with(chat, Arc::new(StubBroker::default()));

        let mut ctx = ExecutionContext::new();
        let outcome = dispatcher
            .dispatch(
                &chat_request("Create a doc"),
                &tool_analysis(0.9),
                None,
                &[],
                &prepared_docs(),
                &mut ctx,
            )
            .await;

        assert!(outcome.text.contains("TOTALLY_UNKNOWN_TOOL"));
        assert!(outcome.text.contains("unknown tool"));
    }

    #[test]
    fn failure_detection_rules() {
        assert!(is_failure(&serde_json::json!({"error": "boom"})));
        assert!(is_failure(&serde_json::json!({"success": false})));
        assert!(!is_failure(&serde_json::json!({})));
        assert!(!is_failure(&serde_json::json!({"success": true, "data": 1})));
        assert!(!is_failure(&serde_json::json!("plain string")));
        assert!(!is_failure(&serde_json::json!(null)));
    }

    #[test]
    fn optimized_prompt_contains_plan_and_date() {
        let mut analysis = tool_analysis(0.9);
        analysis.execution_steps = vec![
            valet_schema::ExecutionStep {
                step_number: 2,
                description: "Send the email".into(),
                required_data: vec![],
                app_name: Some("GMAIL".into()),
                tool_category: None,
                dependencies: vec![1],
                priority: valet_schema::StepPriority::High,
            },
            valet_schema::ExecutionStep {
                step_number: 1,
                description: "Create the doc".into(),
                required_data: vec![],
                app_name: Some("GOOGLEDOCS".into()),
                tool_category: None,
                dependencies: vec![],
                priority: valet_schema::StepPriority::Critical,
            },
        ];
        let history = vec![
            ChatMessage::user("c1", "older message"),
            ChatMessage::assistant("c1", "sure"),
        ];
        let prompt = build_optimized_prompt("do it", &analysis, None, &history);

        let date = Utc::now().format("%Y-%m-%d").to_string();
        assert!(prompt.contains(&date));
        // Plan is rendered in dependency order.
        let doc_pos = prompt.find("Create the doc").unwrap();
        let mail_pos = prompt.find("Send the email").unwrap();
        assert!(doc_pos < mail_pos);
        assert!(prompt.contains("assistant: sure"));
        assert!(prompt.contains("Request: do it"));
    }
}
