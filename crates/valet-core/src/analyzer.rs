//! Stage 2: a single structured-output call producing the per-turn
//! [`ComprehensiveAnalysis`], cached by a fingerprint of the query and the
//! tail of the conversation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use valet_cache::{keys, Cache};
use valet_provider::{LlmRequest, ModelProvider};
use valet_schema::{ChatMessage, ComprehensiveAnalysis, ConversationSummary};

const ANALYSIS_SOFT_DEADLINE: Duration = Duration::from_secs(20);
const ANALYSIS_HARD_DEADLINE: Duration = Duration::from_secs(45);
const ANALYSIS_MAX_TOKENS: u32 = 2000;
const ANALYSIS_TEMPERATURE: f64 = 0.1;
const FINGERPRINT_MESSAGES: usize = 3;
const FINGERPRINT_CONTENT_CHARS: usize = 50;

#[derive(Clone)]
pub struct Analyzer {
    models: Arc<ModelProvider>,
    cache: Cache,
}

impl Analyzer {
    pub fn new(models: Arc<ModelProvider>, cache: Cache) -> Self {
        Self { models, cache }
    }

    /// Analyze a turn. Infallible by contract: any failure (model error,
    /// schema violation, plan cycle, timeout) yields the deterministic
    /// fallback, which is never cached.
    pub async fn analyze(
        &self,
        query: &str,
        history: &[ChatMessage],
        prior_summary: Option<&ConversationSummary>,
    ) -> ComprehensiveAnalysis {
        let cache_key = keys::analysis(&fingerprint(query, history));
        if let Some(cached) = self.cache.get::<ComprehensiveAnalysis>(&cache_key) {
            return cached;
        }

        match self.analyze_inner(query, history, prior_summary).await {
            Ok(analysis) => {
                self.cache.set(&cache_key, &analysis, keys::ANALYSIS_TTL);
                analysis
            }
            Err(e) => {
                tracing::warn!("analysis failed, using fallback: {e}");
                ComprehensiveAnalysis::fallback(query)
            }
        }
    }

    async fn analyze_inner(
        &self,
        query: &str,
        history: &[ChatMessage],
        prior_summary: Option<&ConversationSummary>,
    ) -> Result<ComprehensiveAnalysis> {
        let resolved = self.models.analysis_model()?;
        let request = LlmRequest {
            model: String::new(),
            system: Some(SYSTEM_PROMPT.to_string()),
            messages: vec![valet_provider::LlmMessage::user(build_user_prompt(
                query,
                history,
                prior_summary,
            ))],
            max_tokens: ANALYSIS_MAX_TOKENS,
            temperature: Some(ANALYSIS_TEMPERATURE),
            tools: vec![],
            response_schema: Some(analysis_schema()),
        };

        let started = Instant::now();
        let response = tokio::time::timeout(ANALYSIS_HARD_DEADLINE, resolved.chat(request))
            .await
            .map_err(|_| {
                anyhow!(
                    "analysis timed out after {}s",
                    ANALYSIS_HARD_DEADLINE.as_secs()
                )
            })??;
        let elapsed = started.elapsed();
        if elapsed > ANALYSIS_SOFT_DEADLINE {
            tracing::warn!(
                "analysis exceeded soft deadline: {:.1}s",
                elapsed.as_secs_f64()
            );
        }

        let analysis: ComprehensiveAnalysis = serde_json::from_str(response.text.trim())
            .map_err(|e| anyhow!("analysis output failed schema parse: {e}"))?;
        analysis.validate()?;
        Ok(analysis)
    }
}

/// Fingerprint over the query plus the last three history contents,
/// each truncated to 50 characters.
pub fn fingerprint(query: &str, history: &[ChatMessage]) -> String {
    let tail: String = history
        .iter()
        .rev()
        .take(FINGERPRINT_MESSAGES)
        .rev()
        .map(|m| m.content.chars().take(FINGERPRINT_CONTENT_CHARS).collect::<String>())
        .collect();
    format!("{query}|{tail}")
}

fn build_user_prompt(
    query: &str,
    history: &[ChatMessage],
    prior_summary: Option<&ConversationSummary>,
) -> String {
    let mut sections = Vec::new();

    if let Some(summary) = prior_summary {
        if let Ok(json) = serde_json::to_string(summary) {
            sections.push(format!("Previous conversation summary:\n{json}"));
        }
    }

    if !history.is_empty() {
        let digest: Vec<String> = history
            .iter()
            .rev()
            .take(6)
            .rev()
            .map(|m| format!("{}: {}", m.role.as_str(), m.content))
            .collect();
        sections.push(format!("Recent messages:\n{}", digest.join("\n")));
    }

    sections.push(format!("User request:\n{query}"));
    sections.join("\n\n")
}

const SYSTEM_PROMPT: &str = "You are the planning stage of a personal assistant that can operate \
email, calendar, drive, document and note apps on the user's behalf. \
Analyze the request and produce a single JSON object describing: how clear \
the request is, a confidence score between 0 and 1, whether third-party \
tools must be invoked, an ordered list of execution steps (dependencies may \
only reference earlier steps), which apps are relevant, per-app priorities \
from 1 to 10, any clarifications to ask the user, and an updated \
conversation summary. Be conservative with confidence when information is \
missing.";

/// JSON schema the structured-output model is constrained to.
pub fn analysis_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "queryAnalysis": { "type": "string" },
            "isQueryClear": { "type": "boolean" },
            "confidenceScore": { "type": "number", "minimum": 0, "maximum": 1 },
            "requiresToolExecution": { "type": "boolean" },
            "executionSteps": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "stepNumber": { "type": "integer", "minimum": 1 },
                        "description": { "type": "string" },
                        "requiredData": { "type": "array", "items": { "type": "string" } },
                        "appName": { "type": "string" },
                        "toolCategory": { "type": "string" },
                        "dependencies": { "type": "array", "items": { "type": "integer" } },
                        "priority": { "type": "string", "enum": ["critical", "high", "medium", "low"] }
                    },
                    "required": ["stepNumber", "description"]
                }
            },
            "estimatedComplexity": { "type": "string", "enum": ["low", "medium", "high"] },
            "requiresSequentialExecution": { "type": "boolean" },
            "needsInfoGathering": { "type": "boolean" },
            "missingInformation": { "type": "array", "items": { "type": "string" } },
            "searchQueries": { "type": "array", "items": { "type": "string" } },
            "clarificationNeeded": { "type": "array", "items": { "type": "string" } },
            "canProceedWithDefaults": { "type": "boolean" },
            "conversationSummary": {
                "type": "object",
                "properties": {
                    "currentIntent": { "type": "string" },
                    "contextualDetails": {
                        "type": "object",
                        "properties": {
                            "gathered": { "type": "array", "items": { "type": "string" } },
                            "missing": { "type": "array", "items": { "type": "string" } },
                            "preferences": { "type": "array", "items": { "type": "string" } },
                            "previousActions": { "type": "array", "items": { "type": "string" } }
                        }
                    },
                    "state": {
                        "type": "string",
                        "enum": [
                            "information_gathering",
                            "ready_to_execute",
                            "executed",
                            "clarification_needed",
                            "completed"
                        ]
                    },
                    "keyEntities": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "type": { "type": "string" },
                                "value": { "type": "string" },
                                "confidence": { "type": "number", "minimum": 0, "maximum": 1 }
                            },
                            "required": ["type", "value"]
                        }
                    },
                    "nextExpectedAction": { "type": "string" },
                    "topicShifts": { "type": "array", "items": { "type": "string" } }
                }
            },
            "recommendedApps": { "type": "array", "items": { "type": "string" } },
            "toolPriorities": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "appName": { "type": "string" },
                        "priority": { "type": "integer", "minimum": 1, "maximum": 10 },
                        "reason": { "type": "string" }
                    },
                    "required": ["appName", "priority"]
                }
            }
        },
        "required": [
            "queryAnalysis",
            "isQueryClear",
            "confidenceScore",
            "requiresToolExecution"
        ]
    })
}
