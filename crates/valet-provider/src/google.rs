//! Google Gemini provider over the `generateContent` REST surface. Supports
//! plain chat, function declarations, and schema-constrained JSON output via
//! `responseSchema`.

use std::collections::HashMap;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::{ContentBlock, LlmMessage, LlmProvider, LlmRequest, LlmResponse};

#[derive(Debug, Clone)]
pub struct GoogleProvider {
    client: reqwest::Client,
    api_key: String,
    api_base: String,
}

impl GoogleProvider {
    pub fn new(api_key: impl Into<String>, api_base: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(60))
                .build()
                .unwrap_or_default(),
            api_key: api_key.into(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("GOOGLE_API_KEY")
            .map_err(|_| anyhow!("GOOGLE_API_KEY is not set"))?;
        Ok(Self::new(
            api_key,
            "https://generativelanguage.googleapis.com/v1beta",
        ))
    }

    pub(crate) fn to_api_request(request: &LlmRequest) -> ApiRequest {
        let tools = if request.tools.is_empty() {
            None
        } else {
            Some(vec![ApiToolGroup {
                function_declarations: request
                    .tools
                    .iter()
                    .map(|tool| ApiFunctionDeclaration {
                        name: tool.name.clone(),
                        description: tool.description.clone(),
                        parameters: tool.input_schema.clone(),
                    })
                    .collect(),
            }])
        };

        let generation_config = ApiGenerationConfig {
            temperature: request.temperature,
            max_output_tokens: Some(request.max_tokens),
            response_mime_type: request
                .response_schema
                .as_ref()
                .map(|_| "application/json".to_string()),
            response_schema: request.response_schema.clone(),
        };

        ApiRequest {
            system_instruction: request.system.as_ref().map(|text| ApiContent {
                role: None,
                parts: vec![ApiPart::text(text.clone())],
            }),
            contents: to_api_contents(&request.messages),
            tools,
            generation_config,
        }
    }
}

#[async_trait]
impl LlmProvider for GoogleProvider {
    async fn chat(&self, request: LlmRequest) -> Result<LlmResponse> {
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.api_base, request.model, self.api_key
        );
        let payload = Self::to_api_request(&request);

        let resp = match self
            .client
            .post(url)
            .header("content-type", "application/json")
            .json(&payload)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                return Err(anyhow!(
                    "google api error (timeout) [retryable]: request timed out after 60s"
                ));
            }
            Err(e) if e.is_connect() => {
                return Err(anyhow!("google api error (connect) [retryable]: {e}"));
            }
            Err(e) => return Err(e.into()),
        };

        let status = resp.status();
        if status != StatusCode::OK {
            let text = resp.text().await?;
            let retryable = if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
            {
                " [retryable]"
            } else {
                ""
            };
            return Err(anyhow!("google api error ({status}){retryable}: {text}"));
        }

        let body: ApiResponse = resp.json().await?;
        to_llm_response(body)
    }
}

/// Gemini function calls carry no call id; tool results are correlated by
/// function name instead. Track the name each synthesized id maps to so
/// `functionResponse` parts can be reconstructed from history.
fn to_api_contents(messages: &[LlmMessage]) -> Vec<ApiContent> {
    let mut contents = Vec::new();
    let mut call_names: HashMap<String, String> = HashMap::new();

    for message in messages {
        let role = match message.role.as_str() {
            "assistant" => "model",
            _ => "user",
        };

        let mut parts = Vec::new();
        for block in &message.content {
            match block {
                ContentBlock::Text { text } => {
                    if !text.is_empty() {
                        parts.push(ApiPart::text(text.clone()));
                    }
                }
                ContentBlock::ToolUse { id, name, input } => {
                    call_names.insert(id.clone(), name.clone());
                    parts.push(ApiPart {
                        text: None,
                        function_call: Some(ApiFunctionCall {
                            name: name.clone(),
                            args: input.clone(),
                        }),
                        function_response: None,
                    });
                }
                ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    ..
                } => {
                    let name = call_names
                        .get(tool_use_id)
                        .cloned()
                        .unwrap_or_else(|| tool_use_id.clone());
                    let response = serde_json::from_str::<serde_json::Value>(content)
                        .unwrap_or_else(|_| serde_json::json!({ "output": content }));
                    parts.push(ApiPart {
                        text: None,
                        function_call: None,
                        function_response: Some(ApiFunctionResponse { name, response }),
                    });
                }
            }
        }

        if !parts.is_empty() {
            contents.push(ApiContent {
                role: Some(role.to_string()),
                parts,
            });
        }
    }

    contents
}

fn to_llm_response(body: ApiResponse) -> Result<LlmResponse> {
    let candidate = body
        .candidates
        .first()
        .ok_or_else(|| anyhow!("google api error: empty candidates"))?;

    let mut content = Vec::new();
    let mut texts = Vec::new();
    let mut call_index = 0usize;

    if let Some(parts) = candidate.content.as_ref().map(|c| &c.parts) {
        for part in parts {
            if let Some(text) = &part.text {
                texts.push(text.clone());
                content.push(ContentBlock::Text { text: text.clone() });
            }
            if let Some(call) = &part.function_call {
                call_index += 1;
                content.push(ContentBlock::ToolUse {
                    id: format!("call_{call_index}"),
                    name: call.name.clone(),
                    input: call.args.clone(),
                });
            }
        }
    }

    let stop_reason = if call_index > 0 {
        Some("tool_use".to_string())
    } else {
        candidate.finish_reason.as_deref().map(|r| {
            match r {
                "STOP" => "end_turn",
                "MAX_TOKENS" => "max_tokens",
                other => return other.to_string(),
            }
            .to_string()
        })
    };

    Ok(LlmResponse {
        text: texts.join("\n"),
        content,
        input_tokens: body.usage_metadata.as_ref().map(|u| u.prompt_token_count),
        output_tokens: body
            .usage_metadata
            .as_ref()
            .map(|u| u.candidates_token_count),
        stop_reason,
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ApiRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<ApiContent>,
    pub contents: Vec<ApiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ApiToolGroup>>,
    pub generation_config: ApiGenerationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ApiContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub parts: Vec<ApiPart>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ApiPart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_call: Option<ApiFunctionCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_response: Option<ApiFunctionResponse>,
}

impl ApiPart {
    fn text(text: String) -> Self {
        Self {
            text: Some(text),
            function_call: None,
            function_response: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ApiFunctionCall {
    pub name: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ApiFunctionResponse {
    pub name: String,
    pub response: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ApiToolGroup {
    pub function_declarations: Vec<ApiFunctionDeclaration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ApiFunctionDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ApiGenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_schema: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ApiResponse {
    #[serde(default)]
    pub candidates: Vec<ApiCandidate>,
    #[serde(default)]
    pub usage_metadata: Option<ApiUsageMetadata>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ApiCandidate {
    #[serde(default)]
    pub content: Option<ApiContent>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ApiUsageMetadata {
    #[serde(default)]
    pub prompt_token_count: u32,
    #[serde(default)]
    pub candidates_token_count: u32,
}
