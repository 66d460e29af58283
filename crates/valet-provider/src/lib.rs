pub mod google;
pub mod openai;
pub mod types;

pub use google::GoogleProvider;
pub use openai::OpenAiProvider;
pub use types::*;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

/// A chat-capable language model endpoint. Tool calling and structured
/// output are requested through the [`LlmRequest`] fields; providers that do
/// not support a requested capability return an error.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn chat(&self, request: LlmRequest) -> Result<LlmResponse>;
}

#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn LlmProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }

    pub fn register(&mut self, id: &str, provider: Arc<dyn LlmProvider>) {
        self.providers.insert(id.to_string(), provider);
    }

    pub fn get(&self, id: &str) -> Result<Arc<dyn LlmProvider>> {
        self.providers
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow!("provider not registered: {id}"))
    }

    pub fn ids(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }
}

/// Split a `<provider>:<model>` identifier.
pub fn parse_model_id(input: &str) -> Result<(String, String)> {
    let mut parts = input.splitn(2, ':');
    let provider = parts
        .next()
        .filter(|p| !p.is_empty())
        .ok_or_else(|| anyhow!("invalid model id: {input}"))?;
    let model = parts
        .next()
        .filter(|m| !m.is_empty())
        .ok_or_else(|| anyhow!("invalid model id (expected <provider>:<model>): {input}"))?;
    Ok((provider.to_string(), model.to_string()))
}

/// Resolves the two logical models of the pipeline (analysis and chat) to
/// concrete providers based on configuration.
pub struct ModelProvider {
    registry: ProviderRegistry,
    chat_model: String,
    analysis_model: String,
}

/// A resolved endpoint: the provider plus the bare model name to put in the
/// request.
#[derive(Clone)]
pub struct ResolvedModel {
    pub provider: Arc<dyn LlmProvider>,
    pub model: String,
}

impl ResolvedModel {
    pub async fn chat(&self, mut request: LlmRequest) -> Result<LlmResponse> {
        request.model = self.model.clone();
        self.provider.chat(request).await
    }
}

impl ModelProvider {
    pub fn new(registry: ProviderRegistry, chat_model: &str, analysis_model: &str) -> Self {
        Self {
            registry,
            chat_model: chat_model.to_string(),
            analysis_model: analysis_model.to_string(),
        }
    }

    pub fn chat_model(&self) -> Result<ResolvedModel> {
        self.resolve(&self.chat_model)
    }

    pub fn analysis_model(&self) -> Result<ResolvedModel> {
        self.resolve(&self.analysis_model)
    }

    fn resolve(&self, id: &str) -> Result<ResolvedModel> {
        let (provider_id, model) = parse_model_id(id)?;
        let provider = self.registry.get(&provider_id)?;
        Ok(ResolvedModel { provider, model })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubProvider(&'static str);

    #[async_trait]
    impl LlmProvider for StubProvider {
        async fn chat(&self, request: LlmRequest) -> Result<LlmResponse> {
            Ok(LlmResponse {
                text: format!("{} answered {}", self.0, request.model),
                content: vec![],
                input_tokens: None,
                output_tokens: None,
                stop_reason: Some("end_turn".into()),
            })
        }
    }

    #[test]
    fn parse_model_id_ok() {
        let (provider, model) = parse_model_id("openai:gpt-4o-mini").unwrap();
        assert_eq!(provider, "openai");
        assert_eq!(model, "gpt-4o-mini");
    }

    #[test]
    fn parse_model_id_keeps_extra_colons_in_model() {
        let (provider, model) = parse_model_id("google:models:gemini").unwrap();
        assert_eq!(provider, "google");
        assert_eq!(model, "models:gemini");
    }

    #[test]
    fn parse_model_id_rejects_malformed() {
        assert!(parse_model_id("gpt-4o-mini").is_err());
        assert!(parse_model_id(":model").is_err());
        assert!(parse_model_id("openai:").is_err());
    }

    #[test]
    fn registry_unknown_provider() {
        let registry = ProviderRegistry::new();
        assert!(registry.get("openai").is_err());
    }

    #[tokio::test]
    async fn model_provider_resolves_both_roles() {
        let mut registry = ProviderRegistry::new();
        registry.register("openai", Arc::new(StubProvider("openai")));
        registry.register("google", Arc::new(StubProvider("google")));
        let models = ModelProvider::new(registry, "openai:gpt-4o-mini", "google:gemini-2.0-flash");

        let chat = models.chat_model().unwrap();
        let resp = chat
            .chat(LlmRequest::simple(String::new(), None, "hi".into()))
            .await
            .unwrap();
        assert_eq!(resp.text, "openai answered gpt-4o-mini");

        let analysis = models.analysis_model().unwrap();
        let resp = analysis
            .chat(LlmRequest::simple(String::new(), None, "hi".into()))
            .await
            .unwrap();
        assert_eq!(resp.text, "google answered gemini-2.0-flash");
    }

    #[test]
    fn model_provider_unknown_provider_errors() {
        let registry = ProviderRegistry::new();
        let models = ModelProvider::new(registry, "openai:gpt-4o-mini", "google:gemini-2.0-flash");
        assert!(models.chat_model().is_err());
    }
}
