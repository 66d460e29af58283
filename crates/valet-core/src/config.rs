use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    /// `<provider>:<model>` for the tool-calling chat model.
    pub chat_model: String,
    /// `<provider>:<model>` for the structured-output analysis model.
    pub analysis_model: String,
    pub max_agent_steps: usize,
    pub max_conversation_history: usize,
    pub cache_ttl_secs: u64,
    pub database_url: String,
    pub vector_store_path: String,
    pub redis_host: Option<String>,
    pub redis_port: Option<u16>,
    pub broker_api_base: String,
    pub broker_api_key: Option<String>,
    pub openai_api_key: Option<String>,
    pub google_api_key: Option<String>,
    /// Opt-in: proceed with synthetic in-memory session ids when the store
    /// is unavailable.
    pub degraded_mode: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chat_model: "openai:gpt-4o-mini".into(),
            analysis_model: "google:gemini-2.0-flash".into(),
            max_agent_steps: 8,
            max_conversation_history: 10,
            cache_ttl_secs: 300,
            database_url: "valet.db".into(),
            vector_store_path: "valet-vectors.db".into(),
            redis_host: None,
            redis_port: None,
            broker_api_base: "http://127.0.0.1:9400".into(),
            broker_api_key: None,
            openai_api_key: None,
            google_api_key: None,
            degraded_mode: false,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            chat_model: env_or("CHAT_MODEL", &defaults.chat_model),
            analysis_model: env_or("ANALYSIS_MODEL", &defaults.analysis_model),
            max_agent_steps: env_parse("MAX_AGENT_STEPS", defaults.max_agent_steps),
            max_conversation_history: env_parse(
                "MAX_CONVERSATION_HISTORY",
                defaults.max_conversation_history,
            ),
            cache_ttl_secs: env_parse("CACHE_TTL", defaults.cache_ttl_secs),
            database_url: env_or("DATABASE_URL", &defaults.database_url),
            vector_store_path: env_or("VECTOR_STORE_PATH", &defaults.vector_store_path),
            redis_host: env::var("REDIS_HOST").ok().filter(|v| !v.is_empty()),
            redis_port: env::var("REDIS_PORT").ok().and_then(|v| v.parse().ok()),
            broker_api_base: env_or("BROKER_API_BASE", &defaults.broker_api_base),
            broker_api_key: env::var("BROKER_API_KEY").ok().filter(|v| !v.is_empty()),
            openai_api_key: env::var("OPENAI_API_KEY").ok().filter(|v| !v.is_empty()),
            google_api_key: env::var("GOOGLE_API_KEY").ok().filter(|v| !v.is_empty()),
            degraded_mode: env::var("VALET_DEGRADED_MODE")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let config = Config::default();
        assert_eq!(config.chat_model, "openai:gpt-4o-mini");
        assert_eq!(config.analysis_model, "google:gemini-2.0-flash");
        assert_eq!(config.max_agent_steps, 8);
        assert_eq!(config.max_conversation_history, 10);
        assert_eq!(config.cache_ttl_secs, 300);
        assert!(!config.degraded_mode);
    }
}
