//! Cache key derivation and per-domain TTLs.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

pub const USER_TTL: Duration = Duration::from_secs(3600);
pub const SESSION_TTL: Duration = Duration::from_secs(1800);
pub const SESSION_SUMMARY_TTL: Duration = Duration::from_secs(900);
pub const MESSAGE_HISTORY_TTL: Duration = Duration::from_secs(300);
pub const ANALYSIS_TTL: Duration = Duration::from_secs(300);
pub const TOOL_SEARCH_TTL: Duration = Duration::from_secs(300);
pub const APP_ROUTING_TTL: Duration = Duration::from_secs(300);
pub const CONNECTION_STATUS_TTL: Duration = Duration::from_secs(300);
pub const CONVERSATIONS_TTL: Duration = Duration::from_secs(600);
pub const USER_CONNECTIONS_TTL: Duration = Duration::from_secs(600);

/// Base64 over UTF-8 with '/', '+' and '=' replaced by '_' so user content
/// never leaks raw into a key and keys stay ASCII-safe.
pub fn hash_component(raw: &str) -> String {
    STANDARD
        .encode(raw.as_bytes())
        .replace(['/', '+', '='], "_")
}

pub fn user(user_id: &str) -> String {
    format!("user:{user_id}")
}

pub fn session(session_id: &str) -> String {
    format!("session:{session_id}")
}

pub fn session_summary(session_id: &str) -> String {
    format!("session_summary:{session_id}")
}

pub fn messages(session_id: &str, limit: usize) -> String {
    format!("messages:{session_id}:{limit}")
}

pub fn analysis(fingerprint: &str) -> String {
    format!("analysis:{}", hash_component(fingerprint))
}

pub fn app_routing(query: &str) -> String {
    format!("app_routing:{}", hash_component(query))
}

pub fn tool_search(app_name: &str, query: &str) -> String {
    format!("tool_search:{app_name}:{}", hash_component(query))
}

pub fn connection_status(user_id: &str, app_name: &str) -> String {
    format!("connection_status:{user_id}:{app_name}")
}

pub fn user_connections(user_id: &str) -> String {
    format!("user_connections:{user_id}")
}

pub fn conversations(session_id: &str) -> String {
    format!("conversations:{session_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_component_is_ascii_safe() {
        let hashed = hash_component("What's on my calendar today? / tomorrow + later==");
        assert!(hashed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_'));
        assert!(!hashed.contains('/'));
        assert!(!hashed.contains('+'));
        assert!(!hashed.contains('='));
    }

    #[test]
    fn hash_component_is_deterministic() {
        assert_eq!(hash_component("same input"), hash_component("same input"));
        assert_ne!(hash_component("one"), hash_component("two"));
    }

    #[test]
    fn key_shapes() {
        assert_eq!(messages("s1", 10), "messages:s1:10");
        assert_eq!(session("s1"), "session:s1");
        assert_eq!(session_summary("s1"), "session_summary:s1");
        assert_eq!(connection_status("u1", "GMAIL"), "connection_status:u1:GMAIL");
        assert!(analysis("fp").starts_with("analysis:"));
        assert!(tool_search("GMAIL", "find mail").starts_with("tool_search:GMAIL:"));
    }

    #[test]
    fn query_content_is_hashed_in_keys() {
        let key = app_routing("delete / all + my = files");
        let suffix = key.strip_prefix("app_routing:").unwrap();
        assert!(!suffix.contains(' '));
        assert!(!suffix.contains('/'));
    }
}
