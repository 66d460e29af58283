//! Stage 1: resolve or create the user, session, and current conversation,
//! and load recent history plus the prior session summary.

use std::sync::Arc;

use anyhow::Result;
use uuid::Uuid;
use valet_cache::{keys, Cache};
use valet_schema::{ChatMessage, ConversationSummary};
use valet_store::{ConversationRecord, SessionRecord, Store};

/// Resolved identities for one turn.
#[derive(Debug, Clone)]
pub struct TurnContext {
    pub user_id: String,
    pub session_id: String,
    pub conversation_id: String,
    /// True when the store was unavailable and degraded mode synthesized
    /// in-memory ids; persistence for this turn is best-effort only.
    pub synthetic: bool,
}

#[derive(Clone)]
pub struct ContextInitializer {
    store: Arc<Store>,
    cache: Cache,
    degraded_mode: bool,
}

impl ContextInitializer {
    pub fn new(store: Arc<Store>, cache: Cache, degraded_mode: bool) -> Self {
        Self {
            store,
            cache,
            degraded_mode,
        }
    }

    pub async fn init_context(
        &self,
        user_id: &str,
        session_id: Option<&str>,
        email: Option<&str>,
        name: Option<&str>,
    ) -> Result<TurnContext> {
        match self.init_from_store(user_id, session_id, email, name).await {
            Ok(ctx) => Ok(ctx),
            Err(e) if self.degraded_mode => {
                tracing::warn!("store unavailable, issuing synthetic session: {e}");
                Ok(TurnContext {
                    user_id: user_id.to_string(),
                    session_id: format!("mem-{}", Uuid::new_v4()),
                    conversation_id: format!("mem-{}", Uuid::new_v4()),
                    synthetic: true,
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn init_from_store(
        &self,
        user_id: &str,
        session_id: Option<&str>,
        email: Option<&str>,
        name: Option<&str>,
    ) -> Result<TurnContext> {
        self.store.find_or_create_user(user_id, email, name).await?;

        let session = match session_id {
            Some(requested) => match self.store.get_session(requested).await? {
                Some(existing) if existing.user_id == user_id => {
                    self.store.touch_session(&existing.id).await?;
                    existing
                }
                Some(existing) => {
                    tracing::warn!(
                        requested_session = requested,
                        owner = existing.user_id.as_str(),
                        user_id,
                        "session belongs to a different user, creating a new one"
                    );
                    let fresh = SessionRecord::new(user_id);
                    self.store.insert_session(fresh.clone()).await?;
                    fresh
                }
                None => {
                    // Honor the caller-chosen id for a brand-new session.
                    let mut fresh = SessionRecord::new(user_id);
                    fresh.id = requested.to_string();
                    self.store.insert_session(fresh.clone()).await?;
                    fresh
                }
            },
            None => {
                let fresh = SessionRecord::new(user_id);
                self.store.insert_session(fresh.clone()).await?;
                fresh
            }
        };

        let conversation = match self.store.current_conversation(&session.id).await? {
            Some(existing) => existing,
            None => {
                let fresh = ConversationRecord::new(&session.id);
                self.store.insert_conversation(fresh.clone()).await?;
                fresh
            }
        };

        Ok(TurnContext {
            user_id: user_id.to_string(),
            session_id: session.id,
            conversation_id: conversation.id,
            synthetic: false,
        })
    }

    /// Last `limit` messages of the session's current conversation,
    /// oldest-first. Read-through cached for 5 minutes.
    pub async fn load_history(&self, session_id: &str, limit: usize) -> Vec<ChatMessage> {
        let cache_key = keys::messages(session_id, limit);
        if let Some(cached) = self.cache.get::<Vec<ChatMessage>>(&cache_key) {
            return cached;
        }

        let loaded = async {
            let conversation = self.store.current_conversation(session_id).await?;
            let Some(conversation) = conversation else {
                return Ok::<Vec<ChatMessage>, anyhow::Error>(Vec::new());
            };
            let records = self.store.recent_messages(&conversation.id, limit).await?;
            Ok(records
                .into_iter()
                .map(|r| ChatMessage {
                    id: r.id,
                    conversation_id: Some(r.conversation_id),
                    role: r.role,
                    content: r.content,
                    timestamp: r.timestamp,
                    tool_calls: r.tool_calls,
                    analysis: r.analysis,
                    metadata: r.metadata,
                })
                .collect())
        }
        .await;

        match loaded {
            Ok(messages) => {
                self.cache
                    .set(&cache_key, &messages, keys::MESSAGE_HISTORY_TTL);
                messages
            }
            Err(e) => {
                tracing::warn!("failed to load history for {session_id}: {e}");
                Vec::new()
            }
        }
    }

    /// Prior session summary, if any. Cached for 15 minutes.
    pub async fn load_summary(&self, session_id: &str) -> Option<ConversationSummary> {
        let cache_key = keys::session_summary(session_id);
        if let Some(cached) = self.cache.get::<ConversationSummary>(&cache_key) {
            return Some(cached);
        }

        match self.store.get_session_summary(session_id).await {
            Ok(Some(raw)) => match serde_json::from_value::<ConversationSummary>(raw) {
                Ok(summary) => {
                    self.cache
                        .set(&cache_key, &summary, keys::SESSION_SUMMARY_TTL);
                    Some(summary)
                }
                Err(e) => {
                    tracing::warn!("stored summary for {session_id} failed to parse: {e}");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("failed to load summary for {session_id}: {e}");
                None
            }
        }
    }
}
