//! Stage 5: persist the turn (user message, assistant message with
//! normalized tool calls and analysis), refresh the session summary, and
//! invalidate the touched cache entries. Best-effort: a write failure is a
//! warning on the response, never a lost dispatch result.

use std::sync::Arc;

use anyhow::Result;
use valet_cache::{keys, Cache};
use valet_schema::{ComprehensiveAnalysis, MessageRole, ToolCallRecord};
use valet_store::{MessageRecord, Store};

use crate::context_init::TurnContext;

const TITLE_MAX_CHARS: usize = 80;

#[derive(Clone)]
pub struct PersistWriter {
    store: Arc<Store>,
    cache: Cache,
    history_limit: usize,
}

impl PersistWriter {
    pub fn new(store: Arc<Store>, cache: Cache, history_limit: usize) -> Self {
        Self {
            store,
            cache,
            history_limit,
        }
    }

    /// Commit the turn. Returns a warning string instead of failing when
    /// the store rejects the writes.
    pub async fn commit(
        &self,
        turn: &TurnContext,
        user_query: &str,
        response_text: &str,
        records: &[ToolCallRecord],
        analysis: &ComprehensiveAnalysis,
    ) -> Option<String> {
        match self
            .commit_inner(turn, user_query, response_text, records, analysis)
            .await
        {
            Ok(()) => None,
            Err(e) => {
                tracing::warn!("failed to persist turn for {}: {e}", turn.session_id);
                Some("Your reply was generated but could not be saved to history.".to_string())
            }
        }
    }

    async fn commit_inner(
        &self,
        turn: &TurnContext,
        user_query: &str,
        response_text: &str,
        records: &[ToolCallRecord],
        analysis: &ComprehensiveAnalysis,
    ) -> Result<()> {
        let user_message =
            MessageRecord::new(&turn.conversation_id, MessageRole::User, user_query);
        self.store.append_message(user_message).await?;

        let mut assistant_message =
            MessageRecord::new(&turn.conversation_id, MessageRole::Assistant, response_text);
        if !records.is_empty() {
            assistant_message.tool_calls = Some(serde_json::to_value(records)?);
        }
        assistant_message.analysis = Some(serde_json::to_value(analysis)?);
        self.store.append_message(assistant_message).await?;

        let title: String = user_query.chars().take(TITLE_MAX_CHARS).collect();
        self.store
            .set_conversation_title(&turn.conversation_id, &title)
            .await?;

        self.store
            .update_session_summary(
                &turn.session_id,
                &serde_json::to_value(&analysis.conversation_summary)?,
            )
            .await?;

        self.invalidate(&turn.session_id);
        Ok(())
    }

    fn invalidate(&self, session_id: &str) {
        self.cache
            .delete(&keys::messages(session_id, self.history_limit));
        self.cache.delete(&keys::session(session_id));
        self.cache.delete(&keys::session_summary(session_id));
    }
}
