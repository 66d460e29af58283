use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use valet_schema::{ChatRequest, ChatResponse};

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/", post(chat))
}

/// The chat endpoint. Missing required fields are a 400; unrecoverable
/// core failures a 500; everything else (missing connections, tool
/// failures, degraded replies) is a 200 with explanatory text.
pub async fn chat(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, (StatusCode, Json<serde_json::Value>)> {
    if let Err(message) = request.validate() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": message })),
        ));
    }

    match state.pipeline.handle(request).await {
        Ok(response) => Ok(Json(response)),
        Err(e) => {
            tracing::error!("chat pipeline failed: {e:#}");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": "internal error processing chat request" })),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_state;

    #[tokio::test]
    async fn missing_user_query_is_bad_request() {
        let state = test_state::state();
        let request = ChatRequest {
            user_query: String::new(),
            user_id: "u1".into(),
            session_id: None,
            conversation_history: None,
        };
        let result = chat(State(state), Json(request)).await;
        let (status, _) = result.err().unwrap();
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn missing_user_id_is_bad_request() {
        let state = test_state::state();
        let request = ChatRequest {
            user_query: "Hello".into(),
            user_id: "  ".into(),
            session_id: None,
            conversation_history: None,
        };
        let result = chat(State(state), Json(request)).await;
        let (status, _) = result.err().unwrap();
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn valid_request_returns_response() {
        let state = test_state::state();
        let request = ChatRequest {
            user_query: "Hello, I need help with creating some documents".into(),
            user_id: "u1".into(),
            session_id: None,
            conversation_history: None,
        };
        let Json(response) = chat(State(state), Json(request)).await.ok().unwrap();
        assert_eq!(response.response, "Hello there!");
        assert!(response.executed_tools.is_empty());
        assert!(response.required_connections.is_empty());
        assert!(response.analysis.is_some());
    }
}
