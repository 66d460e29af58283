pub mod catalog;
pub mod chat;
pub mod connections;

use axum::routing::get;
use axum::{Json, Router};

use crate::state::AppState;

pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .nest("/chat", chat::router())
        .nest("/connections", connections::router())
        .nest("/tools", catalog::router())
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "status": "ok",
    }))
}
