//! Administrative tool-catalog endpoints: pull descriptors from the broker
//! into the vector namespace, and run similarity searches against it.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use valet_broker::ToolFilter;
use valet_catalog::{CatalogTool, ToolMatch};

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/ingest", post(ingest))
        .route("/search", post(search))
}

type ApiError = (StatusCode, Json<serde_json::Value>);

fn internal_error(e: anyhow::Error) -> ApiError {
    tracing::error!("catalog endpoint failed: {e:#}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": "internal error" })),
    )
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestRequest {
    pub app_name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestResponse {
    pub app_name: String,
    pub ingested: usize,
}

async fn ingest(
    State(state): State<AppState>,
    Json(request): Json<IngestRequest>,
) -> Result<Json<IngestResponse>, ApiError> {
    if request.app_name.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "appName is required" })),
        ));
    }

    let tools = state
        .broker
        .get_tools(ToolFilter::apps(vec![request.app_name.clone()]), "default")
        .await
        .map_err(internal_error)?;

    let descriptors: Vec<CatalogTool> = tools
        .into_iter()
        .map(|t| CatalogTool {
            name: t.name,
            description: t.description,
        })
        .collect();

    let ingested = state
        .catalog
        .ingest(&request.app_name, &descriptors)
        .await
        .map_err(internal_error)?;

    Ok(Json(IngestResponse {
        app_name: request.app_name,
        ingested,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRequest {
    pub app_name: String,
    pub user_query: String,
    #[serde(default)]
    pub top_k: Option<usize>,
}

async fn search(
    State(state): State<AppState>,
    Json(request): Json<SearchRequest>,
) -> Result<Json<Vec<ToolMatch>>, ApiError> {
    if request.app_name.trim().is_empty() || request.user_query.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "appName and userQuery are required" })),
        ));
    }

    let matches = state
        .catalog
        .search(
            &request.app_name,
            &request.user_query,
            request.top_k.unwrap_or(5),
        )
        .await
        .map_err(internal_error)?;
    Ok(Json(matches))
}
