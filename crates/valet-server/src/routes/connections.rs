use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use valet_cache::keys;
use valet_schema::ConnectionStatus;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/initiate", post(initiate))
        .route("/callback", post(callback))
        .route("/{user_id}", get(list))
}

type ApiError = (StatusCode, Json<serde_json::Value>);

fn internal_error(e: anyhow::Error) -> ApiError {
    tracing::error!("connection endpoint failed: {e:#}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": "internal error" })),
    )
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateRequest {
    pub app_name: String,
    pub user_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_url: Option<String>,
    pub connected_account_id: String,
}

/// Start the handshake with the broker and register the connection as
/// INITIATED for the user.
async fn initiate(
    State(state): State<AppState>,
    Json(request): Json<InitiateRequest>,
) -> Result<Json<InitiateResponse>, ApiError> {
    if request.app_name.trim().is_empty() || request.user_id.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "appName and userId are required" })),
        ));
    }

    let initiated = state
        .broker
        .initiate(&request.app_name, &request.user_id)
        .await
        .map_err(internal_error)?;

    state
        .registry
        .upsert(
            &request.user_id,
            &request.app_name,
            &initiated.connected_account_id,
            ConnectionStatus::Initiated,
        )
        .await
        .map_err(internal_error)?;
    state.cache.delete(&keys::user_connections(&request.user_id));
    state
        .cache
        .delete(&keys::connection_status(&request.user_id, &request.app_name));

    Ok(Json(InitiateResponse {
        redirect_url: initiated.redirect_url,
        connected_account_id: initiated.connected_account_id,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackRequest {
    pub connected_account_id: String,
    pub user_id: String,
    pub app_name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackResponse {
    pub id: String,
    pub status: ConnectionStatus,
}

/// Reconcile the registry entry from the broker's view of the account.
/// A broker status of ACTIVE promotes the entry; failure or expiry are
/// recorded as such.
async fn callback(
    State(state): State<AppState>,
    Json(request): Json<CallbackRequest>,
) -> Result<Json<CallbackResponse>, ApiError> {
    let broker_view = state
        .broker
        .get(&request.connected_account_id)
        .await
        .map_err(internal_error)?;

    let status = match broker_view.status.as_str() {
        "ACTIVE" => ConnectionStatus::Active,
        "EXPIRED" => ConnectionStatus::Expired,
        "FAILED" | "ERROR" => ConnectionStatus::Failed,
        other => {
            tracing::warn!("unrecognized broker status {other}, keeping INITIATED");
            ConnectionStatus::Initiated
        }
    };

    let record = state
        .registry
        .upsert(
            &request.user_id,
            &request.app_name,
            &request.connected_account_id,
            status,
        )
        .await
        .map_err(internal_error)?;
    state.cache.delete(&keys::user_connections(&request.user_id));
    state
        .cache
        .delete(&keys::connection_status(&request.user_id, &request.app_name));

    Ok(Json(CallbackResponse {
        id: record.id,
        status: record.status,
    }))
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionView {
    pub app_name: String,
    pub account_id: String,
    pub status: ConnectionStatus,
}

/// A user's connections, cached for 10 minutes.
async fn list(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<ConnectionView>>, ApiError> {
    let cache_key = keys::user_connections(&user_id);
    if let Some(cached) = state.cache.get::<Vec<ConnectionView>>(&cache_key) {
        return Ok(Json(cached));
    }

    let rows = state
        .registry
        .list(&user_id, None)
        .await
        .map_err(internal_error)?;
    let views: Vec<ConnectionView> = rows
        .into_iter()
        .map(|r| ConnectionView {
            app_name: r.app_name,
            account_id: r.account_id,
            status: r.status,
        })
        .collect();
    state
        .cache
        .set(&cache_key, &views, keys::USER_CONNECTIONS_TTL);
    Ok(Json(views))
}
