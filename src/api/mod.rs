//! Administrative HTTP API
//!
//! JSON over HTTP with a fixed envelope: `{"items": ...}` on success,
//! `{"error": "..."}` on failure. The API composes actor messages; it
//! never touches relay state directly.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use uuid::Uuid;

use crate::conf::PathConf;
use crate::conn::ConnRegistry;
use crate::error::RelayError;
use crate::metrics::Metrics;
use crate::path::{PathManagerHandle, Protocol};
use crate::routine::RoutinePool;

/// Shared state behind the admin router.
pub struct ApiState {
    pub manager: PathManagerHandle,
    pub conns: ConnRegistry,
    pub metrics: Metrics,
}

/// Build the admin router.
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/v1/paths/list", get(paths_list))
        .route("/v1/:proto/conns/list", get(conns_list))
        .route("/v1/:proto/conns/kick/:id", post(conns_kick))
        .route("/v1/config/paths/add/*name", post(config_paths_add))
        .route("/v1/config/paths/edit/*name", post(config_paths_edit))
        .route("/v1/config/paths/remove/*name", post(config_paths_remove))
        .with_state(state)
}

/// Bind and serve a router until the pool's token fires.
pub async fn serve(addr: SocketAddr, router: Router, pool: &RoutinePool) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "HTTP server listening");
    let token = pool.token().clone();
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { token.cancelled().await })
    .await?;
    Ok(())
}

fn items(value: serde_json::Value) -> Response {
    Json(json!({ "items": value })).into_response()
}

fn error(status: StatusCode, msg: impl Into<String>) -> Response {
    (status, Json(json!({ "error": msg.into() }))).into_response()
}

fn relay_error(e: &RelayError) -> Response {
    let status = match e {
        RelayError::Authentication => StatusCode::UNAUTHORIZED,
        RelayError::PathNotFound | RelayError::SegmentNotFound => StatusCode::NOT_FOUND,
        RelayError::Terminated => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::BAD_REQUEST,
    };
    error(status, e.to_string())
}

fn parse_protocol(proto: &str) -> Option<Protocol> {
    match proto {
        "relay" => Some(Protocol::Relay),
        "hls" => Some(Protocol::Hls),
        "web" => Some(Protocol::Web),
        "playback" => Some(Protocol::Playback),
        _ => None,
    }
}

async fn paths_list(State(state): State<Arc<ApiState>>) -> Response {
    match state.manager.api_paths_list().await {
        Ok(list) => {
            let map: serde_json::Map<String, serde_json::Value> = list
                .into_iter()
                .map(|info| {
                    let name = info.name.clone();
                    (name, serde_json::to_value(info).unwrap_or_default())
                })
                .collect();
            items(serde_json::Value::Object(map))
        }
        Err(e) => relay_error(&e),
    }
}

async fn conns_list(
    State(state): State<Arc<ApiState>>,
    Path(proto): Path<String>,
) -> Response {
    let Some(protocol) = parse_protocol(&proto) else {
        return error(StatusCode::NOT_FOUND, "not found");
    };
    let map: serde_json::Map<String, serde_json::Value> = state
        .conns
        .list(protocol)
        .into_iter()
        .map(|snap| {
            (
                snap.id.to_string(),
                serde_json::to_value(&snap).unwrap_or_default(),
            )
        })
        .collect();
    items(serde_json::Value::Object(map))
}

async fn conns_kick(
    State(state): State<Arc<ApiState>>,
    Path((proto, id)): Path<(String, String)>,
) -> Response {
    if parse_protocol(&proto).is_none() {
        return error(StatusCode::NOT_FOUND, "not found");
    }
    let Ok(id) = id.parse::<Uuid>() else {
        return error(StatusCode::BAD_REQUEST, "invalid connection id");
    };
    match state.conns.kick(id) {
        Ok(()) => {
            // Detach path-side state as well; best effort since the
            // connection teardown also does it.
            let _ = state.manager.api_kick(id).await;
            StatusCode::NO_CONTENT.into_response()
        }
        Err(_) => error(StatusCode::NOT_FOUND, "not found"),
    }
}

async fn config_paths_add(
    State(state): State<Arc<ApiState>>,
    Path(name): Path<String>,
    Json(conf): Json<PathConf>,
) -> Response {
    match state.manager.conf_path_add(&name, conf).await {
        Ok(Ok(())) => StatusCode::NO_CONTENT.into_response(),
        Ok(Err(msg)) => error(StatusCode::BAD_REQUEST, msg),
        Err(e) => relay_error(&e),
    }
}

async fn config_paths_edit(
    State(state): State<Arc<ApiState>>,
    Path(name): Path<String>,
    Json(conf): Json<PathConf>,
) -> Response {
    match state.manager.conf_path_edit(&name, conf).await {
        Ok(Ok(())) => StatusCode::NO_CONTENT.into_response(),
        Ok(Err(msg)) => error(StatusCode::BAD_REQUEST, msg),
        Err(e) => relay_error(&e),
    }
}

async fn config_paths_remove(
    State(state): State<Arc<ApiState>>,
    Path(name): Path<String>,
) -> Response {
    match state.manager.conf_path_remove(&name).await {
        Ok(Ok(())) => StatusCode::NO_CONTENT.into_response(),
        Ok(Err(msg)) => error(StatusCode::BAD_REQUEST, msg),
        Err(e) => relay_error(&e),
    }
}
