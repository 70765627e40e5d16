use std::sync::Arc;
use axum::{
    extract::State,
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use shared::protocol::SERVICE_TYPE;
use shared::types::PeerEntry;
use crate::engine::Engine;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub hash_rx: watch::Receiver<String>,
}

impl AppState {
    pub fn new(engine: Arc<Engine>) -> Self {
        let hash_rx = engine.subscribe_peers_hash();
        Self { engine, hash_rx }
    }
}

#[derive(Debug, Serialize)]
pub struct IdentityResponse {
    pub identifier: String,
    pub service_type: String,
    pub listen_port: u16,
}

#[derive(Debug, Deserialize)]
pub struct ChangeIdentityRequest {
    pub prefix: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/peers", get(get_peers))
        .route("/v1/peers/hash", get(get_hash))
        .route("/v1/identity", get(get_identity).put(put_identity))
        .with_state(state)
}

fn identity_of(engine: &Engine) -> IdentityResponse {
    IdentityResponse {
        identifier: engine.identity(),
        service_type: SERVICE_TYPE.to_string(),
        listen_port: engine.listen_port(),
    }
}

async fn get_peers(State(state): State<AppState>) -> Json<Vec<PeerEntry>> {
    Json(state.engine.list_peers())
}

async fn get_hash(State(state): State<AppState>) -> String {
    state.hash_rx.borrow().clone()
}

async fn get_identity(State(state): State<AppState>) -> Json<IdentityResponse> {
    Json(identity_of(&state.engine))
}

/// 502 when the new record could not be advertised; the old identity stays.
async fn put_identity(
    State(state): State<AppState>,
    Json(request): Json<ChangeIdentityRequest>,
) -> Result<Json<IdentityResponse>, StatusCode> {
    let engine = state.engine.clone();
    let prefix = request.prefix;

    // change_identity blocks on the discovery provider
    let changed = tokio::task::spawn_blocking(move || engine.change_identity(&prefix))
        .await
        .map_err(|e| {
            tracing::error!("Identity change task failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    if changed {
        Ok(Json(identity_of(&state.engine)))
    } else {
        Err(StatusCode::BAD_GATEWAY)
    }
}
