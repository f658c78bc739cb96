/// API request handlers

use super::responses::*;
use onioncirc_core::pathbias::rates;
use onioncirc_common::RelayId;
use onioncirc_core::{EntryGuard, LoopbackChannels, LoopbackNetwork, Node};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub network: Arc<RwLock<LoopbackNetwork>>,
}

fn guard_info(node: &Node<LoopbackChannels>, guard: &EntryGuard) -> GuardInfo {
    let circuits = node.circuits();
    let open = |from, to| circuits.count_in_states(&guard.identity, from, to);
    GuardInfo {
        identity: guard.identity.to_hex(),
        nickname: guard.nickname.clone(),
        made_contact: guard.made_contact,
        disabled: guard.path_bias_disabled,
        circ_attempts: guard.circ_attempts,
        circ_successes: guard.circ_successes,
        successful_circuits_closed: guard.successful_circuits_closed,
        collapsed_circuits: guard.collapsed_circuits,
        unusable_circuits: guard.unusable_circuits,
        timeouts: guard.timeouts,
        use_attempts: guard.use_attempts,
        use_successes: guard.use_successes,
        close_rate: rate(rates::close_success_count(guard, &open), guard.circ_successes),
        use_rate: rate(rates::use_success_count(guard, &open), guard.use_attempts),
    }
}

/// Handler for GET /api/guards
pub async fn get_guards(State(state): State<AppState>) -> Result<Json<GuardsResponse>, AppError> {
    debug!("API: GET /api/guards");

    let network = state.network.read().await;
    let client = network.client();
    let guards: Vec<GuardInfo> = client
        .guards()
        .iter()
        .map(|guard| guard_info(client, guard))
        .collect();
    let total = guards.len();

    Ok(Json(GuardsResponse { guards, total }))
}

/// Handler for GET /api/guards/:identity
pub async fn get_guard(
    State(state): State<AppState>,
    Path(identity): Path<String>,
) -> Result<Json<GuardInfo>, AppError> {
    debug!("API: GET /api/guards/{}", identity);

    let id: RelayId = identity
        .parse()
        .map_err(|e| AppError::bad_request(format!("{}", e)))?;
    let network = state.network.read().await;
    let client = network.client();
    let guard = client
        .guard(&id)
        .ok_or_else(|| AppError::not_found(format!("no entry guard {}", identity)))?;

    Ok(Json(guard_info(client, guard)))
}

/// Handler for GET /api/circuits
pub async fn get_circuits(State(state): State<AppState>) -> Result<Json<CircuitsResponse>, AppError> {
    debug!("API: GET /api/circuits");

    let network = state.network.read().await;
    let client = network.client();
    let circuits = client.circuit_summaries();
    let build_times = client.build_times_summary();
    let total = circuits.len();

    Ok(Json(CircuitsResponse {
        circuits,
        total,
        has_completed_circuit: client.has_completed_circuit(),
        build_time_samples: build_times.samples,
        build_timeout_ms: build_times.timeout_ms,
    }))
}

/// Handler for GET /api/params
pub async fn get_params(State(state): State<AppState>) -> Result<Json<ParamsResponse>, AppError> {
    debug!("API: GET /api/params");

    let network = state.network.read().await;
    Ok(Json(ParamsResponse {
        path_bias: *network.client().path_bias_params(),
    }))
}

/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    debug!("API: GET /health");
    (StatusCode::OK, "OK")
}

/// Application error type
pub struct AppError {
    message: String,
    status_code: StatusCode,
}

impl AppError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status_code: StatusCode::BAD_REQUEST,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status_code: StatusCode::NOT_FOUND,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status_code.is_server_error() {
            error!("API Error: {}", self.message);
        } else {
            debug!("API request rejected: {}", self.message);
        }

        let body = Json(ErrorResponse::new(self.message, self.status_code.as_u16()));

        (self.status_code, body).into_response()
    }
}
