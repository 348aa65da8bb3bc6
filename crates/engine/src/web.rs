use anyhow::{Context, Result};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use tracing::{info, warn};

use crate::access::Role;
use crate::db::{Db, DecisionRow, WateringEvent};
use crate::model::IrrigationConfig;
use crate::scheduler::{CommandError, OperatorCommand, SchedulerHandle};
use crate::state::SharedState;

/// Header carrying the caller's role. Missing means viewer.
pub const ROLE_HEADER: &str = "x-operator-role";

const DEFAULT_HISTORY_LIMIT: i64 = 50;
const MAX_HISTORY_LIMIT: i64 = 500;

#[derive(Clone)]
pub struct AppState {
    pub shared: SharedState,
    pub scheduler: SchedulerHandle,
    pub db: Db,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/history", get(api_history))
        .route("/api/config", post(api_save_config))
        .route("/api/switch", post(api_switch))
        .route("/api/tank/refill", post(api_refill))
        .with_state(state)
}

async fn api_status(State(state): State<AppState>) -> impl IntoResponse {
    let st = state.shared.read().await;
    Json(st.to_status())
}

#[derive(Deserialize)]
struct HistoryQuery {
    limit: Option<i64>,
}

#[derive(Serialize)]
struct HistoryResponse {
    watering_events: Vec<WateringEvent>,
    decisions: Vec<DecisionRow>,
}

async fn api_history(
    State(state): State<AppState>,
    Query(q): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let limit = q
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);
    let watering_events = state
        .db
        .recent_watering_events(limit)
        .await
        .map_err(ApiError::Internal)?;
    let decisions = state
        .db
        .recent_decisions(limit)
        .await
        .map_err(ApiError::Internal)?;
    Ok(Json(HistoryResponse {
        watering_events,
        decisions,
    }))
}

#[derive(Deserialize)]
struct SwitchRequest {
    on: bool,
}

#[derive(Deserialize, Default)]
struct RefillRequest {
    #[serde(default)]
    liters: Option<f64>,
}

async fn api_save_config(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(config): Json<IrrigationConfig>,
) -> Result<Response, ApiError> {
    submit(&state, &headers, OperatorCommand::SaveConfig(config)).await
}

async fn api_switch(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<SwitchRequest>,
) -> Result<Response, ApiError> {
    submit(&state, &headers, OperatorCommand::Switch { on: req.on }).await
}

async fn api_refill(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<RefillRequest>,
) -> Result<Response, ApiError> {
    submit(
        &state,
        &headers,
        OperatorCommand::RefillTank { liters: req.liters },
    )
    .await
}

/// Run an operator action and answer with the resulting status.
async fn submit(
    state: &AppState,
    headers: &HeaderMap,
    cmd: OperatorCommand,
) -> Result<Response, ApiError> {
    let role = role_from(headers)?;
    state
        .scheduler
        .submit(role, cmd)
        .await
        .map_err(ApiError::Command)?;
    let st = state.shared.read().await;
    Ok(Json(st.to_status()).into_response())
}

fn role_from(headers: &HeaderMap) -> Result<Role, ApiError> {
    match headers.get(ROLE_HEADER) {
        None => Ok(Role::Viewer),
        Some(v) => v
            .to_str()
            .map_err(|_| ApiError::BadRequest("role header is not ascii".into()))?
            .parse()
            .map_err(ApiError::BadRequest),
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

pub enum ApiError {
    Command(CommandError),
    BadRequest(String),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Command(e) => {
                let status = match &e {
                    CommandError::Forbidden(_) => StatusCode::FORBIDDEN,
                    CommandError::Rejected(_) => StatusCode::BAD_REQUEST,
                    CommandError::Unavailable(_) | CommandError::EngineStopped => {
                        StatusCode::SERVICE_UNAVAILABLE
                    }
                };
                (status, e.to_string())
            }
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(e) => {
                warn!("api error: {e:#}");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

#[cfg(not(feature = "tls"))]
pub async fn serve(state: AppState, port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!("web api listening on http://{addr}");

    axum::serve(listener, router(state))
        .await
        .context("web server error")
}

/// HTTPS using the PEM files named by `TLS_CERT_PATH` / `TLS_KEY_PATH`.
#[cfg(feature = "tls")]
pub async fn serve(state: AppState, port: u16) -> Result<()> {
    use axum_server::tls_rustls::RustlsConfig;

    let cert = std::env::var("TLS_CERT_PATH").context("TLS_CERT_PATH not set")?;
    let key = std::env::var("TLS_KEY_PATH").context("TLS_KEY_PATH not set")?;
    let tls = RustlsConfig::from_pem_file(&cert, &key)
        .await
        .with_context(|| format!("failed to load tls cert {cert} / key {key}"))?;

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("web api listening on https://{addr}");

    axum_server::bind_rustls(addr, tls)
        .serve(router(state).into_make_service())
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================
