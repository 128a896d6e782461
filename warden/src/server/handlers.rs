//! HTTP request handlers
//!
//! Control operations run on their own task so a dropped connection cannot
//! cancel an operation halfway through.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::collect::store::LogQuery;
use crate::models::artifact::TriggerSource;
use crate::models::status::{Operation, OperationOutcome, OutcomeKind};
use crate::server::state::ServerState;
use crate::utils::{constant_time_eq, version_info};

/// Header carrying the webhook secret
pub const WEBHOOK_TOKEN_HEADER: &str = "x-warden-token";

const DEFAULT_STATUS_EVENTS: usize = 20;
const MAX_STATUS_EVENTS: usize = 500;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

/// Health of warden itself, not of the supervised service
pub async fn health_handler() -> impl IntoResponse {
    let version = version_info();
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "warden".to_string(),
        version: version.version,
    })
}

/// Version response
#[derive(Debug, Serialize)]
pub struct VersionResponse {
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
}

/// Version handler
pub async fn version_handler() -> impl IntoResponse {
    let version = version_info();
    Json(VersionResponse {
        version: version.version,
        git_hash: version.git_hash,
        build_time: version.build_time,
    })
}

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    pub events: Option<usize>,
}

/// Current state, last health report and recent events
pub async fn status_handler(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<StatusQuery>,
) -> impl IntoResponse {
    let events = query
        .events
        .unwrap_or(DEFAULT_STATUS_EVENTS)
        .min(MAX_STATUS_EVENTS);
    Json(state.surface.status(events))
}

/// Paginated log entries in an optional `[from, to)` range
pub async fn logs_handler(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<LogQuery>,
) -> impl IntoResponse {
    Json(state.logs.query(&query))
}

/// Error body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}

fn parse_action(action: &str) -> Option<Operation> {
    match action {
        "start" => Some(Operation::Start),
        "stop" => Some(Operation::Stop),
        "redeploy" => Some(Operation::Redeploy),
        "reconcile" => Some(Operation::Reconcile),
        _ => None,
    }
}

fn outcome_response(outcome: OperationOutcome) -> Response {
    let status = match outcome.outcome {
        OutcomeKind::Rejected => StatusCode::CONFLICT,
        OutcomeKind::Completed | OutcomeKind::Failed => StatusCode::OK,
    };
    (status, Json(outcome)).into_response()
}

/// `POST /control/{start|stop|redeploy|reconcile}`
pub async fn control_handler(
    State(state): State<Arc<ServerState>>,
    Path(action): Path<String>,
) -> Response {
    let Some(operation) = parse_action(&action) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            format!("unknown action '{}'", action),
        );
    };

    let surface = state.surface.clone();
    let task = tokio::spawn(async move {
        match operation {
            Operation::Start => surface.request_start().await,
            Operation::Stop => surface.request_stop().await,
            Operation::Redeploy => surface.request_redeploy(TriggerSource::Manual).await,
            Operation::Reconcile => surface.reconcile().await,
        }
    });

    match task.await {
        Ok(outcome) => outcome_response(outcome),
        Err(e) => {
            error!("{} task failed: {}", operation, e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// Webhook response
#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub accepted: bool,
    pub message: String,
}

/// `POST /webhook`: redeploy in the background
pub async fn webhook_handler(State(state): State<Arc<ServerState>>, headers: HeaderMap) -> Response {
    if let Some(secret) = &state.webhook_secret {
        let token = headers
            .get(WEBHOOK_TOKEN_HEADER)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        if !constant_time_eq(token, secret.expose_secret()) {
            warn!("Rejected webhook with a missing or invalid token");
            return error_response(StatusCode::UNAUTHORIZED, "invalid webhook token");
        }
    }

    info!("Webhook received, scheduling redeploy");
    let surface = state.surface.clone();
    tokio::spawn(async move {
        let outcome = surface.request_redeploy(TriggerSource::Webhook).await;
        if !outcome.success {
            warn!("Webhook redeploy did not complete: {}", outcome.detail);
        }
    });

    (
        StatusCode::ACCEPTED,
        Json(WebhookResponse {
            accepted: true,
            message: "redeploy scheduled".to_string(),
        }),
    )
        .into_response()
}
