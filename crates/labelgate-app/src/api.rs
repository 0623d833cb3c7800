// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// HTTP control surface: list printers and relay raw commands to them.
//
// Only `DeviceRegistry::list` and `CommandRelay::send_command` are reached
// from here; the surface never touches device sockets directly.

use std::time::Instant;

use axum::body::Bytes;
use axum::extract::{FromRequest, Path, Request, State};
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::{Form, Router};
use serde::Deserialize;
use tracing::{debug, info, warn};

use labelgate_core::types::{DeviceId, DeviceSummary, SendOutcome};
use labelgate_gateway::{CommandRelay, DeviceRegistry};

/// Base path of the versioned REST routes.
pub const API_BASE_PATH: &str = "/rest/v1";

/// Handles shared by every request.
#[derive(Debug, Clone)]
pub struct AppState {
    pub registry: DeviceRegistry,
    pub relay: CommandRelay,
}

/// Build the control-surface router.
pub fn create_routes(state: AppState) -> Router {
    let v1 = Router::new()
        .route("/printers", get(list_printers))
        .route("/printers/{printer_id}/raw", post(post_raw_command));

    Router::new()
        .route("/health", get(health_check))
        .nest(API_BASE_PATH, v1)
        .layer(middleware::from_fn(log_request))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Request failures, each mapped to one status code and a plain-text body.
#[derive(Debug)]
pub enum ApiError {
    MissingCommand,
    PrinterNotFound,
    PrinterUnreachable,
    /// The device socket writer stopped under us.
    TransportWrite(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::MissingCommand => (StatusCode::BAD_REQUEST, "Missing command").into_response(),
            Self::PrinterNotFound => (StatusCode::NOT_FOUND, "Printer not found").into_response(),
            Self::PrinterUnreachable => {
                (StatusCode::SERVICE_UNAVAILABLE, "Printer unreachable").into_response()
            }
            Self::TransportWrite(reason) => {
                (StatusCode::BAD_GATEWAY, format!("Printer write failed: {reason}"))
                    .into_response()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health_check() -> &'static str {
    "OK"
}

/// Every known device, including those inside their grace period.
async fn list_printers(State(state): State<AppState>) -> Json<Vec<DeviceSummary>> {
    Json(state.registry.list())
}

#[derive(Debug, Deserialize)]
struct RawCommandRequest {
    #[serde(default)]
    command: Option<String>,
}

/// Relay `command` to the printer; may wait out a reconnect.
///
/// The body is `application/x-www-form-urlencoded` when labelled so, and
/// JSON otherwise.
async fn post_raw_command(
    State(state): State<AppState>,
    Path(printer_id): Path<String>,
    request: Request,
) -> Result<StatusCode, ApiError> {
    let command = read_command(request)
        .await
        .ok_or(ApiError::MissingCommand)?;

    let id = DeviceId::new(printer_id);
    debug!(device_id = %id, bytes = command.len(), "raw command received");

    match state.relay.send_command(&id, command.into_bytes()).await {
        Ok(SendOutcome::Delivered) => Ok(StatusCode::NO_CONTENT),
        Ok(SendOutcome::NotFound) => Err(ApiError::PrinterNotFound),
        Ok(SendOutcome::Unreachable) => Err(ApiError::PrinterUnreachable),
        Err(e) => {
            warn!(device_id = %id, error = %e, "raw command not written");
            Err(ApiError::TransportWrite(e.to_string()))
        }
    }
}

/// The non-empty `command` field of the body.  An unreadable body counts
/// as a missing command.
async fn read_command(request: Request) -> Option<String> {
    let is_form = request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("application/x-www-form-urlencoded"));

    let body = if is_form {
        let Form(body) = Form::<RawCommandRequest>::from_request(request, &())
            .await
            .ok()?;
        body
    } else {
        let bytes = Bytes::from_request(request, &()).await.ok()?;
        serde_json::from_slice::<RawCommandRequest>(&bytes).ok()?
    };

    body.command.filter(|command| !command.is_empty())
}

/// One line per request with status and latency.
async fn log_request(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let start = Instant::now();

    let response = next.run(req).await;

    info!(
        %method,
        %uri,
        status = response.status().as_u16(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "control request"
    );
    response
}
