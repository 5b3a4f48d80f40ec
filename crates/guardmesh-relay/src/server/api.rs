//! Control API routes.

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use guardmesh_core::ErrorKind;
use tower_http::trace::TraceLayer;
use tracing::{debug, error};

use crate::claim::{ClaimError, ClaimHandler, ClaimRequest, ClaimResponse};
use crate::storage::{RegistryDatabase, RegistryError, RelaySummary};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub db: RegistryDatabase,
    pub claims: ClaimHandler,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/relay-table", get(relay_table))
        .route("/ip/replace", post(ip_replace))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// A rejection. Callers only ever see the status and a short reason.
#[derive(Debug)]
pub struct ApiError {
    kind: ErrorKind,
    reason: &'static str,
}

impl ApiError {
    const fn bad_request(reason: &'static str) -> Self {
        Self {
            kind: ErrorKind::Validation,
            reason,
        }
    }

    const fn status(&self) -> StatusCode {
        match self.kind {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::Auth => StatusCode::FORBIDDEN,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::Timeout => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Storage | ErrorKind::Device => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), self.reason).into_response()
    }
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        error!(error = %e, "Registry error while serving request");
        let kind = e.kind();
        Self {
            kind,
            reason: if kind == ErrorKind::Timeout {
                "unavailable"
            } else {
                "internal error"
            },
        }
    }
}

impl From<ClaimError> for ApiError {
    fn from(e: ClaimError) -> Self {
        match e {
            ClaimError::Registry(e) => e.into(),
            ClaimError::Validation(ref v) => {
                debug!(field = %v.field, "Claim input rejected");
                Self::bad_request("invalid request")
            }
            ClaimError::NoActiveChallenge | ClaimError::Expired | ClaimError::Rejected => {
                debug!(error = %e, "Claim rejected");
                Self {
                    kind: ErrorKind::Auth,
                    reason: "rejected",
                }
            }
        }
    }
}

/// `GET /relay-table`
async fn relay_table(State(state): State<AppState>) -> Result<Json<Vec<RelaySummary>>, ApiError> {
    Ok(Json(state.db.list_servers().await?))
}

/// `POST /ip/replace`
async fn ip_replace(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<ClaimResponse>, ApiError> {
    let req: ClaimRequest =
        serde_json::from_slice(&body).map_err(|_| ApiError::bad_request("bad json"))?;
    Ok(Json(state.claims.handle(req).await?))
}

/// `GET /healthz`
async fn healthz() -> &'static str {
    "ok"
}
