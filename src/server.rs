//! HTTP reporting endpoint.
//!
//! `GET|POST /infraction/{addr}` records one infraction. With
//! `expose_state`, `GET /state/infractions` returns the jail state dump.

use crate::address::Address;
use crate::error::JailError;
use crate::jailer::Jail;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

#[derive(Clone)]
struct AppState {
    jail: Arc<dyn Jail>,
}

/// Jail error rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl From<JailError> for ApiError {
    fn from(e: JailError) -> Self {
        let status = match &e {
            JailError::Validation { .. } => StatusCode::BAD_REQUEST,
            e if e.is_unavailable() => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError {
            status,
            message: e.to_string(),
        }
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, format!("{}\n", self.message)).into_response()
    }
}

async fn report_infraction(
    State(state): State<AppState>,
    Path(raw): Path<String>,
) -> Result<&'static str, ApiError> {
    let addr = Address::parse(&raw).map_err(|e| {
        warn!(addr = %raw, "Rejected infraction report");
        ApiError::from(e)
    })?;

    state.jail.add_infraction(&addr).await.map_err(|e| {
        error!(addr = %addr, error = %e, "Unable to process infraction");
        let mut err = ApiError::from(e);
        // validation here means a corrupt stored record
        if err.status == StatusCode::BAD_REQUEST {
            err.status = StatusCode::INTERNAL_SERVER_ERROR;
        }
        err
    })?;

    Ok("OK\n")
}

async fn infraction_state(State(state): State<AppState>) -> Result<String, ApiError> {
    let mut out = String::new();
    state.jail.write_state(&mut out).await?;
    Ok(out)
}

/// Build the router.
pub fn router(jail: Arc<dyn Jail>, expose_state: bool) -> Router {
    let mut app = Router::new().route(
        "/infraction/:addr",
        get(report_infraction).post(report_infraction),
    );
    if expose_state {
        app = app.route("/state/infractions", get(infraction_state));
    }
    app.with_state(AppState { jail })
}

/// Serve until `shutdown` resolves, then finish in-flight requests.
pub async fn serve(
    listener: TcpListener,
    jail: Arc<dyn Jail>,
    expose_state: bool,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(listen = %addr, expose_state, "Reporting endpoint listening");
    }
    axum::serve(listener, router(jail, expose_state))
        .with_graceful_shutdown(shutdown)
        .await
}
