//! HTTP boundary exposing the tool registry

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

use crate::error::{ErrorCategory, PipelineError, Result};
use crate::pipeline::Orchestrator;
use crate::tools;

#[derive(Debug, Deserialize)]
pub struct RunRequest {
    pub tool: String,
    #[serde(default)]
    pub input: Value,
}

/// A pipeline error rendered as `{"error": {category, stage, message}}`
pub struct ApiError(pub PipelineError);

impl From<PipelineError> for ApiError {
    fn from(error: PipelineError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(self.0.category());
        (status, Json(json!({ "error": self.0.to_error_body() }))).into_response()
    }
}

pub fn status_for(category: ErrorCategory) -> StatusCode {
    match category {
        c if c.is_caller_error() => StatusCode::BAD_REQUEST,
        c if c.is_auth_error() => StatusCode::UNAUTHORIZED,
        ErrorCategory::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorCategory::SearchFailed
        | ErrorCategory::DownloadFailed
        | ErrorCategory::UploadFailed
        | ErrorCategory::SendFailed => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub fn router(orchestrator: Arc<Orchestrator>) -> Router {
    Router::new()
        .route("/mcp/tools", get(list_tools))
        .route("/mcp/run", post(run_tool))
        .with_state(orchestrator)
}

async fn list_tools() -> Json<Value> {
    Json(json!({ "tools": tools::definitions() }))
}

async fn run_tool(
    State(orchestrator): State<Arc<Orchestrator>>,
    payload: std::result::Result<Json<RunRequest>, JsonRejection>,
) -> std::result::Result<Json<Value>, ApiError> {
    let Json(request) = payload.map_err(|rejection| PipelineError::InvalidInput {
        field: "body".to_string(),
        reason: rejection.body_text(),
    })?;

    let output = orchestrator.run(&request.tool, &request.input).await?;
    Ok(Json(serde_json::to_value(output).map_err(PipelineError::from)?))
}

/// Serve until Ctrl-C
pub async fn serve(orchestrator: Arc<Orchestrator>, host: &str, port: u16) -> Result<()> {
    let listener = tokio::net::TcpListener::bind((host, port)).await?;
    info!("Listening on http://{}", listener.local_addr()?);

    axum::serve(listener, router(orchestrator))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await?;
    Ok(())
}
