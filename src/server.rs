//! Trigger HTTP server.
//!
//! Exposes the on-demand and platform-cron admission paths. Every handler
//! authorizes the caller, invokes [`RunCoordinator::trigger`] and renders
//! the run report. A run that finished with failed stages is still a `200`
//! with `success: false`; the report is the answer.
//!
//! # Endpoints
//!
//! | Method | Path | Auth | Pipeline |
//! |--------|------|------|----------|
//! | `GET`  | `/health` | none | |
//! | `POST` | `/admin/reindex[?pipeline=]` | admin token, fail closed | `all` by default |
//! | `GET`  | `/cron/index-all` | cron secret if set | `all` |
//! | `GET`  | `/cron/index-marketplaces` | cron secret if set | `marketplaces` |
//! | `GET`  | `/cron/index-mcp-servers` | cron secret if set | `mcp-servers` |
//! | `GET`  | `/cron/index-plugins` | cron secret if set | `plugins` |
//! | `GET`  | `/cron/sync-mcp-stats` | cron secret if set | `mcp-stats` |
//!
//! # Error Contract
//!
//! ```json
//! { "error": "run_in_progress", "message": "run 6f1c… of pipeline 'all' is already in progress" }
//! ```
//!
//! | Status | `error` | Cause |
//! |--------|---------|-------|
//! | 400 | `bad_request` | unknown `pipeline` parameter |
//! | 401 | `unauthorized` | missing or wrong bearer token |
//! | 409 | `run_in_progress` | the pipeline's run lock is held |
//! | 500 | `internal` | the coordinator itself failed |
//! | 503 | `unconfigured` | admin token not configured |
//!
//! [`RunCoordinator::trigger`]: crate::coordinator::RunCoordinator::trigger

use axum::{
    extract::{Query, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::config::{Config, Secrets};
use crate::coordinator::RunCoordinator;
use crate::db;
use crate::error::{AuthRejected, TriggerError};
use crate::models::{Pipeline, RunReport, Stage, StageReport, TriggerSource};
use crate::traits::ConnectorRegistry;
use crate::trigger::{authorize_admin, authorize_cron};

/// Shared state of all route handlers.
#[derive(Clone)]
pub struct AppState {
    coordinator: Arc<RunCoordinator>,
    secrets: Arc<Secrets>,
}

impl AppState {
    pub fn new(coordinator: Arc<RunCoordinator>, secrets: Secrets) -> Self {
        Self {
            coordinator,
            secrets: Arc::new(secrets),
        }
    }
}

/// Build the router. Split from [`run_server`] so tests can serve it on an
/// ephemeral port.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/admin/reindex", post(handle_admin_reindex))
        .route("/cron/index-all", get(handle_cron_index_all))
        .route("/cron/index-marketplaces", get(handle_cron_marketplaces))
        .route("/cron/index-mcp-servers", get(handle_cron_mcp_servers))
        .route("/cron/index-plugins", get(handle_cron_plugins))
        .route("/cron/sync-mcp-stats", get(handle_cron_mcp_stats))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Starts the trigger server on `[server].bind` with connectors from
/// `[connectors]` and secrets from the environment.
///
/// Runs until Ctrl-C.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pool = db::connect(config).await?;
    let connectors = ConnectorRegistry::from_config(config);
    let secrets = Secrets::from_env(&config.auth);

    if secrets.admin_token.is_none() {
        tracing::warn!(
            var = %config.auth.admin_token_env,
            "admin token not set, POST /admin/reindex will answer 503"
        );
    }
    if secrets.cron_secret.is_none() {
        tracing::warn!(
            var = %config.auth.cron_secret_env,
            "cron secret not set, /cron/* endpoints accept unauthenticated requests"
        );
    }

    let coordinator = Arc::new(RunCoordinator::new(
        pool,
        connectors,
        config.pipeline.clone(),
    ));
    let app = router(AppState::new(coordinator, secrets));

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    tracing::info!("trigger server listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.code,
            message: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<AuthRejected> for AppError {
    fn from(err: AuthRejected) -> Self {
        let (status, code) = match err {
            AuthRejected::Unconfigured => (StatusCode::SERVICE_UNAVAILABLE, "unconfigured"),
            AuthRejected::Missing | AuthRejected::Mismatch => {
                (StatusCode::UNAUTHORIZED, "unauthorized")
            }
        };
        AppError {
            status,
            code,
            message: err.to_string(),
        }
    }
}

impl From<TriggerError> for AppError {
    fn from(err: TriggerError) -> Self {
        match err {
            TriggerError::RunAlreadyInProgress { .. } => AppError {
                status: StatusCode::CONFLICT,
                code: "run_in_progress",
                message: err.to_string(),
            },
            TriggerError::Infrastructure(_) => {
                tracing::error!("trigger failed: {}", err);
                AppError {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    code: "internal",
                    message: err.to_string(),
                }
            }
        }
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

fn authorization(headers: &HeaderMap) -> Option<&str> {
    headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok())
}

// ============ Response bodies ============

/// Counts of one stage as rendered by the cron endpoints.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageCounts {
    pub success: bool,
    pub stage: Stage,
    pub indexed: u64,
    pub created: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub failed: u64,
    pub skipped: u64,
    pub marked_stale: u64,
    pub reactivated: u64,
    pub duration_ms: u64,
    pub errors: Vec<String>,
}

impl From<&StageReport> for StageCounts {
    fn from(report: &StageReport) -> Self {
        Self {
            success: !report.fatal,
            stage: report.stage,
            indexed: report.indexed,
            created: report.created,
            updated: report.updated,
            unchanged: report.unchanged,
            failed: report.failed,
            skipped: report.skipped,
            marked_stale: report.marked_stale,
            reactivated: report.reactivated,
            duration_ms: report.duration_ms,
            errors: report.errors.clone(),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ReindexResponse {
    success: bool,
    run_id: String,
    indexed: u64,
    failed: u64,
    skipped: u64,
    duration_ms: u64,
    errors: Vec<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct IndexAllResponse {
    success: bool,
    run_id: String,
    results: BTreeMap<&'static str, StageCounts>,
    errors: Vec<String>,
    duration_ms: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CronStageResponse {
    run_id: String,
    #[serde(flatten)]
    counts: StageCounts,
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ============ POST /admin/reindex ============

#[derive(Deserialize)]
struct ReindexParams {
    pipeline: Option<String>,
}

/// Handler for `POST /admin/reindex`.
///
/// Authorization is checked before the query string, so an unauthenticated
/// caller learns nothing about valid pipelines.
async fn handle_admin_reindex(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<ReindexParams>,
) -> Result<Json<ReindexResponse>, AppError> {
    authorize_admin(state.secrets.admin_token.as_deref(), authorization(&headers))?;

    let pipeline = match params.pipeline.as_deref() {
        None | Some("") => Pipeline::All,
        Some(name) => name
            .parse::<Pipeline>()
            .map_err(|e| bad_request(e.to_string()))?,
    };

    let report = state
        .coordinator
        .trigger(pipeline, TriggerSource::Admin)
        .await?;

    Ok(Json(ReindexResponse {
        success: report.success,
        indexed: report.indexed(),
        failed: report.failed(),
        skipped: report.skipped(),
        duration_ms: report.duration_ms,
        errors: report.errors(),
        run_id: report.run_id,
    }))
}

// ============ GET /cron/* ============

async fn handle_cron_index_all(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<IndexAllResponse>, AppError> {
    let report = cron_trigger(&state, &headers, Pipeline::All).await?;

    let results = report
        .stages
        .iter()
        .map(|s| (s.stage.as_str(), StageCounts::from(s)))
        .collect();

    Ok(Json(IndexAllResponse {
        success: report.success,
        results,
        errors: report.errors(),
        duration_ms: report.duration_ms,
        run_id: report.run_id,
    }))
}

async fn handle_cron_marketplaces(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<CronStageResponse>, AppError> {
    cron_stage(&state, &headers, Stage::Marketplaces).await
}

async fn handle_cron_mcp_servers(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<CronStageResponse>, AppError> {
    cron_stage(&state, &headers, Stage::McpServers).await
}

async fn handle_cron_plugins(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<CronStageResponse>, AppError> {
    cron_stage(&state, &headers, Stage::Plugins).await
}

async fn handle_cron_mcp_stats(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<CronStageResponse>, AppError> {
    cron_stage(&state, &headers, Stage::McpStats).await
}

async fn cron_stage(
    state: &AppState,
    headers: &HeaderMap,
    stage: Stage,
) -> Result<Json<CronStageResponse>, AppError> {
    let report = cron_trigger(state, headers, Pipeline::from(stage)).await?;
    let counts = report
        .stage(stage)
        .map(StageCounts::from)
        .unwrap_or_else(|| StageCounts::from(&StageReport::new(stage)));

    Ok(Json(CronStageResponse {
        run_id: report.run_id,
        counts,
    }))
}

async fn cron_trigger(
    state: &AppState,
    headers: &HeaderMap,
    pipeline: Pipeline,
) -> Result<RunReport, AppError> {
    authorize_cron(state.secrets.cron_secret.as_deref(), authorization(headers))?;
    Ok(state
        .coordinator
        .trigger(pipeline, TriggerSource::Cron)
        .await?)
}
