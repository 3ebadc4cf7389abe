use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use axum::body::Bytes;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use record_analytics_api::{
    AnalyzeRequest, ApiError, DashboardView, DeleteResult, MigrateResult, RecordAnalyticsApi,
    API_CONTRACT_VERSION,
};
use record_analytics_core::{AnalysisResult, Record, RecordId, RecordInput};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");

#[derive(Debug, Clone)]
struct ServiceState {
    api: RecordAnalyticsApi,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    service_contract_version: &'static str,
    error: String,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Parser)]
#[command(name = "record-analytics-service")]
#[command(about = "Local HTTP service for record analytics")]
struct Args {
    #[arg(long, default_value = "./record_analytics.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

impl From<ApiError> for ServiceError {
    fn from(err: ApiError) -> Self {
        let status = match &err {
            ApiError::Invalid(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Processing(_) | ApiError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %format!("{err:#}"), "request failed");
        }
        ServiceState::error(status, format!("{err:#}"))
    }
}

impl From<JsonRejection> for ServiceError {
    fn from(rejection: JsonRejection) -> Self {
        ServiceState::error(StatusCode::BAD_REQUEST, rejection.body_text())
    }
}

impl ServiceState {
    fn error(status: StatusCode, message: impl Into<String>) -> ServiceError {
        ServiceError {
            status,
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: message.into(),
        }
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/dashboard", get(dashboard))
        .route("/v1/analyze", post(analyze))
        .route("/v1/records", get(records_list).post(records_create))
        .route("/v1/records/:id", get(records_show).put(records_update).delete(records_delete))
        .with_state(state)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let state = ServiceState { api: RecordAnalyticsApi::new(args.db.clone()) };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, db = %args.db.display(), "service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<record_analytics_store_sqlite::SchemaStatus>>, ServiceError> {
    let status = state.api.schema_status()?;
    Ok(Json(envelope(status)))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    request: Result<Json<MigrateRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<MigrateResult>>, ServiceError> {
    let Json(request) = request?;
    let result = state.api.migrate(request.dry_run)?;
    Ok(Json(envelope(result)))
}

async fn dashboard(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<DashboardView>>, ServiceError> {
    let view = state.api.dashboard()?;
    Ok(Json(envelope(view)))
}

async fn analyze(
    State(state): State<ServiceState>,
    body: Bytes,
) -> Result<Json<ServiceEnvelope<AnalysisResult>>, ServiceError> {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        AnalyzeRequest::default()
    } else {
        serde_json::from_slice::<AnalyzeRequest>(&body).map_err(|err| {
            ServiceState::error(StatusCode::BAD_REQUEST, format!("invalid analyze request: {err}"))
        })?
    };
    let result = state.api.analyze(&request)?;
    Ok(Json(envelope(result)))
}

async fn records_list(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<Vec<Record>>>, ServiceError> {
    let records = state.api.list_records()?;
    Ok(Json(envelope(records)))
}

async fn records_create(
    State(state): State<ServiceState>,
    payload: Result<Json<RecordInput>, JsonRejection>,
) -> Result<(StatusCode, Json<ServiceEnvelope<Record>>), ServiceError> {
    let Json(input) = payload?;
    let record = state.api.create_record(input)?;
    Ok((StatusCode::CREATED, Json(envelope(record))))
}

async fn records_show(
    State(state): State<ServiceState>,
    Path(id): Path<RecordId>,
) -> Result<Json<ServiceEnvelope<Record>>, ServiceError> {
    let record = state.api.get_record(id)?;
    Ok(Json(envelope(record)))
}

async fn records_update(
    State(state): State<ServiceState>,
    Path(id): Path<RecordId>,
    payload: Result<Json<RecordInput>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<Record>>, ServiceError> {
    let Json(input) = payload?;
    let record = state.api.update_record(id, input)?;
    Ok(Json(envelope(record)))
}

async fn records_delete(
    State(state): State<ServiceState>,
    Path(id): Path<RecordId>,
) -> Result<Json<ServiceEnvelope<DeleteResult>>, ServiceError> {
    let result = state.api.delete_record(id)?;
    Ok(Json(envelope(result)))
}
