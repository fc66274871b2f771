use std::net::SocketAddr;
use std::path::PathBuf;

use answer_gate_api::{
    load_config, AnswerGateApi, ContextBuildRequest, GateRunRequest, API_CONTRACT_VERSION,
};
use answer_gate_core::{ContextPack, DecisionTrace, FinalAnswerResponse, GateConfig, PipelineLayer};
use answer_gate_store_sqlite::{AuditSummary, TraceFilter};
use anyhow::{anyhow, Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");

#[derive(Debug, Clone)]
struct ServiceState {
    api: AnswerGateApi,
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

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    judge: &'static str,
}

#[derive(Debug, Clone, Serialize)]
struct GateRunResponse {
    response: FinalAnswerResponse,
    trace: DecisionTrace,
}

#[derive(Debug, Clone, Serialize)]
struct TraceListResponse {
    count: usize,
    traces: Vec<DecisionTrace>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct TraceListQuery {
    allowed: Option<bool>,
    failure_layer: Option<String>,
    limit: Option<usize>,
}

#[derive(Debug, Parser)]
#[command(name = "answer-gate-service")]
#[command(about = "Local HTTP service for the answer gate")]
struct Args {
    #[arg(long, default_value = "./answer_gate.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, default_value = "info")]
    log_level: String,
    #[arg(long, default_value_t = false)]
    log_json: bool,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status;
        (status, Json(self)).into_response()
    }
}

impl ServiceState {
    fn error(message: impl Into<String>) -> ServiceError {
        Self::error_with_status(StatusCode::BAD_REQUEST, message)
    }

    fn error_with_status(status: StatusCode, message: impl Into<String>) -> ServiceError {
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
        .route("/v1/context/build", post(context_build))
        .route("/v1/gate/run", post(gate_run))
        .route("/v1/audit/traces", get(audit_traces))
        .route("/v1/audit/traces/:query_id", get(audit_trace_show))
        .route("/v1/audit/summary", get(audit_summary))
        .with_state(state)
}

fn init_tracing(level: &str, json: bool) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level)
            .with_context(|| format!("invalid --log-level filter: {level}"))?,
    };
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr);
    let installed = if json { builder.json().try_init() } else { builder.try_init() };
    installed.map_err(|err| anyhow!("failed to install tracing subscriber: {err}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level, args.log_json)?;

    let config = match args.config.as_deref() {
        Some(path) => load_config(path)?,
        None => GateConfig::default(),
    };
    let api = AnswerGateApi::new(args.db, config);
    api.migrate(false)?;

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(
        bind = %args.bind,
        judge = api.config().judge.kind(),
        "answer gate service listening"
    );
    axum::serve(listener, app(ServiceState { api })).await?;
    Ok(())
}

async fn health(State(state): State<ServiceState>) -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok", judge: state.api.config().judge.kind() }))
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn context_build(
    State(state): State<ServiceState>,
    Json(request): Json<ContextBuildRequest>,
) -> Result<Json<ServiceEnvelope<ContextPack>>, ServiceError> {
    let pack =
        state.api.build_context(request).map_err(|err| ServiceState::error(format!("{err:#}")))?;
    Ok(Json(envelope(pack)))
}

async fn gate_run(
    State(state): State<ServiceState>,
    Json(request): Json<GateRunRequest>,
) -> Result<Json<ServiceEnvelope<GateRunResponse>>, ServiceError> {
    // Judge calls may block on the network.
    let outcome = tokio::task::spawn_blocking(move || state.api.run_gate(request))
        .await
        .map_err(|err| {
            ServiceState::error_with_status(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("gate worker failed: {err}"),
            )
        })?
        .map_err(|err| ServiceState::error(format!("{err:#}")))?;
    Ok(Json(envelope(GateRunResponse { response: outcome.response, trace: outcome.trace })))
}

async fn audit_traces(
    State(state): State<ServiceState>,
    Query(query): Query<TraceListQuery>,
) -> Result<Json<ServiceEnvelope<TraceListResponse>>, ServiceError> {
    let failure_layer = query
        .failure_layer
        .as_deref()
        .map(PipelineLayer::parse)
        .transpose()
        .map_err(|err| ServiceState::error(err.to_string()))?;
    let filter = TraceFilter { allowed: query.allowed, failure_layer, limit: query.limit };
    let traces =
        state.api.list_traces(&filter).map_err(|err| ServiceState::error(format!("{err:#}")))?;
    Ok(Json(envelope(TraceListResponse { count: traces.len(), traces })))
}

async fn audit_trace_show(
    State(state): State<ServiceState>,
    Path(query_id): Path<String>,
) -> Result<Json<ServiceEnvelope<DecisionTrace>>, ServiceError> {
    let trace =
        state.api.find_trace(&query_id).map_err(|err| ServiceState::error(format!("{err:#}")))?;
    match trace {
        Some(trace) => Ok(Json(envelope(trace))),
        None => Err(ServiceState::error_with_status(
            StatusCode::NOT_FOUND,
            format!("decision trace not found: {query_id}"),
        )),
    }
}

async fn audit_summary(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<AuditSummary>>, ServiceError> {
    let summary =
        state.api.audit_summary().map_err(|err| ServiceState::error(format!("{err:#}")))?;
    Ok(Json(envelope(summary)))
}
