use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use piaxis_api::{
    LibraryPage, MigrateResult, PiaxisApi, SecureDetailsResponse, SuggestRequest,
    API_CONTRACT_VERSION,
};
use piaxis_core::{DetailSummary, PiaxisError, Suggestion};
use piaxis_store_sqlite::{AccessFixReport, SchemaStatus};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const IDENTITY_HEADER: &str = "x-user-email";

#[derive(Debug, Clone)]
struct ServiceState {
    api: PiaxisApi,
    intern_email: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    error: String,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct SearchParams {
    q: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    service_contract_version: &'static str,
    api_contract_version: &'static str,
}

#[derive(Debug, Clone, Serialize)]
struct FixResponse {
    success: bool,
    message: String,
    report: AccessFixReport,
}

#[derive(Debug, Parser)]
#[command(name = "piaxis-service")]
#[command(about = "HTTP service for the PiAxis detail catalog")]
struct Args {
    #[arg(long, env = "PIAXIS_DB", default_value = "./piaxis.sqlite3")]
    db: PathBuf,
    #[arg(long, env = "PIAXIS_BIND", default_value = "127.0.0.1:4010")]
    bind: SocketAddr,
    /// User demoted to intern by `POST /admin/fix-rls`.
    #[arg(long, env = "PIAXIS_INTERN_EMAIL")]
    intern_email: Option<String>,
    /// Load the demo accounts and details before serving.
    #[arg(long, default_value_t = false)]
    seed_demo: bool,
}

impl ServiceError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self { status, error: message.into() }
    }
}

impl From<PiaxisError> for ServiceError {
    fn from(err: PiaxisError) -> Self {
        match err {
            PiaxisError::MissingIdentity => {
                Self::new(StatusCode::BAD_REQUEST, format!("Missing header: {IDENTITY_HEADER}"))
            }
            PiaxisError::UnknownIdentity(_) => {
                Self::new(StatusCode::UNAUTHORIZED, "User not found in users table")
            }
            PiaxisError::Validation(message) => Self::new(StatusCode::BAD_REQUEST, message),
            PiaxisError::Storage(message) | PiaxisError::Transaction(message) => {
                tracing::error!(error = %message, "request failed");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
            }
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/details", get(details_list))
        .route("/details/search", get(details_search))
        .route("/suggest", post(suggest))
        .route("/secure/details", get(secure_details))
        .route("/admin/fix-rls", post(admin_fix_rls))
        .route("/library", get(library))
        .route("/db/schema-version", post(db_schema_version))
        .route("/db/migrate", post(db_migrate))
        .with_state(state)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let api = PiaxisApi::new(args.db);
    if args.seed_demo {
        let summary = api.seed_demo()?;
        tracing::info!(?summary, "demo catalog ready");
    }

    let state = ServiceState { api, intern_email: args.intern_email };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, "piaxis service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
    })
}

async fn details_list(
    State(state): State<ServiceState>,
) -> Result<Json<Vec<DetailSummary>>, ServiceError> {
    Ok(Json(state.api.list_details()?))
}

async fn details_search(
    State(state): State<ServiceState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<Vec<DetailSummary>>, ServiceError> {
    Ok(Json(state.api.search_details(params.q.as_deref())?))
}

async fn suggest(
    State(state): State<ServiceState>,
    body: Result<Json<SuggestRequest>, JsonRejection>,
) -> Result<Json<Suggestion>, ServiceError> {
    let Json(request) = body.map_err(|rejection| {
        ServiceError::new(
            StatusCode::BAD_REQUEST,
            format!("invalid request body: {}", rejection.body_text()),
        )
    })?;
    Ok(Json(state.api.suggest(request)?))
}

async fn secure_details(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Json<SecureDetailsResponse>, ServiceError> {
    let email = headers
        .get(IDENTITY_HEADER)
        .map(|value| {
            value.to_str().map_err(|_| {
                PiaxisError::Validation(format!("Malformed header: {IDENTITY_HEADER}"))
            })
        })
        .transpose()?;
    Ok(Json(state.api.secure_details(email)?))
}

async fn admin_fix_rls(State(state): State<ServiceState>) -> Result<Json<FixResponse>, ServiceError> {
    let report = state.api.fix_access(state.intern_email.as_deref())?;
    Ok(Json(FixResponse {
        success: true,
        message: format!("RLS fixed and {} updated to intern", report.intern_email),
        report,
    }))
}

async fn library(
    State(state): State<ServiceState>,
    Query(params): Query<SearchParams>,
) -> (StatusCode, Json<LibraryPage>) {
    let page = state.api.library(params.q.as_deref());
    let status = match page {
        LibraryPage::Available { .. } => StatusCode::OK,
        LibraryPage::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, Json(page))
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> Result<Json<SchemaStatus>, ServiceError> {
    Ok(Json(state.api.schema_status()?))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> Result<Json<MigrateResult>, ServiceError> {
    Ok(Json(state.api.migrate(request.dry_run)?))
}
