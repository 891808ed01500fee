use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, put};
use axum::{Json, Router};
use category_tree_api::{AddCategoryRequest, CategoryTreeApi, Envelope, API_CONTRACT_VERSION};
use category_tree_core::{Category, ErrorKind, TreeError};
use category_tree_store_sqlite::SchemaStatus;
use clap::Parser;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";

#[derive(Debug, Clone)]
struct ServiceState {
    api: CategoryTreeApi,
}

/// Body of every non-2xx response.
#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    status_code: u16,
    error: &'static str,
    message: String,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    service_contract_version: &'static str,
    api_contract_version: &'static str,
}

#[derive(Debug, Parser)]
#[command(name = "category-tree-service")]
#[command(about = "HTTP service for a hierarchical category tree")]
struct Args {
    #[arg(long, env = "CATEGORY_TREE_DB", default_value = "./category_tree.sqlite3")]
    db: PathBuf,
    #[arg(long, env = "CATEGORY_TREE_BIND", default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    /// Fallback tracing filter when `RUST_LOG` is unset.
    #[arg(long, env = "CATEGORY_TREE_LOG", default_value = "info")]
    log_filter: String,
}

impl ServiceError {
    fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { status_code: kind.http_status(), error: kind.as_str(), message: message.into() }
    }
}

impl From<TreeError> for ServiceError {
    fn from(err: TreeError) -> Self {
        Self::new(err.kind(), err.message())
    }
}

impl From<JsonRejection> for ServiceError {
    fn from(rejection: JsonRejection) -> Self {
        Self::new(ErrorKind::BadRequest, rejection.body_text())
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status_code)
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(
                status = self.status_code,
                kind = self.error,
                message = %self.message,
                "request failed"
            );
        } else {
            tracing::warn!(
                status = self.status_code,
                kind = self.error,
                message = %self.message,
                "request rejected"
            );
        }
        (status, Json(self)).into_response()
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/db/schema-version", get(db_schema_version))
        .route("/categories", get(list_categories).post(add_category))
        .route("/categories/single/:id", get(get_category))
        .route("/categories/with-first-direct-children/:id", get(get_category_with_first_children))
        .route("/categories/with-all-children/:id", get(get_category_with_all_children))
        .route("/categories/remove/:id", delete(remove_category))
        .route(
            "/categories/move-subtree/:source_id/to/:destination_parent_id",
            put(move_subtree),
        )
        .with_state(state)
}

fn init_tracing(fallback_filter: &str) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(fallback_filter)
            .with_context(|| format!("invalid log filter `{fallback_filter}`"))?,
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init()
        .map_err(|err| anyhow!("failed to initialise logging: {err}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_filter)?;

    let state = ServiceState { api: CategoryTreeApi::new(args.db) };
    tracing::info!(
        db = %state.api.db_path().display(),
        bind = %args.bind,
        "starting category tree service"
    );
    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;
    axum::serve(listener, app(state)).await.context("category tree service stopped")?;
    Ok(())
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
    })
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> Result<Json<SchemaStatus>, ServiceError> {
    let status = state
        .api
        .schema_status()
        .map_err(|err| ServiceError::new(ErrorKind::Internal, format!("{err:#}")))?;
    Ok(Json(status))
}

async fn add_category(
    State(state): State<ServiceState>,
    request: Result<Json<AddCategoryRequest>, JsonRejection>,
) -> Result<Json<Envelope<Category>>, ServiceError> {
    let Json(request) = request?;
    Ok(Json(state.api.add_category(request)?))
}

async fn list_categories(
    State(state): State<ServiceState>,
) -> Result<Json<Envelope<Vec<Category>>>, ServiceError> {
    Ok(Json(state.api.get_all_categories()?))
}

async fn get_category(
    State(state): State<ServiceState>,
    Path(id): Path<String>,
) -> Result<Json<Envelope<Category>>, ServiceError> {
    Ok(Json(state.api.get_category_by_id(&id)?))
}

async fn get_category_with_first_children(
    State(state): State<ServiceState>,
    Path(id): Path<String>,
) -> Result<Json<Envelope<Category>>, ServiceError> {
    Ok(Json(state.api.get_category_and_first_descendants_by_id(&id)?))
}

async fn get_category_with_all_children(
    State(state): State<ServiceState>,
    Path(id): Path<String>,
) -> Result<Json<Envelope<Category>>, ServiceError> {
    Ok(Json(state.api.get_category_and_all_descendants_by_id(&id)?))
}

async fn remove_category(
    State(state): State<ServiceState>,
    Path(id): Path<String>,
) -> Result<Json<Envelope<()>>, ServiceError> {
    Ok(Json(state.api.remove_category_by_id(&id)?))
}

async fn move_subtree(
    State(state): State<ServiceState>,
    Path((source_id, destination_parent_id)): Path<(String, String)>,
) -> Result<Json<Envelope<Category>>, ServiceError> {
    Ok(Json(state.api.move_subtree(&source_id, &destination_parent_id)?))
}
