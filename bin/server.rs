// PSD2 Account Aggregator - Query Server
// Read-only REST surface over the unified store for the query agent

use anyhow::Context;
use axum::{
    extract::State,
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use psd2_aggregator::{
    describe_store, list_tables, open_read_only, render_schema, run_read_only_query,
    PipelineError, QueryResult, ServerConfig, TableSchema,
};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Shared application state
#[derive(Clone)]
struct AppState {
    db: Arc<Mutex<Connection>>,
    row_limit: usize,
}

impl AppState {
    fn conn(&self) -> Result<MutexGuard<'_, Connection>, ApiError> {
        self.db
            .lock()
            .map_err(|_| ApiError::internal("database connection poisoned"))
    }
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn internal(message: impl Into<String>) -> Self {
        ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::QueryRejected(_) => {
                warn!(error = %err, "query rejected");
                ApiError {
                    status: StatusCode::BAD_REQUEST,
                    message: err.to_string(),
                }
            }
            // Malformed SQL from the agent is a client error too
            PipelineError::Sqlite(rusqlite::Error::SqliteFailure(_, _)) => ApiError {
                status: StatusCode::BAD_REQUEST,
                message: err.to_string(),
            },
            other => {
                error!(error = %other, "request failed");
                ApiError::internal(other.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(self.message),
        };
        (self.status, Json(body)).into_response()
    }
}

#[derive(Serialize)]
struct SchemaResponse {
    tables: Vec<TableSchema>,
    /// Plain-text rendering for prompt construction
    text: String,
}

#[derive(Deserialize)]
struct QueryRequest {
    sql: String,
    limit: Option<usize>,
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::ok("OK"))
}

/// GET /api/schema - Tables with their columns
async fn get_schema(State(state): State<AppState>) -> Result<Json<ApiResponse<SchemaResponse>>, ApiError> {
    let conn = state.conn()?;
    let tables = describe_store(&conn)?;
    let text = render_schema(&tables);

    Ok(Json(ApiResponse::ok(SchemaResponse { tables, text })))
}

/// GET /api/tables - Table names only
async fn get_tables(State(state): State<AppState>) -> Result<Json<ApiResponse<Vec<String>>>, ApiError> {
    let conn = state.conn()?;
    Ok(Json(ApiResponse::ok(list_tables(&conn)?)))
}

/// POST /api/query - Run one read-only statement
async fn post_query(
    State(state): State<AppState>,
    Json(request): Json<QueryRequest>,
) -> Result<Json<ApiResponse<QueryResult>>, ApiError> {
    let limit = request
        .limit
        .map(|l| l.min(state.row_limit))
        .unwrap_or(state.row_limit);

    let conn = state.conn()?;
    let result = run_read_only_query(&conn, &request.sql, Some(limit))?;
    info!(rows = result.rows.len(), truncated = result.truncated, "query served");

    Ok(Json(ApiResponse::ok(result)))
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|o| o == "*") {
        return CorsLayer::permissive();
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
        .allow_headers([axum::http::header::CONTENT_TYPE])
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("🌐 PSD2 Account Aggregator - Query Server");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let config = ServerConfig::from_env()?;

    if !config.unified_db.exists() {
        eprintln!("❌ Unified database not found at {}", config.unified_db.display());
        eprintln!("   Run: psd2-aggregator run");
        eprintln!("   to build it first.");
        std::process::exit(1);
    }

    let conn = open_read_only(&config.unified_db)
        .with_context(|| format!("opening {}", config.unified_db.display()))?;
    println!("✓ Database opened (read-only): {}", config.unified_db.display());

    // Create shared state
    let state = AppState {
        db: Arc::new(Mutex::new(conn)),
        row_limit: config.row_limit,
    };

    // Build API routes
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/schema", get(get_schema))
        .route("/tables", get(get_tables))
        .route("/query", post(post_query))
        .with_state(state);

    let app = Router::new().nest("/api", api_routes).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(cors_layer(&config.cors_allow)),
    );

    // Start server
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;

    println!("\n🚀 Server running on http://{}", config.listen_addr);
    println!("   Schema: http://{}/api/schema", config.listen_addr);
    println!("   Query:  POST http://{}/api/query", config.listen_addr);
    println!("\n   Press Ctrl+C to stop\n");

    axum::serve(listener, app).await.context("server error")?;

    Ok(())
}
