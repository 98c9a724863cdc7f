//! Runtime HTTP server for published dashboards.
//!
//! Serves cached search results to the web frontend and, when the built
//! frontend is present, the frontend itself.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Status, version, datasource and cache counts |
//! | `GET`  | `/api/data/{dsid}` | Datasource results through the result cache |
//! | `GET`  | `/api/dashboards` | The `_dashboards.json` manifest |
//! | `GET`  | `/api/dashboards/{id}` | A published `definition.json` |
//! | `GET`  | `/api/export/{dsid}/{format}` | Fresh results as `csv` or `json` |
//!
//! Anything else falls through to the static directory (`server.static_dir`).
//!
//! # Error Contract
//!
//! Errors are JSON objects with at least `error` and `message`. A search
//! failure with nothing cached answers `500` with:
//!
//! ```json
//! { "error": "Unable to start Splunk search job", "message": "...", "details": "...",
//!   "searchTime": 12, "datasourceId": "...", "suggestions": ["..."], "timestamp": "..." }
//! ```
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted.

use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;

use crate::cache::{execute_uncached, CacheOutcome, CacheSettings, ResultCache, SystemClock, SUGGESTIONS};
use crate::config::Config;
use crate::datasources::DatasourceManifest;
use crate::models::SearchResults;
use crate::publish::ProjectLayout;
use crate::retry::RetryPolicy;
use crate::search::{SearchDispatcher, SearchExecutor, SearchSettings};
use crate::splunkd::Splunkd;
use crate::transport::ReqwestTransport;

/// Number of ids listed in a datasource-not-found response.
const AVAILABLE_PREVIEW: usize = 10;

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    datasources: Arc<DatasourceManifest>,
    cache: Arc<ResultCache>,
    retry: RetryPolicy,
    layout: Arc<ProjectLayout>,
}

impl AppState {
    pub fn new(
        datasources: DatasourceManifest,
        cache: Arc<ResultCache>,
        retry: RetryPolicy,
        layout: ProjectLayout,
    ) -> Self {
        Self {
            datasources: Arc::new(datasources),
            cache,
            retry,
            layout: Arc::new(layout),
        }
    }
}

/// Load `_datasources.json`. A missing or malformed manifest is logged and
/// yields an empty map so the server still starts.
pub fn load_datasources(path: &std::path::Path) -> DatasourceManifest {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "failed to read datasource manifest");
            return DatasourceManifest::new();
        }
    };
    match serde_json::from_str::<DatasourceManifest>(&content) {
        Ok(manifest) => {
            tracing::info!(count = manifest.len(), "loaded datasources");
            manifest
        }
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "failed to parse datasource manifest");
            DatasourceManifest::new()
        }
    }
}

/// User namespace for search jobs: the token's user, else the configured
/// user, else `nobody`.
pub async fn resolve_owner(splunkd: &Splunkd, config: &Config) -> String {
    match splunkd.current_username().await {
        Ok(user) => {
            tracing::info!(user = %user, "fetched Splunk user");
            user
        }
        Err(e) => {
            let fallback = config
                .splunkd
                .username
                .clone()
                .unwrap_or_else(|| "nobody".to_string());
            tracing::warn!(error = %format!("{:#}", e), user = %fallback, "failed to fetch Splunk user, using default");
            fallback
        }
    }
}

/// The API routes, without static file serving.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/api/data/{dsid}", get(handle_data))
        .route("/api/dashboards", get(handle_dashboards))
        .route("/api/dashboards/{id}", get(handle_definition))
        .route("/api/export/{dsid}/{format}", get(handle_export))
        .layer(cors)
        .with_state(state)
}

/// Starts the runtime server.
///
/// Binds to `[server].bind` and runs until the process is terminated.
pub async fn run_server(config: &Config) -> Result<()> {
    let transport = Arc::new(ReqwestTransport::new(&config.splunkd)?);
    let splunkd = Splunkd::from_config(&config.splunkd, transport)?;
    let owner = resolve_owner(&splunkd, config).await;

    let executor: Arc<dyn SearchExecutor> = Arc::new(SearchDispatcher::new(
        splunkd,
        owner,
        SearchSettings::from_config(config),
    ));
    let retry = RetryPolicy::from_config(&config.server.retry);
    let cache = Arc::new(ResultCache::new(
        executor,
        retry,
        CacheSettings::from_config(&config.server),
        Arc::new(SystemClock),
    ));
    cache.spawn_sweeper(Duration::from_secs(config.server.cache.sweep_interval_secs));

    let layout = ProjectLayout::new(&config.server.project_dir);
    let datasources = load_datasources(&layout.datasources_manifest());
    let state = AppState::new(datasources, cache, retry, layout);

    let mut app = build_router(state);
    let static_dir = &config.server.static_dir;
    if static_dir.is_dir() {
        app = app.fallback_service(ServeDir::new(static_dir));
    } else {
        tracing::warn!(dir = %static_dir.display(), "static directory not found, serving API only");
    }

    let bind_addr = config.server.bind.clone();
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", bind_addr))?;
    println!("dashpub server listening on http://{}", bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

/// Error type that converts into a JSON HTTP response.
struct AppError {
    status: StatusCode,
    body: Value,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

fn bad_request(error: &str, message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        body: json!({ "error": error, "message": message.into() }),
    }
}

fn not_found(error: &str, message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        body: json!({ "error": error, "message": message.into() }),
    }
}

fn internal(error: &str, details: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        body: json!({ "error": error, "details": details.into() }),
    }
}

fn datasource_not_found(state: &AppState, dsid: &str) -> AppError {
    tracing::warn!(dsid, available = state.datasources.len(), "datasource not found");
    let mut err = not_found(
        "Datasource not found",
        format!("The requested datasource '{}' does not exist in the system.", dsid),
    );
    if let Some(obj) = err.body.as_object_mut() {
        let available: Vec<&String> = state.datasources.keys().take(AVAILABLE_PREVIEW).collect();
        obj.insert("availableDatasources".into(), json!(available));
        obj.insert("totalCount".into(), json!(state.datasources.len()));
    }
    err
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

// ============ GET /health ============

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: String,
    version: String,
    datasources: usize,
    cache_entries: usize,
    timestamp: String,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        datasources: state.datasources.len(),
        cache_entries: state.cache.len(),
        timestamp: now_rfc3339(),
    })
}

// ============ GET /api/data/{dsid} ============

async fn handle_data(
    State(state): State<AppState>,
    Path(dsid): Path<String>,
) -> Result<Response, AppError> {
    let started = Instant::now();
    let datasource = state
        .datasources
        .get(&dsid)
        .ok_or_else(|| datasource_not_found(&state, &dsid))?;
    tracing::debug!(dsid = %dsid, app = ?datasource.app, "datasource found");

    match state.cache.get_or_fetch(datasource).await {
        Ok(cached) => {
            let mut response = Json(cached.results).into_response();
            if cached.outcome != CacheOutcome::Stale {
                let value = format!("s-maxage={}, stale-while-revalidate", cached.refresh_secs);
                if let Ok(value) = HeaderValue::from_str(&value) {
                    response.headers_mut().insert(header::CACHE_CONTROL, value);
                }
            }
            Ok(response)
        }
        Err(failure) => Err(AppError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            body: json!({
                "error": failure.error,
                "message": failure.message,
                "details": failure.details,
                "searchTime": started.elapsed().as_millis() as u64,
                "datasourceId": dsid,
                "suggestions": SUGGESTIONS,
                "timestamp": now_rfc3339(),
            }),
        }),
    }
}

// ============ GET /api/dashboards[/{id}] ============

async fn read_json(path: &std::path::Path) -> Result<Option<Value>, AppError> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| internal("Malformed JSON file", format!("{}: {}", path.display(), e))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(internal("Failed to read file", e.to_string())),
    }
}

async fn handle_dashboards(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    read_json(&state.layout.dashboards_manifest())
        .await?
        .map(Json)
        .ok_or_else(|| not_found("Dashboards not found", "No dashboards have been published."))
}

async fn handle_definition(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    if id.is_empty() || id.starts_with('.') || id.contains(['/', '\\']) {
        return Err(bad_request("Invalid dashboard id", format!("'{}' is not a dashboard id", id)));
    }
    let path = state.layout.dashboard_dir(&id).join("definition.json");
    read_json(&path).await?.map(Json).ok_or_else(|| {
        not_found(
            "Dashboard not found",
            format!("The requested dashboard '{}' does not exist.", id),
        )
    })
}

// ============ GET /api/export/{dsid}/{format} ============

/// Render columnar results as CSV with RFC 4180 quoting.
pub fn results_to_csv(results: &SearchResults) -> String {
    if results.fields.is_empty() {
        return "No data available".to_string();
    }
    let names: Vec<String> = results
        .fields
        .iter()
        .map(|f| match f {
            Value::String(s) => s.clone(),
            Value::Object(o) => o
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            other => other.to_string(),
        })
        .collect();

    let mut lines = vec![names.iter().map(|n| csv_cell(n)).collect::<Vec<_>>().join(",")];
    for row in 0..results.row_count() {
        let cells: Vec<String> = (0..names.len())
            .map(|col| {
                let value = results.columns.get(col).and_then(|c| c.get(row));
                match value {
                    None | Some(Value::Null) => String::new(),
                    Some(Value::String(s)) => csv_cell(s),
                    Some(other) => csv_cell(&other.to_string()),
                }
            })
            .collect();
        lines.push(cells.join(","));
    }
    lines.join("\n")
}

fn csv_cell(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

async fn handle_export(
    State(state): State<AppState>,
    Path((dsid, format)): Path<(String, String)>,
) -> Result<Response, AppError> {
    if format != "csv" && format != "json" {
        tracing::warn!(dsid = %dsid, format = %format, "invalid export format requested");
        return Err(bad_request("Invalid export format", "Supported formats: csv, json"));
    }
    let datasource = state
        .datasources
        .get(&dsid)
        .ok_or_else(|| datasource_not_found(&state, &dsid))?;

    let data = execute_uncached(state.cache.executor(), &state.retry, datasource)
        .await
        .map_err(|e| {
            tracing::error!(dsid = %dsid, format = %format, error = %format!("{:#}", e), "data export failed");
            internal("Failed to export data", format!("{:#}", e))
        })?;

    let timestamp = chrono::Utc::now().format("%Y-%m-%dT%H-%M-%S-%3fZ").to_string();
    let filename = format!("{}_{}_{}.{}", dsid, format, timestamp, format);
    let disposition = format!("attachment; filename=\"{}\"", filename);
    tracing::info!(dsid = %dsid, filename = %filename, records = data.meta.total_count, "export completed");

    let mut response = if format == "csv" {
        (
            [(header::CONTENT_TYPE, "text/csv; charset=utf-8")],
            results_to_csv(&data),
        )
            .into_response()
    } else {
        Json(json!({
            "exportInfo": {
                "datasourceId": dsid,
                "format": "json",
                "timestamp": now_rfc3339(),
                "recordCount": data.meta.total_count,
            },
            "data": data,
        }))
        .into_response()
    };
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn results(fields: Value, columns: Value) -> SearchResults {
        SearchResults {
            fields: serde_json::from_value(fields).unwrap(),
            columns: serde_json::from_value(columns).unwrap(),
            ..Default::default()
        }
    }

    #[test]
    fn csv_quotes_special_values() {
        let r = results(
            json!(["host", {"name": "msg"}, "count"]),
            json!([["a", "b"], ["plain", "say \"hi\", then\nleave"], [1, null]]),
        );
        assert_eq!(
            results_to_csv(&r),
            "host,msg,count\na,plain,1\nb,\"say \"\"hi\"\", then\nleave\","
        );
    }

    #[test]
    fn csv_without_fields() {
        assert_eq!(results_to_csv(&SearchResults::default()), "No data available");
    }

    #[test]
    fn missing_manifest_degrades_to_empty() {
        let tmp = TempDir::new().unwrap();
        assert!(load_datasources(&tmp.path().join("absent.json")).is_empty());
        let bad = tmp.path().join("_datasources.json");
        std::fs::write(&bad, "{ not json").unwrap();
        assert!(load_datasources(&bad).is_empty());
    }

    #[test]
    fn manifest_is_keyed_by_id() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("_datasources.json");
        std::fs::write(
            &path,
            r#"{"abc": {"id": "abc", "app": "search", "search": {"query": "index=main", "refresh": 30}}}"#,
        )
        .unwrap();
        let manifest = load_datasources(&path);
        assert_eq!(manifest["abc"].search.refresh, Some(30));
    }
}
