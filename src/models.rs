//! Core data models shared by the publish pipeline and the runtime server.
//!
//! These types describe what flows between the stages: resolved assets on
//! the publish side, datasource descriptors linking the two halves, and the
//! columnar search results handed to the web frontend.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Coarse classification scoping where an opaque asset reference is looked up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssetCategory {
    Icons,
    Images,
}

impl AssetCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetCategory::Icons => "icons",
            AssetCategory::Images => "images",
        }
    }
}

/// A stored, content-addressed asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAsset {
    /// Truncated hex digest of the normalized bytes.
    pub content_hash: String,
    pub mime_type: String,
    /// `<hash>_<base><ext>`, relative to the asset directory.
    pub stored_filename: String,
}

/// A named, cached query against the search backend.
///
/// Loaded from `_datasources.json` at server startup and immutable for the
/// lifetime of the process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatasourceDescriptor {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app: Option<String>,
    pub search: SearchSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SearchSpec {
    pub query: String,
    #[serde(default)]
    pub query_parameters: Map<String, Value>,
    /// Refresh interval in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postprocess: Option<String>,
}

impl SearchSpec {
    /// `earliest` / `latest` query parameter as a plain string.
    pub fn time_bound(&self, key: &str) -> String {
        match self.query_parameters.get(key) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        }
    }
}

/// Columnar search output returned to the frontend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SearchResults {
    pub fields: Vec<Value>,
    pub columns: Vec<Vec<Value>>,
    pub meta: SearchMeta,
}

impl SearchResults {
    /// Number of rows (length of the first column).
    pub fn row_count(&self) -> usize {
        self.columns.first().map(|c| c.len()).unwrap_or(0)
    }
}

/// Millisecond breakdown of one dispatch/poll/results cycle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Timing {
    pub dispatch: u64,
    pub wait: u64,
    pub results: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SearchMeta {
    pub sid: String,
    pub percent_complete: u8,
    pub status: String,
    pub total_count: usize,
    pub last_updated: String,
    pub timing: Timing,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_time: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datasource_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_cache: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_age: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_refresh: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StaleError>,
}

/// Error detail embedded in a stale response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StaleError {
    pub message: String,
    pub details: String,
    pub timestamp: String,
}

/// One entry of `_dashboards.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DashboardInfo {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}
