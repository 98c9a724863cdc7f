//! Time-boxed result cache in front of the search executor.
//!
//! Entries are keyed by datasource id plus the JSON serialization of its
//! query parameters. A lookup behaves as follows:
//!
//! - **hit** (`now < expires_at`): cached results, no upstream call.
//! - **miss or expired**: execute with retry/backoff, store for
//!   `refresh` seconds, return fresh results.
//! - **refresh failed, old entry present**: serve the old entry marked
//!   stale, with a warning and the error detail in `meta`.
//! - **refresh failed, nothing cached**: a [`SearchFailure`] with a
//!   categorized, user-facing message.
//!
//! Concurrent misses on one key are coalesced: the first caller runs the
//! search while the others wait on a per-key lock and then read its
//! result. The sweeper only drops entries that have been expired for
//! longer than the stale retention window, so stale-serve keeps working
//! between sweeps.

use anyhow::Result;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::config::ServerConfig;
use crate::error::PublishError;
use crate::models::{DatasourceDescriptor, SearchResults, StaleError};
use crate::retry::RetryPolicy;
use crate::search::SearchExecutor;

pub const STALE_WARNING: &str = "Using expired cached data due to search failure";

/// Hints returned with every search failure.
pub const SUGGESTIONS: [&str; 5] = [
    "Check if Splunk is accessible and running",
    "Verify your authentication credentials",
    "Try reducing the time range for your search",
    "Check the search query syntax in your datasource configuration",
    "Review server logs for detailed error information",
];

/// Wall-clock source in epoch milliseconds.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    data: SearchResults,
    created_at: i64,
    expires_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheOutcome {
    Hit,
    Fresh,
    Stale,
}

#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub results: SearchResults,
    pub outcome: CacheOutcome,
    /// Refresh interval of the datasource, in seconds.
    pub refresh_secs: u64,
}

/// A search failure with nothing cached to fall back on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchFailure {
    /// Short category, e.g. "Unable to start Splunk search job".
    pub error: String,
    /// User-facing explanation.
    pub message: String,
    /// The underlying error text.
    pub details: String,
}

/// Map an execution error to a user-facing category.
pub fn classify_failure(err: &anyhow::Error) -> SearchFailure {
    let details = format!("{:#}", err);
    let (error, message) = match err.downcast_ref::<PublishError>() {
        Some(PublishError::Dispatch { .. }) => dispatch_category(),
        Some(PublishError::SearchExecution { .. }) => execution_category(),
        Some(PublishError::PollLimitExceeded { .. } | PublishError::Timeout { .. }) => {
            timeout_category()
        }
        _ if details.contains("Failed to dispatch job") => dispatch_category(),
        _ if details.contains("Search job failed") => execution_category(),
        _ if details.contains("timeout") || details.contains("timed out") => timeout_category(),
        _ => ("Failed to fetch data from Splunk", details.as_str()),
    };
    SearchFailure {
        error: error.to_string(),
        message: message.to_string(),
        details: details.clone(),
    }
}

fn dispatch_category() -> (&'static str, &'static str) {
    (
        "Unable to start Splunk search job",
        "The search request could not be initiated. Please check Splunk connectivity.",
    )
}

fn execution_category() -> (&'static str, &'static str) {
    (
        "Splunk search execution failed",
        "The search query encountered an error during execution.",
    )
}

fn timeout_category() -> (&'static str, &'static str) {
    (
        "Search request timed out",
        "The search took too long to complete. Please try a smaller time range.",
    )
}

/// Cache key: datasource id + serialized query parameters.
///
/// Parameters are held in a sorted map, so key order in the manifest does
/// not change the key.
pub fn cache_key(datasource: &DatasourceDescriptor) -> String {
    let params = serde_json::to_string(&datasource.search.query_parameters)
        .unwrap_or_else(|_| "{}".to_string());
    format!("{}_{}", datasource.id, params)
}

#[derive(Debug, Clone, Copy)]
pub struct CacheSettings {
    pub default_ttl_secs: u64,
    pub stale_retention: Duration,
}

impl CacheSettings {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            default_ttl_secs: config.default_ttl_secs,
            stale_retention: Duration::from_secs(config.cache.stale_retention_secs),
        }
    }
}

pub struct ResultCache {
    executor: Arc<dyn SearchExecutor>,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
    settings: CacheSettings,
    entries: Mutex<HashMap<String, CacheEntry>>,
    // Grows with the number of distinct keys, which the immutable
    // datasource manifest bounds.
    inflight: tokio::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ResultCache {
    pub fn new(
        executor: Arc<dyn SearchExecutor>,
        retry: RetryPolicy,
        settings: CacheSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            executor,
            retry,
            clock,
            settings,
            entries: Mutex::new(HashMap::new()),
            inflight: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn executor(&self) -> &Arc<dyn SearchExecutor> {
        &self.executor
    }

    /// TTL for a datasource: its refresh, else the configured default.
    pub fn refresh_secs(&self, datasource: &DatasourceDescriptor) -> u64 {
        datasource
            .search
            .refresh
            .unwrap_or(self.settings.default_ttl_secs)
    }

    pub fn len(&self) -> usize {
        self.lock_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, CacheEntry>> {
        // A panic while holding the lock cannot leave an entry half-written.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lookup(&self, key: &str) -> Option<CacheEntry> {
        self.lock_entries().get(key).cloned()
    }

    fn fresh_hit(&self, key: &str, datasource: &DatasourceDescriptor, started: Instant) -> Option<SearchResults> {
        let entry = self.lookup(key)?;
        let now = self.clock.now_ms();
        if now >= entry.expires_at {
            return None;
        }
        let mut data = entry.data;
        data.meta.search_time = Some(started.elapsed().as_millis() as u64);
        data.meta.datasource_id = Some(datasource.id.clone());
        data.meta.from_cache = Some(true);
        data.meta.cache_age = Some(now - entry.created_at);
        data.meta.next_refresh = Some(entry.expires_at - now);
        tracing::info!(datasource = %datasource.id, cache_age_ms = now - entry.created_at, "cache hit");
        Some(data)
    }

    async fn key_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut inflight = self.inflight.lock().await;
        inflight.entry(key.to_string()).or_default().clone()
    }

    /// Cached results for `datasource`, refreshing them when expired.
    pub async fn get_or_fetch(
        &self,
        datasource: &DatasourceDescriptor,
    ) -> std::result::Result<CachedResponse, SearchFailure> {
        let started = Instant::now();
        let key = cache_key(datasource);
        let refresh_secs = self.refresh_secs(datasource);
        let respond = |results, outcome| CachedResponse {
            results,
            outcome,
            refresh_secs,
        };

        if let Some(hit) = self.fresh_hit(&key, datasource, started) {
            return Ok(respond(hit, CacheOutcome::Hit));
        }

        let lock = self.key_lock(&key).await;
        let _guard = lock.lock().await;
        if let Some(hit) = self.fresh_hit(&key, datasource, started) {
            return Ok(respond(hit, CacheOutcome::Hit));
        }

        tracing::info!(datasource = %datasource.id, "cache miss");
        let executor = &self.executor;
        let result = self
            .retry
            .run(&datasource.id, || executor.execute(datasource))
            .await;

        match result {
            Ok(mut data) => {
                let now = self.clock.now_ms();
                let expires_at = now + (refresh_secs as i64) * 1000;
                self.lock_entries().insert(
                    key,
                    CacheEntry {
                        data: data.clone(),
                        created_at: now,
                        expires_at,
                    },
                );
                tracing::info!(datasource = %datasource.id, refresh_secs, "result cached");
                data.meta.search_time = Some(started.elapsed().as_millis() as u64);
                data.meta.datasource_id = Some(datasource.id.clone());
                data.meta.from_cache = Some(false);
                Ok(respond(data, CacheOutcome::Fresh))
            }
            Err(e) => {
                tracing::error!(datasource = %datasource.id, error = %format!("{:#}", e), "error executing search");
                match self.lookup(&key) {
                    Some(entry) => {
                        let now = self.clock.now_ms();
                        tracing::warn!(
                            datasource = %datasource.id,
                            cache_age_ms = now - entry.created_at,
                            "returning expired cached data due to search failure"
                        );
                        let mut data = entry.data;
                        data.meta.search_time = Some(started.elapsed().as_millis() as u64);
                        data.meta.datasource_id = Some(datasource.id.clone());
                        data.meta.from_cache = Some(true);
                        data.meta.cache_age = Some(now - entry.created_at);
                        data.meta.warning = Some(STALE_WARNING.to_string());
                        data.meta.error = Some(StaleError {
                            message: "Search failed, showing cached data".to_string(),
                            details: format!("{:#}", e),
                            timestamp: chrono::Utc::now()
                                .to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
                        });
                        Ok(respond(data, CacheOutcome::Stale))
                    }
                    None => Err(classify_failure(&e)),
                }
            }
        }
    }

    /// Drop entries expired for longer than the stale retention window.
    pub fn sweep_expired(&self) -> usize {
        let cutoff = self.clock.now_ms() - self.settings.stale_retention.as_millis() as i64;
        let mut entries = self.lock_entries();
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > cutoff);
        let removed = before - entries.len();
        if removed > 0 {
            tracing::info!(removed, remaining = entries.len(), "cache cleanup completed");
        }
        removed
    }

    /// Run [`sweep_expired`](Self::sweep_expired) every `interval`.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                cache.sweep_expired();
            }
        })
    }
}

/// Run one search outside the cache, with retries.
pub async fn execute_uncached(
    executor: &Arc<dyn SearchExecutor>,
    retry: &RetryPolicy,
    datasource: &DatasourceDescriptor,
) -> Result<SearchResults> {
    retry
        .run(&datasource.id, || executor.execute(datasource))
        .await
}
