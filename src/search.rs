//! Search job dispatch and polling.
//!
//! [`SearchDispatcher`] runs a datasource's query as a Splunk search job:
//!
//! 1. **Dispatch**: `POST servicesNS/<user>/<app>/search/jobs` with the
//!    qualified query, time bounds, and a reuse window / server-side
//!    timeout derived from the refresh interval.
//! 2. **Poll**: `GET search/v2/jobs/<sid>` every `poll_delay` until the job
//!    reports done or failed, giving up after `max_polls` checks.
//! 3. **Results**: `POST search/v2/jobs/<sid>/results` in `json_cols`
//!    mode, applying the datasource's postprocess search.
//!
//! The returned meta carries a timing breakdown of the three phases.
//! Retries are not handled here; see [`crate::retry`].

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::time::{Duration, Instant};

use crate::config::{Config, ServerConfig};
use crate::error::PublishError;
use crate::models::{DatasourceDescriptor, SearchMeta, SearchResults, SearchSpec, Timing};
use crate::splunkd::Splunkd;
use crate::transport::HttpRequest;

/// Refresh assumed for datasources that declare none.
pub const DEFAULT_REFRESH_SECS: u64 = 60;

/// Runs a datasource's search and returns its columnar results.
#[async_trait]
pub trait SearchExecutor: Send + Sync {
    async fn execute(&self, datasource: &DatasourceDescriptor) -> Result<SearchResults>;
}

#[derive(Debug, Clone)]
pub struct SearchSettings {
    pub min_refresh_secs: u64,
    pub poll_delay: Duration,
    pub max_polls: u32,
    pub results_count: u64,
    /// App used when a datasource carries none.
    pub default_app: String,
}

impl SearchSettings {
    pub fn from_config(config: &Config) -> Self {
        let server: &ServerConfig = &config.server;
        Self {
            min_refresh_secs: server.min_refresh_secs,
            poll_delay: Duration::from_millis(server.poll_delay_ms),
            max_polls: server.max_polls,
            results_count: server.results_count,
            default_app: config
                .publish
                .app
                .clone()
                .unwrap_or_else(|| "search".to_string()),
        }
    }
}

/// Prefix a bare query with `search` unless it starts with a generating
/// command (`|`).
pub fn qualified_search(query: &str) -> String {
    let trimmed = query.trim();
    if trimmed.starts_with('|') {
        trimmed.to_string()
    } else {
        format!("search {}", trimmed)
    }
}

/// Refresh interval used for dispatch, floor-clamped to `min_refresh_secs`.
pub fn dispatch_refresh(spec: &SearchSpec, min_refresh_secs: u64) -> u64 {
    spec.refresh
        .unwrap_or(DEFAULT_REFRESH_SECS)
        .max(min_refresh_secs)
}

pub struct SearchDispatcher {
    splunkd: Splunkd,
    owner: String,
    settings: SearchSettings,
}

impl SearchDispatcher {
    /// `owner` is the user namespace jobs are created under.
    pub fn new(splunkd: Splunkd, owner: impl Into<String>, settings: SearchSettings) -> Self {
        Self {
            splunkd,
            owner: owner.into(),
            settings,
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    fn service_prefix(&self, app: &str) -> String {
        format!(
            "{}/servicesNS/{}/{}",
            self.splunkd.base_url(),
            urlencoding::encode(&self.owner),
            urlencoding::encode(app)
        )
    }

    async fn dispatch(&self, prefix: &str, spec: &SearchSpec) -> Result<String> {
        let refresh = dispatch_refresh(spec, self.settings.min_refresh_secs);
        let form = vec![
            ("output_mode".to_string(), "json".to_string()),
            ("earliest_time".to_string(), spec.time_bound("earliest")),
            ("latest_time".to_string(), spec.time_bound("latest")),
            ("search".to_string(), qualified_search(&spec.query)),
            ("reuse_max_seconds_ago".to_string(), refresh.to_string()),
            ("timeout".to_string(), (refresh * 2).to_string()),
        ];
        let url = format!("{}/search/jobs", prefix);
        let resp = self
            .splunkd
            .transport()
            .send(HttpRequest::post_form(&url, form).auth(self.splunkd.credentials()))
            .await?;
        if !resp.is_success() {
            return Err(PublishError::Dispatch {
                status: resp.status,
            }
            .into());
        }
        resp.json()?
            .get("sid")
            .and_then(Value::as_str)
            .map(str::to_string)
            .context("dispatch response has no sid")
    }

    async fn wait(&self, prefix: &str, sid: &str) -> Result<()> {
        let url = format!(
            "{}/search/v2/jobs/{}?output_mode=json",
            prefix,
            urlencoding::encode(sid)
        );
        for poll in 1..=self.settings.max_polls {
            let resp = self
                .splunkd
                .transport()
                .send(HttpRequest::get(&url).auth(self.splunkd.credentials()))
                .await?;
            if !resp.is_success() {
                return Err(PublishError::Splunkd {
                    path: format!("search/v2/jobs/{}", sid),
                    status: resp.status,
                }
                .into());
            }
            let body = resp.json()?;
            let content = body
                .pointer("/entry/0/content")
                .with_context(|| format!("job status for {} has no content", sid))?;
            if content.get("isFailed").and_then(Value::as_bool) == Some(true) {
                return Err(PublishError::SearchExecution {
                    sid: sid.to_string(),
                }
                .into());
            }
            if content.get("isDone").and_then(Value::as_bool) == Some(true) {
                tracing::debug!(sid, polls = poll, "search job done");
                return Ok(());
            }
            if poll < self.settings.max_polls {
                tokio::time::sleep(self.settings.poll_delay).await;
            }
        }
        Err(PublishError::PollLimitExceeded {
            sid: sid.to_string(),
            polls: self.settings.max_polls,
        }
        .into())
    }

    async fn results(&self, prefix: &str, sid: &str, spec: &SearchSpec) -> Result<(Vec<Value>, Vec<Vec<Value>>)> {
        let form = vec![
            ("output_mode".to_string(), "json_cols".to_string()),
            ("count".to_string(), self.settings.results_count.to_string()),
            ("offset".to_string(), "0".to_string()),
            (
                "search".to_string(),
                spec.postprocess.clone().unwrap_or_default(),
            ),
        ];
        let url = format!("{}/search/v2/jobs/{}/results", prefix, urlencoding::encode(sid));
        let resp = self
            .splunkd
            .transport()
            .send(HttpRequest::post_form(&url, form).auth(self.splunkd.credentials()))
            .await?;
        if !resp.is_success() {
            return Err(PublishError::Splunkd {
                path: format!("search/v2/jobs/{}/results", sid),
                status: resp.status,
            }
            .into());
        }
        let body = resp.json()?;
        let fields = body
            .get("fields")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let columns = body
            .get("columns")
            .and_then(Value::as_array)
            .map(|cols| {
                cols.iter()
                    .map(|c| c.as_array().cloned().unwrap_or_default())
                    .collect()
            })
            .unwrap_or_default();
        Ok((fields, columns))
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}

#[async_trait]
impl SearchExecutor for SearchDispatcher {
    async fn execute(&self, datasource: &DatasourceDescriptor) -> Result<SearchResults> {
        let app = datasource
            .app
            .as_deref()
            .unwrap_or(&self.settings.default_app);
        let prefix = self.service_prefix(app);
        let spec = &datasource.search;
        tracing::info!(datasource = %datasource.id, app, "executing search");

        let started = Instant::now();
        let sid = self.dispatch(&prefix, spec).await?;
        let dispatch = elapsed_ms(started);
        tracing::info!(datasource = %datasource.id, sid = %sid, dispatch_ms = dispatch, "search job dispatched");

        let waiting = Instant::now();
        self.wait(&prefix, &sid).await?;
        let wait = elapsed_ms(waiting);

        let fetching = Instant::now();
        let (fields, columns) = self.results(&prefix, &sid, spec).await?;
        let results = elapsed_ms(fetching);
        let total = elapsed_ms(started);

        let mut out = SearchResults {
            fields,
            columns,
            meta: SearchMeta {
                sid,
                percent_complete: 100,
                status: "done".to_string(),
                last_updated: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
                timing: Timing {
                    dispatch,
                    wait,
                    results,
                    total,
                },
                ..Default::default()
            },
        };
        out.meta.total_count = out.row_count();
        tracing::info!(
            datasource = %datasource.id,
            rows = out.meta.total_count,
            dispatch_ms = dispatch,
            wait_ms = wait,
            results_ms = results,
            total_ms = total,
            "search results retrieved"
        );
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{json, status, MockTransport};
    use crate::transport::{Credentials, Method};
    use serde_json::json as j;
    use std::sync::Arc;

    fn settings() -> SearchSettings {
        SearchSettings {
            min_refresh_secs: 60,
            poll_delay: Duration::from_millis(250),
            max_polls: 5,
            results_count: 50000,
            default_app: "search".into(),
        }
    }

    fn descriptor(query: &str, refresh: Option<u64>) -> DatasourceDescriptor {
        let mut params = serde_json::Map::new();
        params.insert("earliest".into(), j!("-24h"));
        params.insert("latest".into(), j!("now"));
        DatasourceDescriptor {
            id: "ds1".into(),
            app: Some("ops".into()),
            search: SearchSpec {
                query: query.into(),
                query_parameters: params,
                refresh,
                postprocess: Some("| head 5".into()),
            },
        }
    }

    fn job(done: bool, failed: bool) -> crate::transport::HttpResponse {
        json(j!({"entry": [{"content": {"isDone": done, "isFailed": failed}}]}))
    }

    fn form_value(req: &HttpRequest, key: &str) -> Option<String> {
        req.form
            .as_ref()?
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }

    fn dispatcher(transport: Arc<MockTransport>) -> SearchDispatcher {
        let splunkd = Splunkd::new("https://splunk:8089", Credentials::Bearer("t".into()), transport);
        SearchDispatcher::new(splunkd, "admin", settings())
    }

    #[test]
    fn qualification() {
        assert_eq!(qualified_search("index=main"), "search index=main");
        assert_eq!(qualified_search("| makeresults"), "| makeresults");
        assert_eq!(qualified_search("  | tstats count"), "| tstats count");
    }

    #[test]
    fn refresh_is_floor_clamped() {
        let mut spec = SearchSpec::default();
        assert_eq!(dispatch_refresh(&spec, 60), 60);
        spec.refresh = Some(10);
        assert_eq!(dispatch_refresh(&spec, 60), 60);
        spec.refresh = Some(300);
        assert_eq!(dispatch_refresh(&spec, 60), 300);
    }

    #[tokio::test(start_paused = true)]
    async fn full_cycle_returns_columns_and_timing() {
        let transport = Arc::new(
            MockTransport::new()
                .on(Method::Post, "/servicesNS/admin/ops/search/jobs", json(j!({"sid": "123.45"})))
                .on(
                    Method::Post,
                    "/search/v2/jobs/123.45/results",
                    json(j!({"fields": ["host", "count"], "columns": [["a", "b"], ["1", "2"]]})),
                ),
        );
        transport.push(Method::Get, "/search/v2/jobs/123.45?", job(false, false));
        transport.push(Method::Get, "/search/v2/jobs/123.45?", job(true, false));

        let d = dispatcher(transport.clone());
        let out = d.execute(&descriptor("index=main | stats count by host", Some(300))).await.unwrap();

        assert_eq!(out.fields.len(), 2);
        assert_eq!(out.meta.total_count, 2);
        assert_eq!(out.meta.sid, "123.45");
        assert_eq!(out.meta.percent_complete, 100);
        assert_eq!(out.meta.status, "done");

        let calls = transport.calls();
        let dispatch = &calls[0];
        assert_eq!(
            form_value(dispatch, "search").as_deref(),
            Some("search index=main | stats count by host")
        );
        assert_eq!(form_value(dispatch, "earliest_time").as_deref(), Some("-24h"));
        assert_eq!(form_value(dispatch, "reuse_max_seconds_ago").as_deref(), Some("300"));
        assert_eq!(form_value(dispatch, "timeout").as_deref(), Some("600"));
        assert!(dispatch.headers.iter().any(|(k, v)| k == "Authorization" && v == "Bearer t"));

        assert_eq!(transport.count("/search/v2/jobs/123.45?"), 2);
        let results = calls.last().unwrap();
        assert_eq!(form_value(results, "output_mode").as_deref(), Some("json_cols"));
        assert_eq!(form_value(results, "search").as_deref(), Some("| head 5"));
    }

    #[tokio::test]
    async fn dispatch_rejection_is_typed() {
        let transport = Arc::new(MockTransport::new().on(
            Method::Post,
            "/search/jobs",
            status(503, "unavailable"),
        ));
        let err = dispatcher(transport).execute(&descriptor("index=main", None)).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PublishError>(),
            Some(PublishError::Dispatch { status: 503 })
        ));
        assert!(err.to_string().contains("Failed to dispatch job"));
    }

    #[tokio::test]
    async fn failed_job_is_typed() {
        let transport = Arc::new(
            MockTransport::new()
                .on(Method::Post, "/search/jobs", json(j!({"sid": "s1"})))
                .on(Method::Get, "/search/v2/jobs/s1", job(false, true)),
        );
        let err = dispatcher(transport).execute(&descriptor("index=main", None)).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PublishError>(),
            Some(PublishError::SearchExecution { sid }) if sid == "s1"
        ));
        assert!(err.to_string().contains("Search job failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn poll_ceiling_stops_a_stuck_job() {
        let transport = Arc::new(
            MockTransport::new()
                .on(Method::Post, "/search/jobs", json(j!({"sid": "stuck"})))
                .on(Method::Get, "/search/v2/jobs/stuck", job(false, false)),
        );
        let err = dispatcher(transport.clone())
            .execute(&descriptor("index=main", None))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PublishError>(),
            Some(PublishError::PollLimitExceeded { polls: 5, .. })
        ));
        assert_eq!(transport.count("/search/v2/jobs/stuck"), 5);
    }

    #[tokio::test]
    async fn missing_app_uses_default() {
        let transport = Arc::new(
            MockTransport::new()
                .on(Method::Post, "/servicesNS/admin/search/search/jobs", json(j!({"sid": "x"})))
                .on(Method::Get, "/search/v2/jobs/x", job(true, false))
                .on(Method::Post, "/search/v2/jobs/x/results", json(j!({}))),
        );
        let mut ds = descriptor("| makeresults", None);
        ds.app = None;
        let out = dispatcher(transport).execute(&ds).await.unwrap();
        assert_eq!(out.meta.total_count, 0);
        assert!(out.columns.is_empty());
    }
}
