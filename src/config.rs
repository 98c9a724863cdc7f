//! TOML configuration parsing with environment overrides.
//!
//! Every section has defaults, so a missing config file yields a usable
//! configuration as long as the Splunkd connection comes from the
//! environment. Secrets are expected to come from the environment (or a
//! `.env` file loaded by the binary) rather than the TOML file.
//!
//! ```toml
//! [splunkd]
//! url = "https://splunk.example.com:8089"
//! ui_port = 8000
//! locale = "en-US"
//!
//! [publish]
//! app = "search"
//! project_dir = "./app"
//!
//! [publish.dashboards.ops_overview]
//! tags = ["ops"]
//!
//! [server]
//! bind = "0.0.0.0:3001"
//!
//! [server.retry]
//! max_retries = 3
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub splunkd: SplunkdConfig,
    #[serde(default)]
    pub publish: PublishConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SplunkdConfig {
    /// REST API base URL, e.g. `https://localhost:8089`.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    /// Port of the web UI host that serves `/static/...` assets.
    #[serde(default = "default_ui_port")]
    pub ui_port: u16,
    #[serde(default = "default_locale")]
    pub locale: String,
    #[serde(default = "default_verify_tls")]
    pub verify_tls: bool,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for SplunkdConfig {
    fn default() -> Self {
        Self {
            url: None,
            username: None,
            password: None,
            token: None,
            ui_port: default_ui_port(),
            locale: default_locale(),
            verify_tls: default_verify_tls(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_ui_port() -> u16 {
    8000
}
fn default_locale() -> String {
    "en-US".to_string()
}
fn default_verify_tls() -> bool {
    true
}
fn default_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct PublishConfig {
    #[serde(default)]
    pub app: Option<String>,
    #[serde(default = "default_project_dir")]
    pub project_dir: PathBuf,
    /// Public base URL (CDN/FQDN) prefixed to vector asset links.
    #[serde(default)]
    pub public_base_url: Option<String>,
    /// Dashboards to publish, keyed by name.
    #[serde(default)]
    pub dashboards: BTreeMap<String, DashboardSelection>,
    /// URI schemes resolved through the dashboard-studio KV store.
    #[serde(default = "default_kvstore_schemes")]
    pub kvstore_schemes: Vec<String>,
    /// Markers identifying raw Splunkd passthrough references.
    #[serde(default = "default_raw_markers")]
    pub raw_markers: Vec<String>,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            app: None,
            project_dir: default_project_dir(),
            public_base_url: None,
            dashboards: BTreeMap::new(),
            kvstore_schemes: default_kvstore_schemes(),
            raw_markers: default_raw_markers(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct DashboardSelection {
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_project_dir() -> PathBuf {
    PathBuf::from("./app")
}
fn default_kvstore_schemes() -> Vec<String> {
    vec!["splunk-enterprise-kvstore".to_string()]
}
fn default_raw_markers() -> Vec<String> {
    vec!["splunkd/__raw".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Root of the generated web application (holds `src/` and `dist/`).
    #[serde(default = "default_project_dir")]
    pub project_dir: PathBuf,
    #[serde(default = "default_static_dir")]
    pub static_dir: PathBuf,
    /// Lower bound applied to every datasource refresh at dispatch time.
    #[serde(default = "default_min_refresh_secs")]
    pub min_refresh_secs: u64,
    /// Cache TTL for datasources without a refresh interval.
    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,
    #[serde(default = "default_poll_delay_ms")]
    pub poll_delay_ms: u64,
    /// Client-side ceiling on job status checks.
    #[serde(default = "default_max_polls")]
    pub max_polls: u32,
    #[serde(default = "default_results_count")]
    pub results_count: u64,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            project_dir: default_project_dir(),
            static_dir: default_static_dir(),
            min_refresh_secs: default_min_refresh_secs(),
            default_ttl_secs: default_ttl_secs(),
            poll_delay_ms: default_poll_delay_ms(),
            max_polls: default_max_polls(),
            results_count: default_results_count(),
            retry: RetryConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0:3001".to_string()
}
fn default_static_dir() -> PathBuf {
    PathBuf::from("dist")
}
fn default_min_refresh_secs() -> u64 {
    60
}
fn default_ttl_secs() -> u64 {
    60
}
fn default_poll_delay_ms() -> u64 {
    250
}
fn default_max_polls() -> u32 {
    2400
}
fn default_results_count() -> u64 {
    50_000
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    1000
}
fn default_max_delay_ms() -> u64 {
    10_000
}
fn default_multiplier() -> u32 {
    2
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct CacheConfig {
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// How long an expired entry stays available for stale-serve.
    #[serde(default = "default_stale_retention_secs")]
    pub stale_retention_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval_secs(),
            stale_retention_secs: default_stale_retention_secs(),
        }
    }
}

fn default_sweep_interval_secs() -> u64 {
    300
}
fn default_stale_retention_secs() -> u64 {
    3600
}

impl Config {
    /// The Splunkd REST base URL, or an error if none is configured.
    pub fn splunkd_url(&self) -> Result<&str> {
        self.splunkd
            .url
            .as_deref()
            .context("SPLUNKD_URL is required (set splunkd.url or SPLUNKD_URL)")
    }

    /// Override file values from environment variables.
    ///
    /// `lookup` abstracts `std::env::var` so overrides can be tested
    /// without touching the process environment. Empty values are ignored.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = get("SPLUNKD_URL") {
            self.splunkd.url = Some(url);
        } else if let Some(host) = get("SPLUNKD_HOST") {
            let port = get("SPLUNKD_PORT").unwrap_or_else(|| "8089".to_string());
            let protocol = get("SPLUNKD_PROTOCOL").unwrap_or_else(|| "https".to_string());
            self.splunkd.url = Some(format!("{}://{}:{}", protocol, host, port));
        }
        if let Some(v) = get("SPLUNKD_USER") {
            self.splunkd.username = Some(v);
        }
        if let Some(v) = get("SPLUNKD_PASSWORD") {
            self.splunkd.password = Some(v);
        }
        if let Some(v) = get("SPLUNKD_TOKEN") {
            self.splunkd.token = Some(v);
        }
        if let Some(v) = get("SPLUNKD_UI_PORT") {
            self.splunkd.ui_port = v
                .parse()
                .with_context(|| format!("SPLUNKD_UI_PORT is not a port: {}", v))?;
        }
        if let Some(v) = get("SPLUNKD_LOCALE") {
            self.splunkd.locale = v;
        }
        if let Some(v) = get("SPLUNKD_VERIFY_TLS") {
            self.splunkd.verify_tls = !matches!(v.as_str(), "0" | "false" | "no");
        }
        if let Some(v) = get("DASHPUB_APP") {
            self.publish.app = Some(v);
        }
        if let Some(v) = get("DASHPUB_FQDN") {
            self.publish.public_base_url = Some(v);
        }
        if let Some(v) = get("DASHPUB_DASHBOARDS") {
            if self.publish.dashboards.is_empty() {
                self.publish.dashboards = parse_dashboard_list(&v);
            }
        }
        if let Some(v) = get("MIN_REFRESH_TIME") {
            self.server.min_refresh_secs = v
                .parse()
                .with_context(|| format!("MIN_REFRESH_TIME is not a number: {}", v))?;
        }
        if let Some(v) = get("SEARCH_JOB_DELAY_MS") {
            self.server.poll_delay_ms = v
                .parse()
                .with_context(|| format!("SEARCH_JOB_DELAY_MS is not a number: {}", v))?;
        }
        if let Some(v) = get("DASHPUB_DEFAULT_TTL") {
            self.server.default_ttl_secs = v
                .parse()
                .with_context(|| format!("DASHPUB_DEFAULT_TTL is not a number: {}", v))?;
        }
        if let Some(port) = get("PORT") {
            let host = self
                .server
                .bind
                .rsplit_once(':')
                .map(|(h, _)| h.to_string())
                .unwrap_or_else(|| "0.0.0.0".to_string());
            self.server.bind = format!("{}:{}", host, port);
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if let Some(url) = &self.splunkd.url {
            url::Url::parse(url).with_context(|| format!("Invalid SPLUNKD_URL format: {}", url))?;
        }
        if self.server.poll_delay_ms == 0 {
            bail!("server.poll_delay_ms must be > 0");
        }
        if self.server.max_polls == 0 {
            bail!("server.max_polls must be > 0");
        }
        if self.server.retry.multiplier < 1 {
            bail!("server.retry.multiplier must be >= 1");
        }
        if self.server.retry.base_delay_ms > self.server.retry.max_delay_ms {
            bail!("server.retry.base_delay_ms must not exceed server.retry.max_delay_ms");
        }
        if self.server.cache.sweep_interval_secs == 0 {
            bail!("server.cache.sweep_interval_secs must be > 0");
        }
        Ok(())
    }
}

/// Parse a `DASHPUB_DASHBOARDS` list: `name1,name2[tag a|tag b]`.
pub fn parse_dashboard_list(value: &str) -> BTreeMap<String, DashboardSelection> {
    let mut out = BTreeMap::new();
    for entry in value.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (name, tags) = match entry.split_once('[') {
            Some((name, rest)) => {
                let tags = rest
                    .trim_end_matches(']')
                    .split('|')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .collect();
                (name.trim(), tags)
            }
            None => (entry, Vec::new()),
        };
        if !name.is_empty() {
            out.insert(name.to_string(), DashboardSelection { tags });
        }
    }
    out
}

/// Parse a TOML document and apply environment overrides.
pub fn parse_config<F>(content: &str, lookup: F) -> Result<Config>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config: Config =
        toml::from_str(content).with_context(|| "Failed to parse config file")?;
    config.apply_env(lookup)?;
    config.validate()?;
    Ok(config)
}

/// Load the config file at `path` (if present) with process environment overrides.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = if path.exists() {
        std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?
    } else {
        tracing::debug!(path = %path.display(), "config file not found, using defaults");
        String::new()
    };
    parse_config(&content, |key| std::env::var(key).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_document_yields_defaults() {
        let cfg = parse_config("", env(&[])).unwrap();
        assert_eq!(cfg.splunkd.ui_port, 8000);
        assert_eq!(cfg.splunkd.locale, "en-US");
        assert_eq!(cfg.server.retry.max_retries, 3);
        assert_eq!(cfg.server.poll_delay_ms, 250);
        assert_eq!(cfg.publish.kvstore_schemes, vec!["splunk-enterprise-kvstore"]);
        assert!(cfg.splunkd_url().is_err());
    }

    #[test]
    fn env_overrides_file_values() {
        let toml = r#"
[splunkd]
url = "https://file:8089"
locale = "de-DE"
"#;
        let cfg = parse_config(
            toml,
            env(&[
                ("SPLUNKD_URL", "https://env:8089"),
                ("SPLUNKD_TOKEN", "tok"),
                ("SPLUNKD_UI_PORT", "9000"),
                ("PORT", "4000"),
            ]),
        )
        .unwrap();
        assert_eq!(cfg.splunkd_url().unwrap(), "https://env:8089");
        assert_eq!(cfg.splunkd.token.as_deref(), Some("tok"));
        assert_eq!(cfg.splunkd.ui_port, 9000);
        assert_eq!(cfg.splunkd.locale, "de-DE");
        assert_eq!(cfg.server.bind, "0.0.0.0:4000");
    }

    #[test]
    fn url_built_from_host_components() {
        let cfg = parse_config(
            "",
            env(&[("SPLUNKD_HOST", "splunk.local"), ("SPLUNKD_PROTOCOL", "http")]),
        )
        .unwrap();
        assert_eq!(cfg.splunkd_url().unwrap(), "http://splunk.local:8089");
    }

    #[test]
    fn dashboards_from_env_list() {
        let cfg = parse_config("", env(&[("DASHPUB_DASHBOARDS", "a, b,,c")])).unwrap();
        let names: Vec<_> = cfg.publish.dashboards.keys().cloned().collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn dashboard_list_carries_tags() {
        let list = parse_dashboard_list("ops[prod | team a],sales");
        assert_eq!(list["ops"].tags, vec!["prod", "team a"]);
        assert!(list["sales"].tags.is_empty());
    }

    #[test]
    fn rejects_inverted_backoff_bounds() {
        let toml = r#"
[server.retry]
base_delay_ms = 20000
max_delay_ms = 1000
"#;
        let err = parse_config(toml, env(&[])).unwrap_err();
        assert!(err.to_string().contains("base_delay_ms"));
    }

    #[test]
    fn rejects_malformed_url() {
        let err = parse_config("", env(&[("SPLUNKD_URL", "not a url")])).unwrap_err();
        assert!(err.to_string().contains("Invalid SPLUNKD_URL"));
    }
}
