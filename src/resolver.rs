//! Asset reference resolution.
//!
//! A dashboard definition refers to images in several incompatible ways,
//! depending on which Splunk subsystem produced the reference. The
//! [`AssetResolver`] classifies each reference, fetches the bytes with the
//! right strategy, stores them through [`content_store::store`] and returns
//! the path the published page should use instead.
//!
//! # Classification
//!
//! Rules are tried in order; the first match wins.
//!
//! | Reference | Variant | Retrieval |
//! |-----------|---------|-----------|
//! | empty | [`AssetSource::Empty`] | returned unchanged |
//! | `<svg ...>` | [`AssetSource::InlineMarkup`] | the reference is the data |
//! | `/assets/...`, `data:...` | [`AssetSource::AlreadyResolved`] | returned unchanged |
//! | `/static/...` (single leading slash) | [`AssetSource::SiteRelative`] | GET from the UI host, locale-prefixed |
//! | `http(s)://...` | [`AssetSource::Network`] | unauthenticated GET |
//! | `<kvstore scheme>://id` | [`AssetSource::KvStore`] | dashboard-studio KV store data URI |
//! | `...splunkd/__raw/path` | [`AssetSource::RawPassthrough`] | authenticated Splunkd GET of `path` |
//!
//! A site-relative path is recognised before any scheme split, so a path
//! such as `/static/x.png?from=https://h` is never treated as a URL.
//!
//! # Memoization
//!
//! Resolutions are memoized per source string in an [`AssetMemo`] that
//! lives for one publish run. Each source owns a once-cell: concurrent
//! resolutions of the same source share a single fetch, and a failed
//! attempt leaves the cell empty so a later call retries.

use anyhow::{Context, Result};
use base64::Engine;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};

use crate::config::Config;
use crate::content_store::{self, MIME_SVG};
use crate::error::PublishError;
use crate::models::AssetCategory;
use crate::splunkd::Splunkd;
use crate::transport::HttpRequest;

/// The classification of one asset reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetSource<'a> {
    Empty,
    InlineMarkup(&'a str),
    AlreadyResolved(&'a str),
    SiteRelative(&'a str),
    Network(&'a str),
    KvStore { id: &'a str },
    RawPassthrough { path: &'a str },
    Unrecognized(&'a str),
}

/// Settings that decide how references are classified and linked.
#[derive(Debug, Clone)]
pub struct ResolverSettings {
    pub ui_port: u16,
    pub locale: String,
    /// CDN/FQDN base prefixed to vector assets when set.
    pub public_base_url: Option<String>,
    pub kvstore_schemes: Vec<String>,
    pub raw_markers: Vec<String>,
}

impl ResolverSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            ui_port: config.splunkd.ui_port,
            locale: config.splunkd.locale.clone(),
            public_base_url: config
                .publish
                .public_base_url
                .as_ref()
                .map(|u| u.trim_end_matches('/').to_string())
                .filter(|u| !u.is_empty()),
            kvstore_schemes: config.publish.kvstore_schemes.clone(),
            raw_markers: config.publish.raw_markers.clone(),
        }
    }

    /// Classify a (trimmed) reference.
    pub fn classify<'a>(&self, src: &'a str) -> AssetSource<'a> {
        if src.is_empty() {
            return AssetSource::Empty;
        }
        if src.starts_with("<svg") || src.starts_with("<?xml") {
            return AssetSource::InlineMarkup(src);
        }
        if self.is_resolved(src) {
            return AssetSource::AlreadyResolved(src);
        }
        if src.starts_with('/') && !src.starts_with("//") {
            return AssetSource::SiteRelative(src);
        }

        let (head, rest) = match src.split_once("://") {
            Some((scheme, rest)) => (scheme, Some(rest)),
            None => (src, None),
        };
        if let Some(rest) = rest {
            if head == "http" || head == "https" {
                return AssetSource::Network(src);
            }
            if self.kvstore_schemes.iter().any(|s| s == head) {
                return AssetSource::KvStore { id: rest };
            }
        }
        for marker in &self.raw_markers {
            if let Some((_, path)) = head.split_once(marker.as_str()) {
                if !path.is_empty() {
                    return AssetSource::RawPassthrough { path };
                }
            }
        }
        AssetSource::Unrecognized(src)
    }

    fn is_resolved(&self, src: &str) -> bool {
        if src.starts_with("/assets/") || src.starts_with("data:") {
            return true;
        }
        match &self.public_base_url {
            Some(base) => src
                .strip_prefix(base.as_str())
                .is_some_and(|rest| rest.starts_with("/assets/")),
            None => false,
        }
    }

    /// Link for a stored file: CDN-prefixed when configured, site-relative otherwise.
    fn public_link(&self, filename: &str) -> String {
        match &self.public_base_url {
            Some(base) => format!("{}/assets/{}", base, filename),
            None => format!("/assets/{}", filename),
        }
    }

    /// Link for assets fetched from Splunk: SVGs are CDN-linked or inlined
    /// as a data URI, rasters use the plain site path.
    fn splunk_asset_link(&self, filename: &str, mime: &str, original: &[u8]) -> String {
        if mime != MIME_SVG {
            return format!("/assets/{}", filename);
        }
        match &self.public_base_url {
            Some(_) => self.public_link(filename),
            None => format!(
                "data:{};base64,{}",
                MIME_SVG,
                base64::engine::general_purpose::STANDARD.encode(original)
            ),
        }
    }
}

/// Per-run memo of source reference → resolved link.
///
/// Created empty for each publish run, grows monotonically and is never
/// persisted or evicted.
#[derive(Default)]
pub struct AssetMemo {
    cells: Mutex<HashMap<String, Arc<OnceCell<String>>>>,
}

impl AssetMemo {
    pub fn new() -> Self {
        Self::default()
    }

    async fn cell(&self, src: &str) -> Arc<OnceCell<String>> {
        let mut cells = self.cells.lock().await;
        cells
            .entry(src.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone()
    }

    /// Resolved link for `src`, if a resolution has completed.
    pub async fn get(&self, src: &str) -> Option<String> {
        let cells = self.cells.lock().await;
        cells.get(src).and_then(|c| c.get().cloned())
    }

    /// Number of completed resolutions.
    pub async fn len(&self) -> usize {
        let cells = self.cells.lock().await;
        cells.values().filter(|c| c.initialized()).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

pub struct AssetResolver {
    splunkd: Splunkd,
    settings: ResolverSettings,
    asset_dir: PathBuf,
    memo: Arc<AssetMemo>,
}

impl AssetResolver {
    pub fn new(
        splunkd: Splunkd,
        settings: ResolverSettings,
        asset_dir: impl Into<PathBuf>,
        memo: Arc<AssetMemo>,
    ) -> Self {
        Self {
            splunkd,
            settings,
            asset_dir: asset_dir.into(),
            memo,
        }
    }

    pub fn settings(&self) -> &ResolverSettings {
        &self.settings
    }

    pub fn asset_dir(&self) -> &Path {
        &self.asset_dir
    }

    pub fn memo(&self) -> &Arc<AssetMemo> {
        &self.memo
    }

    /// Resolve one reference to the link the published page should use.
    pub async fn resolve(&self, src: &str, category: AssetCategory) -> Result<String> {
        let src = src.trim();
        let source = self.settings.classify(src);
        match source {
            AssetSource::Empty | AssetSource::AlreadyResolved(_) => return Ok(src.to_string()),
            AssetSource::Unrecognized(s) => {
                return Err(PublishError::UnrecognizedAssetSource(s.to_string()).into())
            }
            _ => {}
        }

        let cell = self.memo.cell(src).await;
        if let Some(hit) = cell.get() {
            tracing::debug!(src = %preview(src), "asset memo hit");
            return Ok(hit.clone());
        }
        let link = cell
            .get_or_try_init(|| self.fetch_and_store(source, category))
            .await?;
        Ok(link.clone())
    }

    async fn fetch_and_store(&self, source: AssetSource<'_>, category: AssetCategory) -> Result<String> {
        match source {
            AssetSource::InlineMarkup(markup) => {
                let asset = content_store::store(
                    markup.as_bytes().to_vec(),
                    MIME_SVG,
                    &self.asset_dir,
                    "img",
                )
                .await?;
                Ok(self.settings.public_link(&asset.stored_filename))
            }
            AssetSource::SiteRelative(path) => self.fetch_site_relative(path).await,
            AssetSource::Network(url) => self.fetch_network(url).await,
            AssetSource::KvStore { id } => self.fetch_kvstore(id, category).await,
            AssetSource::RawPassthrough { path } => self.fetch_raw(path).await,
            AssetSource::Empty => Ok(String::new()),
            AssetSource::AlreadyResolved(s) => Ok(s.to_string()),
            AssetSource::Unrecognized(s) => {
                Err(PublishError::UnrecognizedAssetSource(s.to_string()).into())
            }
        }
    }

    /// `https://host:<ui_port>/<locale><path>` for a site-relative path.
    pub fn ui_url(&self, path: &str) -> Result<String> {
        let mut url = url::Url::parse(self.splunkd.base_url())
            .with_context(|| format!("Invalid SPLUNKD_URL format: {}", self.splunkd.base_url()))?;
        url.set_port(Some(self.settings.ui_port))
            .map_err(|_| anyhow::anyhow!("cannot set UI port on {}", url))?;
        let base = url.as_str().trim_end_matches('/').to_string();
        Ok(format!("{}/{}{}", base, self.settings.locale, path))
    }

    async fn fetch_site_relative(&self, path: &str) -> Result<String> {
        let url = self.ui_url(path)?;
        tracing::info!(src = path, url = %url, auth = self.splunkd.credentials().kind(), "fetching static asset");
        let resp = self
            .splunkd
            .transport()
            .send(HttpRequest::get(&url).auth(self.splunkd.credentials()))
            .await
            .with_context(|| format!("failed to download image {}", path))?;
        if !resp.is_success() {
            return Err(PublishError::asset_fetch(&url, resp.status, &resp.text()).into());
        }

        let mime = resp
            .content_type
            .as_deref()
            .map(content_store::essence)
            .unwrap_or_else(|| content_store::mime_from_extension(path).to_string());
        let base = base_name(path);
        let asset =
            content_store::store(resp.body.clone(), &mime, &self.asset_dir, &base).await?;
        Ok(self
            .settings
            .splunk_asset_link(&asset.stored_filename, &asset.mime_type, &resp.body))
    }

    async fn fetch_network(&self, url: &str) -> Result<String> {
        tracing::info!(url, "fetching remote asset");
        let resp = self.splunkd.transport().send(HttpRequest::get(url)).await?;
        if !resp.is_success() {
            return Err(PublishError::asset_fetch(url, resp.status, &resp.text()).into());
        }
        let mime = resp
            .content_type
            .as_deref()
            .map(content_store::essence)
            .unwrap_or_else(|| content_store::mime_from_extension(url).to_string());
        let asset = content_store::store(resp.body, &mime, &self.asset_dir, "img").await?;
        Ok(format!("/assets/{}", asset.stored_filename))
    }

    async fn fetch_kvstore(&self, id: &str, category: AssetCategory) -> Result<String> {
        tracing::info!(id, category = category.as_str(), "fetching KV store asset");
        let data_uri = self.splunkd.kvstore_asset(category.as_str(), id).await?;
        let (mime, data) = parse_data_uri(&data_uri)?;
        let asset =
            content_store::store(data.clone(), &mime, &self.asset_dir, &sanitize(id)).await?;
        Ok(self
            .settings
            .splunk_asset_link(&asset.stored_filename, &asset.mime_type, &data))
    }

    async fn fetch_raw(&self, path: &str) -> Result<String> {
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };
        tracing::info!(path = %path, "fetching raw splunkd asset");
        let resp = self.splunkd.get_asset(&path).await?;
        let mime = resp
            .content_type
            .as_deref()
            .map(content_store::essence)
            .unwrap_or_else(|| content_store::mime_from_extension(&path).to_string());
        let asset =
            content_store::store(resp.body, &mime, &self.asset_dir, &base_name(&path)).await?;
        Ok(self.settings.public_link(&asset.stored_filename))
    }
}

/// Split a `data:<mime>;base64,<payload>` URI into its MIME type and bytes.
pub fn parse_data_uri(uri: &str) -> Result<(String, Vec<u8>)> {
    let rest = uri
        .strip_prefix("data:")
        .ok_or_else(|| PublishError::InvalidDataUri("missing data: prefix".into()))?;
    let (header, payload) = rest
        .split_once(',')
        .ok_or_else(|| PublishError::InvalidDataUri("missing payload separator".into()))?;
    let mime = header
        .strip_suffix(";base64")
        .ok_or_else(|| PublishError::InvalidDataUri(format!("unsupported encoding in {}", header)))?;
    let mime = mime.split(';').next().unwrap_or_default().trim();
    if mime.is_empty() {
        return Err(PublishError::InvalidDataUri("missing MIME type".into()).into());
    }
    let data = base64::engine::general_purpose::STANDARD
        .decode(payload.trim())
        .map_err(|e| PublishError::InvalidDataUri(e.to_string()))?;
    Ok((mime.to_ascii_lowercase(), data))
}

/// Last path segment without query string or extension, sanitized.
fn base_name(path: &str) -> String {
    let path = path.split(['?', '#']).next().unwrap_or_default();
    let file = path.rsplit('/').next().unwrap_or_default();
    let stem = match file.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => file,
    };
    sanitize(stem)
}

fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "img".to_string()
    } else {
        cleaned
    }
}

/// Short, log-friendly rendering of a reference (inline SVGs can be huge).
fn preview(src: &str) -> String {
    if src.len() > 80 {
        format!("{}...", src.chars().take(80).collect::<String>())
    } else {
        src.to_string()
    }
}
