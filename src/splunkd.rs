//! Splunkd REST client.
//!
//! Thin wrapper over [`HttpTransport`] that knows the Splunkd base URL,
//! the credentials, and the handful of endpoints the publisher needs:
//! dashboard definitions, app and dashboard listings, the current user,
//! and the dashboard-studio KV store used for uploaded images.

use anyhow::{bail, Context, Result};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;

use crate::config::SplunkdConfig;
use crate::error::PublishError;
use crate::transport::{Credentials, HttpRequest, HttpResponse, HttpTransport};

/// A dashboard or app entry from a Splunkd listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listing {
    pub name: String,
    pub label: String,
}

#[derive(Clone)]
pub struct Splunkd {
    base_url: String,
    credentials: Credentials,
    transport: Arc<dyn HttpTransport>,
}

impl Splunkd {
    pub fn new(
        base_url: impl Into<String>,
        credentials: Credentials,
        transport: Arc<dyn HttpTransport>,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
            transport,
        }
    }

    pub fn from_config(config: &SplunkdConfig, transport: Arc<dyn HttpTransport>) -> Result<Self> {
        let url = config
            .url
            .as_deref()
            .context("SPLUNKD_URL is required (set splunkd.url or SPLUNKD_URL)")?;
        Ok(Self::new(url, Credentials::from_config(config), transport))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn transport(&self) -> &Arc<dyn HttpTransport> {
        &self.transport
    }

    async fn send_get(&self, path: &str) -> Result<(String, HttpResponse)> {
        let url = format!("{}{}", self.base_url, path);
        let started = Instant::now();
        let resp = self
            .transport
            .send(HttpRequest::get(&url).auth(&self.credentials))
            .await?;
        tracing::debug!(
            path,
            status = resp.status,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "splunkd GET"
        );
        Ok((url, resp))
    }

    /// Authenticated GET of `path` (which must start with `/`), returning
    /// the raw response. Fails on status > 299.
    pub async fn get_raw(&self, path: &str) -> Result<HttpResponse> {
        let (_, resp) = self.send_get(path).await?;
        if !resp.is_success() {
            if resp.status != 404 {
                tracing::warn!(path, status = resp.status, body = %resp.text(), "splunkd error response");
            }
            return Err(PublishError::Splunkd {
                path: path.to_string(),
                status: resp.status,
            }
            .into());
        }
        Ok(resp)
    }

    /// Authenticated GET of an asset under `path`. A status > 299 fails with
    /// [`PublishError::AssetFetch`] carrying the upstream body.
    pub async fn get_asset(&self, path: &str) -> Result<HttpResponse> {
        let (url, resp) = self.send_get(path).await?;
        if !resp.is_success() {
            return Err(PublishError::asset_fetch(url, resp.status, &resp.text()).into());
        }
        Ok(resp)
    }

    pub async fn get_json(&self, path: &str) -> Result<Value> {
        self.get_raw(path).await?.json()
    }

    /// Fetch a dashboard's definition: the JSON embedded in the view XML,
    /// with the root `theme` attribute merged in when present.
    pub async fn load_dashboard(&self, app: &str, name: &str) -> Result<Value> {
        let path = format!(
            "/servicesNS/nobody/{}/data/ui/views/{}?output_mode=json",
            urlencoding::encode(app),
            urlencoding::encode(name)
        );
        let data = self.get_json(&path).await?;
        let xml = data
            .pointer("/entry/0/content/eai:data")
            .and_then(Value::as_str)
            .with_context(|| format!("dashboard {} has no eai:data", name))?;
        extract_dashboard_definition(xml)
            .with_context(|| format!("failed to extract definition of dashboard {}", name))
    }

    /// Visible Dashboard Studio / classic dashboards owned by `app`.
    pub async fn list_dashboards(&self, app: &str) -> Result<Vec<Listing>> {
        let path = format!(
            "/servicesNS/-/{}/data/ui/views?output_mode=json&count=0&offset=0&search={}",
            urlencoding::encode(app),
            urlencoding::encode("(isDashboard=1 AND isVisible=1 AND (version=2 OR version=1))")
        );
        let data = self.get_json(&path).await?;
        Ok(entries(&data)
            .iter()
            .filter(|e| e.pointer("/acl/app").and_then(Value::as_str) == Some(app))
            .filter_map(listing)
            .collect())
    }

    /// Enabled apps.
    pub async fn list_apps(&self) -> Result<Vec<Listing>> {
        let path = format!(
            "/services/apps/local?output_mode=json&count=0&offset=0&search={}",
            urlencoding::encode("(disabled=0)")
        );
        let data = self.get_json(&path).await?;
        Ok(entries(&data).iter().filter_map(listing).collect())
    }

    /// Username owning the configured credentials.
    pub async fn current_username(&self) -> Result<String> {
        let data = self
            .get_json("/services/authentication/current-context?output_mode=json")
            .await?;
        data.pointer("/entry/0/content/username")
            .and_then(Value::as_str)
            .map(str::to_string)
            .context("current-context response has no username")
    }

    /// Data URI of an image uploaded through the dashboard editor.
    pub async fn kvstore_asset(&self, category: &str, id: &str) -> Result<String> {
        let path = format!(
            "/servicesNS/nobody/splunk-dashboard-studio/storage/collections/data/splunk-dashboard-{}/{}",
            category,
            urlencoding::encode(id)
        );
        let data = self.get_asset(&path).await?.json()?;
        data.get("dataURI")
            .and_then(Value::as_str)
            .map(str::to_string)
            .with_context(|| format!("KV store asset {} has no dataURI", id))
    }
}

fn entries(data: &Value) -> Vec<Value> {
    data.get("entry")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

fn listing(entry: &Value) -> Option<Listing> {
    let name = entry.get("name")?.as_str()?.to_string();
    let label = entry
        .pointer("/content/label")
        .and_then(Value::as_str)
        .unwrap_or(&name)
        .to_string();
    Some(Listing { name, label })
}

/// Pull the JSON `<definition>` out of a view's XML source.
pub fn extract_dashboard_definition(xml: &str) -> Result<Value> {
    let mut reader = quick_xml::Reader::from_str(xml);
    let mut theme: Option<String> = None;
    let mut definition: Option<String> = None;
    let mut depth = 0usize;
    let mut in_definition = false;
    let mut text = String::new();

    loop {
        match reader.read_event() {
            Ok(quick_xml::events::Event::Start(e)) => {
                if depth == 0 {
                    theme = root_theme(&e);
                }
                if depth == 1 && e.local_name().as_ref() == b"definition" {
                    in_definition = true;
                    text.clear();
                }
                depth += 1;
            }
            Ok(quick_xml::events::Event::Empty(e)) => {
                if depth == 0 {
                    theme = root_theme(&e);
                }
            }
            Ok(quick_xml::events::Event::CData(c)) if in_definition => {
                text.push_str(&String::from_utf8_lossy(&c.into_inner()));
            }
            Ok(quick_xml::events::Event::Text(t)) if in_definition => {
                text.push_str(t.unescape().unwrap_or_default().as_ref());
            }
            Ok(quick_xml::events::Event::End(e)) => {
                depth = depth.saturating_sub(1);
                if in_definition && e.local_name().as_ref() == b"definition" {
                    in_definition = false;
                    definition = Some(std::mem::take(&mut text));
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => bail!("malformed dashboard XML: {}", e),
            _ => {}
        }
    }

    let raw = definition.context("dashboard XML has no <definition> element")?;
    let mut def: Value =
        serde_json::from_str(raw.trim()).context("dashboard definition is not valid JSON")?;
    if let (Some(theme), Some(obj)) = (theme, def.as_object_mut()) {
        obj.insert("theme".to_string(), Value::String(theme));
    }
    Ok(def)
}

fn root_theme(e: &quick_xml::events::BytesStart<'_>) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.as_ref() == b"theme")
        .and_then(|a| a.unescape_value().ok())
        .map(|v| v.into_owned())
}
