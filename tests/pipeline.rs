//! End-to-end publish tests.
//!
//! A scripted transport stands in for Splunkd and the UI port so the whole
//! pipeline (dashboard load, asset resolution, datasource conversion, and
//! project output) runs against a temporary directory.

use anyhow::Result;
use async_trait::async_trait;
use dashpub::config::{Config, DashboardSelection};
use dashpub::datasources::DatasourceManifest;
use dashpub::progress::{PublishProgressEvent, PublishProgressReporter};
use dashpub::publish::{publish, ProjectLayout};
use dashpub::splunkd::Splunkd;
use dashpub::transport::{Credentials, HttpRequest, HttpResponse, HttpTransport};
use image::{ImageBuffer, ImageFormat, Rgba};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

// ─── Scripted Splunkd ───────────────────────────────────────────────

/// Answers requests whose URL contains a registered fragment; anything
/// else gets a 404. Every request URL is recorded.
struct ScriptedSplunk {
    routes: Vec<(String, HttpResponse)>,
    seen: Mutex<Vec<String>>,
}

impl ScriptedSplunk {
    fn new() -> Self {
        Self {
            routes: Vec::new(),
            seen: Mutex::new(Vec::new()),
        }
    }

    fn route(mut self, fragment: &str, content_type: &str, body: Vec<u8>) -> Self {
        self.routes.push((
            fragment.to_string(),
            HttpResponse {
                status: 200,
                content_type: Some(content_type.to_string()),
                body,
            },
        ));
        self
    }

    fn requests_matching(&self, fragment: &str) -> usize {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .filter(|u| u.contains(fragment))
            .count()
    }
}

#[async_trait]
impl HttpTransport for ScriptedSplunk {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        self.seen.lock().unwrap().push(request.url.clone());
        for (fragment, resp) in &self.routes {
            if request.url.contains(fragment.as_str()) {
                return Ok(resp.clone());
            }
        }
        Ok(HttpResponse {
            status: 404,
            content_type: Some("text/plain".to_string()),
            body: b"not found".to_vec(),
        })
    }
}

/// Collects progress events for assertions.
#[derive(Default)]
struct RecordingProgress {
    events: Mutex<Vec<PublishProgressEvent>>,
}

impl PublishProgressReporter for RecordingProgress {
    fn report(&self, event: PublishProgressEvent) {
        self.events.lock().unwrap().push(event);
    }
}

fn view(definition: Value) -> Vec<u8> {
    let xml = format!(
        "<dashboard version=\"2\"><definition><![CDATA[{}]]></definition></dashboard>",
        definition
    );
    serde_json::to_vec(&json!({"entry": [{"content": {"eai:data": xml}}]})).unwrap()
}

fn png_bytes() -> Vec<u8> {
    let img = ImageBuffer::from_pixel(4, 4, Rgba([200u8, 40, 40, 255]));
    let mut out = std::io::Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png).unwrap();
    out.into_inner()
}

fn is_hashed_name(name: &str, suffix: &str) -> bool {
    match name.strip_suffix(suffix) {
        Some(hash) => hash.len() == 20 && hash.chars().all(|c| c.is_ascii_hexdigit()),
        None => false,
    }
}

fn read_json(path: &std::path::Path) -> Value {
    serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
}

fn ops_dashboard() -> Value {
    json!({
        "title": "Operations",
        "dataSources": {
            "base": {
                "type": "ds.search",
                "options": {"query": "index=ops | stats count by host", "refresh": "1m"}
            },
            "top": {
                "type": "ds.chain",
                "options": {"extend": "base", "query": "| head 5"}
            }
        },
        "visualizations": {
            "status": {
                "type": "splunk.singlevalueicon",
                "dataSources": {"primary": "base"},
                "options": {"icon": "/static/app/x/appserver/static/icon.png"}
            },
            "repeat": {
                "type": "splunk.singlevalueicon",
                "options": {"icon": "/static/app/x/appserver/static/icon.png"}
            },
            "tokenized": {
                "type": "splunk.image",
                "options": {"src": "$banner$"}
            },
            "table": {"type": "splunk.table", "dataSources": {"primary": "top"}}
        }
    })
}

// ─── Tests ──────────────────────────────────────────────────────────

#[tokio::test]
async fn publishes_dashboard_with_site_relative_icon() {
    let tmp = TempDir::new().unwrap();
    let transport = Arc::new(
        ScriptedSplunk::new()
            .route("/data/ui/views/ops", "application/json", view(ops_dashboard()))
            .route("/appserver/static/icon.png", "image/png", png_bytes()),
    );
    let splunkd = Splunkd::new(
        "https://splunk.example.com:8089",
        Credentials::Bearer("t0ken".into()),
        transport.clone(),
    );
    let mut dashboards = BTreeMap::new();
    dashboards.insert(
        "ops".to_string(),
        DashboardSelection {
            tags: vec!["prod".into()],
        },
    );
    let progress = RecordingProgress::default();

    let outcome = publish(
        &Config::default(),
        &splunkd,
        "x",
        &dashboards,
        tmp.path(),
        &progress,
    )
    .await
    .unwrap();

    assert_eq!(outcome.published, vec!["ops"]);
    assert!(outcome.failed.is_empty());
    assert_eq!(outcome.asset_failures, 0);

    // Asset written once under public/assets with a content-hash prefix.
    let layout = ProjectLayout::new(tmp.path());
    let files: Vec<String> = std::fs::read_dir(layout.assets_dir())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(files.len(), 1, "unexpected assets: {:?}", files);
    assert!(is_hashed_name(&files[0], "_icon.png"), "bad name {}", files[0]);

    // Both icon references point at the stored file; the icon was fetched
    // from the UI port exactly once.
    let def = read_json(&layout.dashboard_dir("ops").join("definition.json"));
    let expected = format!("/assets/{}", files[0]);
    assert_eq!(def["visualizations"]["status"]["options"]["icon"], expected.as_str());
    assert_eq!(def["visualizations"]["repeat"]["options"]["icon"], expected.as_str());
    assert_eq!(def["visualizations"]["tokenized"]["options"]["src"], "$banner$");
    assert_eq!(transport.requests_matching("icon.png"), 1);
    assert_eq!(
        transport.requests_matching("https://splunk.example.com:8000/en-US/static/app/x"),
        1
    );

    // Data sources are rewritten to CDN links backed by the manifest.
    let manifest: DatasourceManifest =
        serde_json::from_value(read_json(&layout.datasources_manifest())).unwrap();
    assert_eq!(manifest.len(), 2);
    for name in ["base", "top"] {
        let ds = &def["dataSources"][name];
        assert_eq!(ds["type"], "ds.cdn");
        let id = ds["options"]["uri"]
            .as_str()
            .unwrap()
            .strip_prefix("/api/data/")
            .unwrap();
        let desc = &manifest[id];
        assert_eq!(desc.id, id);
        assert_eq!(desc.app.as_deref(), Some("x"));
        assert_eq!(desc.search.refresh, Some(60));
    }
    let top_id = def["dataSources"]["top"]["options"]["uri"]
        .as_str()
        .unwrap()
        .trim_start_matches("/api/data/");
    assert_eq!(manifest[top_id].search.postprocess.as_deref(), Some("| head 5"));

    let infos = read_json(&layout.dashboards_manifest());
    assert_eq!(infos["ops"]["title"], "Operations");
    assert_eq!(infos["ops"]["tags"], json!(["prod"]));

    let events = progress.events.lock().unwrap();
    assert!(matches!(
        events.first(),
        Some(PublishProgressEvent::Generating { n: 1, total: 1, .. })
    ));
    assert!(matches!(
        events.last(),
        Some(PublishProgressEvent::WritingManifests { datasources: 2, dashboards: 1 })
    ));
}

#[tokio::test]
async fn republishing_replaces_previous_output() {
    let tmp = TempDir::new().unwrap();
    let layout = ProjectLayout::new(tmp.path());
    std::fs::create_dir_all(layout.dashboard_dir("stale")).unwrap();
    std::fs::create_dir_all(layout.assets_dir()).unwrap();
    std::fs::write(layout.assets_dir().join("old_img.png"), b"old").unwrap();

    let transport = Arc::new(ScriptedSplunk::new().route(
        "/data/ui/views/plain",
        "application/json",
        view(json!({"title": "Plain", "visualizations": {}})),
    ));
    let splunkd = Splunkd::new("https://splunk:8089", Credentials::None, transport);
    let mut dashboards = BTreeMap::new();
    dashboards.insert("plain".to_string(), DashboardSelection::default());

    let outcome = publish(
        &Config::default(),
        &splunkd,
        "search",
        &dashboards,
        tmp.path(),
        &RecordingProgress::default(),
    )
    .await
    .unwrap();

    assert_eq!(outcome.published, vec!["plain"]);
    assert!(!layout.dashboard_dir("stale").exists());
    assert!(!layout.assets_dir().join("old_img.png").exists());
    assert!(layout.dashboard_dir("plain").join("definition.json").exists());
    let manifest = read_json(&layout.datasources_manifest());
    assert_eq!(manifest, json!({}));
}

#[tokio::test]
async fn unreachable_asset_is_reported_but_dashboard_still_published() {
    let tmp = TempDir::new().unwrap();
    let transport = Arc::new(ScriptedSplunk::new().route(
        "/data/ui/views/broken_img",
        "application/json",
        view(json!({
            "visualizations": {
                "logo": {"type": "splunk.image", "options": {"src": "/static/missing.png"}}
            }
        })),
    ));
    let splunkd = Splunkd::new("https://splunk:8089", Credentials::None, transport);
    let mut dashboards = BTreeMap::new();
    dashboards.insert("broken_img".to_string(), DashboardSelection::default());

    let outcome = publish(
        &Config::default(),
        &splunkd,
        "search",
        &dashboards,
        tmp.path(),
        &RecordingProgress::default(),
    )
    .await
    .unwrap();

    assert_eq!(outcome.published, vec!["broken_img"]);
    assert_eq!(outcome.asset_failures, 1);
    let def = read_json(
        &ProjectLayout::new(tmp.path())
            .dashboard_dir("broken_img")
            .join("definition.json"),
    );
    assert_eq!(
        def["visualizations"]["logo"]["options"]["src"],
        "/static/missing.png"
    );
}
