//! Dashboard assembly.
//!
//! Takes a dashboard definition as loaded from Splunk and produces the
//! version that gets published: search data sources lifted into the
//! datasource manifest, and every image reference rewritten to a resolved
//! asset path.
//!
//! Image-bearing fields are known per visualization kind:
//!
//! | Type | Field | Category |
//! |------|-------|----------|
//! | `viz.singlevalueicon`, `splunk.singlevalueicon` | `options.icon` | icons |
//! | `viz.img`, `splunk.image` | `options.src` | images |
//! | `splunk.choropleth.svg` | `options.svg` | images |
//! | layout | `layout.options.backgroundImage.src` | images |
//!
//! Values that are token placeholders (`$token$`) or already inline data
//! URIs are left for the browser. A field that fails to resolve keeps its
//! original value; the rest of the dashboard is still published.

use anyhow::Result;
use serde::Serialize;
use serde_json::Value;

use crate::datasources::{generate_cdn_datasources, DatasourceManifest};
use crate::models::AssetCategory;
use crate::resolver::AssetResolver;

/// Visualization kinds with asset-bearing options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VisualizationKind {
    SingleValueIcon,
    Image,
    ChoroplethSvg,
    /// Any other type; passed through untouched.
    Unknown(String),
}

impl VisualizationKind {
    pub fn from_type(viz_type: &str) -> Self {
        match viz_type {
            "viz.singlevalueicon" | "splunk.singlevalueicon" => VisualizationKind::SingleValueIcon,
            "viz.img" | "splunk.image" => VisualizationKind::Image,
            "splunk.choropleth.svg" => VisualizationKind::ChoroplethSvg,
            other => VisualizationKind::Unknown(other.to_string()),
        }
    }

    /// Option fields holding asset references, with their lookup category.
    pub fn asset_fields(&self) -> &'static [(&'static str, AssetCategory)] {
        match self {
            VisualizationKind::SingleValueIcon => &[("icon", AssetCategory::Icons)],
            VisualizationKind::Image => &[("src", AssetCategory::Images)],
            VisualizationKind::ChoroplethSvg => &[("svg", AssetCategory::Images)],
            VisualizationKind::Unknown(_) => &[],
        }
    }
}

/// True for values containing a `$...$` token placeholder.
pub fn is_placeholder(value: &str) -> bool {
    match (value.find('$'), value.rfind('$')) {
        (Some(first), Some(last)) => last > first,
        _ => false,
    }
}

fn is_inline_data(value: &str) -> bool {
    value.trim_start().starts_with("data:image")
}

/// One asset field that could not be resolved.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AssetFailure {
    /// Visualization id, or `layout` for the background image.
    pub location: String,
    pub field: String,
    pub source: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AssemblyReport {
    pub resolved: usize,
    pub skipped: usize,
    pub failures: Vec<AssetFailure>,
}

#[derive(Debug, Clone)]
pub struct AssembledDashboard {
    pub datasources: DatasourceManifest,
    pub definition: Value,
    pub report: AssemblyReport,
}

/// Convert data sources and resolve every asset reference in `definition`.
///
/// Only a malformed `dataSources` block fails the whole dashboard; asset
/// failures are recorded in the report.
pub async fn assemble(
    mut definition: Value,
    app: Option<&str>,
    resolver: &AssetResolver,
) -> Result<AssembledDashboard> {
    let datasources = generate_cdn_datasources(&mut definition, app)?;
    let mut report = AssemblyReport::default();

    let ids: Vec<String> = definition
        .get("visualizations")
        .and_then(Value::as_object)
        .map(|v| v.keys().cloned().collect())
        .unwrap_or_default();

    for id in ids {
        let pointer = format!("/visualizations/{}", escape_pointer(&id));
        let Some(viz) = definition.pointer_mut(&pointer) else {
            continue;
        };
        let kind = VisualizationKind::from_type(
            viz.get("type").and_then(Value::as_str).unwrap_or_default(),
        );
        for (field, category) in kind.asset_fields() {
            let Some(slot) = viz.get_mut("options").and_then(|o| o.get_mut(*field)) else {
                continue;
            };
            resolve_slot(slot, &id, field, *category, resolver, &mut report).await;
        }
    }

    if let Some(slot) = definition.pointer_mut("/layout/options/backgroundImage/src") {
        resolve_slot(slot, "layout", "backgroundImage.src", AssetCategory::Images, resolver, &mut report)
            .await;
    }

    Ok(AssembledDashboard {
        datasources,
        definition,
        report,
    })
}

async fn resolve_slot(
    slot: &mut Value,
    location: &str,
    field: &str,
    category: AssetCategory,
    resolver: &AssetResolver,
    report: &mut AssemblyReport,
) {
    let Some(source) = slot.as_str().map(str::to_string) else {
        return;
    };
    if is_placeholder(&source) {
        tracing::debug!(location, field, "skipping token placeholder");
        report.skipped += 1;
        return;
    }
    if is_inline_data(&source) {
        tracing::debug!(location, field, "skipping inline data URI");
        report.skipped += 1;
        return;
    }
    match resolver.resolve(&source, category).await {
        Ok(resolved) => {
            *slot = Value::String(resolved);
            report.resolved += 1;
        }
        Err(e) => {
            tracing::error!(location, field, error = %format!("{:#}", e), "failed to process visualization asset");
            report.failures.push(AssetFailure {
                location: location.to_string(),
                field: field.to_string(),
                source,
                error: format!("{:#}", e),
            });
        }
    }
}

/// RFC 6901 escaping for a single pointer segment.
fn escape_pointer(segment: &str) -> String {
    segment.replace('~', "~0").replace('/', "~1")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::resolver::{AssetMemo, ResolverSettings};
    use crate::splunkd::Splunkd;
    use crate::transport::mock::{ok, MockTransport};
    use crate::transport::{Credentials, Method};
    use image::{ImageBuffer, ImageFormat, Rgba};
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn png_bytes() -> Vec<u8> {
        let img = ImageBuffer::from_pixel(2, 2, Rgba([9u8, 9, 9, 255]));
        let mut out = std::io::Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    fn resolver(transport: Arc<MockTransport>, dir: &std::path::Path) -> AssetResolver {
        let splunkd = Splunkd::new("https://splunk:8089", Credentials::None, transport);
        AssetResolver::new(
            splunkd,
            ResolverSettings::from_config(&Config::default()),
            dir,
            Arc::new(AssetMemo::new()),
        )
    }

    #[test]
    fn kinds_map_to_fields() {
        assert_eq!(
            VisualizationKind::from_type("splunk.singlevalueicon").asset_fields(),
            &[("icon", AssetCategory::Icons)]
        );
        assert_eq!(
            VisualizationKind::from_type("viz.img").asset_fields(),
            &[("src", AssetCategory::Images)]
        );
        assert_eq!(
            VisualizationKind::from_type("splunk.choropleth.svg").asset_fields(),
            &[("svg", AssetCategory::Images)]
        );
        let unknown = VisualizationKind::from_type("splunk.table");
        assert_eq!(unknown, VisualizationKind::Unknown("splunk.table".into()));
        assert!(unknown.asset_fields().is_empty());
    }

    #[test]
    fn placeholder_detection() {
        assert!(is_placeholder("$logo_token$"));
        assert!(is_placeholder("/static/$app$/icon.png"));
        assert!(!is_placeholder("/static/icon.png"));
        assert!(!is_placeholder("costs $5"));
    }

    #[tokio::test]
    async fn one_bad_visualization_does_not_sink_the_dashboard() {
        let tmp = TempDir::new().unwrap();
        let transport = Arc::new(
            MockTransport::new()
                .on(Method::Get, "/static/good.png", ok("image/png", png_bytes()))
                .on(Method::Get, "/static/chart.svg", ok("image/svg+xml", "<svg/>"))
                .on(Method::Get, "/static/bad.tiff", ok("image/tiff", "II*\0")),
        );
        let r = resolver(transport, tmp.path());
        let def = json!({
            "visualizations": {
                "viz_icon": {"type": "splunk.singlevalueicon", "options": {"icon": "/static/good.png"}},
                "viz_map": {"type": "splunk.choropleth.svg", "options": {"svg": "/static/chart.svg"}},
                "viz_bad": {"type": "splunk.image", "options": {"src": "/static/bad.tiff"}}
            }
        });

        let out = assemble(def, Some("search"), &r).await.unwrap();
        let vizs = out.definition["visualizations"].as_object().unwrap();
        assert_eq!(vizs.len(), 3);
        let icon = vizs["viz_icon"]["options"]["icon"].as_str().unwrap();
        assert!(icon.starts_with("/assets/") && icon.ends_with("_good.png"));
        assert!(vizs["viz_map"]["options"]["svg"]
            .as_str()
            .unwrap()
            .starts_with("data:image/svg+xml;base64,"));
        assert_eq!(vizs["viz_bad"]["options"]["src"], "/static/bad.tiff");

        assert_eq!(out.report.resolved, 2);
        assert_eq!(out.report.failures.len(), 1);
        assert_eq!(out.report.failures[0].location, "viz_bad");
        assert!(out.report.failures[0].error.contains("image/tiff"));
    }

    #[tokio::test]
    async fn placeholders_data_uris_and_unknown_types_pass_through() {
        let tmp = TempDir::new().unwrap();
        let transport = Arc::new(MockTransport::new());
        let r = resolver(transport.clone(), tmp.path());
        let def = json!({
            "visualizations": {
                "a": {"type": "viz.img", "options": {"src": "$img_token$"}},
                "b": {"type": "splunk.image", "options": {"src": "data:image/png;base64,AAAA"}},
                "c": {"type": "splunk.table", "options": {"src": "/static/ignored.png"}},
                "d": {"type": "splunk.image", "options": {}}
            },
            "layout": {"options": {"backgroundImage": {"src": "$bg$"}}}
        });
        let out = assemble(def.clone(), None, &r).await.unwrap();
        assert_eq!(out.definition, def);
        assert_eq!(out.report.skipped, 3);
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn background_image_is_resolved() {
        let tmp = TempDir::new().unwrap();
        let transport = Arc::new(
            MockTransport::new().on(Method::Get, "https://cdn.example.com/bg.png", ok("image/png", png_bytes())),
        );
        let r = resolver(transport, tmp.path());
        let def = json!({
            "layout": {"options": {"backgroundImage": {"src": "https://cdn.example.com/bg.png"}}}
        });
        let out = assemble(def, None, &r).await.unwrap();
        let src = out.definition["layout"]["options"]["backgroundImage"]["src"]
            .as_str()
            .unwrap();
        assert!(src.starts_with("/assets/") && src.ends_with("_img.png"));
    }

    #[tokio::test]
    async fn shared_icon_is_fetched_once_across_visualizations() {
        let tmp = TempDir::new().unwrap();
        let transport = Arc::new(
            MockTransport::new().on(Method::Get, "/static/shared.png", ok("image/png", png_bytes())),
        );
        let r = resolver(transport.clone(), tmp.path());
        let def = json!({"visualizations": {
            "one": {"type": "viz.singlevalueicon", "options": {"icon": "/static/shared.png"}},
            "two": {"type": "splunk.singlevalueicon", "options": {"icon": "/static/shared.png"}}
        }});
        let out = assemble(def, None, &r).await.unwrap();
        assert_eq!(
            out.definition["visualizations"]["one"]["options"]["icon"],
            out.definition["visualizations"]["two"]["options"]["icon"]
        );
        assert_eq!(transport.count("shared.png"), 1);
    }
}
