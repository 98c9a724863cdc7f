//! Datasource extraction.
//!
//! Published dashboards never talk to Splunk directly. Every `ds.search`
//! (and every `ds.chain` built on one) is lifted out of the definition into
//! a [`DatasourceDescriptor`] and replaced with a `ds.cdn` data source
//! pointing at `/api/data/<id>`, which the runtime server answers from its
//! result cache.
//!
//! Descriptor ids are content hashes of the app and search, so the same
//! search used by two dashboards maps to one cache entry.

use anyhow::{bail, Result};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

use crate::content_store::short_hash;
use crate::models::{DatasourceDescriptor, SearchSpec};

/// `_datasources.json`: descriptor id → descriptor.
pub type DatasourceManifest = BTreeMap<String, DatasourceDescriptor>;

/// Parse a refresh interval: integer seconds or a Splunk span
/// (`30s`, `5m`, `1h`, `1d`). Zero and unparseable values yield `None`.
pub fn parse_refresh(value: &Value) -> Option<u64> {
    let secs = match value {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().map(|f| f.max(0.0) as u64)),
        Value::String(s) => parse_span(s.trim()),
        _ => None,
    };
    secs.filter(|s| *s > 0)
}

fn parse_span(s: &str) -> Option<u64> {
    if let Ok(n) = s.parse::<u64>() {
        return Some(n);
    }
    let split = s.find(|c: char| !c.is_ascii_digit())?;
    let (num, unit) = s.split_at(split);
    let n: u64 = num.parse().ok()?;
    let mult = match unit {
        "s" | "sec" | "secs" | "second" | "seconds" => 1,
        "m" | "min" | "mins" | "minute" | "minutes" => 60,
        "h" | "hr" | "hrs" | "hour" | "hours" => 3600,
        "d" | "day" | "days" => 86400,
        _ => return None,
    };
    Some(n * mult)
}

/// Stable id for a search: 20 hex chars of the hash of app + spec.
pub fn descriptor_id(app: Option<&str>, spec: &SearchSpec) -> String {
    let payload = json!({ "app": app, "search": spec });
    short_hash(payload.to_string().as_bytes())
}

fn options(ds: &Value) -> Option<&Map<String, Value>> {
    ds.get("options").and_then(Value::as_object)
}

fn option_str<'a>(ds: &'a Value, key: &str) -> Option<&'a str> {
    options(ds)
        .and_then(|o| o.get(key))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Build the search spec for `name`, following `extend` links for chains.
fn search_spec(
    name: &str,
    sources: &Map<String, Value>,
    defaults: &Map<String, Value>,
) -> Result<SearchSpec> {
    let mut postprocess: Vec<String> = Vec::new();
    let mut refresh = None;
    let mut current = name;

    for _ in 0..=sources.len() {
        let ds = match sources.get(current) {
            Some(ds) => ds,
            None => bail!("data source {} extends unknown data source {}", name, current),
        };
        if refresh.is_none() {
            refresh = options(ds).and_then(|o| o.get("refresh")).and_then(parse_refresh);
        }
        match ds.get("type").and_then(Value::as_str) {
            Some("ds.search") => {
                let query = option_str(ds, "query")
                    .map(str::to_string)
                    .ok_or_else(|| anyhow::anyhow!("data source {} has no query", current))?;
                let query_parameters = options(ds)
                    .and_then(|o| o.get("queryParameters"))
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_else(|| defaults.clone());
                postprocess.reverse();
                let postprocess = if postprocess.is_empty() {
                    None
                } else {
                    Some(postprocess.join("\n"))
                };
                return Ok(SearchSpec {
                    query,
                    query_parameters,
                    refresh,
                    postprocess,
                });
            }
            Some("ds.chain") => {
                if let Some(q) = option_str(ds, "query") {
                    postprocess.push(q.to_string());
                }
                current = option_str(ds, "extend").ok_or_else(|| {
                    anyhow::anyhow!("chained data source {} has no extend", current)
                })?;
            }
            other => bail!(
                "data source {} cannot extend {} of type {}",
                name,
                current,
                other.unwrap_or("<none>")
            ),
        }
    }
    bail!("data source {} has a cyclic extend chain", name)
}

/// Replace every search-backed data source in `definition` with a `ds.cdn`
/// reference and return the extracted descriptors.
///
/// Data sources of other types are left untouched. A search that cannot be
/// converted (missing query, broken chain) is logged and left as is.
pub fn generate_cdn_datasources(
    definition: &mut Value,
    app: Option<&str>,
) -> Result<DatasourceManifest> {
    let mut manifest = DatasourceManifest::new();
    let defaults = definition
        .pointer("/defaults/dataSources/ds.search/options/queryParameters")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    let sources = match definition.get("dataSources") {
        None | Some(Value::Null) => return Ok(manifest),
        Some(Value::Object(map)) => map.clone(),
        Some(_) => bail!("dashboard dataSources is not an object"),
    };

    let mut replacements = Vec::new();
    for (name, ds) in &sources {
        let kind = ds.get("type").and_then(Value::as_str).unwrap_or_default();
        if kind != "ds.search" && kind != "ds.chain" {
            continue;
        }
        let spec = match search_spec(name, &sources, &defaults) {
            Ok(spec) => spec,
            Err(e) => {
                tracing::warn!(datasource = %name, error = %e, "skipping data source");
                continue;
            }
        };
        let id = descriptor_id(app, &spec);
        let mut cdn = json!({
            "type": "ds.cdn",
            "options": { "uri": format!("/api/data/{}", id) }
        });
        if let (Some(label), Some(obj)) = (ds.get("name"), cdn.as_object_mut()) {
            obj.insert("name".to_string(), label.clone());
        }
        tracing::debug!(datasource = %name, id = %id, "converted data source");
        manifest.insert(
            id.clone(),
            DatasourceDescriptor {
                id,
                app: app.map(str::to_string),
                search: spec,
            },
        );
        replacements.push((name.clone(), cdn));
    }

    if let Some(target) = definition.get_mut("dataSources").and_then(Value::as_object_mut) {
        for (name, cdn) in replacements {
            target.insert(name, cdn);
        }
    }
    Ok(manifest)
}
