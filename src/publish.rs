//! Publish orchestration.
//!
//! `dashpub publish` loads each selected dashboard from Splunk, assembles
//! it, and writes the result into the project directory:
//!
//! ```text
//! <project>/
//!   public/assets/<hash>_<name>.<ext>       resolved images
//!   src/dashboards/<name>/definition.json   assembled definition
//!   src/dashboards/<name>/index.js          page component stub
//!   src/pages/api/data/_datasources.json    datasource manifest
//!   src/_dashboards.json                    {title, tags} per dashboard
//! ```
//!
//! Generated directories are wiped at the start of every run. A dashboard
//! that fails is reported and skipped; the others are still published.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::assemble::{assemble, AssemblyReport};
use crate::config::{Config, DashboardSelection};
use crate::datasources::DatasourceManifest;
use crate::models::DashboardInfo;
use crate::progress::{PublishProgressEvent, PublishProgressReporter};
use crate::resolver::{AssetMemo, AssetResolver, ResolverSettings};
use crate::splunkd::Splunkd;

/// Page component written next to every `definition.json`.
pub const COMPONENT_CODE: &str = r#"import React, { lazy, Suspense } from 'react';
import Loading from '../../components/loading';
import NoSSR from '../../components/nossr';
import definition from './definition.json';

const Dashboard = lazy(() => import('../../components/dashboard'));

export default function DashboardContainer() {
    return (
        <NoSSR>
            <Suspense fallback={<Loading />}>
                <Dashboard definition={definition} />
            </Suspense>
        </NoSSR>
    );
}
"#;

/// Paths of the generated artifacts inside a project directory.
#[derive(Debug, Clone)]
pub struct ProjectLayout {
    root: PathBuf,
}

impl ProjectLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn assets_dir(&self) -> PathBuf {
        self.root.join("public").join("assets")
    }

    pub fn dashboards_dir(&self) -> PathBuf {
        self.root.join("src").join("dashboards")
    }

    pub fn dashboard_dir(&self, name: &str) -> PathBuf {
        self.dashboards_dir().join(name)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root.join("src").join("pages").join("api").join("data")
    }

    pub fn datasources_manifest(&self) -> PathBuf {
        self.data_dir().join("_datasources.json")
    }

    pub fn dashboards_manifest(&self) -> PathBuf {
        self.root.join("src").join("_dashboards.json")
    }

    /// Remove generated output and recreate the directories a run writes to.
    pub async fn reset(&self) -> Result<()> {
        for dir in [self.assets_dir(), self.dashboards_dir()] {
            remove_dir_if_exists(&dir).await?;
        }
        let manifest = self.datasources_manifest();
        if tokio::fs::try_exists(&manifest).await.unwrap_or(false) {
            tokio::fs::remove_file(&manifest)
                .await
                .with_context(|| format!("failed to remove {}", manifest.display()))?;
        }
        for dir in [self.assets_dir(), self.data_dir(), self.dashboards_dir()] {
            tokio::fs::create_dir_all(&dir)
                .await
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}

async fn remove_dir_if_exists(dir: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("failed to remove {}", dir.display())),
    }
}

/// A dashboard that could not be published.
#[derive(Debug, Clone, Serialize)]
pub struct DashboardFailure {
    pub dashboard: String,
    pub error: String,
}

/// Summary of a publish run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PublishOutcome {
    pub published: Vec<String>,
    pub failed: Vec<DashboardFailure>,
    pub datasources: usize,
    pub assets_resolved: usize,
    pub asset_failures: usize,
}

/// Pick the dashboards to publish.
///
/// Precedence: names given on the command line, then `publish.dashboards`
/// (which already includes `DASHPUB_DASHBOARDS`), then every visible
/// dashboard in `app`.
pub async fn select_dashboards(
    splunkd: &Splunkd,
    app: &str,
    names: &[String],
    configured: &BTreeMap<String, DashboardSelection>,
) -> Result<BTreeMap<String, DashboardSelection>> {
    if !names.is_empty() {
        return Ok(names
            .iter()
            .map(|n| {
                let sel = configured.get(n).cloned().unwrap_or_default();
                (n.clone(), sel)
            })
            .collect());
    }
    if !configured.is_empty() {
        return Ok(configured.clone());
    }
    let listed = splunkd.list_dashboards(app).await?;
    tracing::info!(app, count = listed.len(), "publishing every dashboard in app");
    Ok(listed
        .into_iter()
        .map(|l| (l.name, DashboardSelection::default()))
        .collect())
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\'])
    {
        bail!("invalid dashboard name: {:?}", name);
    }
    Ok(())
}

struct Published {
    datasources: DatasourceManifest,
    info: DashboardInfo,
    report: AssemblyReport,
}

async fn publish_one(
    splunkd: &Splunkd,
    resolver: &AssetResolver,
    layout: &ProjectLayout,
    app: &str,
    name: &str,
    selection: &DashboardSelection,
) -> Result<Published> {
    validate_name(name)?;
    tracing::debug!(dashboard = name, "loading dashboard");
    let definition = splunkd.load_dashboard(app, name).await?;
    let assembled = assemble(definition, Some(app), resolver).await?;

    let dir = layout.dashboard_dir(name);
    tokio::fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("failed to create {}", dir.display()))?;
    let json = serde_json::to_string_pretty(&assembled.definition)?;
    tokio::fs::write(dir.join("definition.json"), json).await?;
    tokio::fs::write(dir.join("index.js"), COMPONENT_CODE).await?;

    let title = assembled
        .definition
        .get("title")
        .and_then(|t| t.as_str())
        .map(str::to_string);
    Ok(Published {
        datasources: assembled.datasources,
        info: DashboardInfo {
            title,
            tags: selection.tags.clone(),
        },
        report: assembled.report,
    })
}

/// Publish `dashboards` from `app` into `project_dir`.
pub async fn publish(
    config: &Config,
    splunkd: &Splunkd,
    app: &str,
    dashboards: &BTreeMap<String, DashboardSelection>,
    project_dir: &Path,
    progress: &dyn PublishProgressReporter,
) -> Result<PublishOutcome> {
    let layout = ProjectLayout::new(project_dir);
    layout.reset().await?;

    let resolver = AssetResolver::new(
        splunkd.clone(),
        ResolverSettings::from_config(config),
        layout.assets_dir(),
        Arc::new(AssetMemo::new()),
    );

    let mut outcome = PublishOutcome::default();
    let mut datasources = DatasourceManifest::new();
    let mut infos: BTreeMap<String, DashboardInfo> = BTreeMap::new();
    let total = dashboards.len() as u64;

    for (i, (name, selection)) in dashboards.iter().enumerate() {
        progress.report(PublishProgressEvent::Generating {
            dashboard: name.clone(),
            n: i as u64 + 1,
            total,
        });
        match publish_one(splunkd, &resolver, &layout, app, name, selection).await {
            Ok(done) => {
                progress.report(PublishProgressEvent::Generated {
                    dashboard: name.clone(),
                    assets: done.report.resolved as u64,
                    failed: done.report.failures.len() as u64,
                });
                outcome.assets_resolved += done.report.resolved;
                outcome.asset_failures += done.report.failures.len();
                datasources.extend(done.datasources);
                infos.insert(name.clone(), done.info);
                outcome.published.push(name.clone());
            }
            Err(e) => {
                let error = format!("{:#}", e);
                tracing::error!(dashboard = %name, error = %error, "failed to generate dashboard");
                progress.report(PublishProgressEvent::Failed {
                    dashboard: name.clone(),
                    error: error.clone(),
                });
                outcome.failed.push(DashboardFailure {
                    dashboard: name.clone(),
                    error,
                });
            }
        }
    }

    progress.report(PublishProgressEvent::WritingManifests {
        datasources: datasources.len() as u64,
        dashboards: infos.len() as u64,
    });
    tokio::fs::write(
        layout.datasources_manifest(),
        serde_json::to_string_pretty(&datasources)?,
    )
    .await
    .context("failed to write datasource manifest")?;
    tokio::fs::write(
        layout.dashboards_manifest(),
        serde_json::to_string_pretty(&infos)?,
    )
    .await
    .context("failed to write dashboard manifest")?;

    outcome.datasources = datasources.len();
    tracing::info!(
        published = outcome.published.len(),
        failed = outcome.failed.len(),
        datasources = outcome.datasources,
        assets = outcome.assets_resolved,
        "publish complete"
    );
    Ok(outcome)
}

/// Write a starter `dashpub.toml` and the empty project layout.
///
/// Refuses to overwrite an existing config file.
pub fn init_project(config_path: &Path, project_dir: &Path) -> Result<Vec<PathBuf>> {
    if config_path.exists() {
        bail!("Config file already exists: {}", config_path.display());
    }
    if let Some(parent) = config_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let template = format!(
        r#"# dashpub configuration
#
# Secrets belong in the environment or a .env file:
#   SPLUNKD_TOKEN=...            (preferred)
#   SPLUNKD_USER / SPLUNKD_PASSWORD

[splunkd]
url = "https://localhost:8089"
ui_port = 8000
locale = "en-US"
verify_tls = true

[publish]
# app = "search"
project_dir = "{project}"
# public_base_url = "https://dashboards.example.com"

# [publish.dashboards.my_dashboard]
# tags = ["ops"]

[server]
bind = "0.0.0.0:3001"
project_dir = "{project}"
min_refresh_secs = 60

[server.retry]
max_retries = 3
base_delay_ms = 1000
max_delay_ms = 10000
"#,
        project = project_dir.display()
    );
    std::fs::write(config_path, template)
        .with_context(|| format!("failed to write {}", config_path.display()))?;

    let layout = ProjectLayout::new(project_dir);
    let mut created = vec![config_path.to_path_buf()];
    for dir in [layout.assets_dir(), layout.dashboards_dir(), layout.data_dir()] {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        created.push(dir);
    }
    Ok(created)
}
