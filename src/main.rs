//! # dashpub CLI
//!
//! The `dashpub` binary publishes Splunk dashboards into a web project and
//! runs the server that feeds them data.
//!
//! ## Usage
//!
//! ```bash
//! dashpub --config ./dashpub.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `dashpub init` | Write a starter config and the project layout |
//! | `dashpub apps` | List enabled Splunk apps |
//! | `dashpub dashboards` | List dashboards in an app |
//! | `dashpub publish [NAMES...]` | Publish dashboards into the project directory |
//! | `dashpub serve` | Start the runtime data server |
//!
//! Connection settings and secrets are usually supplied through the
//! environment (`SPLUNKD_URL`, `SPLUNKD_TOKEN`, ...); a `.env` file in the
//! working directory is loaded first.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use dashpub::config::{self, Config};
use dashpub::progress::ProgressMode;
use dashpub::publish::{init_project, publish, select_dashboards};
use dashpub::server::run_server;
use dashpub::splunkd::Splunkd;
use dashpub::transport::ReqwestTransport;

/// dashpub: publish Splunk dashboards as a standalone web application.
#[derive(Parser)]
#[command(
    name = "dashpub",
    about = "Publish Splunk dashboards as a standalone web application",
    version
)]
struct Cli {
    /// Path to configuration file (TOML). A missing file means defaults
    /// plus environment overrides.
    #[arg(long, global = true, default_value = "./dashpub.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter config file and create the project directories.
    Init {
        /// Project directory to create.
        #[arg(long, default_value = "./app")]
        project_dir: PathBuf,
    },

    /// List enabled apps.
    Apps,

    /// List visible dashboards in an app.
    Dashboards {
        /// App to list (defaults to `publish.app` / `DASHPUB_APP`).
        #[arg(long)]
        app: Option<String>,
    },

    /// Publish dashboards into the project directory.
    ///
    /// Without NAMES, publishes the dashboards configured in
    /// `publish.dashboards` (or `DASHPUB_DASHBOARDS`), else every visible
    /// dashboard in the app.
    Publish {
        /// App owning the dashboards.
        #[arg(long)]
        app: Option<String>,

        /// Output project directory (overrides `publish.project_dir`).
        #[arg(long)]
        project_dir: Option<PathBuf>,

        /// Progress output on stderr. Defaults to human when stderr is a TTY.
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,

        /// Dashboards to publish.
        names: Vec<String>,
    },

    /// Start the runtime server.
    Serve {
        /// Bind address (overrides `server.bind`).
        #[arg(long)]
        bind: Option<String>,
    },
}

fn init_tracing(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn connect(cfg: &Config) -> Result<Splunkd> {
    let transport = Arc::new(ReqwestTransport::new(&cfg.splunkd)?);
    Splunkd::from_config(&cfg.splunkd, transport)
}

fn require_app(arg: Option<String>, cfg: &Config) -> Result<String> {
    arg.or_else(|| cfg.publish.app.clone())
        .context("no app given (use --app, publish.app or DASHPUB_APP)")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();
    init_tracing(match cli.command {
        Commands::Serve { .. } => "info",
        _ => "warn",
    });

    // Commands that don't require config
    if let Commands::Init { project_dir } = &cli.command {
        let created = init_project(&cli.config, project_dir)?;
        for path in created {
            println!("created {}", path.display());
        }
        return Ok(());
    }

    let mut cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init { .. } => {}
        Commands::Apps => {
            let splunkd = connect(&cfg)?;
            for app in splunkd.list_apps().await? {
                println!("{}\t{}", app.name, app.label);
            }
        }
        Commands::Dashboards { app } => {
            let app = require_app(app, &cfg)?;
            let splunkd = connect(&cfg)?;
            for dash in splunkd.list_dashboards(&app).await? {
                println!("{}\t{}", dash.name, dash.label);
            }
        }
        Commands::Publish {
            app,
            project_dir,
            progress,
            names,
        } => {
            let app = require_app(app, &cfg)?;
            let project_dir = project_dir.unwrap_or_else(|| cfg.publish.project_dir.clone());
            let reporter = progress.unwrap_or_else(ProgressMode::default_for_tty).reporter();
            let splunkd = connect(&cfg)?;

            let dashboards =
                select_dashboards(&splunkd, &app, &names, &cfg.publish.dashboards).await?;
            if dashboards.is_empty() {
                bail!("no dashboards to publish in app {}", app);
            }
            let outcome = publish(
                &cfg,
                &splunkd,
                &app,
                &dashboards,
                &project_dir,
                reporter.as_ref(),
            )
            .await?;

            println!(
                "Published {} dashboard(s), {} datasource(s), {} asset(s) into {}",
                outcome.published.len(),
                outcome.datasources,
                outcome.assets_resolved,
                project_dir.display()
            );
            if outcome.asset_failures > 0 {
                println!("{} asset(s) could not be resolved", outcome.asset_failures);
            }
            for failure in &outcome.failed {
                println!("FAILED {}: {}", failure.dashboard, failure.error);
            }
            if outcome.published.is_empty() {
                bail!("no dashboards were published");
            }
        }
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                cfg.server.bind = bind;
            }
            run_server(&cfg).await?;
        }
    }

    Ok(())
}
