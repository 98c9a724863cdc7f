//! # dashpub
//!
//! Publishes Splunk dashboards as a standalone web application and serves
//! their data at runtime.
//!
//! `dashpub publish` fetches dashboard definitions from Splunk, downloads
//! and content-addresses every image they reference, and writes the
//! definitions plus a datasource manifest into a project directory.
//! `dashpub serve` answers the frontend's data requests by running the
//! manifest's searches against Splunk behind a TTL cache that falls back
//! to stale results when Splunk is unavailable.
//!
//! ## Architecture
//!
//! ```text
//!  publish                                   serve
//! ┌──────────┐   ┌──────────┐   ┌────────┐   ┌─────────┐   ┌────────────┐
//! │ Splunkd  │──▶│ Assemble │──▶│ Assets │   │ /api/*  │──▶│ ResultCache│
//! │  views   │   │ + datasrc│   │ public/│   └─────────┘   └─────┬──────┘
//! └──────────┘   └────┬─────┘   └────────┘                       ▼
//!                     ▼                                   ┌────────────┐
//!              _datasources.json ───────────────────────▶│ Dispatcher │
//!                                                         └────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! dashpub init                          # write dashpub.toml + project layout
//! dashpub apps                          # list apps
//! dashpub dashboards --app search       # list dashboards in an app
//! dashpub publish --app search          # publish every dashboard in the app
//! dashpub serve                         # start the runtime server
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration with environment overrides |
//! | [`error`] | Typed pipeline and search failures |
//! | [`models`] | Core data types |
//! | [`transport`] | HTTP transport abstraction and credentials |
//! | [`splunkd`] | Splunkd REST client |
//! | [`content_store`] | Image normalization and content-addressed storage |
//! | [`resolver`] | Asset reference classification and resolution |
//! | [`datasources`] | `ds.search` → `ds.cdn` conversion |
//! | [`assemble`] | Dashboard definition assembly |
//! | [`publish`] | Publish orchestration and project layout |
//! | [`progress`] | Publish progress reporting |
//! | [`search`] | Search job dispatch and polling |
//! | [`retry`] | Exponential backoff |
//! | [`cache`] | Result cache with stale fallback |
//! | [`server`] | Runtime HTTP server |

pub mod assemble;
pub mod cache;
pub mod config;
pub mod content_store;
pub mod datasources;
pub mod error;
pub mod models;
pub mod progress;
pub mod publish;
pub mod resolver;
pub mod retry;
pub mod search;
pub mod server;
pub mod splunkd;
pub mod transport;
