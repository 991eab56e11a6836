//! Build backends.
//!
//! A [`Builder`] turns a run-specification URL into a live [`Run`], keeps it
//! refreshed, and describes it as a SLSA predicate once it is done. The
//! backend is chosen from the URL shape:
//!
//! | URL | Backend |
//! |-----|---------|
//! | `https://github.com/{owner}/{repo}/actions/runs/{id}` | [`github::GitHubActions`] |
//! | `gcb://{project}/{build-id}` | [`cloudbuild::CloudBuild`] |

pub mod cloudbuild;
pub mod github;

use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tracing::debug;

use crate::attestation::SlsaPredicate;
use crate::config::WatchConfig;
use crate::errors::ConfigError;
use crate::run::{Run, RunState};

use cloudbuild::CloudBuild;
use github::GitHubActions;

/// Read-only JSON access to a backend API.
pub trait ApiClient: Send + Sync {
    fn get_json(&self, url: &str) -> Result<Value>;
}

/// [`ApiClient`] over a blocking `reqwest` client with optional bearer auth.
pub struct HttpApiClient {
    http: reqwest::blocking::Client,
    token: Option<String>,
}

impl HttpApiClient {
    pub fn new(token: Option<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .user_agent(concat!("runwitness/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(15))
            .timeout(timeout)
            .build()
            .context("creating api client")?;
        Ok(Self { http, token })
    }
}

impl ApiClient for HttpApiClient {
    fn get_json(&self, url: &str) -> Result<Value> {
        let mut req = self.http.get(url).header("Accept", "application/json");
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        let response = req.send().with_context(|| format!("GET {url}"))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(anyhow!("GET {url} returned {status}: {body}"));
        }
        response
            .json()
            .with_context(|| format!("decoding response from {url}"))
    }
}

/// Backend state parsed from one API response, applied to a [`Run`] only
/// after the whole document parsed.
#[derive(Debug)]
pub(crate) struct Observation {
    pub state: RunState,
    pub is_success: bool,
    pub status: String,
    pub start_time: Option<OffsetDateTime>,
    pub end_time: Option<OffsetDateTime>,
    pub params: BTreeMap<String, String>,
    pub system_data: Value,
}

impl Observation {
    fn apply(self, run: &mut Run) -> Result<()> {
        run.advance(self.state)?;
        run.is_success = self.is_success;
        run.status = self.status;
        run.start_time = self.start_time.or(run.start_time);
        run.end_time = self.end_time.or(run.end_time);
        run.params = self.params;
        run.system_data = self.system_data;
        Ok(())
    }
}

/// The build system a run executes on.
pub enum Builder {
    GitHubActions(GitHubActions),
    CloudBuild(CloudBuild),
}

impl Builder {
    /// Picks the backend for `spec_url` and wires it to the real API.
    pub fn new(spec_url: &str, cfg: &WatchConfig) -> Result<Self> {
        let token_env = if spec_url.starts_with(cloudbuild::SCHEME) {
            &cfg.google_token_env
        } else {
            &cfg.github_token_env
        };
        let client = HttpApiClient::new(WatchConfig::token_from_env(token_env), cfg.http_timeout())?;
        Self::with_client(spec_url, cfg, Arc::new(client))
    }

    /// Picks the backend for `spec_url`, talking to it through `client`.
    pub fn with_client(spec_url: &str, cfg: &WatchConfig, client: Arc<dyn ApiClient>) -> Result<Self> {
        if spec_url.starts_with(cloudbuild::SCHEME) {
            return Ok(Self::CloudBuild(CloudBuild::new(
                spec_url,
                &cfg.cloudbuild_api_url,
                client,
            )?));
        }
        if github::matches(spec_url) {
            return Ok(Self::GitHubActions(GitHubActions::new(
                spec_url,
                &cfg.github_api_url,
                client,
            )?));
        }
        Err(ConfigError::UnknownBuilder(spec_url.to_string()).into())
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::GitHubActions(_) => "github-actions",
            Self::CloudBuild(_) => "cloudbuild",
        }
    }

    /// The run-specification URL this builder was created for.
    pub fn spec_url(&self) -> &str {
        match self {
            Self::GitHubActions(b) => b.spec_url(),
            Self::CloudBuild(b) => b.spec_url(),
        }
    }

    /// Fetches the run named by `spec_url` with its current state.
    pub fn get_run(&self, spec_url: &str) -> Result<Run> {
        if spec_url != self.spec_url() {
            return Err(anyhow!(
                "{} builder for {} cannot fetch {spec_url}",
                self.name(),
                self.spec_url()
            ));
        }
        let mut run = Run::new(spec_url);
        self.refresh_run(&mut run)
            .with_context(|| format!("fetching run {spec_url}"))?;
        Ok(run)
    }

    /// Updates `run` in place with the backend's latest view. A terminated
    /// run is left untouched. On error `run` keeps its last observed state.
    pub fn refresh_run(&self, run: &mut Run) -> Result<()> {
        if !run.is_running() {
            return Ok(());
        }
        let doc = match self {
            Self::GitHubActions(b) => b.fetch(),
            Self::CloudBuild(b) => b.fetch(),
        }?;
        let observed = match self {
            Self::GitHubActions(_) => github::observe(doc),
            Self::CloudBuild(_) => cloudbuild::observe(doc),
        }
        .with_context(|| format!("interpreting {} run {}", self.name(), run.spec_url))?;
        debug!(run = %run.spec_url, status = %observed.status, "run refreshed");
        observed.apply(run)
    }

    /// Provenance skeleton for `run`, without subjects.
    pub fn build_predicate(&self, run: &Run) -> Result<SlsaPredicate> {
        match self {
            Self::GitHubActions(_) => github::predicate(run),
            Self::CloudBuild(_) => cloudbuild::predicate(run),
        }
    }
}

/// Reads an optional RFC 3339 timestamp field. Absent, null and empty
/// values are `None`.
pub(crate) fn timestamp(doc: &Value, field: &str) -> Result<Option<OffsetDateTime>> {
    match doc.get(field).and_then(Value::as_str) {
        None | Some("") => Ok(None),
        Some(s) => OffsetDateTime::parse(s, &Rfc3339)
            .map(Some)
            .with_context(|| format!("field {field} is not RFC 3339: {s}")),
    }
}

/// Reads a required string field.
pub(crate) fn string_field<'a>(doc: &'a Value, field: &str) -> Result<&'a str> {
    doc.get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("missing string field {field}"))
}

/// Renders a scalar JSON value as a parameter string. Objects, arrays and
/// null are skipped.
pub(crate) fn scalar(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
