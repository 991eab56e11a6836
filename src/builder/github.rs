//! GitHub Actions workflow runs.

use anyhow::{anyhow, Context, Result};
use serde_json::{json, Value};
use std::{collections::BTreeMap, sync::Arc};
use url::Url;

use super::{scalar, string_field, timestamp, ApiClient, Observation};
use crate::attestation::{
    BuilderId, Completeness, ConfigSource, DigestSet, Invocation, Metadata, SlsaPredicate,
};
use crate::errors::ConfigError;
use crate::run::{Run, RunState};

pub const BUILDER_ID: &str = "https://github.com/Attestations/GitHubHostedActions@v1";
pub const BUILD_TYPE: &str = "https://github.com/Attestations/GitHubActionsWorkflow@v1";

/// Run document fields copied into [`Run::params`].
const PARAM_FIELDS: &[&str] = &[
    "id",
    "run_attempt",
    "run_number",
    "event",
    "head_branch",
    "head_sha",
    "workflow_id",
    "path",
];

/// Coordinates of one workflow run.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RunRef {
    owner: String,
    repo: String,
    id: u64,
}

fn parse(spec_url: &str) -> Result<RunRef> {
    let invalid = |reason: &str| ConfigError::InvalidUri {
        uri: spec_url.to_string(),
        reason: reason.to_string(),
    };
    let u = Url::parse(spec_url).map_err(|e| invalid(&e.to_string()))?;
    if u.scheme() != "https" || u.host_str() != Some("github.com") {
        return Err(invalid("not a github.com url").into());
    }
    let segments: Vec<&str> = u
        .path_segments()
        .map(|s| s.filter(|p| !p.is_empty()).collect())
        .unwrap_or_default();
    match segments.as_slice() {
        [owner, repo, "actions", "runs", id] => Ok(RunRef {
            owner: (*owner).to_string(),
            repo: (*repo).to_string(),
            id: id.parse().map_err(|_| invalid("run id is not a number"))?,
        }),
        _ => Err(invalid("expected /{owner}/{repo}/actions/runs/{id}").into()),
    }
}

/// True when `spec_url` names a GitHub Actions run.
pub fn matches(spec_url: &str) -> bool {
    parse(spec_url).is_ok()
}

pub struct GitHubActions {
    spec_url: String,
    endpoint: String,
    client: Arc<dyn ApiClient>,
}

impl GitHubActions {
    pub fn new(spec_url: &str, api_url: &str, client: Arc<dyn ApiClient>) -> Result<Self> {
        let r = parse(spec_url)?;
        let endpoint = format!(
            "{}/repos/{}/{}/actions/runs/{}",
            api_url.trim_end_matches('/'),
            r.owner,
            r.repo,
            r.id
        );
        Ok(Self {
            spec_url: spec_url.to_string(),
            endpoint,
            client,
        })
    }

    pub fn spec_url(&self) -> &str {
        &self.spec_url
    }

    pub(crate) fn fetch(&self) -> Result<Value> {
        self.client.get_json(&self.endpoint)
    }
}

fn state_of(status: &str) -> Result<RunState> {
    match status {
        "queued" | "waiting" | "requested" | "pending" => Ok(RunState::Pending),
        "in_progress" => Ok(RunState::Running),
        "completed" => Ok(RunState::Terminated),
        other => Err(anyhow!("unknown workflow run status {other}")),
    }
}

pub(crate) fn observe(doc: Value) -> Result<Observation> {
    let status = string_field(&doc, "status")?.to_string();
    let state = state_of(&status)?;
    let is_success = doc.get("conclusion").and_then(Value::as_str) == Some("success");
    let start_time = timestamp(&doc, "run_started_at")?;
    let end_time = if state == RunState::Terminated {
        timestamp(&doc, "updated_at")?
    } else {
        None
    };
    let params: BTreeMap<String, String> = PARAM_FIELDS
        .iter()
        .filter_map(|f| doc.get(*f).and_then(scalar).map(|v| ((*f).to_string(), v)))
        .collect();
    Ok(Observation {
        state,
        is_success,
        status,
        start_time,
        end_time,
        params,
        system_data: doc,
    })
}

pub(crate) fn predicate(run: &Run) -> Result<SlsaPredicate> {
    let doc = &run.system_data;
    let repo_url = doc
        .pointer("/repository/html_url")
        .and_then(Value::as_str)
        .with_context(|| format!("run {} has no repository url", run.spec_url))?;
    let param = |k: &str| run.params.get(k).cloned().unwrap_or_default();

    let mut digest = DigestSet::new();
    if let Some(sha) = run.params.get("head_sha") {
        digest.insert("sha1".to_string(), sha.clone());
    }
    let uri = match run.params.get("head_branch") {
        Some(branch) => format!("git+{repo_url}@refs/heads/{branch}"),
        None => format!("git+{repo_url}"),
    };
    let attempt = run
        .params
        .get("run_attempt")
        .cloned()
        .unwrap_or_else(|| "1".to_string());

    Ok(SlsaPredicate {
        builder: BuilderId {
            id: BUILDER_ID.to_string(),
        },
        build_type: BUILD_TYPE.to_string(),
        invocation: Invocation {
            config_source: ConfigSource {
                uri,
                digest,
                entry_point: param("path"),
            },
            parameters: Value::Null,
            environment: json!({
                "github_event_name": param("event"),
                "github_run_id": param("id"),
                "github_run_attempt": attempt,
                "github_run_number": param("run_number"),
                "github_sha1": param("head_sha"),
                "github_workflow_id": param("workflow_id"),
            }),
        },
        build_config: Value::Null,
        metadata: Some(Metadata {
            build_invocation_id: format!("{}-{attempt}", param("id")),
            build_started_on: run.start_time,
            build_finished_on: run.end_time,
            completeness: Completeness {
                parameters: true,
                environment: false,
                materials: false,
            },
            reproducible: false,
        }),
        materials: Vec::new(),
    })
}
