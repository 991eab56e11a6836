//! Google Cloud Build builds, addressed as `gcb://{project}/{build-id}`.

use anyhow::{anyhow, Result};
use serde_json::{json, Map, Value};
use std::{collections::BTreeMap, sync::Arc};

use super::{scalar, string_field, timestamp, ApiClient, Observation};
use crate::attestation::{
    BuilderId, Completeness, ConfigSource, DigestSet, Invocation, Metadata, SlsaPredicate,
};
use crate::errors::ConfigError;
use crate::run::{Run, RunState};

pub const SCHEME: &str = "gcb://";
pub const BUILDER_ID: &str = "https://cloudbuild.googleapis.com/GoogleHostedWorker@v0.2";
pub const BUILD_TYPE: &str = "https://cloudbuild.googleapis.com/CloudBuildYaml@v0.1";

const WAITING: &[&str] = &["STATUS_UNKNOWN", "PENDING", "QUEUED"];
const TERMINAL: &[&str] = &[
    "SUCCESS",
    "FAILURE",
    "INTERNAL_ERROR",
    "TIMEOUT",
    "CANCELLED",
    "EXPIRED",
];

fn parse(spec_url: &str) -> Result<(String, String)> {
    let invalid = |reason: &str| ConfigError::InvalidUri {
        uri: spec_url.to_string(),
        reason: reason.to_string(),
    };
    let rest = spec_url
        .strip_prefix(SCHEME)
        .ok_or_else(|| invalid("expected gcb:// scheme"))?;
    match rest.trim_end_matches('/').split_once('/') {
        Some((project, id)) if !project.is_empty() && !id.is_empty() && !id.contains('/') => {
            Ok((project.to_string(), id.to_string()))
        }
        _ => Err(invalid("expected gcb://{project}/{build-id}").into()),
    }
}

pub struct CloudBuild {
    spec_url: String,
    endpoint: String,
    client: Arc<dyn ApiClient>,
}

impl CloudBuild {
    pub fn new(spec_url: &str, api_url: &str, client: Arc<dyn ApiClient>) -> Result<Self> {
        let (project, id) = parse(spec_url)?;
        Ok(Self {
            spec_url: spec_url.to_string(),
            endpoint: format!(
                "{}/v1/projects/{project}/builds/{id}",
                api_url.trim_end_matches('/')
            ),
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
        "WORKING" => Ok(RunState::Running),
        s if WAITING.contains(&s) => Ok(RunState::Pending),
        s if TERMINAL.contains(&s) => Ok(RunState::Terminated),
        other => Err(anyhow!("unknown build status {other}")),
    }
}

pub(crate) fn observe(doc: Value) -> Result<Observation> {
    let status = string_field(&doc, "status")?.to_string();
    let state = state_of(&status)?;
    let mut params = BTreeMap::new();
    for key in ["id", "projectId", "logUrl"] {
        if let Some(v) = doc.get(key).and_then(scalar) {
            params.insert(key.to_string(), v);
        }
    }
    if let Some(subs) = doc.get("substitutions").and_then(Value::as_object) {
        for (k, v) in subs {
            if let Some(v) = scalar(v) {
                params.insert(k.clone(), v);
            }
        }
    }
    Ok(Observation {
        state,
        is_success: status == "SUCCESS",
        start_time: timestamp(&doc, "startTime")?,
        end_time: timestamp(&doc, "finishTime")?,
        status,
        params,
        system_data: doc,
    })
}

/// Where the build's source came from, with the resolved commit if any.
fn config_source(doc: &Value) -> ConfigSource {
    let mut digest = DigestSet::new();
    let resolved = doc.pointer("/sourceProvenance/resolvedRepoSource");
    if let Some(sha) = resolved
        .and_then(|r| r.get("commitSha"))
        .and_then(Value::as_str)
    {
        digest.insert("sha1".to_string(), sha.to_string());
    }
    let uri = if let Some(repo) = doc.pointer("/source/repoSource") {
        let project = repo.get("projectId").and_then(Value::as_str).unwrap_or_default();
        let name = repo.get("repoName").and_then(Value::as_str).unwrap_or_default();
        format!("https://source.developers.google.com/p/{project}/r/{name}")
    } else if let Some(storage) = doc.pointer("/source/storageSource") {
        let bucket = storage.get("bucket").and_then(Value::as_str).unwrap_or_default();
        let object = storage.get("object").and_then(Value::as_str).unwrap_or_default();
        format!("gs://{bucket}/{object}")
    } else {
        String::new()
    };
    let entry_point = doc
        .pointer("/substitutions/_TRIGGER_BUILD_CONFIG_PATH")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    ConfigSource {
        uri,
        digest,
        entry_point,
    }
}

pub(crate) fn predicate(run: &Run) -> Result<SlsaPredicate> {
    let doc = &run.system_data;
    let id = doc
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("build {} has no id", run.spec_url))?;
    let substitutions = doc
        .get("substitutions")
        .cloned()
        .unwrap_or_else(|| Value::Object(Map::new()));
    let steps = doc.get("steps").cloned().unwrap_or_else(|| json!([]));

    Ok(SlsaPredicate {
        builder: BuilderId {
            id: BUILDER_ID.to_string(),
        },
        build_type: BUILD_TYPE.to_string(),
        invocation: Invocation {
            config_source: config_source(doc),
            parameters: substitutions,
            environment: json!({
                "project_id": doc.get("projectId").cloned().unwrap_or(Value::Null),
                "log_url": doc.get("logUrl").cloned().unwrap_or(Value::Null),
            }),
        },
        build_config: json!({ "steps": steps }),
        metadata: Some(Metadata {
            build_invocation_id: id.to_string(),
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

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::super::testing::Scripted;
    use super::super::Builder;
    use super::*;
    use crate::config::WatchConfig;
    use time::macros::datetime;

    const URL: &str = "gcb://my-proj/6a1f-77";

    fn doc(status: &str) -> Value {
        json!({
            "id": "6a1f-77",
            "projectId": "my-proj",
            "status": status,
            "createTime": "2022-07-01T08:59:00Z",
            "startTime": "2022-07-01T09:00:00.250Z",
            "finishTime": "2022-07-01T09:04:00Z",
            "logUrl": "https://console.cloud.google.com/cloud-build/builds/6a1f-77",
            "substitutions": {"_IMAGE": "app", "BRANCH_NAME": "main"},
            "steps": [{"name": "gcr.io/cloud-builders/docker", "args": ["build", "."]}],
            "source": {"repoSource": {"projectId": "my-proj", "repoName": "app"}},
            "sourceProvenance": {"resolvedRepoSource": {"commitSha": "0badc0de"}}
        })
    }

    #[test]
    fn parses_build_urls() {
        assert_eq!(parse(URL).unwrap(), ("my-proj".into(), "6a1f-77".into()));
        assert!(parse("gcb://my-proj").is_err());
        assert!(parse("gcb:///id").is_err());
        assert!(parse("gcb://p/a/b").is_err());
    }

    #[test]
    fn endpoint_uses_configured_api() {
        let api = Scripted::new([Ok(doc("QUEUED"))]);
        CloudBuild::new(URL, "http://localhost:9000/", api.clone())
            .unwrap()
            .fetch()
            .unwrap();
        assert_eq!(
            api.calls.lock().unwrap()[0],
            "http://localhost:9000/v1/projects/my-proj/builds/6a1f-77"
        );
    }

    #[test]
    fn status_mapping() {
        for s in ["STATUS_UNKNOWN", "PENDING", "QUEUED"] {
            assert_eq!(state_of(s).unwrap(), RunState::Pending, "{s}");
        }
        assert_eq!(state_of("WORKING").unwrap(), RunState::Running);
        for s in ["SUCCESS", "FAILURE", "INTERNAL_ERROR", "TIMEOUT", "CANCELLED", "EXPIRED"] {
            assert_eq!(state_of(s).unwrap(), RunState::Terminated, "{s}");
        }
        assert!(state_of("").is_err());
        assert!(state_of("success").is_err());
    }

    #[test]
    fn unknown_status_keeps_run_running() {
        let api = Scripted::new([Ok(doc("WORKING")), Ok(doc("SUSPENDED"))]);
        let b = Builder::with_client(URL, &WatchConfig::default(), api).unwrap();
        let mut run = b.get_run(URL).unwrap();
        let err = format!("{:#}", b.refresh_run(&mut run).unwrap_err());
        assert!(err.contains("unknown build status SUSPENDED"), "{err}");
        assert!(run.is_running());
        assert_eq!(run.status, "WORKING");
    }

    #[test]
    fn success_only_on_success_status() {
        assert!(observe(doc("SUCCESS")).unwrap().is_success);
        assert!(!observe(doc("FAILURE")).unwrap().is_success);
    }

    #[test]
    fn observes_substitutions_as_params() {
        let o = observe(doc("WORKING")).unwrap();
        assert_eq!(o.params["_IMAGE"], "app");
        assert_eq!(o.params["projectId"], "my-proj");
        assert_eq!(
            o.start_time,
            Some(datetime!(2022-07-01 09:00:00.25 UTC))
        );
    }

    #[test]
    fn polls_until_terminal() {
        let api = Scripted::new([Ok(doc("QUEUED")), Ok(doc("WORKING")), Ok(doc("SUCCESS"))]);
        let b = Builder::with_client(URL, &WatchConfig::default(), api.clone()).unwrap();
        let mut run = b.get_run(URL).unwrap();
        assert_eq!(run.state(), RunState::Pending);
        b.refresh_run(&mut run).unwrap();
        assert_eq!(run.state(), RunState::Running);
        b.refresh_run(&mut run).unwrap();
        assert!(!run.is_running());
        assert!(run.is_success);
        assert_eq!(api.call_count(), 3);
    }

    #[test]
    fn builds_predicate() {
        let mut run = Run::new(URL);
        observe(doc("SUCCESS")).unwrap().apply(&mut run).unwrap();
        let p = predicate(&run).unwrap();
        assert_eq!(p.builder.id, BUILDER_ID);
        assert_eq!(p.build_type, BUILD_TYPE);
        assert_eq!(p.invocation.parameters["_IMAGE"], "app");
        assert_eq!(
            p.invocation.config_source.uri,
            "https://source.developers.google.com/p/my-proj/r/app"
        );
        assert_eq!(p.invocation.config_source.digest["sha1"], "0badc0de");
        assert_eq!(p.build_config["steps"][0]["args"][0], "build");
        let m = p.metadata.unwrap();
        assert_eq!(m.build_invocation_id, "6a1f-77");
        assert_eq!(m.build_finished_on, Some(datetime!(2022-07-01 09:04:00 UTC)));
    }

    #[test]
    fn storage_source_uri() {
        let mut d = doc("SUCCESS");
        d["source"] = json!({"storageSource": {"bucket": "b", "object": "src.tgz"}});
        assert_eq!(config_source(&d).uri, "gs://b/src.tgz");
    }
}
