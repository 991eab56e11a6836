//! Container registry image store.
//!
//! An image reference resolves to a set of content-addressed descriptors:
//! the manifest, its config blob and every layer. Multi-platform indexes are
//! walked down to each child manifest. Every descriptor becomes one snapshot
//! entry keyed by its digest.

use anyhow::{anyhow, Context, Result};
use regex::Regex;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::errors::ConfigError;
use crate::snapshot::{Artifact, Snapshot, DIGEST};

pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";

const DEFAULT_TAG: &str = "latest";

/// Raw manifest as served by a registry.
#[derive(Debug, Clone)]
pub struct FetchedManifest {
    pub digest: String,
    pub media_type: String,
    pub body: Vec<u8>,
}

/// Minimal registry surface the driver needs.
pub trait RegistryClient: Send + Sync {
    /// Fetches the manifest for `reference` (tag or digest) of `repository`
    /// on `registry`. `repository` is the registry-relative name.
    fn fetch_manifest(
        &self,
        registry: &str,
        repository: &str,
        reference: &str,
    ) -> Result<FetchedManifest>;
}

/// One image in a registry.
pub struct Oci {
    /// Registry host, e.g. `ghcr.io`.
    pub registry: String,
    /// Registry plus namespace, e.g. `ghcr.io/uservers/miniprow`.
    pub repository: String,
    pub image: String,
    /// Tag or `sha256:` digest.
    pub reference: String,
    client: Arc<dyn RegistryClient>,
}

impl std::fmt::Debug for Oci {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Oci")
            .field("repository", &self.repository)
            .field("image", &self.image)
            .field("reference", &self.reference)
            .finish_non_exhaustive()
    }
}

impl Oci {
    /// Parses `oci://registry/repo/image[:tag|@digest]`.
    pub fn new(spec_url: &str, client: Arc<dyn RegistryClient>) -> Result<Self> {
        let rest = spec_url.strip_prefix("oci://").ok_or_else(|| ConfigError::InvalidUri {
            uri: spec_url.to_string(),
            reason: "expected an oci:// reference".to_string(),
        })?;

        let (name, digest) = match rest.split_once('@') {
            Some((n, d)) => (n, Some(d)),
            None => (rest, None),
        };
        let (repository, last) = name
            .rsplit_once('/')
            .filter(|(repo, img)| !repo.is_empty() && !img.is_empty())
            .ok_or_else(|| ConfigError::MissingImage(spec_url.to_string()))?;
        let (image, tag) = match last.split_once(':') {
            Some((i, t)) => (i, Some(t)),
            None => (last, None),
        };
        if image.is_empty() {
            return Err(ConfigError::MissingImage(spec_url.to_string()).into());
        }
        let reference = digest
            .or(tag)
            .filter(|r| !r.is_empty())
            .unwrap_or(DEFAULT_TAG)
            .to_string();
        let registry = repository
            .split('/')
            .next()
            .unwrap_or(repository)
            .to_string();

        Ok(Self {
            registry,
            repository: repository.to_string(),
            image: image.to_string(),
            reference,
            client,
        })
    }

    /// Repository path relative to the registry host, as the v2 API wants it.
    pub fn api_repository(&self) -> String {
        let namespace = self
            .repository
            .strip_prefix(&self.registry)
            .unwrap_or_default()
            .trim_start_matches('/');
        match namespace {
            "" if is_docker_hub(&self.registry) => format!("library/{}", self.image),
            "" => self.image.clone(),
            ns => format!("{ns}/{}", self.image),
        }
    }

    fn artifact(&self, digest: &str) -> Artifact {
        Artifact::new(
            format!("{}/{}@{digest}", self.repository, self.image),
            OffsetDateTime::UNIX_EPOCH,
        )
        .with_checksum(DIGEST, digest)
    }

    /// Resolves the image and records every descriptor composing it.
    pub fn snap(&self) -> Result<Snapshot> {
        let repo = self.api_repository();
        let mut queue = VecDeque::from([self.reference.clone()]);
        let mut visited: HashSet<String> = HashSet::new();
        let mut recorded: HashSet<String> = HashSet::new();
        let mut entries: Vec<(String, Artifact)> = Vec::new();

        while let Some(reference) = queue.pop_front() {
            if !visited.insert(reference.clone()) {
                continue;
            }
            let fetched = self
                .client
                .fetch_manifest(&self.registry, &repo, &reference)
                .with_context(|| {
                    format!("fetching manifest {}/{repo}:{reference}", self.registry)
                })?;
            if !recorded.insert(fetched.digest.clone()) {
                continue;
            }
            entries.push((fetched.digest.clone(), self.artifact(&fetched.digest)));

            let doc: ManifestDoc = serde_json::from_slice(&fetched.body)
                .with_context(|| format!("parsing manifest {}", fetched.digest))?;
            let media_type = doc.media_type.as_deref().unwrap_or(&fetched.media_type);

            if media_type == OCI_INDEX
                || media_type == DOCKER_MANIFEST_LIST
                || !doc.manifests.is_empty()
            {
                debug!(digest = %fetched.digest, children = doc.manifests.len(), "image index");
                for child in doc.manifests {
                    if !recorded.contains(&child.digest) {
                        queue.push_back(child.digest);
                    }
                }
                continue;
            }

            let config = doc
                .config
                .ok_or_else(|| anyhow!("manifest {} has no config descriptor", fetched.digest))?;
            for blob in std::iter::once(config).chain(doc.layers) {
                if recorded.insert(blob.digest.clone()) {
                    entries.push((blob.digest.clone(), self.artifact(&blob.digest)));
                }
            }
        }

        info!(image = %self.image, descriptors = entries.len(), "registry snapshot");
        Ok(entries.into_iter().collect())
    }
}

fn is_docker_hub(registry: &str) -> bool {
    matches!(registry, "docker.io" | "index.docker.io" | "registry-1.docker.io")
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManifestDoc {
    media_type: Option<String>,
    config: Option<Descriptor>,
    #[serde(default)]
    layers: Vec<Descriptor>,
    #[serde(default)]
    manifests: Vec<Descriptor>,
}

#[derive(Debug, Deserialize)]
struct Descriptor {
    digest: String,
}

/// [`RegistryClient`] speaking the distribution v2 HTTP API with anonymous
/// bearer tokens.
pub struct RegistryHttpClient {
    http: reqwest::blocking::Client,
    scheme: String,
    /// Bearer tokens keyed by (registry, repository).
    tokens: Mutex<HashMap<(String, String), String>>,
}

impl RegistryHttpClient {
    pub fn new(scheme: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .timeout(timeout)
            .build()
            .context("creating registry client")?;
        Ok(Self {
            http,
            scheme: scheme.to_string(),
            tokens: Mutex::new(HashMap::new()),
        })
    }

    fn host(registry: &str) -> &str {
        if is_docker_hub(registry) {
            "registry-1.docker.io"
        } else {
            registry
        }
    }

    fn cached_token(&self, registry: &str, repository: &str) -> Option<String> {
        self.tokens
            .lock()
            .ok()?
            .get(&(registry.to_string(), repository.to_string()))
            .cloned()
    }

    fn remember_token(&self, registry: &str, repository: &str, token: &str) {
        if let Ok(mut cache) = self.tokens.lock() {
            cache.insert(
                (registry.to_string(), repository.to_string()),
                token.to_string(),
            );
        }
    }

    fn request(&self, url: &str, token: Option<&str>) -> Result<reqwest::blocking::Response> {
        let mut req = self.http.get(url).header(
            "Accept",
            [OCI_INDEX, OCI_MANIFEST, DOCKER_MANIFEST_LIST, DOCKER_MANIFEST].join(", "),
        );
        if let Some(t) = token {
            req = req.bearer_auth(t);
        }
        req.send().with_context(|| format!("GET {url}"))
    }

    /// Answers a `WWW-Authenticate: Bearer ...` challenge with an anonymous token.
    fn fetch_token(&self, challenge: &str, registry: &str, repository: &str) -> Result<String> {
        #[derive(Deserialize)]
        struct TokenResponse {
            token: Option<String>,
            access_token: Option<String>,
        }

        let params = parse_challenge(challenge)?;
        let realm = params
            .get("realm")
            .ok_or_else(|| anyhow!("auth challenge has no realm: {challenge}"))?;
        let scope = params
            .get("scope")
            .cloned()
            .unwrap_or_else(|| format!("repository:{repository}:pull"));
        let mut query = vec![("scope", scope)];
        if let Some(service) = params.get("service") {
            query.push(("service", service.clone()));
        }

        let response = self
            .http
            .get(realm)
            .query(&query)
            .send()
            .with_context(|| format!("requesting registry token from {realm}"))?;
        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("token endpoint {realm} returned {status}"));
        }
        let body: TokenResponse = response.json().context("decoding registry token")?;
        let token = body
            .token
            .or(body.access_token)
            .ok_or_else(|| anyhow!("token endpoint {realm} returned no token"))?;
        self.remember_token(registry, repository, &token);
        Ok(token)
    }
}

impl RegistryClient for RegistryHttpClient {
    fn fetch_manifest(
        &self,
        registry: &str,
        repository: &str,
        reference: &str,
    ) -> Result<FetchedManifest> {
        let url = format!(
            "{}://{}/v2/{repository}/manifests/{reference}",
            self.scheme,
            Self::host(registry)
        );

        let cached = self.cached_token(registry, repository);
        let mut response = self.request(&url, cached.as_deref())?;
        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            let challenge = response
                .headers()
                .get(reqwest::header::WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| anyhow!("GET {url} returned 401 without an auth challenge"))?
                .to_string();
            let token = self.fetch_token(&challenge, registry, repository)?;
            response = self.request(&url, Some(&token))?;
        }

        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("GET {url} returned {status}"));
        }
        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(ToString::to_string)
        };
        let media_type = header("Content-Type").unwrap_or_default();
        let served_digest = header("Docker-Content-Digest");
        let body = response.bytes().context("reading manifest body")?.to_vec();

        let computed = format!("sha256:{}", hex::encode(Sha256::digest(&body)));
        if reference.starts_with("sha256:") && reference != computed {
            return Err(anyhow!(
                "manifest digest mismatch for {repository}: asked {reference}, got {computed}"
            ));
        }
        Ok(FetchedManifest {
            digest: served_digest.unwrap_or(computed),
            media_type,
            body,
        })
    }
}

/// Splits `Bearer realm="..",service="..",scope=".."` into its parameters.
fn parse_challenge(challenge: &str) -> Result<HashMap<String, String>> {
    let rest = challenge
        .trim()
        .strip_prefix("Bearer ")
        .ok_or_else(|| anyhow!("unsupported auth challenge: {challenge}"))?;
    let re = Regex::new(r#"(\w+)="([^"]*)""#)?;
    Ok(re
        .captures_iter(rest)
        .filter_map(|c| Some((c.get(1)?.as_str().to_string(), c.get(2)?.as_str().to_string())))
        .collect())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Registry serving fixed manifests by tag or digest.
    #[derive(Default)]
    struct FakeRegistry {
        manifests: HashMap<String, FetchedManifest>,
        calls: Mutex<Vec<(String, String)>>,
    }

    impl FakeRegistry {
        fn add(&mut self, tags: &[&str], media_type: &str, doc: serde_json::Value) -> String {
            let body = serde_json::to_vec(&doc).unwrap();
            let digest = format!("sha256:{}", hex::encode(Sha256::digest(&body)));
            let m = FetchedManifest {
                digest: digest.clone(),
                media_type: media_type.to_string(),
                body,
            };
            self.manifests.insert(digest.clone(), m.clone());
            for t in tags {
                self.manifests.insert((*t).to_string(), m.clone());
            }
            digest
        }
    }

    impl RegistryClient for FakeRegistry {
        fn fetch_manifest(&self, _registry: &str, repository: &str, reference: &str) -> Result<FetchedManifest> {
            self.calls
                .lock()
                .unwrap()
                .push((repository.to_string(), reference.to_string()));
            self.manifests
                .get(reference)
                .cloned()
                .ok_or_else(|| anyhow!("manifest unknown: {reference}"))
        }
    }

    fn image_manifest(config: &str, layers: &[&str]) -> serde_json::Value {
        json!({
            "schemaVersion": 2,
            "mediaType": OCI_MANIFEST,
            "config": {"mediaType": "application/vnd.oci.image.config.v1+json", "digest": config, "size": 10},
            "layers": layers.iter().map(|d| json!({"mediaType": "application/vnd.oci.image.layer.v1.tar+gzip", "digest": d, "size": 100})).collect::<Vec<_>>()
        })
    }

    #[test]
    fn reference_without_tag_defaults_to_latest() {
        let oci = Oci::new(
            "oci://ghcr.io/uservers/miniprow/miniprow",
            Arc::new(FakeRegistry::default()),
        )
        .unwrap();
        assert_eq!(oci.image, "miniprow");
        assert_eq!(oci.repository, "ghcr.io/uservers/miniprow");
        assert_eq!(oci.registry, "ghcr.io");
        assert_eq!(oci.reference, "latest");
        assert_eq!(oci.api_repository(), "uservers/miniprow/miniprow");
    }

    #[test]
    fn reference_with_tag_and_port() {
        let oci = Oci::new("oci://localhost:5000/team/app:v1.2", Arc::new(FakeRegistry::default()))
            .unwrap();
        assert_eq!(oci.registry, "localhost:5000");
        assert_eq!(oci.repository, "localhost:5000/team");
        assert_eq!(oci.image, "app");
        assert_eq!(oci.reference, "v1.2");
    }

    #[test]
    fn reference_with_digest() {
        let oci = Oci::new("oci://docker.io/nginx@sha256:abcd", Arc::new(FakeRegistry::default()))
            .unwrap();
        assert_eq!(oci.reference, "sha256:abcd");
        assert_eq!(oci.api_repository(), "library/nginx");
    }

    #[test]
    fn reference_without_image_is_a_config_error() {
        let err = Oci::new("oci://ghcr.io", Arc::new(FakeRegistry::default())).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::MissingImage(_))
        ));
    }

    #[test]
    fn single_manifest_yields_manifest_config_and_layers() {
        let mut reg = FakeRegistry::default();
        let manifest = reg.add(
            &["latest"],
            OCI_MANIFEST,
            image_manifest("sha256:c0", &["sha256:l1", "sha256:l2", "sha256:l3"]),
        );
        let oci = Oci::new("oci://ghcr.io/uservers/miniprow/miniprow", Arc::new(reg)).unwrap();
        let snap = oci.snap().unwrap();
        assert_eq!(snap.len(), 5);
        let entry = snap.get(&manifest).unwrap();
        assert_eq!(entry.checksum[DIGEST], manifest);
        assert_eq!(
            entry.path,
            format!("ghcr.io/uservers/miniprow/miniprow@{manifest}")
        );
        assert_eq!(entry.time, OffsetDateTime::UNIX_EPOCH);
        assert!(snap.contains("sha256:c0"));
    }

    #[test]
    fn index_enumerates_every_child() {
        let mut reg = FakeRegistry::default();
        let amd = reg.add(&[], OCI_MANIFEST, image_manifest("sha256:ca", &["sha256:shared", "sha256:a1"]));
        let arm = reg.add(&[], DOCKER_MANIFEST, image_manifest("sha256:cb", &["sha256:shared", "sha256:b1"]));
        let index = reg.add(
            &["v1"],
            OCI_INDEX,
            json!({"schemaVersion": 2, "mediaType": OCI_INDEX, "manifests": [
                {"mediaType": OCI_MANIFEST, "digest": amd, "size": 1},
                {"mediaType": DOCKER_MANIFEST, "digest": arm, "size": 1}
            ]}),
        );
        let oci = Oci::new("oci://ghcr.io/org/app:v1", Arc::new(reg)).unwrap();
        let snap = oci.snap().unwrap();
        // index + 2 manifests + 2 configs + shared + a1 + b1
        assert_eq!(snap.len(), 8);
        for d in [&index, &amd, &arm] {
            assert!(snap.contains(d), "missing {d}");
        }
    }

    #[test]
    fn fetch_errors_name_the_image() {
        let oci = Oci::new("oci://ghcr.io/org/app:missing", Arc::new(FakeRegistry::default()))
            .unwrap();
        let err = format!("{:#}", oci.snap().unwrap_err());
        assert!(err.contains("ghcr.io/org/app:missing"), "{err}");
    }

    #[test]
    fn tokens_are_scoped_to_registry_and_repository() {
        let client = RegistryHttpClient::new("https", Duration::from_secs(1)).unwrap();
        client.remember_token("ghcr.io", "org/app", "ghcr-token");
        assert_eq!(
            client.cached_token("ghcr.io", "org/app").as_deref(),
            Some("ghcr-token")
        );
        assert_eq!(client.cached_token("quay.io", "org/app"), None);
        assert_eq!(client.cached_token("ghcr.io", "org/other"), None);
    }

    #[test]
    fn parse_bearer_challenge() {
        let p = parse_challenge(
            r#"Bearer realm="https://ghcr.io/token",service="ghcr.io",scope="repository:org/app:pull""#,
        )
        .unwrap();
        assert_eq!(p["realm"], "https://ghcr.io/token");
        assert_eq!(p["service"], "ghcr.io");
        assert_eq!(p["scope"], "repository:org/app:pull");
        assert!(parse_challenge("Basic realm=\"x\"").is_err());
    }
}
