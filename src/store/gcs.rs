//! Google Cloud Storage artifact store.
//!
//! GCS has no real directories, so a snapshot first mirrors every object
//! under the configured prefix into a private temporary directory and then
//! lets the [`Directory`] driver compute times and checksums. Identities are
//! rewritten back to `gs://bucket/object` before the snapshot is returned.
//!
//! Listing walks "directories" with an explicit worklist and a visited set
//! instead of recursion. Downloads run on a bounded pool of scoped threads;
//! the directory snapshot only starts after every download has finished.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::{
    collections::{HashMap, HashSet, VecDeque},
    fs,
    io::{BufWriter, Write},
    path::{Component, Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tracing::{debug, info};
use url::Url;

use super::directory::Directory;
use crate::errors::ConfigError;
use crate::snapshot::Snapshot;

/// One object returned by a listing call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEntry {
    pub name: String,
    pub size: u64,
    pub content_type: Option<String>,
    /// Last modification time reported by the bucket.
    pub updated: Option<OffsetDateTime>,
}

/// One page of a delimited listing.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub objects: Vec<ObjectEntry>,
    /// Sub-prefixes ("directories") reported by the delimiter.
    pub prefixes: Vec<String>,
    pub next_page_token: Option<String>,
}

/// Minimal object storage surface the driver needs.
pub trait ObjectClient: Send + Sync {
    /// Lists one page of `bucket` under `prefix` using `/` as delimiter.
    fn list(&self, bucket: &str, prefix: &str, page_token: Option<&str>) -> Result<ListPage>;

    /// Streams the contents of `name` into `out`, returning the byte count.
    fn download(&self, bucket: &str, name: &str, out: &mut dyn Write) -> Result<u64>;
}

/// A bucket prefix holding build outputs.
pub struct Gcs {
    pub bucket: String,
    pub path: String,
    workers: usize,
    client: Arc<dyn ObjectClient>,
}

impl std::fmt::Debug for Gcs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gcs")
            .field("bucket", &self.bucket)
            .field("path", &self.path)
            .field("workers", &self.workers)
            .finish_non_exhaustive()
    }
}

impl Gcs {
    /// Parses `gs://bucket/prefix`. Both parts are required.
    pub fn new(spec_url: &str, client: Arc<dyn ObjectClient>, workers: usize) -> Result<Self> {
        let u = Url::parse(spec_url).map_err(|e| ConfigError::InvalidUri {
            uri: spec_url.to_string(),
            reason: e.to_string(),
        })?;
        let bucket = u.host_str().unwrap_or_default().to_string();
        if bucket.is_empty() {
            return Err(ConfigError::MissingBucket(spec_url.to_string()).into());
        }
        if u.path().is_empty() {
            return Err(ConfigError::MissingPath(spec_url.to_string()).into());
        }
        info!(bucket = %bucket, path = %u.path(), "GCS driver init");
        Ok(Self {
            bucket,
            path: u.path().to_string(),
            workers: workers.max(1),
            client,
        })
    }

    /// Listing prefix for the configured path: no leading slash, a trailing
    /// slash unless it is the bucket root.
    fn root_prefix(&self) -> String {
        let trimmed = self.path.trim_matches('/');
        if trimmed.is_empty() {
            String::new()
        } else {
            format!("{trimmed}/")
        }
    }

    /// Lists every object to mirror under the configured prefix.
    fn list_objects(&self) -> Result<Vec<ObjectEntry>> {
        let mut queue = VecDeque::from([self.root_prefix()]);
        let mut seen: HashSet<String> = HashSet::new();
        let mut files = Vec::new();

        while let Some(prefix) = queue.pop_front() {
            if !seen.insert(prefix.clone()) {
                continue;
            }
            debug!(prefix = %prefix, "listing prefix");
            let mut token: Option<String> = None;
            loop {
                let page = self
                    .client
                    .list(&self.bucket, &prefix, token.as_deref())
                    .with_context(|| format!("listing gs://{}/{prefix}", self.bucket))?;

                for sub in page.prefixes {
                    if !seen.contains(&sub) {
                        queue.push_back(sub);
                    }
                }

                for obj in page.objects {
                    if obj.name.ends_with('/') {
                        // Placeholder object marking a directory.
                        if !seen.contains(&obj.name) {
                            queue.push_back(obj.name);
                        }
                        continue;
                    }
                    if is_marker_text(&obj) {
                        // Heuristic: may hide a genuine empty text artifact.
                        debug!(object = %obj.name, "skipping zero-length text object");
                        continue;
                    }
                    files.push(obj);
                }

                match page.next_page_token {
                    Some(t) if !t.is_empty() => token = Some(t),
                    _ => break,
                }
            }
        }
        files.sort_by(|a, b| a.name.cmp(&b.name));
        files.dedup_by(|a, b| a.name == b.name);
        Ok(files)
    }

    /// Copies one object into the working directory.
    fn download_one(&self, workdir: &Path, name: &str) -> Result<()> {
        let local = local_path(workdir, name)?;
        if let Some(parent) = local.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating directory {}", parent.display()))?;
        }
        let file = fs::File::create(&local)
            .with_context(|| format!("opening local file {}", local.display()))?;
        let mut out = BufWriter::new(file);
        let bytes = self
            .client
            .download(&self.bucket, name, &mut out)
            .with_context(|| format!("copying gs://{}/{name}", self.bucket))?;
        out.flush()
            .with_context(|| format!("flushing {}", local.display()))?;
        debug!(object = %name, bytes, "downloaded object");
        Ok(())
    }

    /// Downloads `objects` with at most `self.workers` threads. Returns once
    /// every worker has stopped; the first failure stops further downloads.
    fn download_all(&self, workdir: &Path, objects: &[ObjectEntry]) -> Result<()> {
        if objects.is_empty() {
            return Ok(());
        }
        let next = &AtomicUsize::new(0);
        let failed = &AtomicBool::new(false);
        let workers = self.workers.min(objects.len());

        let results: Vec<Result<()>> = thread::scope(|s| {
            let handles: Vec<_> = (0..workers)
                .map(|_| {
                    s.spawn(move || -> Result<()> {
                        while !failed.load(Ordering::Acquire) {
                            let Some(obj) = objects.get(next.fetch_add(1, Ordering::AcqRel)) else {
                                break;
                            };
                            if let Err(e) = self.download_one(workdir, &obj.name) {
                                failed.store(true, Ordering::Release);
                                return Err(e);
                            }
                        }
                        Ok(())
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| {
                    h.join()
                        .unwrap_or_else(|_| Err(anyhow!("download worker panicked")))
                })
                .collect()
        });
        results.into_iter().collect()
    }

    /// Mirrors the prefix locally and snapshots it.
    pub fn snap(&self) -> Result<Snapshot> {
        let workdir = tempfile::Builder::new()
            .prefix("runwitness-gcs")
            .tempdir()
            .context("creating temporary directory")?;

        let objects = self.list_objects().context("synching bucket")?;
        let by_identity = local_identities(&objects)?;
        info!(bucket = %self.bucket, objects = objects.len(), "mirroring bucket prefix");
        self.download_all(workdir.path(), &objects)
            .context("synching bucket")?;

        let local = Directory::at(workdir.path())
            .snap()
            .context("snapshotting work directory")?;

        // Local mtimes are download times; prefer what the bucket reports.
        local
            .artifacts()
            .map(|a| {
                let obj = by_identity.get(a.path.as_str()).ok_or_else(|| {
                    anyhow!("local file {} does not belong to any listed object", a.path)
                })?;
                let mut a = a.clone();
                if let Some(t) = obj.updated {
                    a.time = t;
                }
                a.path = format!("gs://{}/{}", self.bucket, obj.name);
                Ok((a.path.clone(), a))
            })
            .collect()
    }
}

fn is_marker_text(obj: &ObjectEntry) -> bool {
    obj.size == 0
        && obj
            .content_type
            .as_deref()
            .is_some_and(|ct| ct.starts_with("text/plain"))
}

/// Relative `/` path an object name lands on in the working directory.
/// Empty and `.` segments fold away, so `out//a` and `out/./a` both become
/// `out/a`. Names that would land outside the directory are refused.
fn local_identity(name: &str) -> Result<String> {
    let mut parts = Vec::new();
    for c in Path::new(name).components() {
        match c {
            Component::Normal(p) => parts.push(p.to_string_lossy()),
            Component::CurDir => {}
            _ => {
                return Err(anyhow!(
                    "Security: Path traversal attempt detected. Object {name} escapes the work directory"
                ))
            }
        }
    }
    if parts.is_empty() {
        return Err(anyhow!("object {name:?} has no usable local path"));
    }
    Ok(parts.join("/"))
}

/// Indexes `objects` by local identity. Two objects folding onto the same
/// local file cannot both be mirrored, so that is an error.
fn local_identities(objects: &[ObjectEntry]) -> Result<HashMap<String, &ObjectEntry>> {
    let mut by_identity: HashMap<String, &ObjectEntry> = HashMap::new();
    for obj in objects {
        let identity = local_identity(&obj.name)?;
        if let Some(prev) = by_identity.insert(identity.clone(), obj) {
            return Err(anyhow!(
                "objects {} and {} both map to local path {identity}",
                prev.name,
                obj.name
            ));
        }
    }
    Ok(by_identity)
}

/// Maps an object name onto the working directory, refusing names that
/// would land outside it.
fn local_path(workdir: &Path, name: &str) -> Result<PathBuf> {
    Ok(workdir.join(local_identity(name)?))
}

/// [`ObjectClient`] backed by the GCS JSON API.
pub struct GcsHttpClient {
    http: reqwest::blocking::Client,
    api_base_url: String,
    token: Option<String>,
}

impl GcsHttpClient {
    pub fn new(api_base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .timeout(timeout)
            .build()
            .context("creating storage client")?;
        Ok(Self {
            http,
            api_base_url: api_base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut u = Url::parse(&self.api_base_url)
            .with_context(|| format!("parsing storage api url {}", self.api_base_url))?;
        u.path_segments_mut()
            .map_err(|()| anyhow!("storage api url cannot be a base: {}", self.api_base_url))?
            .pop_if_empty()
            .extend(segments);
        Ok(u)
    }

    fn get(&self, u: Url) -> Result<reqwest::blocking::Response> {
        let mut req = self.http.get(u.clone());
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        let response = req.send().with_context(|| format!("GET {u}"))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(anyhow!("GET {u} returned {status}: {body}"));
        }
        Ok(response)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectsResponse {
    #[serde(default)]
    items: Vec<ObjectResource>,
    #[serde(default)]
    prefixes: Vec<String>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectResource {
    name: String,
    /// The JSON API encodes sizes as decimal strings.
    #[serde(default)]
    size: String,
    content_type: Option<String>,
    updated: Option<String>,
}

impl ObjectClient for GcsHttpClient {
    fn list(&self, bucket: &str, prefix: &str, page_token: Option<&str>) -> Result<ListPage> {
        let mut u = self.endpoint(&["storage", "v1", "b", bucket, "o"])?;
        {
            let mut q = u.query_pairs_mut();
            q.append_pair("prefix", prefix).append_pair("delimiter", "/");
            if let Some(t) = page_token {
                q.append_pair("pageToken", t);
            }
        }
        let resp: ObjectsResponse = self
            .get(u)?
            .json()
            .context("decoding object listing")?;

        let objects = resp
            .items
            .into_iter()
            .map(|o| {
                let size = if o.size.is_empty() {
                    0
                } else {
                    o.size
                        .parse()
                        .with_context(|| format!("object {} has invalid size {}", o.name, o.size))?
                };
                let updated = match o.updated.as_deref() {
                    Some(t) => Some(OffsetDateTime::parse(t, &Rfc3339).with_context(|| {
                        format!("object {} has invalid update time {t}", o.name)
                    })?),
                    None => None,
                };
                Ok(ObjectEntry {
                    name: o.name,
                    size,
                    content_type: o.content_type,
                    updated,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(ListPage {
            objects,
            prefixes: resp.prefixes,
            next_page_token: resp.next_page_token,
        })
    }

    fn download(&self, bucket: &str, name: &str, out: &mut dyn Write) -> Result<u64> {
        let mut u = self.endpoint(&["download", "storage", "v1", "b", bucket, "o", name])?;
        u.query_pairs_mut().append_pair("alt", "media");
        let mut response = self.get(u)?;
        response.copy_to(out).context("copying data")
    }
}
