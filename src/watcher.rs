//! Run watching and provenance assembly.
//!
//! A [`Watcher`] owns one [`Builder`] and the artifact [`Store`]s registered
//! for a run. The usual sequence is:
//!
//! 1. [`Watcher::snap`] (or [`Watcher::load_snapshots`]) records each
//!    store's pre-run state.
//! 2. [`Watcher::watch`] polls the run until it terminates.
//! 3. [`Watcher::attest_run`] re-snapshots every store and turns the
//!    delta into attestation subjects.
//!
//! The start/finish split persists step 1 to disk with
//! [`Watcher::save_snapshots`] so that step 3 can happen in another process.

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    path::Path,
    sync::{Arc, Condvar, Mutex},
    time::Duration,
};
use tracing::{debug, info, warn};

use crate::attestation::{Attestation, Material};
use crate::builder::Builder;
use crate::config::WatchConfig;
use crate::run::Run;
use crate::snapshot::{Artifact, Snapshot, SnapshotState, StoreSnapshot};
use crate::store::{Store, StoreResolver};

/// Shared cancellation flag, observed while a watch sleeps between polls.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<(Mutex<bool>, Condvar)>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flags cancellation and wakes any sleeping watch.
    pub fn cancel(&self) {
        let (lock, cvar) = &*self.0;
        if let Ok(mut cancelled) = lock.lock() {
            *cancelled = true;
        }
        cvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0 .0.lock().map(|c| *c).unwrap_or(true)
    }

    /// Sleeps up to `timeout`. Returns true if cancelled before or during
    /// the wait.
    pub fn wait(&self, timeout: Duration) -> Result<bool> {
        let (lock, cvar) = &*self.0;
        let guard = lock.lock().map_err(|_| anyhow!("cancel token poisoned"))?;
        let (guard, _) = cvar
            .wait_timeout_while(guard, timeout, |cancelled| !*cancelled)
            .map_err(|_| anyhow!("cancel token poisoned"))?;
        Ok(*guard)
    }
}

/// Payload handed to whatever finishes a started attestation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartMessage {
    #[serde(rename = "SpecURL")]
    pub spec_url: String,
    /// Partial attestation JSON, base64.
    #[serde(rename = "Attestation")]
    pub attestation: String,
    /// Snapshot state JSON, base64. Empty when no state was saved.
    #[serde(rename = "Snapshots", default, skip_serializing_if = "String::is_empty")]
    pub snapshots: String,
    #[serde(rename = "Artifacts", default)]
    pub artifacts: Vec<String>,
    /// `artifacts` joined with commas.
    #[serde(rename = "ArtifactList", default)]
    pub artifact_list: String,
}

impl StartMessage {
    pub fn new(
        spec_url: &str,
        attestation_json: &[u8],
        snapshots_json: Option<&[u8]>,
        artifacts: &[String],
    ) -> Self {
        Self {
            spec_url: spec_url.to_string(),
            attestation: STANDARD.encode(attestation_json),
            snapshots: snapshots_json.map(|s| STANDARD.encode(s)).unwrap_or_default(),
            artifacts: artifacts.to_vec(),
            artifact_list: artifacts.join(","),
        }
    }

    pub fn attestation(&self) -> Result<Attestation> {
        let raw = STANDARD
            .decode(&self.attestation)
            .context("decoding attestation base64")?;
        Attestation::from_json(&raw)
    }

    pub fn snapshot_state(&self) -> Result<Option<SnapshotState>> {
        if self.snapshots.is_empty() {
            return Ok(None);
        }
        let raw = STANDARD
            .decode(&self.snapshots)
            .context("decoding snapshot base64")?;
        SnapshotState::from_json(&raw).map(Some)
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).context("serializing start message")
    }
}

pub struct Watcher {
    builder: Builder,
    resolver: StoreResolver,
    stores: Vec<Store>,
    /// Pre-run snapshots keyed by store URI.
    snapshots: BTreeMap<String, Snapshot>,
    materials: Vec<Material>,
    poll_interval: Duration,
    cancel: CancelToken,
}

impl Watcher {
    /// Creates a watcher for the run at `spec_url` backed by the real APIs.
    /// No network traffic happens until a run or store is read.
    pub fn new(spec_url: &str, cfg: &WatchConfig) -> Result<Self> {
        let builder = Builder::new(spec_url, cfg).context("getting build watcher")?;
        let resolver = StoreResolver::new(cfg)?;
        Ok(Self::with_parts(builder, resolver, cfg.poll_interval()))
    }

    pub fn with_parts(builder: Builder, resolver: StoreResolver, poll_interval: Duration) -> Self {
        Self {
            builder,
            resolver,
            stores: Vec::new(),
            snapshots: BTreeMap::new(),
            materials: Vec::new(),
            poll_interval,
            cancel: CancelToken::new(),
        }
    }

    pub fn builder(&self) -> &Builder {
        &self.builder
    }

    pub fn stores(&self) -> &[Store] {
        &self.stores
    }

    /// A handle that aborts [`Watcher::watch`] from another thread.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn get_run(&self, spec_url: &str) -> Result<Run> {
        self.builder.get_run(spec_url).context("getting run")
    }

    /// Polls `run` until it terminates. Any refresh error ends the watch
    /// immediately and `run` keeps its last observed state.
    pub fn watch(&self, run: &mut Run) -> Result<()> {
        let mut polls = 0u32;
        while run.is_running() {
            self.builder
                .refresh_run(run)
                .context("refreshing run data")?;
            polls += 1;
            if !run.is_running() {
                break;
            }
            debug!(run = %run.spec_url, status = %run.status, "waiting for run");
            if self.cancel.wait(self.poll_interval)? {
                return Err(anyhow!("watch of {} cancelled", run.spec_url));
            }
        }
        info!(run = %run.spec_url, polls, success = run.is_success, "run finished");
        Ok(())
    }

    /// Registers another artifact store. Fails on an unknown scheme or a
    /// URI that is already registered.
    pub fn add_artifact_source(&mut self, uri: &str) -> Result<()> {
        if self.stores.iter().any(|s| s.uri() == uri) {
            return Err(anyhow!("artifact source {uri} already registered"));
        }
        let store = self
            .resolver
            .resolve(uri)
            .context("getting artifact store")?;
        self.stores.push(store);
        Ok(())
    }

    /// Takes the pre-run snapshot of every registered store.
    pub fn snap(&mut self) -> Result<()> {
        for store in &self.stores {
            let snap = store.snap()?;
            self.snapshots.insert(store.uri().to_string(), snap);
        }
        Ok(())
    }

    /// Pre-run snapshots in store registration order.
    pub fn snapshot_state(&self) -> SnapshotState {
        SnapshotState::new(
            self.stores
                .iter()
                .filter_map(|s| {
                    self.snapshots.get(s.uri()).map(|snap| StoreSnapshot {
                        store: s.uri().to_string(),
                        artifacts: snap.clone(),
                    })
                })
                .collect(),
        )
    }

    pub fn save_snapshots(&self, path: &Path) -> Result<()> {
        self.snapshot_state()
            .save(path)
            .with_context(|| format!("saving storage snapshots to {}", path.display()))
    }

    /// Restores pre-run snapshots for the registered stores. Entries for
    /// stores that are not registered are ignored.
    pub fn load_snapshots(&mut self, path: &Path) -> Result<()> {
        let state = SnapshotState::load(path)
            .with_context(|| format!("loading storage snapshots from {}", path.display()))?;
        self.restore_snapshots(&state);
        Ok(())
    }

    pub fn restore_snapshots(&mut self, state: &SnapshotState) {
        for entry in &state.snapshots {
            if self.stores.iter().any(|s| s.uri() == entry.store) {
                self.snapshots
                    .insert(entry.store.clone(), entry.artifacts.clone());
            } else {
                warn!(store = %entry.store, "ignoring snapshot of unregistered store");
            }
        }
    }

    /// Re-snapshots every store and returns what each one gained or changed
    /// since its pre-run snapshot. Two stores reporting the same identity
    /// with different checksums is an error.
    pub fn collect_artifacts(&self) -> Result<Vec<Artifact>> {
        let empty = Snapshot::new();
        let mut artifacts: Vec<Artifact> = Vec::new();
        let mut origin: BTreeMap<String, &str> = BTreeMap::new();
        for store in &self.stores {
            let pre = match self.snapshots.get(store.uri()) {
                Some(s) => s,
                None => {
                    debug!(store = %store.uri(), "no pre-run snapshot, diffing against empty");
                    &empty
                }
            };
            let post = store.snap()?;
            let delta = pre.delta(&post);
            info!(store = %store.uri(), artifacts = delta.len(), "collected artifacts");
            for a in delta {
                if let Some(first) = origin.get(&a.path) {
                    let clash = artifacts
                        .iter()
                        .any(|b| b.path == a.path && b.checksum != a.checksum);
                    if clash {
                        return Err(anyhow!(
                            "artifact {} found in {first} and {} with different contents",
                            a.path,
                            store.uri()
                        ));
                    }
                    continue;
                }
                origin.insert(a.path.clone(), store.uri());
                artifacts.push(a);
            }
        }
        Ok(artifacts)
    }

    /// Records a `repo-url[@commit]` locator as a material.
    pub fn add_vcs_material(&mut self, locator: &str) {
        let m = Material::from_vcs_locator(locator);
        if !self.materials.contains(&m) {
            self.materials.push(m);
        }
    }

    /// Attestation with only the materials known before the run.
    pub fn start_attestation(&self) -> Attestation {
        let mut att = Attestation::new().slsa();
        if let Some(p) = att.slsa_predicate_mut() {
            p.add_materials(self.materials.iter().cloned());
        }
        att
    }

    /// Full attestation for `run`: the builder's predicate, the recorded
    /// materials and one subject per artifact found across all stores.
    pub fn attest_run(&self, run: &Run) -> Result<Attestation> {
        if run.is_running() {
            warn!(run = %run.spec_url, "run is still running");
        }
        let mut predicate = self
            .builder
            .build_predicate(run)
            .context("building predicate")?;
        predicate.add_materials(self.materials.iter().cloned());

        let mut att = Attestation::new();
        att.set_slsa(predicate);
        let artifacts = self.collect_artifacts()?;
        att.add_subjects(&artifacts)?;
        Ok(att)
    }

    /// Completes a partial attestation from [`Watcher::start_attestation`].
    /// The partial document's materials come first.
    pub fn finish_attestation(&self, partial: &Attestation, run: &Run) -> Result<Attestation> {
        let mut att = self.attest_run(run)?;
        if let (Some(done), Some(start)) = (att.slsa_predicate_mut(), partial.slsa_predicate()) {
            let own = std::mem::take(&mut done.materials);
            done.add_materials(start.materials.iter().cloned());
            done.add_materials(own);
        }
        Ok(att)
    }
}
