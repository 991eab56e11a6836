//! Artifacts, snapshots and the directional delta between two snapshots.
//!
//! A [`Snapshot`] is an immutable picture of one store at one instant. The
//! only way to compare two of them is [`Snapshot::delta`], which reports what
//! appeared or changed and deliberately ignores what disappeared.
//!
//! Snapshots of every store are bundled in a [`SnapshotState`] for
//! persistence between the `start` and `finish` phases.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, path::Path};
use time::OffsetDateTime;

/// Checksum algorithm key used for file content digests.
pub const SHA256: &str = "SHA256";

/// Checksum algorithm key used for content-addressed registry descriptors.
pub const DIGEST: &str = "digest";

/// Current on-disk format of [`SnapshotState`].
pub const STATE_VERSION: u32 = 1;

/// Maximum persisted state size (64 MB).
pub const MAX_STATE_BYTES: u64 = 64 * 1024 * 1024;

/// One discovered file or object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub path: String,
    #[serde(with = "time::serde::rfc3339")]
    pub time: OffsetDateTime,
    /// Algorithm name to hex digest. More than one algorithm may be present.
    pub checksum: BTreeMap<String, String>,
}

impl Artifact {
    pub fn new(path: impl Into<String>, time: OffsetDateTime) -> Self {
        Self {
            path: path.into(),
            time,
            checksum: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_checksum(mut self, algorithm: &str, value: impl Into<String>) -> Self {
        self.checksum.insert(algorithm.to_string(), value.into());
        self
    }

    /// True when some algorithm present on both sides disagrees.
    fn checksum_differs(&self, other: &Self) -> bool {
        self.checksum.iter().any(|(algo, value)| {
            other
                .checksum
                .get(algo)
                .is_some_and(|theirs| theirs != value)
        })
    }
}

/// Store contents at one instant, keyed by artifact identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Snapshot(BTreeMap<String, Artifact>);

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Artifact> {
        self.0.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Artifact)> {
        self.0.iter()
    }

    /// Artifacts in identity order.
    pub fn artifacts(&self) -> impl Iterator<Item = &Artifact> {
        self.0.values()
    }

    /// Returns the artifacts of `post` that are new or changed relative to
    /// `self`, sorted by identity.
    ///
    /// Precedence per entry: absent before, then differing time, then any
    /// differing checksum under an algorithm both entries carry. Entries
    /// removed in `post` are never reported.
    pub fn delta(&self, post: &Snapshot) -> Vec<Artifact> {
        post.0
            .iter()
            .filter(|(key, after)| match self.0.get(*key) {
                None => true,
                Some(before) => before.time != after.time || before.checksum_differs(after),
            })
            .map(|(_, after)| after.clone())
            .collect()
    }
}

impl FromIterator<(String, Artifact)> for Snapshot {
    fn from_iter<I: IntoIterator<Item = (String, Artifact)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl FromIterator<Artifact> for Snapshot {
    /// Keys every artifact by its own path. Later duplicates replace earlier ones.
    fn from_iter<I: IntoIterator<Item = Artifact>>(iter: I) -> Self {
        Self(iter.into_iter().map(|a| (a.path.clone(), a)).collect())
    }
}

/// The snapshot of a single store, tagged with the store URI it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub store: String,
    pub artifacts: Snapshot,
}

/// Versioned persisted form of every pre-run snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotState {
    pub version: u32,
    pub snapshots: Vec<StoreSnapshot>,
}

impl SnapshotState {
    pub fn new(snapshots: Vec<StoreSnapshot>) -> Self {
        Self {
            version: STATE_VERSION,
            snapshots,
        }
    }

    /// Looks up the snapshot captured for `store`.
    pub fn for_store(&self, store: &str) -> Option<&Snapshot> {
        self.snapshots
            .iter()
            .find(|s| s.store == store)
            .map(|s| &s.artifacts)
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).context("serializing snapshot state")
    }

    pub fn from_json(data: &[u8]) -> Result<Self> {
        let state: Self = serde_json::from_slice(data).context("parsing snapshot state")?;
        if state.version != STATE_VERSION {
            return Err(anyhow!(
                "unsupported snapshot state version {} (expected {STATE_VERSION})",
                state.version
            ));
        }
        Ok(state)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        crate::fs_guard::write_file(path, &self.to_json()?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = crate::fs_guard::read_validated(path, MAX_STATE_BYTES)?;
        Self::from_json(&data).with_context(|| format!("loading {}", path.display()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn art(path: &str, t: OffsetDateTime, sum: &str) -> Artifact {
        Artifact::new(path, t).with_checksum(SHA256, sum)
    }

    fn snap(items: Vec<Artifact>) -> Snapshot {
        items.into_iter().collect()
    }

    const T1: OffsetDateTime = datetime!(1976-02-10 23:30:30 UTC);
    const T2: OffsetDateTime = datetime!(2022-06-01 12:00:00 UTC);

    #[test]
    fn delta_of_snapshot_with_itself_is_empty() {
        let s = snap(vec![art("a", T1, "aa"), art("b", T2, "bb")]);
        assert!(s.delta(&s).is_empty());
    }

    #[test]
    fn delta_reports_additions() {
        let pre = snap(vec![art("a", T1, "aa")]);
        let post = snap(vec![art("a", T1, "aa"), art("b", T1, "bb")]);
        assert_eq!(pre.delta(&post), vec![art("b", T1, "bb")]);
    }

    #[test]
    fn delta_never_reports_deletions() {
        let pre = snap(vec![art("a", T1, "aa"), art("gone", T1, "gg")]);
        let post = snap(vec![art("a", T1, "aa")]);
        assert!(pre.delta(&post).is_empty());
    }

    #[test]
    fn time_change_wins_over_equal_checksums() {
        let pre = snap(vec![art("a", T1, "aa")]);
        let post = snap(vec![art("a", T2, "aa")]);
        assert_eq!(pre.delta(&post), vec![art("a", T2, "aa")]);
    }

    #[test]
    fn checksum_change_with_equal_time() {
        let pre = snap(vec![art("a", T1, "aa")]);
        let post = snap(vec![art("a", T1, "ab")]);
        assert_eq!(pre.delta(&post), vec![art("a", T1, "ab")]);
    }

    #[test]
    fn only_shared_algorithms_are_compared() {
        let pre = snap(vec![Artifact::new("a", T1).with_checksum("SHA1", "x")]);
        let post = snap(vec![Artifact::new("a", T1).with_checksum(SHA256, "y")]);
        assert!(pre.delta(&post).is_empty());
    }

    #[test]
    fn delta_is_sorted_and_does_not_mutate_inputs() {
        let pre = snap(vec![]);
        let post = snap(vec![art("z", T1, "1"), art("m", T1, "2"), art("a", T1, "3")]);
        let before = post.clone();
        let paths: Vec<_> = pre.delta(&post).into_iter().map(|a| a.path).collect();
        assert_eq!(paths, vec!["a", "m", "z"]);
        assert_eq!(post, before);
    }

    #[test]
    fn state_round_trips_through_json() {
        let state = SnapshotState::new(vec![StoreSnapshot {
            store: "file:///tmp/out".into(),
            artifacts: snap(vec![art("bin/tool", T2, "ff")]),
        }]);
        let back = SnapshotState::from_json(&state.to_json().unwrap()).unwrap();
        assert_eq!(back, state);
        assert_eq!(back.for_store("file:///tmp/out").unwrap().len(), 1);
        assert!(back.for_store("file:///elsewhere").is_none());
    }

    #[test]
    fn state_rejects_unknown_version() {
        let err = SnapshotState::from_json(br#"{"version": 99, "snapshots": []}"#)
            .unwrap_err()
            .to_string();
        assert!(err.contains("version 99"), "{err}");
    }

    #[test]
    fn artifact_json_shape() {
        let v = serde_json::to_value(art("x", T1, "00")).unwrap();
        assert_eq!(v["path"], "x");
        assert_eq!(v["time"], "1976-02-10T23:30:30Z");
        assert_eq!(v["checksum"]["SHA256"], "00");
    }
}
