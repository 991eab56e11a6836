//! # runwitness
//!
//! Watches a build run on an external build system and writes SLSA
//! provenance for whatever the run produced.
//!
//! Artifact stores (local directories, object-storage buckets, OCI
//! registries) are snapshotted before and after the run. The directional
//! delta between the two snapshots becomes the attestation's subjects; the
//! build backend supplies the predicate.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`fs_guard`] | Symlink-safe, size-bounded file reads |
//! | [`config`] | Watcher configuration and defaults |
//! | [`errors`] | Configuration error taxonomy |
//! | [`snapshot`] | Artifacts, snapshots, delta, persisted snapshot state |
//! | [`store`] | Artifact store drivers (`file`, `gs`, `oci`) |
//! | [`run`] | Build run entity |
//! | [`builder`] | Build backends (GitHub Actions, Cloud Build) |
//! | [`attestation`] | in-toto Statement with a SLSA v0.2 predicate |
//! | [`vcs`] | VCS locators and checkout inspection |
//! | [`watcher`] | Poll loop and attestation assembly |

/// Symlink-safe, size-bounded file reads for every untrusted document the
/// crate loads.
pub mod fs_guard;

/// `WatchConfig`: poll interval, worker pool size, API endpoints and token
/// variable names.
pub mod config;

/// `ConfigError` for malformed URIs and unsupported schemes.
pub mod errors;

/// Artifact snapshots and the pre/post delta.
pub mod snapshot;

/// Artifact stores (`file://`, `gs://`, `oci://`) and scheme resolution.
pub mod store;

/// A build run and its forward-only lifecycle state.
pub mod run;

/// Run-specification URLs to live runs and provenance predicates.
pub mod builder;

/// in-toto Statement with the SLSA v0.2 provenance predicate.
pub mod attestation;

/// VCS locators for the attestation's source material.
pub mod vcs;

/// Orchestration of stores, builder and attestation across a run.
pub mod watcher;
