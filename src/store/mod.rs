//! Artifact stores.
//!
//! A [`Store`] is one artifact repository the watcher inspects before and
//! after a run. The set of backends is closed; the variant is picked once,
//! from the URI scheme, by a [`StoreResolver`] the caller constructs and
//! owns. Every call to [`Store::snap`] is an independent, fresh read.
//!
//! | Scheme | Driver |
//! |--------|--------|
//! | `file://<path>` | [`directory::Directory`] |
//! | `gs://<bucket>/<prefix>` | [`gcs::Gcs`] |
//! | `oci://<registry>/<repository>/<image>[:tag]` | [`oci::Oci`] |

pub mod directory;
pub mod gcs;
pub mod oci;

use anyhow::{Context, Result};
use std::{collections::BTreeMap, sync::Arc};
use tracing::info;

use crate::config::WatchConfig;
use crate::errors::ConfigError;
use crate::snapshot::Snapshot;

use directory::Directory;
use gcs::{Gcs, GcsHttpClient, ObjectClient};
use oci::{Oci, RegistryClient, RegistryHttpClient};

/// One artifact repository, tagged by backend.
#[derive(Debug)]
pub enum Store {
    Directory { uri: String, driver: Directory },
    Gcs { uri: String, driver: Gcs },
    Oci { uri: String, driver: Oci },
}

impl Store {
    /// The URI this store was resolved from.
    pub fn uri(&self) -> &str {
        match self {
            Self::Directory { uri, .. } | Self::Gcs { uri, .. } | Self::Oci { uri, .. } => uri,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Directory { .. } => "directory",
            Self::Gcs { .. } => "gcs",
            Self::Oci { .. } => "oci",
        }
    }

    /// Reads the current contents of the store.
    pub fn snap(&self) -> Result<Snapshot> {
        let snap = match self {
            Self::Directory { driver, .. } => driver.snap(),
            Self::Gcs { driver, .. } => driver.snap(),
            Self::Oci { driver, .. } => driver.snap(),
        }
        .with_context(|| format!("snapshotting {} store {}", self.kind(), self.uri()))?;
        info!(store = %self.uri(), artifacts = snap.len(), "snapshot taken");
        Ok(snap)
    }
}

type Constructor = fn(&StoreResolver, &str) -> Result<Store>;

/// Scheme table mapping store URIs to drivers, plus the clients drivers share.
pub struct StoreResolver {
    drivers: BTreeMap<&'static str, Constructor>,
    objects: Arc<dyn ObjectClient>,
    registry: Arc<dyn RegistryClient>,
    download_workers: usize,
}

impl StoreResolver {
    /// Builds a resolver whose drivers talk to the real backends.
    pub fn new(cfg: &WatchConfig) -> Result<Self> {
        let token = WatchConfig::token_from_env(&cfg.google_token_env);
        let objects = GcsHttpClient::new(&cfg.gcs_api_url, token, cfg.http_timeout())?;
        let registry = RegistryHttpClient::new(&cfg.registry_scheme, cfg.http_timeout())?;
        Ok(Self::with_clients(
            Arc::new(objects),
            Arc::new(registry),
            cfg.workers(),
        ))
    }

    /// Builds a resolver over caller supplied backend clients.
    pub fn with_clients(
        objects: Arc<dyn ObjectClient>,
        registry: Arc<dyn RegistryClient>,
        download_workers: usize,
    ) -> Self {
        let mut drivers: BTreeMap<&'static str, Constructor> = BTreeMap::new();
        drivers.insert("file", |_, uri| {
            Ok(Store::Directory {
                uri: uri.to_string(),
                driver: Directory::new(uri)?,
            })
        });
        drivers.insert("gs", |r, uri| {
            Ok(Store::Gcs {
                uri: uri.to_string(),
                driver: Gcs::new(uri, Arc::clone(&r.objects), r.download_workers)?,
            })
        });
        drivers.insert("oci", |r, uri| {
            Ok(Store::Oci {
                uri: uri.to_string(),
                driver: Oci::new(uri, Arc::clone(&r.registry))?,
            })
        });
        Self {
            drivers,
            objects,
            registry,
            download_workers: download_workers.max(1),
        }
    }

    /// Schemes with a registered driver.
    pub fn schemes(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.drivers.keys().copied()
    }

    /// Picks the driver for `uri` by scheme. Fails before any I/O.
    pub fn resolve(&self, uri: &str) -> Result<Store> {
        let (scheme, _) = uri.split_once("://").ok_or_else(|| ConfigError::InvalidUri {
            uri: uri.to_string(),
            reason: "missing scheme".to_string(),
        })?;
        let constructor = self
            .drivers
            .get(scheme)
            .ok_or_else(|| ConfigError::UnsupportedScheme(scheme.to_string()))?;
        constructor(self, uri)
    }
}
