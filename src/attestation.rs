//! in-toto Statement carrying a SLSA v0.2 provenance predicate.
//!
//! [`Attestation::new`] makes an empty envelope and [`Attestation::slsa`]
//! selects the SLSA predicate. Materials and subjects are appended as the
//! watch progresses; [`Attestation::to_json`] refuses to serialize an
//! envelope without a predicate.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use time::OffsetDateTime;

use crate::snapshot::{Artifact, DIGEST};

pub const STATEMENT_TYPE: &str = "https://in-toto.io/Statement/v0.1";
pub const SLSA_PREDICATE_TYPE: &str = "https://slsa.dev/provenance/v0.2";

/// Algorithm name to digest value, e.g. `{"sha256": "..."}`.
pub type DigestSet = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    pub name: String,
    pub digest: DigestSet,
}

impl From<&Artifact> for Subject {
    fn from(a: &Artifact) -> Self {
        Self {
            name: a.path.clone(),
            digest: digest_set(&a.checksum),
        }
    }
}

/// Converts artifact checksums into in-toto digest form. Algorithm names
/// are lowercased; registry `digest` entries (`sha256:abc`) are split.
pub fn digest_set(checksum: &BTreeMap<String, String>) -> DigestSet {
    checksum
        .iter()
        .map(|(algo, value)| match (algo.as_str(), value.split_once(':')) {
            (DIGEST, Some((a, v))) => (a.to_lowercase(), v.to_string()),
            _ => (algo.to_lowercase(), value.clone()),
        })
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Material {
    pub uri: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub digest: DigestSet,
}

impl Material {
    /// Material for a `repo-url[@commit]` locator; the commit becomes a
    /// `sha1` digest.
    pub fn from_vcs_locator(locator: &str) -> Self {
        let (uri, commit) = crate::vcs::split_locator(locator);
        Self {
            uri: uri.to_string(),
            digest: commit
                .map(|c| DigestSet::from([("sha1".to_string(), c.to_string())]))
                .unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuilderId {
    pub id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSource {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uri: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub digest: DigestSet,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub entry_point: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invocation {
    #[serde(default)]
    pub config_source: ConfigSource,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub parameters: Value,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub environment: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completeness {
    pub parameters: bool,
    pub environment: bool,
    pub materials: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub build_invocation_id: String,
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub build_started_on: Option<OffsetDateTime>,
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub build_finished_on: Option<OffsetDateTime>,
    pub completeness: Completeness,
    pub reproducible: bool,
}

/// SLSA provenance v0.2 predicate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlsaPredicate {
    pub builder: BuilderId,
    #[serde(default)]
    pub build_type: String,
    #[serde(default)]
    pub invocation: Invocation,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub build_config: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    #[serde(default)]
    pub materials: Vec<Material>,
}

impl SlsaPredicate {
    /// Appends materials not already present.
    pub fn add_materials(&mut self, materials: impl IntoIterator<Item = Material>) {
        for m in materials {
            if !self.materials.contains(&m) {
                self.materials.push(m);
            }
        }
    }
}

/// The predicate kinds an attestation can carry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Predicate {
    Slsa(SlsaPredicate),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attestation {
    #[serde(rename = "_type")]
    pub statement_type: String,
    pub predicate_type: String,
    #[serde(default)]
    pub subject: Vec<Subject>,
    pub predicate: Option<Predicate>,
}

impl Attestation {
    /// An empty envelope with no predicate selected.
    pub fn new() -> Self {
        Self {
            statement_type: STATEMENT_TYPE.to_string(),
            ..Self::default()
        }
    }

    /// Selects the SLSA provenance predicate.
    #[must_use]
    pub fn slsa(mut self) -> Self {
        self.predicate_type = SLSA_PREDICATE_TYPE.to_string();
        self.predicate = Some(Predicate::Slsa(SlsaPredicate::default()));
        self
    }

    /// Replaces the predicate with `predicate`.
    pub fn set_slsa(&mut self, predicate: SlsaPredicate) {
        self.predicate_type = SLSA_PREDICATE_TYPE.to_string();
        self.predicate = Some(Predicate::Slsa(predicate));
    }

    pub fn slsa_predicate(&self) -> Option<&SlsaPredicate> {
        match &self.predicate {
            Some(Predicate::Slsa(p)) => Some(p),
            None => None,
        }
    }

    pub fn slsa_predicate_mut(&mut self) -> Option<&mut SlsaPredicate> {
        match &mut self.predicate {
            Some(Predicate::Slsa(p)) => Some(p),
            None => None,
        }
    }

    /// Adds one subject per artifact, keeping subjects sorted and unique by
    /// name. A name may only repeat with identical digests; on conflict the
    /// attestation is left unchanged.
    pub fn add_subjects<'a>(
        &mut self,
        artifacts: impl IntoIterator<Item = &'a Artifact>,
    ) -> Result<()> {
        let mut by_name: BTreeMap<String, Subject> = self
            .subject
            .iter()
            .map(|s| (s.name.clone(), s.clone()))
            .collect();
        for a in artifacts {
            let s = Subject::from(a);
            match by_name.get(&s.name) {
                Some(existing) if existing.digest != s.digest => {
                    return Err(anyhow!(
                        "subject {} reported twice with different digests",
                        s.name
                    ));
                }
                Some(_) => {}
                None => {
                    by_name.insert(s.name.clone(), s);
                }
            }
        }
        self.subject = by_name.into_values().collect();
        Ok(())
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        if self.predicate.is_none() {
            return Err(anyhow!("attestation has no predicate"));
        }
        serde_json::to_vec_pretty(self).context("serializing attestation json")
    }

    pub fn from_json(data: &[u8]) -> Result<Self> {
        let att: Self = serde_json::from_slice(data).context("parsing attestation json")?;
        if att.predicate.is_none() {
            return Err(anyhow!("attestation has no predicate"));
        }
        Ok(att)
    }
}
