use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use time::OffsetDateTime;

/// Lifecycle of a build run. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Pending,
    Running,
    Terminated,
}

/// One execution of an external build, as last observed.
///
/// Only a [`crate::builder::Builder`] updates a run; once it reaches
/// [`RunState::Terminated`] it is never refreshed again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub spec_url: String,
    state: RunState,
    pub is_success: bool,
    /// Backend specific status string, e.g. `in_progress` or `WORKING`.
    pub status: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub start_time: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub end_time: Option<OffsetDateTime>,
    pub params: BTreeMap<String, String>,
    /// The backend's native run document from the latest refresh.
    pub system_data: Value,
}

impl Run {
    pub fn new(spec_url: impl Into<String>) -> Self {
        Self {
            spec_url: spec_url.into(),
            state: RunState::Pending,
            is_success: false,
            status: String::new(),
            start_time: None,
            end_time: None,
            params: BTreeMap::new(),
            system_data: Value::Null,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state != RunState::Terminated
    }

    /// Moves the run to `next`. Any backward step is an error and leaves the
    /// state unchanged.
    pub(crate) fn advance(&mut self, next: RunState) -> Result<()> {
        if next < self.state {
            return Err(anyhow!(
                "run {} is {:?}, refusing transition back to {next:?}",
                self.spec_url,
                self.state
            ));
        }
        self.state = next;
        Ok(())
    }
}
