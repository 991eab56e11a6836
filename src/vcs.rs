//! VCS locators and source checkout inspection.

use anyhow::{anyhow, Context, Result};
use std::path::Path;
use std::process::Command;
use tracing::debug;

/// Splits a `repo-url[@commit]` locator into URI and commit.
///
/// The split happens at the last `@`, and only when the right side looks
/// like a revision rather than a host path, so `git+ssh://git@host/repo`
/// stays whole.
pub fn split_locator(locator: &str) -> (&str, Option<&str>) {
    match locator.rsplit_once('@') {
        Some((uri, commit)) if !uri.is_empty() && !commit.is_empty() && !commit.contains('/') => {
            (uri, Some(commit))
        }
        _ => (locator, None),
    }
}

fn git(dir: &Path, args: &[&str]) -> Result<Option<String>> {
    let out = Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(args)
        .output()
        .with_context(|| format!("running git {} in {}", args.join(" "), dir.display()))?;
    if !out.status.success() {
        debug!(dir = %dir.display(), ?args, status = %out.status, "git query failed");
        return Ok(None);
    }
    let value = String::from_utf8(out.stdout)
        .context("git output is not utf-8")?
        .trim()
        .to_string();
    Ok((!value.is_empty()).then_some(value))
}

/// Builds a `git+{remote}@{commit}` locator for the checkout at `path`.
///
/// Returns `Ok(None)` when `path` is not a git checkout or has no `origin`
/// remote. The commit part is left off for a repository with no commits.
pub fn locator_for_dir(path: &Path) -> Result<Option<String>> {
    if !path.is_dir() {
        return Err(anyhow!("repository path {} is not a directory", path.display()));
    }
    let Some(remote) = git(path, &["config", "--get", "remote.origin.url"])? else {
        return Ok(None);
    };
    let remote = if remote.starts_with("git+") {
        remote
    } else {
        format!("git+{remote}")
    };
    Ok(Some(match git(path, &["rev-parse", "HEAD"])? {
        Some(commit) => format!("{remote}@{commit}"),
        None => remote,
    }))
}
