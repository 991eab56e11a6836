use anyhow::{anyhow, Context, Result};
use sha2::{Digest, Sha256};
use std::{
    fs,
    io::Read,
    path::{Path, PathBuf},
};
use time::OffsetDateTime;
use tracing::debug;
use walkdir::WalkDir;

use crate::errors::ConfigError;
use crate::snapshot::{Artifact, Snapshot, SHA256};

/// A local directory holding build outputs.
#[derive(Debug, Clone)]
pub struct Directory {
    pub path: PathBuf,
}

impl Directory {
    /// Builds a directory store from a `file://<path>` URI.
    pub fn new(spec_url: &str) -> Result<Self> {
        let path = spec_url.strip_prefix("file://").ok_or_else(|| {
            ConfigError::InvalidUri {
                uri: spec_url.to_string(),
                reason: "expected a file:// uri".to_string(),
            }
        })?;
        if path.is_empty() {
            return Err(ConfigError::MissingPath(spec_url.to_string()).into());
        }
        Ok(Self::at(path))
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Walks the directory and records every regular file.
    ///
    /// Identities are paths relative to the root, `/` separated. Any
    /// unreadable entry fails the whole snapshot. Symlinks are not followed
    /// and not recorded.
    pub fn snap(&self) -> Result<Snapshot> {
        let root = &self.path;
        let meta = fs::metadata(root).with_context(|| format!("stat {}", root.display()))?;
        if !meta.is_dir() {
            return Err(anyhow!("{} is not a directory", root.display()));
        }

        let mut artifacts = Vec::new();
        for entry in WalkDir::new(root).follow_links(false) {
            let entry = entry.with_context(|| format!("walking {}", root.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry.path().strip_prefix(root).with_context(|| {
                format!(
                    "Path '{}' should be prefixed with '{}'",
                    entry.path().display(),
                    root.display()
                )
            })?;
            let identity = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");

            let modified = entry
                .metadata()
                .with_context(|| format!("stat {}", entry.path().display()))?
                .modified()
                .with_context(|| format!("reading mtime of {}", entry.path().display()))?;

            let digest = sha256_file(entry.path())?;
            artifacts.push(
                Artifact::new(identity, OffsetDateTime::from(modified)).with_checksum(SHA256, digest),
            );
        }
        debug!(root = %root.display(), files = artifacts.len(), "directory snapshot");
        Ok(artifacts.into_iter().collect())
    }
}

/// Streaming SHA-256 of a file (64 KB buffer).
pub(crate) fn sha256_file(path: &Path) -> Result<String> {
    let mut f = fs::File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut hasher = Sha256::new();
    #[allow(clippy::large_stack_arrays)]
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = f
            .read(&mut buf)
            .with_context(|| format!("read {}", path.display()))?;
        if n == 0 {
            break;
        }
        #[allow(clippy::indexing_slicing)]
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use filetime::{set_file_mtime, FileTime};
    use tempfile::TempDir;

    const TEST_SHA256: &str = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";
    const CHANGED_SHA256: &str = "76aad9c1d52e424d0dd6c6b8e07169d5d5f9001a06fe5343d4bfa13c804788f0";
    // 1976-02-10T23:30:30Z
    const FIXED_UNIX: i64 = 192_843_030;

    fn fixed_time() -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(FIXED_UNIX).unwrap()
    }

    fn write_fixed(path: &Path, data: &[u8]) {
        fs::write(path, data).unwrap();
        set_file_mtime(path, FileTime::from_unix_time(FIXED_UNIX, 0)).unwrap();
    }

    fn delta_after(prepare: impl Fn(&Path), mutate: impl Fn(&Path)) -> Vec<Artifact> {
        let dir = TempDir::new().unwrap();
        let sut = Directory::at(dir.path());
        prepare(dir.path());
        let before = sut.snap().unwrap();
        mutate(dir.path());
        let after = sut.snap().unwrap();
        before.delta(&after)
    }

    #[test]
    fn empty_directories_have_no_delta() {
        assert!(delta_after(|_| {}, |_| {}).is_empty());
    }

    #[test]
    fn untouched_file_has_no_delta() {
        let delta = delta_after(
            |p| fs::write(p.join("test.txt"), b"test").unwrap(),
            |_| {},
        );
        assert!(delta.is_empty());
    }

    #[test]
    fn retouched_file_is_reported_by_time() {
        let delta = delta_after(
            |p| fs::write(p.join("test.txt"), b"test").unwrap(),
            |p| write_fixed(&p.join("test.txt"), b"test"),
        );
        assert_eq!(
            delta,
            vec![Artifact::new("test.txt", fixed_time()).with_checksum(SHA256, TEST_SHA256)]
        );
    }

    #[test]
    fn changed_content_is_reported_by_checksum() {
        let delta = delta_after(
            |p| write_fixed(&p.join("test.txt"), b"test"),
            |p| write_fixed(&p.join("test.txt"), b"test, but with a change!"),
        );
        assert_eq!(
            delta,
            vec![Artifact::new("test.txt", fixed_time()).with_checksum(SHA256, CHANGED_SHA256)]
        );
    }

    #[test]
    fn nested_files_use_relative_slash_paths() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("bin").join("linux")).unwrap();
        fs::write(dir.path().join("bin").join("linux").join("tool"), b"elf").unwrap();
        let snap = Directory::at(dir.path()).snap().unwrap();
        assert!(snap.contains("bin/linux/tool"));
        assert_eq!(snap.len(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_are_not_recorded() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("real"), b"x").unwrap();
        std::os::unix::fs::symlink(dir.path().join("real"), dir.path().join("link")).unwrap();
        let snap = Directory::at(dir.path()).snap().unwrap();
        assert!(snap.contains("real"));
        assert!(!snap.contains("link"));
    }

    #[test]
    fn missing_root_fails() {
        let dir = TempDir::new().unwrap();
        let sut = Directory::at(dir.path().join("nope"));
        assert!(sut.snap().is_err());
    }

    #[test]
    fn new_parses_file_uri() {
        let d = Directory::new("file:///tmp/out").unwrap();
        assert_eq!(d.path, PathBuf::from("/tmp/out"));
        let err = Directory::new("file://").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::MissingPath(_))
        ));
    }
}
