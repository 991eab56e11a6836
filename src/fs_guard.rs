use anyhow::{anyhow, Context, Result};
use serde::de::DeserializeOwned;
use std::{fs, path::Path};

/// Reads a file after verifying it is not a symlink and is within `max_bytes`.
///
/// NOTE: narrow TOCTOU window between `symlink_metadata()` and `fs::read()`.
/// The check still catches accidental symlinks pointing state files
/// somewhere unexpected.
pub fn read_validated(path: &Path, max_bytes: u64) -> Result<Vec<u8>> {
    let meta = fs::symlink_metadata(path).with_context(|| format!("stat {}", path.display()))?;
    if meta.file_type().is_symlink() {
        return Err(anyhow!("Refusing to read symlink: {}", path.display()));
    }
    if meta.len() > max_bytes {
        return Err(anyhow!(
            "File too large: {} ({} bytes, max {max_bytes} bytes)",
            path.display(),
            meta.len(),
        ));
    }
    fs::read(path).with_context(|| format!("read {}", path.display()))
}

/// Reads and deserializes a JSON document through [`read_validated`].
pub fn read_json<T: DeserializeOwned>(path: &Path, max_bytes: u64) -> Result<T> {
    let data = read_validated(path, max_bytes)?;
    serde_json::from_slice(&data).with_context(|| format!("parsing json {}", path.display()))
}

/// Writes `data` to `path`, creating parent directories as needed.
pub fn write_file(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating directory {}", parent.display()))?;
    }
    fs::write(path, data).with_context(|| format!("writing {}", path.display()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Deserialize)]
    struct Doc {
        version: u32,
    }

    #[test]
    fn read_json_parses_document() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("doc.json");
        fs::write(&p, br#"{"version": 7}"#).unwrap();
        let doc: Doc = read_json(&p, 1024).unwrap();
        assert_eq!(doc.version, 7);
    }

    #[test]
    fn read_validated_rejects_oversized() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("big.json");
        fs::write(&p, vec![b' '; 64]).unwrap();
        let err = read_validated(&p, 10).unwrap_err().to_string();
        assert!(err.contains("too large"), "{err}");
    }

    #[cfg(unix)]
    #[test]
    fn read_validated_rejects_symlink() {
        let dir = tempfile::tempdir().unwrap();
        let real = dir.path().join("real.json");
        fs::write(&real, b"{}").unwrap();
        let link = dir.path().join("link.json");
        std::os::unix::fs::symlink(&real, &link).unwrap();
        let err = read_validated(&link, 1024).unwrap_err().to_string();
        assert!(err.contains("symlink"), "{err}");
    }

    #[test]
    fn write_file_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("a").join("b").join("out.json");
        write_file(&p, b"[]").unwrap();
        assert_eq!(fs::read(&p).unwrap(), b"[]");
    }
}
