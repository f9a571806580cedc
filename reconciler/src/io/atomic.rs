//! Atomic file replacement for the files operators and later runs read back.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Write `contents` next to `path` and rename it into place.
///
/// The temp file keeps the target's extension with `.tmp` appended, so a
/// leftover from a killed run is easy to recognise.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = temp_path(path);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut extension = path.extension().map(OsString::from).unwrap_or_default();
    if !extension.is_empty() {
        extension.push(".");
    }
    extension.push("tmp");
    path.with_extension(extension)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temp_file_keeps_target_extension() {
        assert_eq!(temp_path(Path::new("a/queue.json")), Path::new("a/queue.json.tmp"));
        assert_eq!(temp_path(Path::new("a/reconciler.toml")), Path::new("a/reconciler.toml.tmp"));
        assert_eq!(temp_path(Path::new("a/queue")), Path::new("a/queue.tmp"));
    }

    #[test]
    fn replaces_file_and_creates_parents() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state").join("queue.json");
        write_atomic(&path, "first").expect("write");
        write_atomic(&path, "second").expect("rewrite");
        assert_eq!(fs::read_to_string(&path).expect("read"), "second");
        assert!(!temp_path(&path).exists());
    }

    #[test]
    fn parent_that_is_a_file_fails() {
        let temp = tempfile::tempdir().expect("tempdir");
        let blocker = temp.path().join("blocker");
        fs::write(&blocker, "").expect("write blocker");
        assert!(write_atomic(&blocker.join("queue.json"), "x").is_err());
    }
}
