//! Atomic file writes for saved research results.
//!
//! Data is written to a sibling temporary file and renamed into place, so a
//! reader never observes a half-written result.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};

/// Serialize `data` as pretty JSON and write it atomically.
pub fn atomic_write_json<T: serde::Serialize>(path: &Path, data: &T) -> io::Result<()> {
    let json = serde_json::to_vec_pretty(data).map_err(io::Error::other)?;
    atomic_write(path, &json)
}

/// Write `data` to `path` through a temporary sibling and a rename.
///
/// Parent directories are created as needed.
pub fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = temp_path(path);
    if let Err(e) = std::fs::write(&tmp, data).and_then(|()| std::fs::rename(&tmp, path)) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}

/// Load JSON written by [`atomic_write_json`]. `Ok(None)` if the file is absent.
pub fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> io::Result<Option<T>> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    serde_json::from_slice(&data)
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// `result.json` -> `result.json.tmp`, keeping the original extension.
fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(OsString::from)
        .unwrap_or_else(|| OsString::from("delve"));
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use tempfile::TempDir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Saved {
        query: String,
        learnings: Vec<String>,
    }

    #[test]
    fn test_json_write_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("runs").join("latest.json");
        let saved = Saved {
            query: "tokio".into(),
            learnings: vec!["uses a work-stealing scheduler".into()],
        };
        atomic_write_json(&path, &saved).unwrap();
        assert_eq!(load_json::<Saved>(&path).unwrap(), Some(saved));
        assert!(!temp_path(&path).exists());
    }

    #[test]
    fn test_load_missing_file_is_none() {
        let dir = TempDir::new().unwrap();
        let loaded: Option<Saved> = load_json(&dir.path().join("absent.json")).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_load_invalid_json_is_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.json");
        atomic_write(&path, b"{ not json").unwrap();
        let err = load_json::<Saved>(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_temp_path_keeps_extension() {
        assert_eq!(
            temp_path(Path::new("/tmp/result.json")),
            PathBuf::from("/tmp/result.json.tmp")
        );
    }
}
