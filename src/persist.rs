//! Atomic whole-file JSON persistence shared by the store and the awareness
//! file. Grounded on the teacher's `persist::app::managed_vec::io_utils::atomic_write`:
//! write to a sibling temp file, then rename into place, so readers never
//! observe a truncated file.

use crate::error::{Result, RuntimeError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;

/// Loads and deserializes `path` as JSON, returning `Ok(None)` if the file
/// does not exist. A malformed (present but unparsable) file is an error.
pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match std::fs::read(path) {
        Ok(bytes) => {
            let value = serde_json::from_slice(&bytes).map_err(|err| {
                RuntimeError::MalformedStore(format!("{}: {err}", path.display()))
            })?;
            Ok(Some(value))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(RuntimeError::Io(err)),
    }
}

/// Serializes `value` as pretty JSON and atomically replaces `path`.
pub fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let bytes = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, &bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Sample {
        n: u32,
    }

    #[test]
    fn missing_file_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.json");
        let loaded: Option<Sample> = load_json(&path).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn round_trips_through_atomic_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.json");
        save_json(&path, &Sample { n: 7 }).unwrap();
        let loaded: Option<Sample> = load_json(&path).unwrap();
        assert_eq!(loaded, Some(Sample { n: 7 }));
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, b"not json").unwrap();
        let loaded: Result<Option<Sample>> = load_json(&path);
        assert!(loaded.is_err());
    }
}
