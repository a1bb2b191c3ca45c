//! Atomic load/save of last-known output (P-pin) states.
//!
//! On-disk shape: `{"P": {"<pin>": true|false, ...}}`, keys sorted for
//! determinism, written via temp-file + fsync + rename.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use crate::error::StateStoreError;

#[derive(Serialize, Deserialize, Default)]
struct StateDoc {
    #[serde(rename = "P", default)]
    p: BTreeMap<String, bool>,
}

/// Loads P-pin states from `path`. Missing file or parse error both yield
/// an empty map (the latter logs a warning) rather than failing startup.
pub fn load(path: &Path) -> BTreeMap<u16, bool> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(_) => return BTreeMap::new(),
    };

    let doc: StateDoc = match serde_json::from_str(&content) {
        Ok(d) => d,
        Err(e) => {
            log::warn!("Failed to parse state file {}: {}", path.display(), e);
            return BTreeMap::new();
        }
    };

    doc.p
        .into_iter()
        .filter_map(|(k, v)| k.parse::<u16>().ok().map(|pin| (pin, v)))
        .collect()
}

/// Atomically persists `mapping` to `path`: write to a sibling temp file,
/// fsync, then rename over the target. The temp file is removed on any
/// failure along the way.
pub fn save(path: &Path, mapping: &BTreeMap<u16, bool>) -> Result<(), StateStoreError> {
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;

    let doc = StateDoc {
        p: mapping.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
    };
    let data = serde_json::to_string(&doc)
        .map_err(|e| StateStoreError::Malformed(e.to_string()))?;

    let tmp_path = dir.join(format!(".tmp_state_{}", std::process::id()));
    let result = (|| -> Result<(), StateStoreError> {
        let mut file = std::fs::File::create(&tmp_path)?;
        file.write_all(data.as_bytes())?;
        file.sync_all()?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&tmp_path);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let mut mapping = BTreeMap::new();
        mapping.insert(22, true);
        mapping.insert(13, false);

        save(&path, &mapping).unwrap();
        let loaded = load(&path);
        assert_eq!(loaded, mapping);
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.json");
        assert!(load(&path).is_empty());
    }

    #[test]
    fn malformed_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"not json at all").unwrap();
        assert!(load(&path).is_empty());
    }

    #[test]
    fn save_is_sorted_and_uses_expected_shape() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let mut mapping = BTreeMap::new();
        mapping.insert(22, true);

        save(&path, &mapping).unwrap();
        let raw = std::fs::read_to_string(&path).unwrap();
        assert_eq!(raw, r#"{"P":{"22":true}}"#);
    }

    #[test]
    fn no_leftover_temp_file_after_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        save(&path, &BTreeMap::new()).unwrap();

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".tmp_state_"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
