//! Loads the static S-pin → P-pin mapping used while the broker is
//! unreachable. Missing file yields an empty map; invalid entries are
//! skipped silently — a malformed failsafe file must never abort startup.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Deserialize)]
struct Binding {
    s: i64,
    p: i64,
}

#[derive(Deserialize, Default)]
struct FailsafeDoc {
    #[serde(default)]
    bindings: Option<Vec<Binding>>,
    #[serde(default)]
    map: Option<BTreeMap<String, i64>>,
}

pub fn load(path: &Path) -> BTreeMap<u16, u16> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(_) => return BTreeMap::new(),
    };

    let doc: FailsafeDoc = match serde_json::from_str(&content) {
        Ok(d) => d,
        Err(e) => {
            log::warn!("Failed to parse failsafe map {}: {}", path.display(), e);
            return BTreeMap::new();
        }
    };

    let mut result = BTreeMap::new();
    if let Some(bindings) = doc.bindings {
        for b in bindings {
            if let (Ok(s), Ok(p)) = (u16::try_from(b.s), u16::try_from(b.p)) {
                result.insert(s, p);
            }
        }
    } else if let Some(map) = doc.map {
        for (s_str, p) in map {
            if let (Ok(s), Ok(p)) = (s_str.parse::<u16>(), u16::try_from(p)) {
                result.insert(s, p);
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(&dir.path().join("nope.json")).is_empty());
    }

    #[test]
    fn bindings_list_shape() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("failsafe.json");
        std::fs::write(&path, r#"{"bindings":[{"s":30,"p":18},{"s":31,"p":22}]}"#).unwrap();

        let map = load(&path);
        assert_eq!(map.get(&30), Some(&18));
        assert_eq!(map.get(&31), Some(&22));
    }

    #[test]
    fn map_dict_shape() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("failsafe.json");
        std::fs::write(&path, r#"{"map":{"30":18,"31":22}}"#).unwrap();

        let map = load(&path);
        assert_eq!(map.get(&30), Some(&18));
        assert_eq!(map.get(&31), Some(&22));
    }

    #[test]
    fn invalid_entries_are_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("failsafe.json");
        std::fs::write(&path, r#"{"map":{"30":18,"bogus":99}}"#).unwrap();

        let map = load(&path);
        assert_eq!(map.len(), 1);
        assert_eq!(map.get(&30), Some(&18));
    }

    #[test]
    fn malformed_json_yields_empty_not_panic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("failsafe.json");
        std::fs::write(&path, b"not json").unwrap();
        assert!(load(&path).is_empty());
    }
}
