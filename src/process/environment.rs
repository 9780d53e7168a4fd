//! Environment blocks with Windows key semantics

use std::collections::BTreeMap;
use std::path::Path;

/// Environment variables keyed case-insensitively.
///
/// Lookups ignore case; the casing of the most recent insert is the one
/// sent on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    entries: BTreeMap<String, (String, String)>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        let key = key.into();
        self.entries
            .insert(key.to_uppercase(), (key, value.into()))
            .map(|(_, old)| old)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .get(&key.to_uppercase())
            .map(|(_, value)| value.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(&key.to_uppercase())
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.entries.remove(&key.to_uppercase()).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.values().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// `self` layered on top of `defaults`; entries of `self` win
    pub fn merged_over(&self, defaults: &Environment) -> Environment {
        let mut merged = defaults.clone();
        for (key, value) in self.iter() {
            merged.insert(key, value);
        }
        merged
    }

    pub fn to_map(&self) -> BTreeMap<String, String> {
        self.iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    /// Base block every supervised process starts from: temp directories
    /// and the search path, plus the system variables Windows programs
    /// expect when the host has them.
    pub fn default_block() -> Environment {
        let temp = std::env::temp_dir().display().to_string();
        let path = std::env::var("PATH")
            .unwrap_or_else(|_| r"C:\Windows\system32;C:\Windows".to_string());

        let mut env = Environment::new();
        env.insert("TEMP", temp.clone());
        env.insert("TMP", temp);
        env.insert("PATH", path);
        for key in ["SystemRoot", "windir", "ComSpec", "PATHEXT", "SystemDrive"] {
            if let Ok(value) = std::env::var(key) {
                env.insert(key, value);
            }
        }
        env
    }

    /// Default block pointing temp and profile directories into a container
    pub fn container_block(container_dir: &Path) -> Environment {
        let mut env = Environment::default_block();
        let temp = container_dir.join("tmp").display().to_string();
        env.insert("TEMP", temp.clone());
        env.insert("TMP", temp);
        env.insert("USERPROFILE", container_dir.display().to_string());
        env
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Environment {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut env = Environment::new();
        for (k, v) in iter {
            env.insert(k, v);
        }
        env
    }
}

impl From<BTreeMap<String, String>> for Environment {
    fn from(map: BTreeMap<String, String>) -> Self {
        map.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_lookup_ignores_case_and_keeps_latest_casing() {
        let mut env = Environment::new();
        env.insert("Path", "a");
        assert_eq!(env.insert("PATH", "b"), Some("a".to_string()));

        assert_eq!(env.get("path"), Some("b"));
        assert_eq!(env.len(), 1);
        assert_eq!(env.to_map(), BTreeMap::from([("PATH".to_string(), "b".to_string())]));
    }

    #[test]
    fn test_caller_entries_win_over_defaults() {
        let defaults: Environment = [("TEMP", r"C:\tmp"), ("PATH", r"C:\bin")].into_iter().collect();
        let caller: Environment = [("temp", r"D:\scratch"), ("FOO", "BAR")].into_iter().collect();

        let merged = caller.merged_over(&defaults);

        assert_eq!(merged.get("TEMP"), Some(r"D:\scratch"));
        assert_eq!(merged.get("PATH"), Some(r"C:\bin"));
        assert_eq!(merged.get("foo"), Some("BAR"));
        assert_eq!(merged.len(), 3);
    }

    #[test]
    fn test_default_block_has_temp_and_path() {
        let env = Environment::default_block();
        assert!(env.contains_key("TEMP"));
        assert!(env.contains_key("TMP"));
        assert!(env.contains_key("PATH"));
    }

    #[test]
    fn test_container_block_points_into_container() {
        let env = Environment::container_block(Path::new("containers").join("c1").as_path());
        assert!(env.get("TEMP").unwrap().contains("c1"));
        assert!(env.get("USERPROFILE").unwrap().ends_with("c1"));
    }
}
