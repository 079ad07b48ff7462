//! Ordered variable scope with `${NAME}` expansion.
//!
//! A [`VariableStore`] keeps insertion order so that the exported process
//! environment and the step output are reproducible. Resolution expands
//! `${NAME}` references against the store itself first and then against an
//! optional parent scope (typically the host environment).

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound on fixed-point passes performed by [`VariableStore::resolve`].
const MAX_RESOLVE_PASSES: usize = 10;

static REFERENCE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_.\-]*)\}").expect("valid reference regex"));

/// Errors raised when mutating a [`VariableStore`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VariableError {
    #[error("Invalid variable name '{name}': names must be non-empty and must not contain '='")]
    InvalidName { name: String },
}

impl VariableError {
    /// Create an invalid name error.
    pub fn invalid_name(name: impl Into<String>) -> Self {
        Self::InvalidName { name: name.into() }
    }
}

/// Ordered mapping of variable name to string value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "IndexMap<String, String>", into = "IndexMap<String, String>")]
pub struct VariableStore {
    entries: IndexMap<String, String>,
}

impl VariableStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from the current process environment.
    pub fn from_process_env() -> Self {
        let entries = std::env::vars().filter(|(key, _)| is_valid_name(key)).collect();
        Self { entries }
    }

    /// Insert or replace `key`. Existing keys keep their original position.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> Result<(), VariableError> {
        let key = key.into();
        if !is_valid_name(&key) {
            return Err(VariableError::invalid_name(key));
        }
        self.entries.insert(key, value.into());
        Ok(())
    }

    /// Returns the value stored for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(key, value)| (key.as_str(), value.as_str()))
    }

    /// Merges `other` into `self`; values from `other` win on collision.
    pub fn merge(&mut self, other: &VariableStore) {
        for (key, value) in &other.entries {
            self.entries.insert(key.clone(), value.clone());
        }
    }

    /// Expands `${NAME}` references in place until a fixed point is reached.
    ///
    /// Each reference resolves against this store first and then against
    /// `parent`. A variable referring to itself resolves against `parent`
    /// only, so `PATH=/ws/bin:${PATH}` extends the parent's `PATH`.
    /// Unknown names expand to the empty string. Cycles stop after a bounded
    /// number of passes, leaving the last substitution in place.
    pub fn resolve(&mut self, parent: Option<&VariableStore>) {
        for _ in 0..MAX_RESOLVE_PASSES {
            let mut changed = false;
            let keys: Vec<String> = self.entries.keys().cloned().collect();
            for key in keys {
                let Some(current) = self.entries.get(&key) else { continue };
                if !current.contains("${") {
                    continue;
                }
                let expanded = self.expand(current, Some(&key), parent);
                if &expanded != current {
                    self.entries.insert(key, expanded);
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
    }

    /// Expands `${NAME}` references inside `input` without mutating the store.
    pub fn resolve_str(&self, input: &str, parent: Option<&VariableStore>) -> String {
        let mut output = input.to_string();
        for _ in 0..MAX_RESOLVE_PASSES {
            if !output.contains("${") {
                break;
            }
            let expanded = self.expand(&output, None, parent);
            if expanded == output {
                break;
            }
            output = expanded;
        }
        output
    }

    fn expand(&self, input: &str, owner: Option<&str>, parent: Option<&VariableStore>) -> String {
        REFERENCE
            .replace_all(input, |captures: &Captures| {
                let name = &captures[1];
                let local = if owner == Some(name) { None } else { self.get(name) };
                local
                    .or_else(|| parent.and_then(|scope| scope.get(name)))
                    .unwrap_or_default()
                    .to_string()
            })
            .into_owned()
    }

    /// Returns ordered `KEY=VALUE` strings for process environment seeding.
    pub fn to_kv(&self) -> Vec<String> {
        self.entries.iter().map(|(key, value)| format!("{key}={value}")).collect()
    }

    /// Returns the subset whose names start with any of `prefixes`.
    pub fn filter_by_prefix<S: AsRef<str>>(&self, prefixes: &[S]) -> VariableStore {
        let entries = self
            .entries
            .iter()
            .filter(|(key, _)| prefixes.iter().any(|prefix| key.starts_with(prefix.as_ref())))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        Self { entries }
    }
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && !name.contains('=')
}

impl TryFrom<IndexMap<String, String>> for VariableStore {
    type Error = VariableError;

    fn try_from(entries: IndexMap<String, String>) -> Result<Self, Self::Error> {
        if let Some(name) = entries.keys().find(|key| !is_valid_name(key)) {
            return Err(VariableError::invalid_name(name.clone()));
        }
        Ok(Self { entries })
    }
}

impl From<VariableStore> for IndexMap<String, String> {
    fn from(store: VariableStore) -> Self {
        store.entries
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for VariableStore {
    /// Collects pairs, silently skipping names that contain `=`.
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut store = Self::new();
        for (key, value) in iter {
            let _ = store.set(key, value);
        }
        store
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(pairs: &[(&str, &str)]) -> VariableStore {
        pairs.iter().map(|(k, v)| (*k, *v)).collect()
    }

    #[test]
    fn set_rejects_names_with_equals() {
        let mut vars = VariableStore::new();
        let err = vars.set("A=B", "x").unwrap_err();
        assert_eq!(err, VariableError::invalid_name("A=B"));
        assert!(vars.is_empty());
    }

    #[test]
    fn merge_prefers_other_and_keeps_order() {
        let mut base = store(&[("A", "1"), ("B", "2")]);
        base.merge(&store(&[("B", "20"), ("C", "3")]));
        assert_eq!(base.to_kv(), vec!["A=1", "B=20", "C=3"]);
    }

    #[test]
    fn resolve_expands_against_self_then_parent() {
        let parent = store(&[("HOME", "/home/ci"), ("A", "parent")]);
        let mut vars = store(&[("A", "self"), ("WS", "${HOME}/ws"), ("MSG", "${A}-${MISSING}-end")]);
        vars.resolve(Some(&parent));
        assert_eq!(vars.get("WS"), Some("/home/ci/ws"));
        assert_eq!(vars.get("MSG"), Some("self--end"));
    }

    #[test]
    fn resolve_reaches_fixed_point_through_chains() {
        let mut vars = store(&[("C", "${B}/c"), ("B", "${A}/b"), ("A", "/a")]);
        vars.resolve(None);
        assert_eq!(vars.get("C"), Some("/a/b/c"));
    }

    #[test]
    fn self_reference_resolves_against_parent() {
        let parent = store(&[("PATH", "/usr/bin")]);
        let mut vars = store(&[("PATH", "/ws/bin:${PATH}")]);
        vars.resolve(Some(&parent));
        assert_eq!(vars.get("PATH"), Some("/ws/bin:/usr/bin"));
    }

    #[test]
    fn resolve_terminates_on_cycles() {
        let mut vars = store(&[("A", "${B}"), ("B", "${A}")]);
        vars.resolve(None);
        assert!(vars.get("A").is_some());
        assert!(vars.get("B").is_some());
    }

    #[test]
    fn filter_by_prefix_keeps_only_matching_names() {
        let vars = store(&[("FLOW_A", "1"), ("OTHER", "2"), ("FLOW_B", "3")]);
        let filtered = vars.filter_by_prefix(&["FLOW_"]);
        assert_eq!(filtered.to_kv(), vec!["FLOW_A=1", "FLOW_B=3"]);
        assert!(vars.filter_by_prefix::<&str>(&[]).is_empty());
    }

    #[test]
    fn deserialize_rejects_invalid_names() {
        let ok: VariableStore = serde_json::from_str(r#"{"A":"1","B":"2"}"#).unwrap();
        assert_eq!(ok.to_kv(), vec!["A=1", "B=2"]);
        assert!(serde_json::from_str::<VariableStore>(r#"{"A=1":"x"}"#).is_err());
    }
}
