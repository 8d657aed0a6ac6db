use std::collections::HashMap;
use std::fmt;

use lazy_static::lazy_static;
use regex::Regex;

pub const RESERVED_LABEL_PREFIX: &str = "__";

lazy_static! {
    static ref INVALID_LABEL_CHAR_RE: Regex = Regex::new(r"[^a-zA-Z0-9_]").unwrap();
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Label {
    pub name: String,
    pub value: String,
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}=\"{}\"", self.name, self.value)
    }
}

/// A label set sorted by name. Names are unique; setting an existing name
/// replaces its value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Labels(Vec<Label>);

impl Labels {
    pub fn from_map(map: &HashMap<String, String>) -> Labels {
        map.iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .binary_search_by(|l| l.name.as_str().cmp(name))
            .ok()
            .map(|i| self.0[i].value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.0.binary_search_by(|l| l.name.cmp(&name)) {
            Ok(i) => self.0[i].value = value,
            Err(i) => self.0.insert(i, Label { name, value }),
        }
    }

    pub fn retain(&mut self, f: impl FnMut(&Label) -> bool) {
        self.0.retain(f);
    }

    /// Returns a copy of `self` overridden by every label of `other`.
    pub fn merge(&self, other: &Labels) -> Labels {
        let mut merged = self.clone();
        for label in other.iter() {
            merged.set(label.name.clone(), label.value.clone());
        }
        merged
    }

    /// Labels without the reserved `__` prefix.
    pub fn public(&self) -> Labels {
        Labels(
            self.0
                .iter()
                .filter(|l| !l.name.starts_with(RESERVED_LABEL_PREFIX))
                .cloned()
                .collect(),
        )
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Label> {
        self.0.iter()
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, label) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", label)?;
        }
        write!(f, "}}")
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for Labels {
    fn from_iter<T: IntoIterator<Item = (N, V)>>(iter: T) -> Self {
        let mut lset = Labels::default();
        for (name, value) in iter {
            lset.set(name, value);
        }
        lset
    }
}

impl<'a> IntoIterator for &'a Labels {
    type Item = &'a Label;
    type IntoIter = std::slice::Iter<'a, Label>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Replaces every character that is not valid in a label name with `_`.
pub fn sanitize_label_name(name: &str) -> String {
    INVALID_LABEL_CHAR_RE.replace_all(name, "_").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_keeps_names_sorted_and_unique() {
        let mut lset = Labels::default();
        lset.set("zone", "a");
        lset.set("app", "api");
        lset.set("zone", "b");

        let names: Vec<&str> = lset.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["app", "zone"]);
        assert_eq!(lset.get("zone"), Some("b"));
    }

    #[test]
    fn merge_prefers_other() {
        let job: Labels = [("env", "prod"), ("team", "core")].into_iter().collect();
        let target: Labels = [("env", "staging")].into_iter().collect();

        let merged = job.merge(&target);
        assert_eq!(merged.get("env"), Some("staging"));
        assert_eq!(merged.get("team"), Some("core"));
    }

    #[test]
    fn public_drops_reserved_labels() {
        let lset: Labels = [("__address__", "10.0.0.1:6060"), ("job", "api")]
            .into_iter()
            .collect();
        assert_eq!(lset.public().to_string(), "{job=\"api\"}");
    }

    #[test]
    fn sanitize_replaces_invalid_chars() {
        assert_eq!(sanitize_label_name("app.kubernetes.io/name"), "app_kubernetes_io_name");
    }
}
