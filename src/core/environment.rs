//! Ordered environment map exported into pipeline sessions

use std::collections::HashMap;

/// Ordered set of exported K=V pairs plus a hidden sub-environment.
///
/// Order is insertion order; updating an existing key keeps its slot.
/// Hidden entries are exported like any other but their values are masked
/// from log output by the caller.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    entries: Vec<(String, String)>,
    hidden: Vec<(String, String)>,
}

/// Prefix stripped from host env vars passed through to the pipeline
const PASSTHRU_PREFIX: &str = "X_";

/// Prefix stripped from host env vars passed through as hidden values
const HIDDEN_PASSTHRU_PREFIX: &str = "XV_";

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from an ordered list of pairs
    pub fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        let mut env = Self::new();
        for (k, v) in pairs {
            env.add(k, v);
        }
        env
    }

    /// Insert or update a key, preserving its original position on update
    pub fn add(&mut self, key: &str, value: &str) {
        update_in(&mut self.entries, key, value);
    }

    /// Insert or update a hidden key
    pub fn add_hidden(&mut self, key: &str, value: &str) {
        update_in(&mut self.hidden, key, value);
    }

    /// Apply a batch of pairs in order
    pub fn update(&mut self, pairs: &[(String, String)]) {
        for (k, v) in pairs {
            self.add(k, v);
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .chain(self.hidden.iter())
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Visible entries in insertion order
    pub fn ordered(&self) -> &[(String, String)] {
        &self.entries
    }

    /// Hidden entries in insertion order
    pub fn hidden(&self) -> &[(String, String)] {
        &self.hidden
    }

    /// All entries, visible then hidden
    pub fn all(&self) -> Vec<(String, String)> {
        let mut all = self.entries.clone();
        all.extend(self.hidden.iter().cloned());
        all
    }

    /// Shell `export` lines for every entry, values quoted
    pub fn export(&self) -> Vec<String> {
        self.all()
            .iter()
            .map(|(k, v)| format!("export {}={}", k, quote(v)))
            .collect()
    }

    /// Host vars prefixed `X_` (public) or `XV_` (hidden), prefix stripped
    pub fn load_passthru<I>(&mut self, host: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (k, v) in host {
            if let Some(stripped) = k.strip_prefix(HIDDEN_PASSTHRU_PREFIX) {
                self.add_hidden(stripped, &v);
            } else if let Some(stripped) = k.strip_prefix(PASSTHRU_PREFIX) {
                self.add(stripped, &v);
            }
        }
    }

    /// Expand `$VAR` and `${VAR}` references from this environment
    pub fn interpolate(&self, input: &str) -> String {
        let map: HashMap<&str, &str> = self
            .entries
            .iter()
            .chain(self.hidden.iter())
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();

        let re = regex::Regex::new(r"\$(\w+)|\$\{(\w+)\}").unwrap();
        re.replace_all(input, |caps: &regex::Captures| {
            let name = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str())
                .unwrap_or("");
            map.get(name).copied().unwrap_or("").to_string()
        })
        .into_owned()
    }
}

fn update_in(entries: &mut Vec<(String, String)>, key: &str, value: &str) {
    if let Some(slot) = entries.iter_mut().find(|(k, _)| k == key) {
        slot.1 = value.to_string();
    } else {
        entries.push((key.to_string(), value.to_string()));
    }
}

/// Single-quote a value for the shell, escaping embedded quotes
fn quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./:=@%+".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_preserved_on_update() {
        let mut env = Environment::new();
        env.add("A", "1");
        env.add("B", "2");
        env.add("A", "3");
        assert_eq!(
            env.ordered(),
            &[
                ("A".to_string(), "3".to_string()),
                ("B".to_string(), "2".to_string())
            ]
        );
    }

    #[test]
    fn test_export_quotes_values() {
        let mut env = Environment::new();
        env.add("PLAIN", "simple-1.0");
        env.add("SPACED", "two words");
        env.add("QUOTED", "it's");
        let lines = env.export();
        assert_eq!(lines[0], "export PLAIN=simple-1.0");
        assert_eq!(lines[1], "export SPACED='two words'");
        assert_eq!(lines[2], r"export QUOTED='it'\''s'");
    }

    #[test]
    fn test_passthru_prefixes() {
        let mut env = Environment::new();
        env.load_passthru(vec![
            ("X_PUBLIC".to_string(), "a".to_string()),
            ("XV_SECRET".to_string(), "b".to_string()),
            ("IGNORED".to_string(), "c".to_string()),
        ]);
        assert_eq!(env.get("PUBLIC"), Some("a"));
        assert_eq!(env.get("SECRET"), Some("b"));
        assert_eq!(env.get("IGNORED"), None);
        assert_eq!(env.ordered().len(), 1);
        assert_eq!(env.hidden().len(), 1);
    }

    #[test]
    fn test_interpolate() {
        let mut env = Environment::new();
        env.add("TAG", "v1");
        env.add("REPO", "acme/app");
        assert_eq!(env.interpolate("$REPO:${TAG}"), "acme/app:v1");
        assert_eq!(env.interpolate("$MISSING!"), "!");
    }
}
