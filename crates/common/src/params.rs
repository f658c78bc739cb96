use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Named integer parameters published in the consensus
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NetworkParams {
    values: BTreeMap<String, i32>,
}

impl NetworkParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: i32) {
        self.values.insert(name.into(), value);
    }

    pub fn with(mut self, name: impl Into<String>, value: i32) -> Self {
        self.set(name, value);
        self
    }

    /// Look up `name`, falling back to `default` when absent and clamping
    /// the published value into `[min, max]`.
    pub fn get(&self, name: &str, default: i32, min: i32, max: i32) -> i32 {
        match self.values.get(name) {
            Some(&v) if v < min => min,
            Some(&v) if v > max => max,
            Some(&v) => v,
            None => default,
        }
    }

    /// Parse `key=value` pairs separated by whitespace, as they appear in a
    /// consensus "params" line. Malformed entries are skipped.
    pub fn parse_line(line: &str) -> Self {
        let mut params = Self::new();
        for item in line.split_whitespace() {
            if let Some((k, v)) = item.split_once('=') {
                if let Ok(v) = v.parse::<i32>() {
                    params.set(k, v);
                }
            }
        }
        params
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, i32)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }
}
