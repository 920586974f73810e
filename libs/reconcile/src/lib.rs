//! Content marks for deterministic comparison.
//!
//! Everything the agent renders (pod declarations, unit sources, fact
//! payloads) is compared by *mark*: a short content hash over a canonical
//! encoding. Two values with equal marks are treated as semantically
//! identical and never trigger re-execution.
//!
//! # Invariants
//!
//! - Marks are deterministic: map key order never changes the result
//! - Marks are stable across restarts (they are persisted in unit headers)

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A content mark.
///
/// Rendered as `sha256:<32 hex chars>` (the first 128 bits of the digest).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Mark(String);

impl Mark {
    /// Mark of a JSON value, computed over its canonical encoding.
    pub fn from_json(json: &serde_json::Value) -> Self {
        Self::from_bytes(canonical_json(json).as_bytes())
    }

    /// Mark of a serializable value.
    ///
    /// Values that fail to serialize are marked as JSON `null`.
    pub fn of<T: Serialize>(value: &T) -> Self {
        let json = serde_json::to_value(value).unwrap_or(serde_json::Value::Null);
        Self::from_json(&json)
    }

    /// Mark of a flat string map.
    pub fn from_map(map: &BTreeMap<String, String>) -> Self {
        let mut hasher = Sha256::new();
        for (k, v) in map {
            hasher.update(k.as_bytes());
            hasher.update([0u8]);
            hasher.update(v.as_bytes());
            hasher.update([0xffu8]);
        }
        Self::finish(hasher)
    }

    /// Mark of raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self::finish(hasher)
    }

    /// Wrap an already rendered mark (e.g. read back from disk).
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Get the mark string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn finish(hasher: Sha256) -> Self {
        let result = hasher.finalize();
        Self(format!("sha256:{}", hex::encode(&result[..16])))
    }
}

impl fmt::Display for Mark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Produce canonical JSON (sorted keys, no extra whitespace).
fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by_key(|(k, _)| *k);
            let inner: Vec<String> = pairs
                .iter()
                .map(|(k, v)| format!("\"{}\":{}", escape_json_string(k), canonical_json(v)))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        serde_json::Value::Array(arr) => {
            let inner: Vec<String> = arr.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        serde_json::Value::String(s) => format!("\"{}\"", escape_json_string(s)),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Null => "null".to_string(),
    }
}

fn escape_json_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out
}

/// Compare two optional marked values.
///
/// Absent equals absent; present values are equal iff their marks are.
pub fn is_equal_by<T, F>(left: Option<&T>, right: Option<&T>, mark: F) -> bool
where
    F: Fn(&T) -> Mark,
{
    match (left, right) {
        (None, None) => true,
        (Some(l), Some(r)) => mark(l) == mark(r),
        _ => false,
    }
}
