//! `${name}` variable interpolation.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

use regex::{Captures, Regex};

fn pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"\$\{([A-Za-z0-9_.\-]+)\}").ok())
        .as_ref()
}

/// Replace every `${name}` in `source` with `env[name]`.
///
/// Variables missing from `env` are left untouched.
pub fn interpolate(source: &str, env: &BTreeMap<String, String>) -> String {
    let Some(pattern) = pattern() else {
        return source.to_string();
    };
    pattern
        .replace_all(source, |caps: &Captures<'_>| match env.get(&caps[1]) {
            Some(value) => value.clone(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// Names of all variables referenced by `source`.
pub fn variables(source: &str) -> BTreeSet<String> {
    let Some(pattern) = pattern() else {
        return BTreeSet::new();
    };
    pattern
        .captures_iter(source)
        .map(|caps| caps[1].to_string())
        .collect()
}
