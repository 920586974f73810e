//! Configuration for the agent.

use std::path::PathBuf;

use thiserror::Error;
use tilth_manifest::FlatMap;

use crate::allocation::SystemPaths;

/// Errors from reading the configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}: expected key=value, got {value:?}")]
    InvalidPair { var: &'static str, value: String },

    #[error("{var}: expected true or false, got {value:?}")]
    InvalidBool { var: &'static str, value: String },
}

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Unique identifier for this node.
    pub node_id: String,

    /// systemd unit directories.
    pub paths: SystemPaths,

    /// Static node metadata published as `meta.*` facts.
    pub meta: FlatMap,

    /// Pod manifest files as `(namespace, path)`.
    pub pod_files: Vec<(String, PathBuf)>,

    /// Namespaces by priority, highest first.
    pub namespaces: Vec<String>,

    /// Drain the node: deallocate every pod.
    pub drain: bool,

    /// `ExecStart` of generated pod units, if not the default.
    pub pod_exec: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let node_id = lookup("TILTH_NODE_ID")
            .or_else(|| lookup("HOSTNAME"))
            .unwrap_or_else(|| "local".to_string());

        let defaults = SystemPaths::default();
        let paths = SystemPaths::new(
            lookup("TILTH_LOCAL_DIR").map_or(defaults.local, PathBuf::from),
            lookup("TILTH_RUNTIME_DIR").map_or(defaults.runtime, PathBuf::from),
        );

        let meta = parse_pairs("TILTH_META", lookup("TILTH_META"))?
            .into_iter()
            .collect();

        let pod_files = parse_pairs("TILTH_POD_FILES", lookup("TILTH_POD_FILES"))?
            .into_iter()
            .map(|(namespace, path)| (namespace, PathBuf::from(path)))
            .collect();

        let namespaces = lookup("TILTH_NAMESPACES")
            .map(|value| split_list(&value).map(String::from).collect())
            .unwrap_or_else(|| vec!["private".to_string(), "public".to_string()]);

        let drain = match lookup("TILTH_DRAIN").as_deref().map(str::trim) {
            None | Some("") | Some("false") => false,
            Some("true") => true,
            Some(other) => {
                return Err(ConfigError::InvalidBool {
                    var: "TILTH_DRAIN",
                    value: other.to_string(),
                })
            }
        };

        let pod_exec = lookup("TILTH_POD_EXEC").filter(|exec| !exec.trim().is_empty());

        let log_level = lookup("TILTH_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            node_id,
            paths,
            meta,
            pod_files,
            namespaces,
            drain,
            pod_exec,
            log_level,
        })
    }
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|item| !item.is_empty())
}

/// Parse `a=1,b=2`.
fn parse_pairs(
    var: &'static str,
    value: Option<String>,
) -> Result<Vec<(String, String)>, ConfigError> {
    let Some(value) = value else {
        return Ok(Vec::new());
    };
    split_list(&value)
        .map(|item| {
            item.split_once('=')
                .filter(|(key, _)| !key.trim().is_empty())
                .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
                .ok_or_else(|| ConfigError::InvalidPair {
                    var,
                    value: item.to_string(),
                })
        })
        .collect()
}
