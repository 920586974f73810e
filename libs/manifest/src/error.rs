//! Error types for manifests and constraints.

use std::path::PathBuf;

use thiserror::Error;

/// A constraint pair that did not hold against the current facts.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConstraintError {
    /// The pair evaluated to false.
    #[error("constraint failed: {left:?}:{right:?}")]
    Failed { left: String, right: String },
}

/// Errors that can occur while loading pod declarations.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// The manifest file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The manifest is not valid JSON for the pod schema.
    #[error("failed to parse pods: {0}")]
    Parse(#[from] serde_json::Error),

    /// The manifest parsed but violates a structural rule.
    #[error("invalid pod {pod:?}: {message}")]
    Invalid { pod: String, message: String },

    /// A transition names a command the process manager does not know.
    #[error("unknown unit command: {0:?}")]
    UnknownCommand(String),
}
