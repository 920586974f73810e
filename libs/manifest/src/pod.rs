//! Pod declarations.

use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tilth_reconcile::Mark;

use crate::constraint::Constraint;
use crate::error::ManifestError;

/// Default systemd target pods are wanted by.
pub const DEFAULT_TARGET: &str = "multi-user.target";

/// Lifecycle command issued to the process manager for a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnitCommand {
    Start,
    Stop,
    Restart,
    Reload,
    TryRestart,
}

impl UnitCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::Reload => "reload",
            Self::TryRestart => "try-restart",
        }
    }
}

impl fmt::Display for UnitCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UnitCommand {
    type Err = ManifestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(Self::Start),
            "stop" => Ok(Self::Stop),
            "restart" => Ok(Self::Restart),
            "reload" => Ok(Self::Reload),
            "try-restart" => Ok(Self::TryRestart),
            other => Err(ManifestError::UnknownCommand(other.to_string())),
        }
    }
}

/// Commands issued when a unit is created, updated or destroyed.
///
/// A missing command means "leave the unit alone" for that transition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create: Option<UnitCommand>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update: Option<UnitCommand>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destroy: Option<UnitCommand>,
}

impl Transition {
    /// The usual service transition: start, restart, stop.
    pub fn service() -> Self {
        Self {
            create: Some(UnitCommand::Start),
            update: Some(UnitCommand::Restart),
            destroy: Some(UnitCommand::Stop),
        }
    }
}

/// A declared unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unit {
    /// Unit file name, e.g. `web.service`.
    pub name: String,

    /// Unit source, possibly referencing facts as `${name}`.
    #[serde(default)]
    pub source: String,

    #[serde(default)]
    pub transition: Transition,

    /// Permanent units are enabled persistently and survive reboots.
    #[serde(default)]
    pub permanent: bool,
}

/// A declared pod.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pod {
    pub name: String,

    /// Stamped by the loader; not part of the declaration file.
    #[serde(default)]
    pub namespace: String,

    /// Runtime pods live under the volatile systemd directory.
    #[serde(default = "default_runtime")]
    pub runtime: bool,

    #[serde(default = "default_target")]
    pub target: String,

    #[serde(default)]
    pub constraint: Constraint,

    #[serde(default)]
    pub units: Vec<Unit>,
}

fn default_runtime() -> bool {
    true
}

fn default_target() -> String {
    DEFAULT_TARGET.to_string()
}

impl Pod {
    /// Content mark of the declaration.
    pub fn mark(&self) -> Mark {
        Mark::of(self)
    }

    /// Constraint the pod must satisfy to be scheduled on this node.
    pub fn scheduling_constraint(&self) -> &Constraint {
        &self.constraint
    }

    /// Check structural rules.
    pub fn validate(&self) -> Result<(), ManifestError> {
        let invalid = |message: String| ManifestError::Invalid {
            pod: self.name.clone(),
            message,
        };
        if self.name.is_empty() {
            return Err(invalid("empty pod name".to_string()));
        }
        if self.name.contains(|c: char| c == '/' || c.is_whitespace()) {
            return Err(invalid("pod name contains '/' or whitespace".to_string()));
        }
        let mut seen = BTreeSet::new();
        for unit in &self.units {
            if unit.name.is_empty() || unit.name.contains(|c: char| c == '/' || c.is_whitespace()) {
                return Err(invalid(format!("bad unit name {:?}", unit.name)));
            }
            if !seen.insert(unit.name.as_str()) {
                return Err(invalid(format!("duplicate unit {:?}", unit.name)));
            }
        }
        Ok(())
    }
}

/// Parse a JSON array of pods and stamp them with `namespace`.
pub fn parse_pods(namespace: &str, src: &str) -> Result<Vec<Pod>, ManifestError> {
    let mut pods: Vec<Pod> = serde_json::from_str(src)?;
    for pod in &mut pods {
        pod.namespace = namespace.to_string();
        pod.validate()?;
    }
    Ok(pods)
}

/// Read pods for `namespace` from a JSON file.
pub fn load_pods(namespace: &str, path: impl AsRef<Path>) -> Result<Vec<Pod>, ManifestError> {
    let path = path.as_ref();
    let src = std::fs::read_to_string(path).map_err(|source| ManifestError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_pods(namespace, &src)
}
