//! Header lines embedded in pod units.

use serde::{Deserialize, Serialize};
use tilth_manifest::{Transition, UnitCommand};
use tilth_reconcile::Mark;

use super::{AllocationError, Unit, UnitFile};

const POD_PREFIX: &str = "### POD ";
const UNIT_PREFIX: &str = "### UNIT ";

/// Identity and marks of an allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PodHeader {
    /// Written outside the JSON part of the header line.
    #[serde(skip)]
    pub name: String,
    pub agent_mark: Mark,
    pub namespace: String,
    pub pod_mark: Mark,
}

impl PodHeader {
    pub fn mark(&self) -> Mark {
        Mark::of(&(self.name.as_str(), self))
    }

    /// Render the header lines for this pod and its units.
    pub fn marshal(&self, units: &[Unit]) -> Result<String, AllocationError> {
        let mut out = format!("{POD_PREFIX}{} {}\n", self.name, serde_json::to_string(self)?);
        for unit in units {
            out.push_str(&format!(
                "{UNIT_PREFIX}{} {}\n",
                unit.file.path.display(),
                serde_json::to_string(&unit.header)?
            ));
        }
        Ok(out)
    }

    /// Parse the header lines at the top of a pod unit source.
    ///
    /// Parsing stops at the first non-blank line that is not a header.
    /// Returned units carry their paths but empty sources.
    pub fn unmarshal(source: &str) -> Result<(PodHeader, Vec<Unit>), AllocationError> {
        let mut header = None;
        let mut units = Vec::new();
        for line in source.lines() {
            if let Some(rest) = line.strip_prefix(POD_PREFIX) {
                let (name, json) = split_line(rest)?;
                let mut parsed: PodHeader = serde_json::from_str(&json)?;
                parsed.name = name.to_string();
                header = Some(parsed);
            } else if let Some(rest) = line.strip_prefix(UNIT_PREFIX) {
                let (path, json) = split_line(rest)?;
                units.push(Unit {
                    file: UnitFile::new(path, String::new()),
                    header: serde_json::from_str(&json)?,
                });
            } else if !line.trim().is_empty() {
                break;
            }
        }
        let header = header.ok_or_else(|| AllocationError::Header("no pod line".to_string()))?;
        Ok((header, units))
    }
}

/// Split `<subject> {json}`.
fn split_line(rest: &str) -> Result<(&str, String), AllocationError> {
    rest.split_once(" {")
        .map(|(subject, json)| (subject, format!("{{{json}")))
        .ok_or_else(|| AllocationError::Header(format!("no JSON in {rest:?}")))
}

/// Lifecycle policy of one unit, as persisted in the pod unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UnitHeader {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create: Option<UnitCommand>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update: Option<UnitCommand>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destroy: Option<UnitCommand>,
    #[serde(default)]
    pub permanent: bool,
}

impl UnitHeader {
    pub fn new(transition: Transition, permanent: bool) -> Self {
        Self {
            create: transition.create,
            update: transition.update,
            destroy: transition.destroy,
            permanent,
        }
    }
}
