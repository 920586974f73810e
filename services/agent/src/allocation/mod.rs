//! Rendered pod allocations.
//!
//! An [`Allocation`] is a declared pod rendered against the node facts:
//! every unit source interpolated, every unit assigned a path under one of
//! the systemd directories, and a generated *pod unit* whose header lines
//! carry the marks needed to recover the allocation after a restart.
//!
//! ```text
//! ### POD web {"AgentMark":"sha256:…","Namespace":"private","PodMark":"sha256:…"}
//! ### UNIT /run/systemd/system/web.service {"Create":"start","Destroy":"stop","Permanent":false}
//!
//! [Unit]
//! Description=web
//! Before=web.service
//! [Service]
//! ExecStart=/usr/bin/sleep inf
//! [Install]
//! WantedBy=multi-user.target
//! ```

mod header;
mod recover;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use tilth_manifest::{interpolate, variables, FlatMap, ManifestError, Pod, Transition};
use tilth_reconcile::Mark;

pub use header::{PodHeader, UnitHeader};
pub use recover::recover;

/// Fact holding the `ExecStart` command of generated pod units.
pub const POD_EXEC_KEY: &str = "agent.pod_exec";

const DEFAULT_POD_EXEC: &str = "/usr/bin/sleep inf";

/// Errors from rendering, encoding or recovering allocations.
#[derive(Debug, Error)]
pub enum AllocationError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("malformed header: {0}")]
    Header(String),

    #[error("failed to encode header: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// The two systemd unit directories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemPaths {
    /// Persistent units, e.g. `/etc/systemd/system`.
    pub local: PathBuf,
    /// Volatile units, e.g. `/run/systemd/system`.
    pub runtime: PathBuf,
}

impl Default for SystemPaths {
    fn default() -> Self {
        Self {
            local: PathBuf::from("/etc/systemd/system"),
            runtime: PathBuf::from("/run/systemd/system"),
        }
    }
}

impl SystemPaths {
    pub fn new(local: impl Into<PathBuf>, runtime: impl Into<PathBuf>) -> Self {
        Self {
            local: local.into(),
            runtime: runtime.into(),
        }
    }

    /// Path of `unit_name` in the runtime or local directory.
    pub fn unit_path(&self, unit_name: &str, runtime: bool) -> PathBuf {
        let dir = if runtime { &self.runtime } else { &self.local };
        dir.join(unit_name)
    }

    /// True if `path` lives directly in the runtime directory.
    pub fn is_runtime(&self, path: &Path) -> bool {
        path.parent().map(normalize) == Some(normalize(&self.runtime))
    }
}

/// A unit file on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitFile {
    pub path: PathBuf,
    pub source: String,
}

impl UnitFile {
    pub fn new(path: impl Into<PathBuf>, source: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            source: source.into(),
        }
    }

    /// Unit name as systemd knows it, e.g. `web.service`.
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// A rendered unit and its lifecycle policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unit {
    pub file: UnitFile,
    pub header: UnitHeader,
}

/// A pod rendered for this node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub header: PodHeader,
    /// Generated `pod-<namespace>-<name>.service`.
    pub pod_unit: Unit,
    pub units: Vec<Unit>,
}

impl Allocation {
    /// Render `pod` against `env`.
    pub fn from_manifest(
        pod: &Pod,
        env: &FlatMap,
        paths: &SystemPaths,
    ) -> Result<Self, AllocationError> {
        pod.validate()?;

        let units: Vec<Unit> = pod
            .units
            .iter()
            .map(|unit| Unit {
                file: UnitFile::new(
                    paths.unit_path(&unit.name, pod.runtime),
                    interpolate(&unit.source, env),
                ),
                header: UnitHeader::new(unit.transition, unit.permanent),
            })
            .collect();

        let header = PodHeader {
            name: pod.name.clone(),
            agent_mark: agent_mark(pod, env),
            namespace: pod.namespace.clone(),
            pod_mark: pod.mark(),
        };

        let mut source = header.marshal(&units)?;
        source.push('\n');
        source.push_str(&pod_unit_body(pod, env, &units));

        let pod_unit = Unit {
            file: UnitFile::new(
                paths.unit_path(&pod_unit_name(&pod.namespace, &pod.name), pod.runtime),
                source,
            ),
            header: UnitHeader::new(Transition::service(), !pod.runtime),
        };

        Ok(Self {
            header,
            pod_unit,
            units,
        })
    }

    /// Rebuild an allocation from a pod unit found on disk.
    ///
    /// Unit sources are read from the paths listed in the header.
    pub fn from_pod_unit(file: UnitFile, paths: &SystemPaths) -> Result<Self, AllocationError> {
        let (header, mut units) = PodHeader::unmarshal(&file.source)?;
        for unit in &mut units {
            unit.file.source =
                std::fs::read_to_string(&unit.file.path).map_err(|source| AllocationError::Io {
                    path: unit.file.path.clone(),
                    source,
                })?;
        }
        let permanent = !paths.is_runtime(&file.path);
        Ok(Self {
            header,
            pod_unit: Unit {
                file,
                header: UnitHeader::new(Transition::service(), permanent),
            },
            units,
        })
    }

    pub fn name(&self) -> &str {
        &self.header.name
    }

    /// Allocations with equal marks are interchangeable.
    pub fn mark(&self) -> Mark {
        self.header.mark()
    }

    /// Mark equality of two optional allocations. Absent equals absent.
    pub fn is_equal(left: Option<&Allocation>, right: Option<&Allocation>) -> bool {
        tilth_reconcile::is_equal_by(left, right, Allocation::mark)
    }

    /// Declared units followed by the pod unit.
    pub fn all_units(&self) -> impl Iterator<Item = &Unit> {
        self.units.iter().chain(std::iter::once(&self.pod_unit))
    }

    /// Normalized paths of every unit file, including the pod unit.
    ///
    /// Two allocations whose path sets intersect cannot be applied at the
    /// same time.
    pub fn unit_paths(&self) -> BTreeSet<PathBuf> {
        self.all_units().map(|unit| normalize(&unit.file.path)).collect()
    }

    /// True if this allocation shares a unit file with `other`.
    pub fn collides_with(&self, other: &Allocation) -> bool {
        let ours = self.unit_paths();
        other.unit_paths().iter().any(|path| ours.contains(path))
    }
}

/// `pod-<namespace>-<name>.service`
pub fn pod_unit_name(namespace: &str, name: &str) -> String {
    format!("pod-{namespace}-{name}.service")
}

fn pod_unit_body(pod: &Pod, env: &FlatMap, units: &[Unit]) -> String {
    let before: Vec<String> = units.iter().map(|unit| unit.file.name()).collect();
    let exec = env
        .get(POD_EXEC_KEY)
        .map(String::as_str)
        .unwrap_or(DEFAULT_POD_EXEC);
    format!(
        "[Unit]\nDescription={}\nBefore={}\n[Service]\nExecStart={}\n[Install]\nWantedBy={}\n",
        pod.name,
        before.join(" "),
        exec,
        pod.target
    )
}

/// Mark of the env values the pod actually renders.
fn agent_mark(pod: &Pod, env: &FlatMap) -> Mark {
    let mut referenced: BTreeSet<String> = pod
        .units
        .iter()
        .flat_map(|unit| variables(&unit.source))
        .collect();
    referenced.insert(POD_EXEC_KEY.to_string());
    let used: BTreeMap<String, String> = referenced
        .into_iter()
        .filter_map(|key| env.get(&key).map(|value| (key, value.clone())))
        .collect();
    Mark::from_map(&used)
}

fn normalize(path: &Path) -> PathBuf {
    path.components()
        .filter(|component| !matches!(component, Component::CurDir))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tilth_manifest::{parse_pods, UnitCommand};

    fn pod() -> Pod {
        parse_pods(
            "private",
            r##"[{
                "name": "pod-1",
                "units": [
                    {"name": "unit-1.service", "source": "# ${meta.consul}",
                     "transition": {"create": "start", "destroy": "stop"}},
                    {"name": "unit-2.service", "source": "# static",
                     "transition": {"create": "start", "destroy": "stop"}}
                ]
            }]"##,
        )
        .unwrap()
        .remove(0)
    }

    fn env(consul: &str) -> FlatMap {
        FlatMap::from([
            ("meta.consul".to_string(), consul.to_string()),
            ("meta.rack".to_string(), "r1".to_string()),
        ])
    }

    #[test]
    fn test_from_manifest() {
        let alloc =
            Allocation::from_manifest(&pod(), &env("true"), &SystemPaths::default()).unwrap();

        assert_eq!(alloc.name(), "pod-1");
        assert_eq!(alloc.header.namespace, "private");
        assert_eq!(
            alloc.pod_unit.file.path,
            PathBuf::from("/run/systemd/system/pod-private-pod-1.service")
        );
        assert_eq!(
            alloc.units[0].file,
            UnitFile::new("/run/systemd/system/unit-1.service", "# true")
        );
        assert_eq!(alloc.units[0].header.create, Some(UnitCommand::Start));
        assert!(!alloc.pod_unit.header.permanent);

        let source = &alloc.pod_unit.file.source;
        assert!(source.starts_with("### POD pod-1 {"));
        assert!(source.contains("### UNIT /run/systemd/system/unit-2.service {"));
        assert!(source
            .contains("\n[Unit]\nDescription=pod-1\nBefore=unit-1.service unit-2.service\n"));
        assert!(source.contains("ExecStart=/usr/bin/sleep inf\n"));
        assert!(source.ends_with("WantedBy=multi-user.target\n"));
    }

    #[test]
    fn test_local_pod() {
        let mut pod = pod();
        pod.runtime = false;
        let alloc = Allocation::from_manifest(&pod, &env("true"), &SystemPaths::default()).unwrap();

        assert_eq!(
            alloc.units[1].file.path,
            PathBuf::from("/etc/systemd/system/unit-2.service")
        );
        assert!(alloc.pod_unit.header.permanent);
    }

    #[test]
    fn test_pod_exec_from_env() {
        let mut env = env("true");
        env.insert(POD_EXEC_KEY.to_string(), "/bin/true".to_string());
        let alloc = Allocation::from_manifest(&pod(), &env, &SystemPaths::default()).unwrap();
        assert!(alloc.pod_unit.file.source.contains("ExecStart=/bin/true\n"));
    }

    #[test]
    fn test_agent_mark_ignores_unreferenced_facts() {
        let paths = SystemPaths::default();
        let base = Allocation::from_manifest(&pod(), &env("true"), &paths).unwrap();

        let mut unrelated = env("true");
        unrelated.insert("meta.rack".to_string(), "r2".to_string());
        let same = Allocation::from_manifest(&pod(), &unrelated, &paths).unwrap();
        assert!(Allocation::is_equal(Some(&base), Some(&same)));

        let changed = Allocation::from_manifest(&pod(), &env("false"), &paths).unwrap();
        assert!(!Allocation::is_equal(Some(&base), Some(&changed)));
        assert!(!Allocation::is_equal(Some(&base), None));
        assert!(Allocation::is_equal(None, None));
    }

    #[test]
    fn test_collision() {
        let paths = SystemPaths::default();
        let first = Allocation::from_manifest(&pod(), &env("true"), &paths).unwrap();

        let mut other = pod();
        other.name = "pod-2".to_string();
        let second = Allocation::from_manifest(&other, &env("true"), &paths).unwrap();
        assert!(first.collides_with(&second));

        other.units.clear();
        let empty = Allocation::from_manifest(&other, &env("true"), &paths).unwrap();
        assert!(!first.collides_with(&empty));
        assert_eq!(empty.unit_paths().len(), 1);
    }

    #[test]
    fn test_is_runtime() {
        let paths = SystemPaths::new("/etc/systemd/system", "/run/systemd/system/");
        assert!(paths.is_runtime(Path::new("/run/systemd/system/a.service")));
        assert!(!paths.is_runtime(Path::new("/etc/systemd/system/a.service")));
    }
}
