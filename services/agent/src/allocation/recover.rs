//! Recovery of allocations from existing pod units.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::Path;

use tracing::{debug, info, warn};

use super::{Allocation, AllocationError, SystemPaths, UnitFile};

/// Scan both systemd directories for pod units and rebuild their
/// allocations.
///
/// Pod units that cannot be parsed, or whose units are missing, are logged
/// and skipped. Missing directories are treated as empty.
pub fn recover(paths: &SystemPaths) -> Result<Vec<Allocation>, AllocationError> {
    let mut recovered: BTreeMap<String, Allocation> = BTreeMap::new();

    for dir in [&paths.local, &paths.runtime] {
        for file in pod_units(dir)? {
            let path = file.path.clone();
            match Allocation::from_pod_unit(file, paths) {
                Ok(allocation) => {
                    if recovered.contains_key(allocation.name()) {
                        warn!(
                            pod = %allocation.name(),
                            path = %path.display(),
                            "Duplicate pod unit, ignoring"
                        );
                        continue;
                    }
                    debug!(
                        pod = %allocation.name(),
                        path = %path.display(),
                        "Recovered allocation"
                    );
                    recovered.insert(allocation.name().to_string(), allocation);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unrecoverable pod unit");
                }
            }
        }
    }

    info!(count = recovered.len(), "Recovered allocations");
    Ok(recovered.into_values().collect())
}

/// `pod-*.service` files directly under `dir`.
fn pod_units(dir: &Path) -> Result<Vec<UnitFile>, AllocationError> {
    let io_err = |source| AllocationError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io_err(e)),
    };

    let mut files = Vec::new();
    for entry in entries {
        let path = entry.map_err(io_err)?.path();
        let is_pod_unit = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with("pod-") && name.ends_with(".service"));
        if !is_pod_unit || !path.is_file() {
            continue;
        }
        let source = std::fs::read_to_string(&path).map_err(|source| AllocationError::Io {
            path: path.clone(),
            source,
        })?;
        files.push(UnitFile::new(path, source));
    }
    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(files)
}
