//! systemd implementation driven through `systemctl`.

use std::io::ErrorKind;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tilth_manifest::UnitCommand;
use tokio::process::Command;
use tracing::debug;

use super::{Connector, Manager, ManagerError};
use crate::allocation::UnitFile;

/// Connects to the host systemd.
#[derive(Debug, Clone)]
pub struct SystemdConnector {
    systemctl: String,
}

impl SystemdConnector {
    pub fn new() -> Self {
        Self {
            systemctl: "systemctl".to_string(),
        }
    }

    /// Use a different `systemctl` binary.
    pub fn with_systemctl(mut self, systemctl: impl Into<String>) -> Self {
        self.systemctl = systemctl.into();
        self
    }
}

impl Default for SystemdConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for SystemdConnector {
    async fn connect(&self) -> Result<Arc<dyn Manager>, ManagerError> {
        // Fail early if the binary is not usable.
        run(&self.systemctl, &["--version"])
            .await
            .map_err(|e| ManagerError::Connect(format!("{e:#}")))?;
        Ok(Arc::new(SystemdManager {
            systemctl: self.systemctl.clone(),
        }))
    }
}

/// A systemd connection.
#[derive(Debug)]
pub struct SystemdManager {
    systemctl: String,
}

impl SystemdManager {
    async fn systemctl(&self, args: &[&str]) -> Result<(), ManagerError> {
        run(&self.systemctl, args).await?;
        Ok(())
    }
}

#[async_trait]
impl Manager for SystemdManager {
    async fn enable(&self, unit: &UnitFile, runtime: bool) -> Result<(), ManagerError> {
        let name = unit.name();
        if runtime {
            self.systemctl(&["enable", "--runtime", &name]).await
        } else {
            self.systemctl(&["enable", &name]).await
        }
    }

    async fn disable(&self, unit: &UnitFile) -> Result<(), ManagerError> {
        self.systemctl(&["disable", &unit.name()]).await
    }

    async fn write(&self, unit: &UnitFile) -> Result<(), ManagerError> {
        tokio::fs::write(&unit.path, &unit.source)
            .await
            .map_err(|source| ManagerError::Io {
                action: "write",
                path: unit.path.clone(),
                source,
            })?;
        self.systemctl(&["daemon-reload"]).await
    }

    async fn delete(&self, unit: &UnitFile) -> Result<(), ManagerError> {
        match tokio::fs::remove_file(&unit.path).await {
            Ok(()) => {}
            // Already gone.
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(source) => {
                return Err(ManagerError::Io {
                    action: "delete",
                    path: unit.path.clone(),
                    source,
                })
            }
        }
        self.systemctl(&["daemon-reload"]).await
    }

    async fn command(&self, unit: &UnitFile, command: UnitCommand) -> Result<(), ManagerError> {
        self.systemctl(&[command.as_str(), &unit.name()]).await
    }
}

/// Run a `systemctl` command and return result.
async fn run(systemctl: &str, args: &[&str]) -> Result<()> {
    debug!(command = %args.join(" "), "Running systemctl");
    let output = Command::new(systemctl)
        .args(args)
        .output()
        .await
        .with_context(|| format!("failed to execute {systemctl}"))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("{} {} failed: {}", systemctl, args.join(" "), stderr.trim());
    }

    Ok(())
}
