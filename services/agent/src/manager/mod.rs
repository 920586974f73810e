//! Process manager interface.
//!
//! The scheduler never talks to systemd directly. Every evaluation opens a
//! fresh [`Manager`] through a [`Connector`] and applies its instructions
//! through it, so concurrent evaluations never share a client.
//!
//! - [`SystemdConnector`] drives the host systemd through `systemctl`
//! - [`MockConnector`] records calls for tests and development

mod mock;
mod systemd;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tilth_manifest::UnitCommand;

use crate::allocation::UnitFile;

pub use mock::{MockCall, MockConnector};
pub use systemd::{SystemdConnector, SystemdManager};

/// Errors from process manager calls.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("failed to connect: {0}")]
    Connect(String),

    #[error("failed to {action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{operation} {unit} rejected: {reason}")]
    Rejected {
        operation: String,
        unit: String,
        reason: String,
    },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// One connection to the process manager.
///
/// Every call is independent and may fail on its own.
#[async_trait]
pub trait Manager: Send + Sync {
    /// Enable the unit, only until reboot when `runtime` is set.
    async fn enable(&self, unit: &UnitFile, runtime: bool) -> Result<(), ManagerError>;

    async fn disable(&self, unit: &UnitFile) -> Result<(), ManagerError>;

    /// Write the unit source to its path.
    async fn write(&self, unit: &UnitFile) -> Result<(), ManagerError>;

    /// Remove the unit file.
    async fn delete(&self, unit: &UnitFile) -> Result<(), ManagerError>;

    async fn command(&self, unit: &UnitFile, command: UnitCommand) -> Result<(), ManagerError>;
}

/// Opens manager connections.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn Manager>, ManagerError>;
}
