//! Process manager instructions.

use std::fmt;

use tilth_manifest::UnitCommand;

use crate::allocation::UnitFile;
use crate::manager::{Manager, ManagerError};

/// Position of an instruction in a plan. Lower phases run first.
pub type Phase = u8;

/// Destroy command of removed units.
pub const PHASE_DESTROY: Phase = 0;
/// Disable removed units.
pub const PHASE_DISABLE: Phase = 1;
/// Delete removed unit files.
pub const PHASE_DELETE: Phase = 2;
/// Write new and changed unit files.
pub const PHASE_WRITE: Phase = 3;
/// Enable new and changed units.
pub const PHASE_ENABLE: Phase = 4;
/// Create or update command of new and changed units.
pub const PHASE_COMMAND: Phase = 5;

/// What an instruction does to its unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Enable { runtime: bool },
    Disable,
    Write,
    Delete,
    Command(UnitCommand),
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Enable { runtime: true } => f.write_str("enable-runtime"),
            Self::Enable { runtime: false } => f.write_str("enable"),
            Self::Disable => f.write_str("disable"),
            Self::Write => f.write_str("write"),
            Self::Delete => f.write_str("delete"),
            Self::Command(command) => write!(f, "{command}"),
        }
    }
}

/// One atomic process manager operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub phase: Phase,
    pub operation: Operation,
    pub unit: UnitFile,
}

impl Instruction {
    pub fn new(phase: Phase, operation: Operation, unit: UnitFile) -> Self {
        Self {
            phase,
            operation,
            unit,
        }
    }

    pub async fn execute(&self, manager: &dyn Manager) -> Result<(), ManagerError> {
        match self.operation {
            Operation::Enable { runtime } => manager.enable(&self.unit, runtime).await,
            Operation::Disable => manager.disable(&self.unit).await,
            Operation::Write => manager.write(&self.unit).await,
            Operation::Delete => manager.delete(&self.unit).await,
            Operation::Command(command) => manager.command(&self.unit, command).await,
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.phase, self.operation, self.unit.path.display())
    }
}
