//! tilth agent library
//!
//! The agent runs on every node and keeps the local systemd in line with
//! the declared pods. It watches node facts, decides which pods may run
//! here, renders them into unit files and applies the changes.
//!
//! ## Architecture
//!
//! ```text
//! fact sources ──► Scheduler ──► Arbiter ──► Evaluator ──► Manager (systemd)
//! ```
//!
//! - **Arbiter**: gates pods on their constraints against the latest facts
//! - **Evaluator state**: serializes changes per pod and holds back pods
//!   that would overwrite each other's unit files
//! - **Evaluator**: turns an allocation change into a phased instruction
//!   plan and runs it
//!
//! ## Modules
//!
//! - `allocation`: rendered pods, pod unit headers and recovery
//! - `manager`: process manager seam with systemd and mock implementations
//! - `scheduler`: arbiter, state, planning, execution and composition

pub mod allocation;
pub mod config;
pub mod manager;
pub mod scheduler;

// Re-export commonly used types
pub use allocation::{Allocation, SystemPaths};
pub use config::Config;
pub use manager::{Connector, Manager, MockConnector, SystemdConnector};
pub use scheduler::{Evaluator, EvaluatorState, Scheduler, Source};
