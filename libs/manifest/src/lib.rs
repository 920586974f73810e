//! # tilth-manifest
//!
//! Declared pod model for the tilth agent.
//!
//! ## Concepts
//!
//! - A **pod** is a named group of systemd units deployed and removed together
//! - A **constraint** gates a pod on the node's current facts
//! - Unit sources may reference facts as `${name}`; they are interpolated at
//!   render time
//!
//! Pods are declared per namespace. The same pod name may appear in several
//! namespaces; the scheduler decides which declaration wins.

mod constraint;
mod error;
mod interpolate;
mod pod;

pub use constraint::{Constraint, FlatMap};
pub use error::{ConstraintError, ManifestError};
pub use interpolate::{interpolate, variables};
pub use pod::{load_pods, parse_pods, Pod, Transition, Unit, UnitCommand};
