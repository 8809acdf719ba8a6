//! Shared domain types for the clusterup upgrade orchestrator: the phase
//! data model, the plan container, the changelog entry, and the error
//! taxonomy every other crate in the workspace builds on.

pub mod errors;
pub mod phase;
pub mod plan;

pub use errors::ClusterupError;
pub use phase::{ExecutorTag, PackageLocator, Phase, PhaseData, PhasePath, PhaseState, ServerRef, ServerRole};
pub use plan::{ChangeEntry, Plan, UpdateServer};
