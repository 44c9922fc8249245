//! # `stepbind` Core
//!
//! Node-local resource binding and dynamic CPU reallocation for a job-step
//! launcher. For each task of a job step this crate:
//!
//! - computes and applies a CPU/NUMA binding (scheduler affinity or an
//!   on-disk cpuset),
//! - manages the hierarchical cpuset directories representing that binding,
//! - coordinates with co-located job steps so CPUs can be repartitioned at
//!   runtime through an external dynamic balancing facility.
//!
//! The launcher drives everything through [`hooks::TaskHooks`], which is
//! invoked at fixed lifecycle points (pre-setuid, pre-launch,
//! post-termination, release-resources). Scheduling and placement decisions
//! are made elsewhere; this crate only acts on a binding already decided for
//! the node.
//!
//! ## Components
//!
//! - [`topology`] - CPU/NUMA masks and node topology detection
//! - [`cpuset`] - the on-disk cpuset hierarchy store
//! - [`affinity`] - binding computation and application
//! - [`gate`] - polling wait for dependency job steps to start
//! - [`drom`] - registration with the dynamic balancing facility
//! - [`hooks`] - the lifecycle entry points gluing the above

#![deny(missing_docs)]
#![deny(unsafe_code)] // Selectively allowed at syscall sites with justification
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod affinity;
pub mod config;
pub mod cpuset;
pub mod drom;
pub mod gate;
pub mod hooks;
pub mod topology;

pub use config::{BindPolicy, NodeConfig};
pub use hooks::TaskHooks;
pub use topology::{CpuMask, Topology};

/// Result type for stepbind-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for stepbind-core
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Cpuset hierarchy errors
    #[error("Cpuset error: {0}")]
    Cpuset(#[from] cpuset::CpusetError),

    /// Binding computation/application errors
    #[error("Affinity error: {0}")]
    Affinity(#[from] affinity::AffinityError),

    /// Dependency gate errors
    #[error("Dependency gate error: {0}")]
    Gate(#[from] gate::GateError),

    /// Balancing facility errors
    #[error("Balancing facility error: {0}")]
    Drom(#[from] drom::DromError),
}
