//! # On-Disk Cpuset Hierarchy
//!
//! Manages the cpuset directories that represent per-job and per-task CPU
//! bindings:
//!
//! ```text
//! <root>/slurm[_<node>]_<job>/          base, one per job
//! <root>/.../slurm<job>.<step>_<task>   task cpuset, one per local task
//! ```
//!
//! The hierarchy is shared by every task of a job on the node, so creation
//! treats "already exists" as success and removal treats "already gone" as
//! success. Teardown is two-phase: a direct rmdir first, then child
//! enumeration when the kernel has not released the children itself - the
//! release-agent mechanism is not reliable enough to be trusted.

mod error;
mod store;

pub use error::CpusetError;
pub use store::CpusetStore;
