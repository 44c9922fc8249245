//! # Dynamic Resource Balancing Coordination
//!
//! Wraps the external dynamic-resource-balancing facility that reassigns
//! CPUs between cooperating processes at runtime. Before exec, each
//! interactive task is pre-registered with its current mask so CPUs can
//! later be stolen from or granted to it; at termination the registration
//! is finalized; when a job's allocation is released, the node's now-free
//! CPUs are redistributed among the remaining registered tasks.
//!
//! The facility itself is an external shared subsystem reached through the
//! narrow [`BalancingFacility`] trait; [`StubFacility`] is the in-memory
//! implementation used when the balancer is disabled and in tests. Attach
//! is scoped tightly around each call and never held across a dependency
//! wait.

mod stub;

pub use stub::StubFacility;

use std::time::Instant;

use fxhash::{FxHashMap, FxHashSet};
use tracing::debug;

use crate::topology::CpuMask;

/// Errors that can occur while talking to the balancing facility.
#[derive(Debug, thiserror::Error)]
pub enum DromError {
    /// Attaching to (or detaching from) the facility failed
    #[error("failed to attach to balancing facility: {0}")]
    AttachFailed(String),

    /// Pre-registering a task failed
    #[error("failed to register pid {pid} with balancing facility: {message}")]
    RegistrationFailed {
        /// The task pid
        pid: i32,
        /// Facility error text
        message: String,
    },

    /// Finalizing a task's registration failed
    #[error("failed to finalize pid {pid} with balancing facility: {message}")]
    FinalizeFailed {
        /// The task pid
        pid: i32,
        /// Facility error text
        message: String,
    },

    /// Node-level CPU reassignment failed
    #[error("failed to reassign CPUs of job {job_id}: {message}")]
    ReassignFailed {
        /// The released job
        job_id: u32,
        /// Facility error text
        message: String,
    },
}

/// Environment variables a registration hands back, to be merged into the
/// task's environment before exec so the spawned program's runtime can
/// observe facility-managed state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvPatch {
    vars: Vec<(String, String)>,
}

impl EnvPatch {
    /// Creates an empty patch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one variable.
    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.push((key.into(), value.into()));
    }

    /// Iterates over the variables in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Merges the patch into a task environment, overwriting existing keys.
    pub fn merge_into(&self, env: &mut FxHashMap<String, String>) {
        for (key, value) in &self.vars {
            env.insert(key.clone(), value.clone());
        }
    }
}

/// The facility's capability surface, as narrow as this layer needs it.
///
/// `attach`/`detach` scope access to the facility's shared state;
/// `preinit`/`post_finalize` bracket one task's registration lifetime;
/// `reassign_cpus` redistributes a released job's CPUs node-wide.
pub trait BalancingFacility {
    /// Acquires a handle to the facility's shared state.
    ///
    /// # Errors
    ///
    /// Returns `AttachFailed` if the facility is unreachable.
    fn attach(&self) -> Result<(), DromError>;

    /// Releases the handle acquired by [`attach`](Self::attach).
    ///
    /// # Errors
    ///
    /// Returns `AttachFailed` if the facility rejects the detach.
    fn detach(&self) -> Result<(), DromError>;

    /// The facility's view of the node CPU count.
    ///
    /// # Errors
    ///
    /// Returns `AttachFailed` if the facility is unreachable.
    fn cpu_count(&self) -> Result<usize, DromError>;

    /// Registers `pid` with its currently held mask so its CPUs may later
    /// be reassigned, returning the environment patch for the task.
    ///
    /// # Errors
    ///
    /// Returns `RegistrationFailed` if the facility rejects the task.
    fn preinit(&self, pid: i32, mask: &CpuMask) -> Result<EnvPatch, DromError>;

    /// Deregisters `pid` at task termination.
    ///
    /// # Errors
    ///
    /// Returns `FinalizeFailed` if the facility rejects the call.
    fn post_finalize(&self, pid: i32) -> Result<(), DromError>;

    /// Redistributes the released job's CPUs among the tasks still
    /// registered on the node.
    ///
    /// # Errors
    ///
    /// Returns `ReassignFailed` if the redistribution fails.
    fn reassign_cpus(&self, job_id: u32) -> Result<(), DromError>;
}

/// Owns the live registrations on this node and brackets every facility
/// call with a scoped attach/detach pair.
#[derive(Debug)]
pub struct DromCoordinator<F> {
    facility: F,
    /// Pids with a live registration. Exactly one registration may exist
    /// per pid; re-registering before deregistering is a contract
    /// violation.
    registered: FxHashSet<i32>,
}

impl<F: BalancingFacility> DromCoordinator<F> {
    /// Creates a coordinator over the given facility.
    pub fn new(facility: F) -> Self {
        Self {
            facility,
            registered: FxHashSet::default(),
        }
    }

    /// The facility's view of the node CPU count, queried under a scoped
    /// attach.
    ///
    /// # Errors
    ///
    /// Returns `AttachFailed` if the facility is unreachable.
    pub fn node_cpu_count(&self) -> Result<usize, DromError> {
        self.facility.attach()?;
        let count = self.facility.cpu_count();
        self.facility.detach()?;
        count
    }

    /// Pre-registers a task with its current mask, returning the
    /// environment patch that must be merged into the task's environment
    /// before exec.
    ///
    /// # Errors
    ///
    /// Returns `RegistrationFailed` if `pid` already holds a registration
    /// or the facility rejects it.
    pub fn register_task(&mut self, pid: i32, mask: &CpuMask) -> Result<EnvPatch, DromError> {
        if self.registered.contains(&pid) {
            return Err(DromError::RegistrationFailed {
                pid,
                message: "pid already registered".into(),
            });
        }

        self.facility.attach()?;
        let result = self.facility.preinit(pid, mask);
        self.facility.detach()?;

        let patch = result?;
        self.registered.insert(pid);
        debug!("registered pid {pid} with mask [{mask}]");
        Ok(patch)
    }

    /// Finalizes a task's registration at termination. A pid with no live
    /// registration is a no-op success, so re-entrant termination hooks
    /// stay idempotent.
    ///
    /// # Errors
    ///
    /// Returns `FinalizeFailed` if the facility rejects the call; the
    /// registration is dropped regardless.
    pub fn finalize_task(&mut self, pid: i32) -> Result<(), DromError> {
        if !self.registered.remove(&pid) {
            debug!("pid {pid} has no live registration, nothing to finalize");
            return Ok(());
        }

        self.facility.attach()?;
        let result = self.facility.post_finalize(pid);
        self.facility.detach()?;
        result
    }

    /// Redistributes a released job's CPUs among the remaining registered
    /// tasks on the node.
    ///
    /// # Errors
    ///
    /// Returns `ReassignFailed` if the facility cannot redistribute.
    pub fn reassign_node_cpus(&mut self, job_id: u32) -> Result<(), DromError> {
        let start = Instant::now();
        let result = self.facility.reassign_cpus(job_id);
        debug!(
            "CPU reassignment for job {job_id} took {} ms",
            start.elapsed().as_millis()
        );
        result
    }

    /// Returns true if `pid` currently holds a registration.
    #[must_use]
    pub fn is_registered(&self, pid: i32) -> bool {
        self.registered.contains(&pid)
    }

    /// The wrapped facility, for hosts that need its extra surface.
    pub fn facility(&self) -> &F {
        &self.facility
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mask() -> CpuMask {
        CpuMask::from_cpulist("0-1", 4)
    }

    #[test]
    fn test_register_then_finalize() {
        let mut drom = DromCoordinator::new(StubFacility::new(4));
        let patch = drom.register_task(100, &mask()).unwrap();
        assert!(patch.iter().any(|(k, _)| k == "DLB_MASK"));
        assert!(drom.is_registered(100));

        drom.finalize_task(100).unwrap();
        assert!(!drom.is_registered(100));
        assert_eq!(drom.facility().finalized(), vec![100]);
    }

    #[test]
    fn test_double_register_is_contract_violation() {
        let mut drom = DromCoordinator::new(StubFacility::new(4));
        drom.register_task(100, &mask()).unwrap();
        let err = drom.register_task(100, &mask()).unwrap_err();
        assert!(matches!(err, DromError::RegistrationFailed { pid: 100, .. }));
        // The facility only ever saw one preinit.
        assert_eq!(drom.facility().preinit_count(), 1);
    }

    #[test]
    fn test_double_finalize_is_noop() {
        let mut drom = DromCoordinator::new(StubFacility::new(4));
        drom.register_task(100, &mask()).unwrap();
        drom.finalize_task(100).unwrap();
        drom.finalize_task(100).unwrap();
        assert_eq!(drom.facility().finalized(), vec![100]);
    }

    #[test]
    fn test_attach_scoped_around_each_call() {
        let mut drom = DromCoordinator::new(StubFacility::new(4));
        drom.register_task(100, &mask()).unwrap();
        drom.finalize_task(100).unwrap();
        assert_eq!(drom.facility().attach_count(), 2);
        assert!(!drom.facility().attached());
    }

    #[test]
    fn test_failed_preinit_leaves_no_registration() {
        let facility = StubFacility::new(4);
        facility.fail_next_preinit();
        let mut drom = DromCoordinator::new(facility);

        let err = drom.register_task(100, &mask()).unwrap_err();
        assert!(matches!(err, DromError::RegistrationFailed { .. }));
        assert!(!drom.is_registered(100));
        // The facility was still detached after the failure.
        assert!(!drom.facility().attached());
    }

    #[test]
    fn test_reassign_records_job() {
        let mut drom = DromCoordinator::new(StubFacility::new(4));
        drom.reassign_node_cpus(100).unwrap();
        assert_eq!(drom.facility().reassigned(), vec![100]);
    }

    #[test]
    fn test_env_patch_merge() {
        let mut patch = EnvPatch::new();
        patch.push("DLB_MASK", "0-1");
        patch.push("OMP_NUM_THREADS", "2");

        let mut env = FxHashMap::default();
        env.insert("OMP_NUM_THREADS".to_string(), "8".to_string());
        patch.merge_into(&mut env);

        assert_eq!(env.get("DLB_MASK").unwrap(), "0-1");
        assert_eq!(env.get("OMP_NUM_THREADS").unwrap(), "2");
    }

    #[test]
    fn test_node_cpu_count() {
        let drom = DromCoordinator::new(StubFacility::new(12));
        assert_eq!(drom.node_cpu_count().unwrap(), 12);
    }
}
