//! In-memory balancing facility.
//!
//! Stands in for the real facility when dynamic balancing is disabled on a
//! node, and doubles as the test double for everything above the
//! [`BalancingFacility`](super::BalancingFacility) seam. Records every call
//! so tests can assert on ordering and scoping.

use std::sync::Mutex;

use crate::topology::CpuMask;

use super::{BalancingFacility, DromError, EnvPatch};

#[derive(Debug, Default)]
struct StubState {
    attached: bool,
    attach_count: u64,
    preinits: Vec<(i32, String)>,
    finalized: Vec<i32>,
    reassigned: Vec<u32>,
    fail_next_preinit: bool,
    fail_next_reassign: bool,
}

/// An in-memory [`BalancingFacility`].
#[derive(Debug)]
pub struct StubFacility {
    ncpus: usize,
    state: Mutex<StubState>,
}

impl StubFacility {
    /// Creates a stub reporting `ncpus` CPUs.
    #[must_use]
    pub fn new(ncpus: usize) -> Self {
        Self {
            ncpus,
            state: Mutex::new(StubState::default()),
        }
    }

    /// Makes the next `preinit` fail.
    pub fn fail_next_preinit(&self) {
        self.state.lock().unwrap().fail_next_preinit = true;
    }

    /// Makes the next `reassign_cpus` fail.
    pub fn fail_next_reassign(&self) {
        self.state.lock().unwrap().fail_next_reassign = true;
    }

    /// Returns true while a handle is attached.
    #[must_use]
    pub fn attached(&self) -> bool {
        self.state.lock().unwrap().attached
    }

    /// Number of attach calls seen.
    #[must_use]
    pub fn attach_count(&self) -> u64 {
        self.state.lock().unwrap().attach_count
    }

    /// Number of preinit calls seen.
    #[must_use]
    pub fn preinit_count(&self) -> usize {
        self.state.lock().unwrap().preinits.len()
    }

    /// Pids and masks passed to preinit, in order.
    #[must_use]
    pub fn preinits(&self) -> Vec<(i32, String)> {
        self.state.lock().unwrap().preinits.clone()
    }

    /// Pids finalized, in order.
    #[must_use]
    pub fn finalized(&self) -> Vec<i32> {
        self.state.lock().unwrap().finalized.clone()
    }

    /// Job ids reassigned, in order.
    #[must_use]
    pub fn reassigned(&self) -> Vec<u32> {
        self.state.lock().unwrap().reassigned.clone()
    }
}

impl BalancingFacility for StubFacility {
    fn attach(&self) -> Result<(), DromError> {
        let mut state = self.state.lock().unwrap();
        state.attached = true;
        state.attach_count += 1;
        Ok(())
    }

    fn detach(&self) -> Result<(), DromError> {
        self.state.lock().unwrap().attached = false;
        Ok(())
    }

    fn cpu_count(&self) -> Result<usize, DromError> {
        Ok(self.ncpus)
    }

    fn preinit(&self, pid: i32, mask: &CpuMask) -> Result<EnvPatch, DromError> {
        let mut state = self.state.lock().unwrap();
        if std::mem::take(&mut state.fail_next_preinit) {
            return Err(DromError::RegistrationFailed {
                pid,
                message: "stub preinit failure".into(),
            });
        }
        state.preinits.push((pid, mask.to_cpulist()));

        let mut patch = EnvPatch::new();
        patch.push("DLB_MASK", mask.to_cpulist());
        Ok(patch)
    }

    fn post_finalize(&self, pid: i32) -> Result<(), DromError> {
        self.state.lock().unwrap().finalized.push(pid);
        Ok(())
    }

    fn reassign_cpus(&self, job_id: u32) -> Result<(), DromError> {
        let mut state = self.state.lock().unwrap();
        if std::mem::take(&mut state.fail_next_reassign) {
            return Err(DromError::ReassignFailed {
                job_id,
                message: "stub reassign failure".into(),
            });
        }
        state.reassigned.push(job_id);
        Ok(())
    }
}

impl BalancingFacility for &StubFacility {
    fn attach(&self) -> Result<(), DromError> {
        (*self).attach()
    }

    fn detach(&self) -> Result<(), DromError> {
        (*self).detach()
    }

    fn cpu_count(&self) -> Result<usize, DromError> {
        (*self).cpu_count()
    }

    fn preinit(&self, pid: i32, mask: &CpuMask) -> Result<EnvPatch, DromError> {
        (*self).preinit(pid, mask)
    }

    fn post_finalize(&self, pid: i32) -> Result<(), DromError> {
        (*self).post_finalize(pid)
    }

    fn reassign_cpus(&self, job_id: u32) -> Result<(), DromError> {
        (*self).reassign_cpus(job_id)
    }
}
