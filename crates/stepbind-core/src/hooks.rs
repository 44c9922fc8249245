//! # Lifecycle Hooks
//!
//! The ordered entry points the launcher calls around each task:
//!
//! 1. `pre_setuid` - create the job's base cpuset while still privileged
//! 2. `pre_launch` - apply the binding, wait for dependency steps, register
//!    with the balancing facility, patch the task environment
//! 3. `pre_launch_privileged` - extension point, no-op
//! 4. `post_termination` - remove the task cpuset, finalize the
//!    registration
//! 5. `post_step` - extension point, no-op
//! 6. `release_resources` - node-level CPU reassignment, base hierarchy
//!    teardown
//!
//! Every teardown entry point is idempotent: re-entering
//! `post_termination` or calling `release_resources` before any task
//! started is a no-op success. Batch tasks skip the dependency wait and
//! the facility registration - the balancing facility only manages
//! interactive step CPUs.

use std::path::PathBuf;
use std::time::Instant;

use fxhash::{FxHashMap, FxHashSet};
use tracing::{debug, info, warn};

use crate::affinity;
use crate::affinity::CpuBindRoute;
use crate::config::{BindPolicy, NodeConfig};
use crate::cpuset::CpusetStore;
use crate::drom::{BalancingFacility, DromCoordinator};
use crate::gate::{DependencyGate, JobStepId, StepDirectory, StepStateQuery};
use crate::topology::{CpuMask, Topology};

/// Step id value used in cpuset path names for the batch step.
pub const NO_VAL: u32 = 0xffff_fffe;

/// Per-step launch context handed in by the launcher.
#[derive(Debug, Clone)]
pub struct StepRecord {
    /// The owning job
    pub job_id: u32,
    /// The step within the job; `None` for the batch step
    pub step_id: Option<u32>,
    /// User the tasks run as
    pub uid: u32,
    /// Group the tasks run as
    pub gid: u32,
    /// True for the batch (whole-allocation) step
    pub batch: bool,
    /// Requested CPU binding granularity, if any
    pub cpu_bind: Option<BindPolicy>,
    /// True when memory binding was requested for the step
    pub mem_bind: bool,
    /// Job ids this step must wait on before its tasks may launch
    pub dependencies: FxHashSet<u32>,
}

impl StepRecord {
    fn step_id_or_no_val(&self) -> u32 {
        self.step_id.unwrap_or(NO_VAL)
    }

    fn identity(&self) -> JobStepId {
        JobStepId {
            job_id: self.job_id,
            step_id: self.step_id,
        }
    }
}

/// Per-task launch context handed in by the launcher.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    /// Node-local task index within the step
    pub local_id: u32,
    /// The task's process id
    pub pid: i32,
    /// CPUs assigned to this task by the scheduler
    pub assigned_cpus: CpuMask,
    /// NUMA nodes to bind the task's memory to
    #[cfg(feature = "numa")]
    pub mem_nodes: Option<crate::topology::MemNodeSet>,
    /// The task's environment, patched in place before exec
    pub env: FxHashMap<String, String>,
}

/// The lifecycle hook surface, owning all node-local binding state.
#[derive(Debug)]
pub struct TaskHooks<F, D, Q> {
    config: NodeConfig,
    topology: Topology,
    store: CpusetStore,
    drom: DromCoordinator<F>,
    gate: DependencyGate<D, Q>,
}

impl<F, D, Q> TaskHooks<F, D, Q>
where
    F: BalancingFacility,
    D: StepDirectory,
    Q: StepStateQuery,
{
    /// Builds the hook surface. The cpuset store is rooted per the node
    /// configuration; the gate is built by the caller so poll interval and
    /// cancellation can be wired to the launcher's signal handling.
    pub fn new(
        config: NodeConfig,
        topology: Topology,
        facility: F,
        gate: DependencyGate<D, Q>,
    ) -> Self {
        let store = CpusetStore::new(config.cpuset_root.clone(), config.node_name.clone());
        Self {
            config,
            topology,
            store,
            drom: DromCoordinator::new(facility),
            gate,
        }
    }

    /// Called before the launcher drops privileges: creates the job's base
    /// cpuset and hands it to the task's uid/gid, so the unprivileged task
    /// can create its own cpuset underneath later.
    ///
    /// # Errors
    ///
    /// Returns an error if the base cpuset cannot be derived or created.
    pub fn pre_setuid(&self, step: &StepRecord) -> crate::Result<()> {
        if !self.config.use_cpusets {
            return Ok(());
        }
        let base = self.store.base_path(step.job_id)?;
        self.store.create_base(&base, step.uid, step.gid)?;
        Ok(())
    }

    /// Called in the task process just before exec: applies the CPU/memory
    /// binding, waits for dependency steps, registers the task with the
    /// balancing facility and merges the returned environment patch into
    /// the task environment.
    ///
    /// # Errors
    ///
    /// Returns an error if binding application, the dependency wait or the
    /// facility registration fails. Binding readback mismatches are logged,
    /// not errors.
    pub fn pre_launch(&mut self, step: &StepRecord, task: &mut TaskRecord) -> crate::Result<()> {
        debug!(
            "pre-launch job {} task {} bind {:?}",
            step.identity(),
            task.local_id,
            step.cpu_bind
        );

        let task_path = if self.config.use_cpusets {
            info!("using cpuset affinity for tasks");
            let base = self.store.base_path(step.job_id)?;
            Some(self.store.task_path(
                &base,
                step.job_id,
                step.step_id_or_no_val(),
                task.local_id,
            )?)
        } else {
            info!("using scheduler affinity for tasks");
            None
        };

        let applied = self.apply_cpu_binding(step, task, task_path.as_deref())?;

        #[cfg(feature = "numa")]
        self.apply_mem_binding(task, task_path.as_deref())?;

        if step.batch {
            debug!("skipped batch");
            return Ok(());
        }

        let start = Instant::now();
        self.gate.wait(step.identity(), &step.dependencies)?;

        // The mask registered with the facility is the task's current one:
        // what was just applied, or the live scheduler mask when no binding
        // was requested.
        let current = match applied {
            Some(mask) => mask,
            None => affinity::current_affinity(task.pid, self.config.ncpus)?,
        };
        let patch = self.drom.register_task(task.pid, &current)?;
        patch.merge_into(&mut task.env);
        debug!(
            "pre-launch balancing leg took {} ms",
            start.elapsed().as_millis()
        );
        Ok(())
    }

    /// Extension point called just before exec while still privileged.
    ///
    /// # Errors
    ///
    /// Never fails; kept fallible for interface symmetry.
    pub fn pre_launch_privileged(
        &mut self,
        _step: &StepRecord,
        _task: &TaskRecord,
    ) -> crate::Result<()> {
        Ok(())
    }

    /// Called after a task terminates: removes its cpuset (already gone is
    /// fine) and finalizes its facility registration. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if removal or finalization fails; the cpuset
    /// removal has been attempted either way.
    pub fn post_termination(
        &mut self,
        step: &StepRecord,
        task: &TaskRecord,
    ) -> crate::Result<()> {
        debug!(
            "post-termination job {} task {}",
            step.identity(),
            task.local_id
        );

        if self.config.use_cpusets {
            let base = self.store.base_path(step.job_id)?;
            let path = self.store.task_path(
                &base,
                step.job_id,
                step.step_id_or_no_val(),
                task.local_id,
            )?;
            self.store.remove_task_cpuset(&path)?;
        }

        if !step.batch {
            self.drom.finalize_task(task.pid)?;
        }
        Ok(())
    }

    /// Extension point called once all tasks of a step are done.
    ///
    /// # Errors
    ///
    /// Never fails; kept fallible for interface symmetry.
    pub fn post_step(&mut self, _step: &StepRecord) -> crate::Result<()> {
        Ok(())
    }

    /// Called when a job's allocation is released: redistributes its CPUs
    /// among the remaining registered tasks, then tears down its cpuset
    /// hierarchy. A failed reassignment aborts the hook, but the cpuset
    /// teardown is still attempted best-effort first.
    ///
    /// # Errors
    ///
    /// Returns the reassignment error, or the teardown error when the
    /// reassignment succeeded.
    pub fn release_resources(&mut self, job_id: u32) -> crate::Result<()> {
        debug!("release resources of job {job_id}");

        let reassign = self.drom.reassign_node_cpus(job_id);

        if self.config.use_cpusets {
            let base = self.store.base_path(job_id)?;
            let removed = self.store.remove_tree(&base);
            match (&reassign, removed) {
                (Ok(()), removed) => removed?,
                (Err(_), Err(e)) => {
                    warn!("best-effort cpuset cleanup of job {job_id} failed: {e}");
                }
                (Err(_), Ok(())) => {}
            }
        }

        reassign?;
        Ok(())
    }

    /// Applies the CPU binding (or the memory-only cpuset) and returns the
    /// effective mask when one was applied.
    fn apply_cpu_binding(
        &self,
        step: &StepRecord,
        task: &TaskRecord,
        task_path: Option<&std::path::Path>,
    ) -> crate::Result<Option<CpuMask>> {
        let Some(policy) = self.config.effective_policy(step.cpu_bind) else {
            if step.mem_bind {
                if let Some(path) = task_path {
                    // Cpuset established just for the memory binding, around
                    // whatever the task's affinity currently is.
                    let current = affinity::current_affinity(task.pid, self.config.ncpus)?;
                    self.store.create_task_cpuset(path, step.uid, step.gid)?;
                    self.store.write_cpus(path, &current)?;
                    self.store.attach_pid(path, task.pid)?;
                }
            }
            return Ok(None);
        };

        let mut requested =
            affinity::compute_binding(&task.assigned_cpus, policy, &self.topology);
        if requested.is_empty() {
            // An empty expansion would evict the task from every CPU; fall
            // back to its current mask.
            requested = affinity::current_affinity(task.pid, self.config.ncpus)
                .unwrap_or_else(|_| self.topology.full_mask());
        }

        let route = match task_path {
            Some(path) => CpuBindRoute::Cpuset {
                store: &self.store,
                path,
                uid: step.uid,
                gid: step.gid,
            },
            None => CpuBindRoute::Sched,
        };
        let effective =
            affinity::apply_cpu_binding(task.pid, &requested, &route, self.config.ncpus)?;
        affinity::verify_binding(task.pid, &requested, &effective, self.config.verbose_bind);
        Ok(Some(effective))
    }

    /// Writes the memory-node binding through the cpuset and binds the
    /// allocation policy directly.
    #[cfg(feature = "numa")]
    fn apply_mem_binding(
        &self,
        task: &TaskRecord,
        task_path: Option<&std::path::Path>,
    ) -> crate::Result<()> {
        let Some(nodes) = &task.mem_nodes else {
            return Ok(());
        };
        if let Some(path) = task_path {
            self.store.write_mems(path, nodes)?;
        }
        affinity::set_membind(nodes)?;
        Ok(())
    }

    /// The cpuset store, mainly for inspection by the launcher and tests.
    pub fn store(&self) -> &CpusetStore {
        &self.store
    }

    /// The balancing coordinator, mainly for inspection.
    pub fn drom(&self) -> &DromCoordinator<F> {
        &self.drom
    }

    /// Derives the job's base cpuset path.
    ///
    /// # Errors
    ///
    /// Returns `PathTooLong` if the derived path exceeds the platform
    /// limit.
    pub fn base_path(&self, job_id: u32) -> crate::Result<PathBuf> {
        Ok(self.store.base_path(job_id)?)
    }
}
