//! # Step Dependency Gate
//!
//! Blocks a task's launch until every job step it depends on is observed
//! running on this node.
//!
//! This is a busy-wait coordination primitive, not push-based notification:
//! independently launched step daemons share no wakeup channel, so the gate
//! re-enumerates the locally known steps each cycle, polls the pending ones
//! over their point-to-point connections, and sleeps a short fixed interval
//! in between. Steps that launch late join classification on a later cycle.
//!
//! The gate imposes no timeout of its own - it trusts that dependency steps
//! eventually launch. Callers needing a deadline wrap [`DependencyGate::wait`]
//! themselves; external termination is honored through the cancel flag,
//! checked every cycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use fxhash::FxHashSet;
use tracing::debug;

/// Interval slept between poll cycles.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Identity of a job step on this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobStepId {
    /// The owning job
    pub job_id: u32,
    /// The step within the job; `None` is the batch (whole-allocation)
    /// step, which is never a dependency target.
    pub step_id: Option<u32>,
}

impl JobStepId {
    /// Returns true for the batch step.
    #[must_use]
    pub fn is_batch(&self) -> bool {
        self.step_id.is_none()
    }
}

impl std::fmt::Display for JobStepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.step_id {
            Some(step) => write!(f, "{}.{}", self.job_id, step),
            None => write!(f, "{}.batch", self.job_id),
        }
    }
}

/// Run state reported by a step's local daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepState {
    /// Tasks are still being set up
    Starting,
    /// Tasks are running
    Running,
    /// Tasks are winding down
    Ending,
    /// No task is running
    NotRunning,
}

impl StepState {
    /// Running or winding down - safe to steal CPUs from.
    #[must_use]
    pub fn is_ready(self) -> bool {
        matches!(self, Self::Running | Self::Ending)
    }
}

/// Errors that can occur during a dependency wait.
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    /// Enumerating the locally known steps failed
    #[error("step discovery failed: {0}")]
    DiscoveryFailed(String),

    /// Connecting to a step's daemon for a state poll failed. Never
    /// downgraded to "ready": that would risk stealing CPUs from a step
    /// that is still using them.
    #[error("cannot communicate with step {step}: {message}")]
    ConnectFailed {
        /// The step whose daemon was unreachable
        step: JobStepId,
        /// Connection error text
        message: String,
    },

    /// The wait was cancelled externally
    #[error("dependency wait cancelled")]
    Cancelled,
}

/// Enumerates the job steps currently known on this node.
///
/// Connection details for each step stay inside the implementation; the
/// gate only needs identities here and hands them back to the
/// [`StepStateQuery`] for polling.
pub trait StepDirectory {
    /// Lists the locally known steps.
    ///
    /// # Errors
    ///
    /// Returns `DiscoveryFailed` if the enumeration source is unavailable.
    fn list_steps(&self) -> Result<Vec<JobStepId>, GateError>;
}

/// Queries one step's run state over its point-to-point connection.
pub trait StepStateQuery {
    /// Returns the step's current run state.
    ///
    /// # Errors
    ///
    /// Returns `ConnectFailed` if the step's daemon is unreachable.
    fn query_state(&self, step: JobStepId) -> Result<StepState, GateError>;
}

/// Counters from a completed wait, for the caller's logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GateStats {
    /// Discover/classify/poll cycles run
    pub cycles: u64,
    /// State queries issued
    pub polls: u64,
}

/// Polling gate over the local step population.
#[derive(Debug)]
pub struct DependencyGate<D, Q> {
    directory: D,
    query: Q,
    poll_interval: Duration,
    cancel: Option<Arc<AtomicBool>>,
}

impl<D: StepDirectory, Q: StepStateQuery> DependencyGate<D, Q> {
    /// Creates a gate over the given collaborators.
    pub fn new(directory: D, query: Q) -> Self {
        Self {
            directory,
            query,
            poll_interval: DEFAULT_POLL_INTERVAL,
            cancel: None,
        }
    }

    /// Overrides the sleep between poll cycles.
    #[must_use]
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Installs a cancel flag checked at the start of every cycle, so an
    /// externally terminated task leaves the wait promptly.
    #[must_use]
    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Waits until, for every job id in `deps`, at least one local step of
    /// that job has been discovered and every discovered step of that job
    /// is running or winding down.
    ///
    /// `self_step` is the waiting task's own step; it and batch steps are
    /// never waited on. An empty `deps` returns immediately with zero
    /// polls.
    ///
    /// # Errors
    ///
    /// Returns `ConnectFailed`/`DiscoveryFailed` when a collaborator call
    /// fails, or `Cancelled` when the cancel flag is raised.
    pub fn wait(
        &self,
        self_step: JobStepId,
        deps: &FxHashSet<u32>,
    ) -> Result<GateStats, GateError> {
        let mut stats = GateStats::default();
        if deps.is_empty() {
            debug!("step {self_step} does not depend on other jobs");
            return Ok(stats);
        }

        // Steps already observed running-or-ending; never re-polled.
        let mut ready: FxHashSet<JobStepId> = FxHashSet::default();

        loop {
            if let Some(cancel) = &self.cancel {
                if cancel.load(Ordering::Acquire) {
                    return Err(GateError::Cancelled);
                }
            }

            let steps = self.directory.list_steps()?;
            stats.cycles += 1;

            let mut covered: FxHashSet<u32> = FxHashSet::default();
            let mut all_ready = true;

            for step in steps {
                // Batch steps, the waiting step itself and jobs outside the
                // dependency set are irrelevant.
                if step.is_batch() || step == self_step || !deps.contains(&step.job_id) {
                    debug!("skipping step {step}");
                    continue;
                }
                covered.insert(step.job_id);
                if ready.contains(&step) {
                    continue;
                }

                stats.polls += 1;
                let state = self.query.query_state(step)?;
                if state.is_ready() {
                    debug!("step {step} is running");
                    ready.insert(step);
                } else {
                    debug!("step {step} is still not running");
                    all_ready = false;
                }
            }

            if all_ready && deps.iter().all(|job| covered.contains(job)) {
                debug!(
                    "dependencies satisfied after {} cycles, {} polls",
                    stats.cycles, stats.polls
                );
                return Ok(stats);
            }

            thread::sleep(self.poll_interval);
        }
    }
}
