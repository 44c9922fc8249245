//! # Binding Computation and Application
//!
//! Derives a task's CPU binding from its assigned resource set and the
//! configured granularity, then applies it either through the cpuset
//! hierarchy or directly via the scheduler affinity primitive. The
//! resulting mask is always read back: a binding coarser than requested is
//! logged, never fatal, since the cpuset hierarchy may legitimately widen
//! it.
//!
//! Memory binding follows the same two-path policy (cpuset `mems` file vs
//! direct `set_mempolicy`, the latter behind the `numa` feature) and is
//! independent of CPU binding.

use std::path::Path;

use tracing::{debug, info};

use crate::config::BindPolicy;
use crate::cpuset::{CpusetError, CpusetStore};
use crate::topology::{CpuMask, Topology};

/// Errors that can occur while computing or applying a binding.
#[derive(Debug, thiserror::Error)]
pub enum AffinityError {
    /// The scheduler affinity primitive failed
    #[error("failed to bind pid {pid}: {message}")]
    BindFailed {
        /// Target process
        pid: i32,
        /// OS error text
        message: String,
    },

    /// Reading a process's affinity back failed
    #[error("failed to read affinity of pid {pid}: {message}")]
    ReadbackFailed {
        /// Target process
        pid: i32,
        /// OS error text
        message: String,
    },

    /// Binding memory nodes failed
    #[error("failed to bind memory nodes: {0}")]
    MemBindFailed(String),

    /// A cpuset operation underneath the binding failed
    #[error(transparent)]
    Cpuset(#[from] CpusetError),
}

/// How a CPU binding reaches the kernel.
#[derive(Debug)]
pub enum CpuBindRoute<'a> {
    /// Through a per-task cpuset: create it, write the mask, move the pid
    /// into it.
    Cpuset {
        /// The hierarchy store
        store: &'a CpusetStore,
        /// The per-task cpuset path
        path: &'a Path,
        /// Owner of the task cpuset
        uid: u32,
        /// Group of the task cpuset
        gid: u32,
    },
    /// Directly via the scheduler affinity primitive.
    Sched,
}

/// Expands a task's assigned CPU set to the configured binding granularity.
///
/// `Thread` keeps the assignment as-is; `Core`/`Socket`/`NumaDomain` widen
/// it to every CPU sharing a core, socket or NUMA node with an assigned
/// CPU; `Unbound` is a pass-through returning the full node mask.
#[must_use]
pub fn compute_binding(assigned: &CpuMask, policy: BindPolicy, topology: &Topology) -> CpuMask {
    match policy {
        BindPolicy::Unbound => topology.full_mask(),
        BindPolicy::Thread => assigned.clone(),
        BindPolicy::Core => expand(assigned, topology, Topology::same_core),
        BindPolicy::Socket => expand(assigned, topology, Topology::same_socket),
        BindPolicy::NumaDomain => expand(assigned, topology, Topology::same_node),
    }
}

fn expand(
    assigned: &CpuMask,
    topology: &Topology,
    related: fn(&Topology, usize, usize) -> bool,
) -> CpuMask {
    let mut out = CpuMask::new(topology.num_cpus());
    for cpu in 0..topology.num_cpus() {
        if assigned.iter().any(|a| related(topology, cpu, a)) {
            out.set(cpu);
        }
    }
    out
}

/// Applies `mask` to `pid` through the chosen route and reads the effective
/// mask back.
///
/// For the cpuset route the effective mask is what the cpuset grants (its
/// CPU file after the write); the scheduler view is compared when the pid
/// is reachable and any difference is logged. A readback differing from the
/// request is reported via [`verify_binding`] by the caller, not treated as
/// an error here.
///
/// # Errors
///
/// Returns an error if the cpuset operations or the scheduler primitive
/// fail.
pub fn apply_cpu_binding(
    pid: i32,
    mask: &CpuMask,
    route: &CpuBindRoute<'_>,
    ncpus: usize,
) -> Result<CpuMask, AffinityError> {
    match route {
        CpuBindRoute::Cpuset {
            store,
            path,
            uid,
            gid,
        } => {
            store.create_task_cpuset(path, *uid, *gid)?;
            store.write_cpus(path, mask)?;
            store.attach_pid(path, pid)?;
            let effective = store.read_cpus(path, ncpus)?;
            if let Ok(sched) = current_affinity(pid, ncpus) {
                if sched != effective {
                    debug!(
                        "pid {pid}: scheduler mask [{sched}] differs from cpuset [{effective}]"
                    );
                }
            }
            Ok(effective)
        }
        CpuBindRoute::Sched => {
            set_affinity(pid, mask)?;
            current_affinity(pid, ncpus)
        }
    }
}

/// Logs the outcome of a binding application. Mismatches mean the binding
/// came out coarser (or narrower) than requested; the task still runs.
pub fn verify_binding(pid: i32, requested: &CpuMask, effective: &CpuMask, verbose: bool) {
    if requested == effective {
        if verbose {
            info!("pid {pid} bound to [{effective}]");
        }
    } else {
        info!(
            "pid {pid} requested [{requested}] but is bound to [{effective}]"
        );
    }
}

/// Reads the scheduler affinity of `pid` (0 = the calling thread).
///
/// # Errors
///
/// Returns `ReadbackFailed` if the underlying syscall fails.
#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
pub fn current_affinity(pid: i32, capacity: usize) -> Result<CpuMask, AffinityError> {
    use std::mem;

    // SAFETY: the set is zero-initialized and sized by the libc type;
    // sched_getaffinity only writes within it.
    unsafe {
        let mut set: libc::cpu_set_t = mem::zeroed();
        let rc = libc::sched_getaffinity(pid, mem::size_of::<libc::cpu_set_t>(), &mut set);
        if rc != 0 {
            return Err(AffinityError::ReadbackFailed {
                pid,
                message: std::io::Error::last_os_error().to_string(),
            });
        }
        let mut mask = CpuMask::new(capacity);
        for cpu in 0..capacity.min(libc::CPU_SETSIZE as usize) {
            if libc::CPU_ISSET(cpu, &set) {
                mask.set(cpu);
            }
        }
        Ok(mask)
    }
}

/// Reads the scheduler affinity of `pid`. Non-Linux fallback: the full
/// mask, since there is nothing to read.
#[cfg(not(target_os = "linux"))]
pub fn current_affinity(_pid: i32, capacity: usize) -> Result<CpuMask, AffinityError> {
    Ok(CpuMask::full(capacity))
}

/// Sets the scheduler affinity of `pid` to `mask`.
///
/// # Errors
///
/// Returns `BindFailed` if the underlying syscall fails.
#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
pub fn set_affinity(pid: i32, mask: &CpuMask) -> Result<(), AffinityError> {
    use std::mem;

    // SAFETY: the set is built with CPU_ZERO/CPU_SET over in-range indices
    // and passed with its own size.
    unsafe {
        let mut set: libc::cpu_set_t = mem::zeroed();
        libc::CPU_ZERO(&mut set);
        for cpu in mask.iter() {
            if cpu < libc::CPU_SETSIZE as usize {
                libc::CPU_SET(cpu, &mut set);
            }
        }
        let rc = libc::sched_setaffinity(pid, mem::size_of::<libc::cpu_set_t>(), &set);
        if rc != 0 {
            return Err(AffinityError::BindFailed {
                pid,
                message: std::io::Error::last_os_error().to_string(),
            });
        }
    }
    Ok(())
}

/// Non-Linux fallback: no scheduler affinity primitive, no-op.
#[cfg(not(target_os = "linux"))]
pub fn set_affinity(_pid: i32, _mask: &CpuMask) -> Result<(), AffinityError> {
    Ok(())
}

/// Binds the calling process's memory allocations to `nodes` with
/// `MPOL_BIND`.
///
/// # Errors
///
/// Returns `MemBindFailed` if the syscall fails.
#[cfg(all(target_os = "linux", feature = "numa"))]
#[allow(unsafe_code)]
pub fn set_membind(nodes: &crate::topology::MemNodeSet) -> Result<(), AffinityError> {
    // MPOL_BIND = 2 - strictly bind to the specified nodes
    const MPOL_BIND: libc::c_long = 2;

    let words = nodes.words();
    let maxnode = (words.len() * 64 + 1) as libc::c_ulong;

    // SAFETY: set_mempolicy reads maxnode bits from the nodemask, which
    // stays alive for the duration of the call.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_set_mempolicy,
            MPOL_BIND,
            words.as_ptr(),
            maxnode,
        )
    };
    if rc != 0 {
        return Err(AffinityError::MemBindFailed(
            std::io::Error::last_os_error().to_string(),
        ));
    }
    Ok(())
}

/// Non-Linux fallback: direct memory binding is unavailable, no-op.
#[cfg(all(not(target_os = "linux"), feature = "numa"))]
pub fn set_membind(_nodes: &crate::topology::MemNodeSet) -> Result<(), AffinityError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assigned(list: &str, n: usize) -> CpuMask {
        CpuMask::from_cpulist(list, n)
    }

    // 8 CPUs, 2 sockets of 2 cores, 2-way SMT:
    // cpu:    0 1 2 3 4 5 6 7
    // core:   0 0 1 1 0 0 1 1
    // socket: 0 0 0 0 1 1 1 1
    // node:   0 0 0 0 1 1 1 1
    fn smt_topology() -> Topology {
        Topology::with_maps(
            8,
            vec![0, 0, 1, 1, 0, 0, 1, 1],
            vec![0, 0, 0, 0, 1, 1, 1, 1],
            vec![0, 0, 0, 0, 1, 1, 1, 1],
        )
    }

    #[test]
    fn test_thread_policy_is_identity() {
        let topo = smt_topology();
        let a = assigned("1,6", 8);
        assert_eq!(compute_binding(&a, BindPolicy::Thread, &topo), a);
    }

    #[test]
    fn test_core_policy_pulls_in_siblings() {
        let topo = smt_topology();
        let bound = compute_binding(&assigned("1", 8), BindPolicy::Core, &topo);
        assert_eq!(bound.to_cpulist(), "0-1");
    }

    #[test]
    fn test_socket_policy_expands_to_package() {
        let topo = smt_topology();
        let bound = compute_binding(&assigned("6", 8), BindPolicy::Socket, &topo);
        assert_eq!(bound.to_cpulist(), "4-7");
    }

    #[test]
    fn test_numa_policy_expands_to_domain() {
        let topo = smt_topology();
        let bound = compute_binding(&assigned("0,5", 8), BindPolicy::NumaDomain, &topo);
        assert_eq!(bound.to_cpulist(), "0-7");
    }

    #[test]
    fn test_unbound_policy_is_full_mask() {
        let topo = smt_topology();
        let bound = compute_binding(&assigned("1", 8), BindPolicy::Unbound, &topo);
        assert_eq!(bound, topo.full_mask());
    }

    #[test]
    fn test_core_policy_flat_topology() {
        // Flat topology: every CPU its own core, core expansion changes nothing.
        let topo = Topology::with_cpu_count(4);
        let a = assigned("1-2", 4);
        assert_eq!(compute_binding(&a, BindPolicy::Core, &topo), a);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_current_affinity_self() {
        let mask = current_affinity(0, num_cpus::get()).unwrap();
        assert!(!mask.is_empty());
    }

    #[test]
    fn test_cpuset_route_applies_and_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = CpusetStore::new(dir.path(), None);
        let (uid, gid) = own_ids();
        let base = store.base_path(3).unwrap();
        store.create_base(&base, uid, gid).unwrap();
        let task = store.task_path(&base, 3, 0, 0).unwrap();

        let mask = assigned("1-2", 4);
        let route = CpuBindRoute::Cpuset {
            store: &store,
            path: &task,
            uid,
            gid,
        };
        let effective = apply_cpu_binding(4242, &mask, &route, 4).unwrap();
        assert_eq!(effective, mask);
    }

    #[allow(unsafe_code)]
    fn own_ids() -> (u32, u32) {
        // SAFETY: getuid/getgid take no arguments and cannot fail.
        unsafe { (libc::getuid(), libc::getgid()) }
    }
}
