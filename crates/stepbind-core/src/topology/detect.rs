//! Node topology detection: CPU count plus per-CPU core, socket and NUMA
//! node membership.
//!
//! On Linux this reads sysfs (`/sys/devices/system/cpu`,
//! `/sys/devices/system/node`); on other platforms, or when sysfs is not
//! readable, it falls back to a flat topology where every CPU is its own
//! core on a single socket and node. Detection never fails.

use super::mask::CpuMask;

/// Per-CPU topology of the node.
///
/// Used to expand a task's assigned CPU set to its binding granularity
/// (core, socket, NUMA domain).
#[derive(Debug, Clone)]
pub struct Topology {
    num_cpus: usize,
    /// Core id per CPU, unique only within a socket.
    core_of: Vec<usize>,
    /// Physical package id per CPU.
    socket_of: Vec<usize>,
    /// NUMA node per CPU.
    node_of: Vec<usize>,
}

impl Topology {
    /// Detects the node topology, falling back to a flat topology when
    /// sysfs is unavailable.
    #[must_use]
    pub fn detect() -> Self {
        #[cfg(target_os = "linux")]
        {
            if let Some(topo) = Self::detect_sysfs() {
                return topo;
            }
        }

        Self::with_cpu_count(num_cpus::get())
    }

    /// Builds a flat topology for `num_cpus` CPUs: one socket, one NUMA
    /// node, every CPU its own core.
    ///
    /// Used when the CPU count comes from an external source (the balancing
    /// facility reports its own view of the node) and in tests.
    #[must_use]
    pub fn with_cpu_count(num_cpus: usize) -> Self {
        Self {
            num_cpus,
            core_of: (0..num_cpus).collect(),
            socket_of: vec![0; num_cpus],
            node_of: vec![0; num_cpus],
        }
    }

    #[cfg(target_os = "linux")]
    fn detect_sysfs() -> Option<Self> {
        use std::fs;
        use std::path::Path;

        let online = fs::read_to_string("/sys/devices/system/cpu/online").ok()?;
        let cpus = super::mask::parse_cpulist(online.trim());
        let num_cpus = cpus.iter().max().map(|m| m + 1)?;

        let mut core_of = vec![0; num_cpus];
        let mut socket_of = vec![0; num_cpus];
        let mut node_of = vec![0; num_cpus];

        for cpu in &cpus {
            let topo_dir = format!("/sys/devices/system/cpu/cpu{cpu}/topology");
            core_of[*cpu] = read_id(&format!("{topo_dir}/core_id")).unwrap_or(*cpu);
            socket_of[*cpu] =
                read_id(&format!("{topo_dir}/physical_package_id")).unwrap_or(0);
        }

        let node_root = Path::new("/sys/devices/system/node");
        if let Ok(entries) = fs::read_dir(node_root) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                let Some(node_id) = name.strip_prefix("node").and_then(|n| n.parse().ok())
                else {
                    continue;
                };
                if let Ok(list) = fs::read_to_string(entry.path().join("cpulist")) {
                    for cpu in super::mask::parse_cpulist(list.trim()) {
                        if cpu < num_cpus {
                            node_of[cpu] = node_id;
                        }
                    }
                }
            }
        }

        Some(Self {
            num_cpus,
            core_of,
            socket_of,
            node_of,
        })
    }

    /// Returns the number of CPUs on the node.
    #[must_use]
    pub fn num_cpus(&self) -> usize {
        self.num_cpus
    }

    /// Returns the number of NUMA nodes.
    #[must_use]
    pub fn num_nodes(&self) -> usize {
        self.node_of.iter().max().map_or(1, |m| m + 1)
    }

    /// Returns a mask with every CPU on the node set.
    #[must_use]
    pub fn full_mask(&self) -> CpuMask {
        CpuMask::full(self.num_cpus)
    }

    /// Returns the NUMA node of `cpu` (0 for out-of-range CPUs).
    #[must_use]
    pub fn node_of(&self, cpu: usize) -> usize {
        self.node_of.get(cpu).copied().unwrap_or(0)
    }

    /// Returns true if `a` and `b` share a physical core.
    #[must_use]
    pub fn same_core(&self, a: usize, b: usize) -> bool {
        self.same_socket(a, b)
            && self.core_of.get(a).copied().unwrap_or(a) == self.core_of.get(b).copied().unwrap_or(b)
    }

    /// Returns true if `a` and `b` share a socket.
    #[must_use]
    pub fn same_socket(&self, a: usize, b: usize) -> bool {
        self.socket_of.get(a).copied().unwrap_or(0) == self.socket_of.get(b).copied().unwrap_or(0)
    }

    /// Returns true if `a` and `b` share a NUMA node.
    #[must_use]
    pub fn same_node(&self, a: usize, b: usize) -> bool {
        self.node_of(a) == self.node_of(b)
    }

    /// Overrides topology maps, for tests that need SMT or multi-socket
    /// shapes without the real hardware.
    #[cfg(test)]
    pub(crate) fn with_maps(
        num_cpus: usize,
        core_of: Vec<usize>,
        socket_of: Vec<usize>,
        node_of: Vec<usize>,
    ) -> Self {
        Self {
            num_cpus,
            core_of,
            socket_of,
            node_of,
        }
    }
}

#[cfg(target_os = "linux")]
fn read_id(path: &str) -> Option<usize> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect() {
        let topo = Topology::detect();
        assert!(topo.num_cpus() >= 1);
        assert!(topo.num_nodes() >= 1);
    }

    #[test]
    fn test_flat_topology() {
        let topo = Topology::with_cpu_count(4);
        assert_eq!(topo.num_cpus(), 4);
        assert_eq!(topo.num_nodes(), 1);
        assert!(topo.same_socket(0, 3));
        assert!(topo.same_node(0, 3));
        assert!(!topo.same_core(0, 1));
        assert!(topo.same_core(2, 2));
    }

    #[test]
    fn test_full_mask() {
        let topo = Topology::with_cpu_count(3);
        assert_eq!(topo.full_mask().to_cpulist(), "0-2");
    }
}
