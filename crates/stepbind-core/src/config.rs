//! Node-level configuration for task binding.
//!
//! Mirrors what the launcher daemon hands this layer: where the cpuset
//! hierarchy lives, whether bindings go through cpusets or straight to the
//! scheduler, and an optional node-enforced binding granularity that
//! overrides whatever the step requested.

use std::path::PathBuf;

use tracing::info;

/// Binding granularity for a task's CPU affinity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindPolicy {
    /// Explicitly unrestricted: the task gets the full node mask.
    Unbound,
    /// Bind to the assigned hardware threads exactly.
    Thread,
    /// Expand the assignment to whole physical cores.
    Core,
    /// Expand the assignment to whole sockets.
    Socket,
    /// Expand the assignment to whole NUMA domains.
    NumaDomain,
}

impl BindPolicy {
    /// Human-readable name used in binding logs.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Unbound => "none",
            Self::Thread => "threads",
            Self::Core => "cores",
            Self::Socket => "sockets",
            Self::NumaDomain => "ldoms",
        }
    }
}

/// Node configuration consumed by the lifecycle hooks.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Root of the cpuset filesystem hierarchy managed by this node.
    pub cpuset_root: PathBuf,
    /// Node name, set when multiple node-local daemons share a host so
    /// their cpuset bases do not collide.
    pub node_name: Option<String>,
    /// Number of CPUs on the node.
    pub ncpus: usize,
    /// Route bindings through the cpuset hierarchy instead of calling the
    /// scheduler affinity primitive directly.
    pub use_cpusets: bool,
    /// Node-enforced binding granularity; overrides the step's request.
    pub bind_policy: Option<BindPolicy>,
    /// Log every binding verification, not just mismatches.
    pub verbose_bind: bool,
}

impl NodeConfig {
    /// Resolves the binding policy for a step: the node-enforced policy
    /// wins over the step's request; `None` means no binding was asked for
    /// at either level.
    #[must_use]
    pub fn effective_policy(&self, requested: Option<BindPolicy>) -> Option<BindPolicy> {
        if let Some(enforced) = self.bind_policy {
            if requested != Some(enforced) {
                info!("enforcing '{}' cpu bind method", enforced.name());
            }
            return Some(enforced);
        }
        requested
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(enforced: Option<BindPolicy>) -> NodeConfig {
        NodeConfig {
            cpuset_root: PathBuf::from("/dev/cpuset"),
            node_name: None,
            ncpus: 4,
            use_cpusets: true,
            bind_policy: enforced,
            verbose_bind: false,
        }
    }

    #[test]
    fn test_enforced_policy_wins() {
        let cfg = config(Some(BindPolicy::Core));
        assert_eq!(
            cfg.effective_policy(Some(BindPolicy::Thread)),
            Some(BindPolicy::Core)
        );
        assert_eq!(cfg.effective_policy(None), Some(BindPolicy::Core));
    }

    #[test]
    fn test_request_passes_through() {
        let cfg = config(None);
        assert_eq!(
            cfg.effective_policy(Some(BindPolicy::Socket)),
            Some(BindPolicy::Socket)
        );
        assert_eq!(cfg.effective_policy(None), None);
    }
}
