//! # CPU/NUMA Masks and Node Topology
//!
//! Pure data types over CPU and NUMA-node index sets, plus detection of the
//! node's CPU topology (core, socket and NUMA-node membership per CPU).
//!
//! Detection uses sysfs on Linux and falls back to a flat single-socket
//! topology elsewhere, so every consumer can assume a usable topology.

mod detect;
mod mask;

pub use detect::Topology;
pub use mask::CpuMask;

#[cfg(feature = "numa")]
pub use mask::MemNodeSet;
