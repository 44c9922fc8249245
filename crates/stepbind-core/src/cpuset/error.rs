//! Error types for cpuset hierarchy operations.

use std::path::PathBuf;

/// Errors that can occur while managing the cpuset hierarchy.
#[derive(Debug, thiserror::Error)]
pub enum CpusetError {
    /// A derived cpuset path exceeds the platform path limit
    #[error("cpuset path too long: {path}")]
    PathTooLong {
        /// The over-long path
        path: PathBuf,
    },

    /// Creating or chowning a cpuset directory failed
    #[error("failed to create cpuset {path}: {source}")]
    CreateFailed {
        /// The cpuset directory
        path: PathBuf,
        /// Underlying OS error
        source: std::io::Error,
    },

    /// Writing a cpuset control file failed
    #[error("failed to write cpuset file {path}: {source}")]
    WriteFailed {
        /// The control file
        path: PathBuf,
        /// Underlying OS error
        source: std::io::Error,
    },

    /// Reading a cpuset control file failed
    #[error("failed to read cpuset file {path}: {source}")]
    ReadFailed {
        /// The control file
        path: PathBuf,
        /// Underlying OS error
        source: std::io::Error,
    },

    /// Removing a cpuset directory failed
    #[error("failed to remove cpuset {path}: {source}")]
    RemoveFailed {
        /// The cpuset directory
        path: PathBuf,
        /// Underlying OS error
        source: std::io::Error,
    },
}
