//! Cpuset path derivation, directory construction and teardown.

use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::topology::CpuMask;

use super::CpusetError;

/// Name prefix for every directory this store manages. Teardown only
/// touches entries carrying it.
const MANAGED_PREFIX: &str = "slurm";

/// Control files a cpuset directory may carry, for the plain-directory
/// removal fallback (see [`remove_cpuset_dir`]).
const CONTROL_FILES: &[&str] = &["cpus", "mems", "tasks", "cpuset.cpus", "cpuset.mems"];

#[cfg(unix)]
const MAX_PATH: usize = libc::PATH_MAX as usize;
#[cfg(not(unix))]
const MAX_PATH: usize = 4096;

/// Manages the on-disk cpuset hierarchy for jobs and tasks on this node.
#[derive(Debug, Clone)]
pub struct CpusetStore {
    root: PathBuf,
    node_name: Option<String>,
    /// Whether control files at the root are `cpuset.*`-prefixed (cgroup
    /// mounts) or bare (`cpus`, legacy mounts and plain directories).
    prefixed: bool,
}

impl CpusetStore {
    /// Creates a store rooted at `root`. `node_name` is set when multiple
    /// node-local daemons share a host, to keep their bases apart.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, node_name: Option<String>) -> Self {
        let root = root.into();
        let prefixed = root.join("cpuset.cpus").exists();
        Self {
            root,
            node_name,
            prefixed,
        }
    }

    /// Derives the per-job base cpuset path,
    /// `<root>/slurm[_<node>]_<job_id>`.
    ///
    /// # Errors
    ///
    /// Returns `PathTooLong` if the derived path exceeds the platform limit.
    pub fn base_path(&self, job_id: u32) -> Result<PathBuf, CpusetError> {
        let name = match &self.node_name {
            Some(node) => format!("{MANAGED_PREFIX}_{node}_{job_id}"),
            None => format!("{MANAGED_PREFIX}{job_id}"),
        };
        self.checked_join(&self.root, &name)
    }

    /// Derives the per-task cpuset path under `base`,
    /// `base/slurm<job_id>.<step_id>_<local_task>`.
    ///
    /// # Errors
    ///
    /// Returns `PathTooLong` if the derived path exceeds the platform limit.
    pub fn task_path(
        &self,
        base: &Path,
        job_id: u32,
        step_id: u32,
        local_task: u32,
    ) -> Result<PathBuf, CpusetError> {
        let name = format!("{MANAGED_PREFIX}{job_id}.{step_id}_{local_task}");
        self.checked_join(base, &name)
    }

    fn checked_join(&self, parent: &Path, name: &str) -> Result<PathBuf, CpusetError> {
        let path = parent.join(name);
        if path.as_os_str().len() >= MAX_PATH {
            return Err(CpusetError::PathTooLong { path });
        }
        Ok(path)
    }

    /// Creates the per-job base cpuset and hands it to `uid`/`gid`.
    ///
    /// Concurrent tasks race to create the base; "already exists" is
    /// success and both callers observe the same directory.
    ///
    /// # Errors
    ///
    /// Returns `CreateFailed` on any other OS error.
    pub fn create_base(&self, path: &Path, uid: u32, gid: u32) -> Result<(), CpusetError> {
        self.build_cpuset(path, uid, gid)
    }

    /// Creates a per-task cpuset under an existing base.
    ///
    /// # Errors
    ///
    /// Returns `CreateFailed` on any OS error other than "already exists".
    pub fn create_task_cpuset(&self, path: &Path, uid: u32, gid: u32) -> Result<(), CpusetError> {
        self.build_cpuset(path, uid, gid)
    }

    /// mkdir + chown + seed: a fresh kernel cpuset has empty `cpus`/`mems`
    /// and cannot hold tasks until both are populated, so they are copied
    /// from the parent cpuset.
    fn build_cpuset(&self, path: &Path, uid: u32, gid: u32) -> Result<(), CpusetError> {
        match fs::create_dir(path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                debug!("cpuset {} already exists", path.display());
            }
            Err(source) => {
                return Err(CpusetError::CreateFailed {
                    path: path.to_path_buf(),
                    source,
                })
            }
        }

        chown(path, uid, gid).map_err(|source| CpusetError::CreateFailed {
            path: path.to_path_buf(),
            source,
        })?;

        if let Some(parent) = path.parent() {
            self.seed_from_parent(parent, path, self.cpus_file())?;
            self.seed_from_parent(parent, path, self.mems_file())?;
        }
        Ok(())
    }

    /// Copies a control file from the parent cpuset if the parent carries
    /// one (plain directories used in tests carry none).
    fn seed_from_parent(
        &self,
        parent: &Path,
        path: &Path,
        file: &str,
    ) -> Result<(), CpusetError> {
        let src = parent.join(file);
        if !src.is_file() {
            return Ok(());
        }
        let value = fs::read_to_string(&src).map_err(|source| CpusetError::ReadFailed {
            path: src,
            source,
        })?;
        let dst = path.join(file);
        fs::write(&dst, value.trim()).map_err(|source| CpusetError::WriteFailed {
            path: dst,
            source,
        })
    }

    /// Writes the CPU mask into the cpuset's CPU-assignment control file.
    ///
    /// # Errors
    ///
    /// Returns `WriteFailed` on OS error.
    pub fn write_cpus(&self, path: &Path, mask: &CpuMask) -> Result<(), CpusetError> {
        let file = path.join(self.cpus_file());
        fs::write(&file, mask.to_cpulist()).map_err(|source| CpusetError::WriteFailed {
            path: file,
            source,
        })
    }

    /// Reads the cpuset's CPU-assignment control file back as a mask.
    ///
    /// # Errors
    ///
    /// Returns `ReadFailed` on OS error.
    pub fn read_cpus(&self, path: &Path, capacity: usize) -> Result<CpuMask, CpusetError> {
        let file = path.join(self.cpus_file());
        let text = fs::read_to_string(&file).map_err(|source| CpusetError::ReadFailed {
            path: file,
            source,
        })?;
        Ok(CpuMask::from_cpulist(text.trim(), capacity))
    }

    /// Writes the memory-node set into the cpuset's `mems` control file.
    ///
    /// # Errors
    ///
    /// Returns `WriteFailed` on OS error.
    #[cfg(feature = "numa")]
    pub fn write_mems(
        &self,
        path: &Path,
        nodes: &crate::topology::MemNodeSet,
    ) -> Result<(), CpusetError> {
        let file = path.join(self.mems_file());
        fs::write(&file, nodes.to_nodelist()).map_err(|source| CpusetError::WriteFailed {
            path: file,
            source,
        })
    }

    /// Moves `pid` into the cpuset by appending it to the `tasks` file.
    ///
    /// # Errors
    ///
    /// Returns `WriteFailed` on OS error.
    pub fn attach_pid(&self, path: &Path, pid: i32) -> Result<(), CpusetError> {
        let file = path.join("tasks");
        let write = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&file)
            .and_then(|mut f| writeln!(f, "{pid}"));
        write.map_err(|source| CpusetError::WriteFailed { path: file, source })
    }

    /// Removes a single task cpuset. Already gone is success; the
    /// release agent may have beaten us to it.
    ///
    /// # Errors
    ///
    /// Returns `RemoveFailed` on any other OS error.
    pub fn remove_task_cpuset(&self, path: &Path) -> Result<(), CpusetError> {
        match remove_cpuset_dir(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(CpusetError::RemoveFailed {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Recursively removes a job's base cpuset. Idempotent.
    ///
    /// Tries a direct rmdir first (succeeds once the kernel has released
    /// all children); on "not empty"/"busy" removes each managed-prefix
    /// child, then the base. "Already gone" anywhere is success.
    ///
    /// # Errors
    ///
    /// Returns `RemoveFailed` on any other OS error.
    pub fn remove_tree(&self, base: &Path) -> Result<(), CpusetError> {
        let not_empty = match remove_cpuset_dir(base) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e)
                if e.raw_os_error() == Some(libc::ENOTEMPTY)
                    || e.raw_os_error() == Some(libc::EBUSY) =>
            {
                e
            }
            Err(source) => {
                return Err(CpusetError::RemoveFailed {
                    path: base.to_path_buf(),
                    source,
                })
            }
        };
        debug!(
            "direct rmdir of {} failed ({not_empty}), removing children",
            base.display()
        );

        let entries = match fs::read_dir(base) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(source) => {
                return Err(CpusetError::RemoveFailed {
                    path: base.to_path_buf(),
                    source,
                })
            }
        };

        for entry in entries {
            let entry = entry.map_err(|source| CpusetError::RemoveFailed {
                path: base.to_path_buf(),
                source,
            })?;
            if !entry.file_name().to_string_lossy().starts_with(MANAGED_PREFIX) {
                continue;
            }
            let child = entry.path();
            if !child.is_dir() {
                continue;
            }
            match remove_cpuset_dir(&child) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => {
                    return Err(CpusetError::RemoveFailed {
                        path: child,
                        source,
                    })
                }
            }
        }

        match remove_cpuset_dir(base) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(CpusetError::RemoveFailed {
                path: base.to_path_buf(),
                source,
            }),
        }
    }

    fn cpus_file(&self) -> &'static str {
        if self.prefixed {
            "cpuset.cpus"
        } else {
            "cpus"
        }
    }

    #[cfg_attr(not(feature = "numa"), allow(dead_code))]
    fn mems_file(&self) -> &'static str {
        if self.prefixed {
            "cpuset.mems"
        } else {
            "mems"
        }
    }
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn chown(path: &Path, uid: u32, gid: u32) -> std::io::Result<()> {
    use std::os::unix::ffi::OsStrExt;

    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;
    // SAFETY: c_path is a valid NUL-terminated path for the duration of
    // the call; chown does not retain the pointer.
    let rc = unsafe { libc::chown(c_path.as_ptr(), uid, gid) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
fn chown(_path: &Path, _uid: u32, _gid: u32) -> std::io::Result<()> {
    Ok(())
}

/// Removes one cpuset directory.
///
/// A kernel cpuset's control files vanish with the directory, so rmdir is
/// enough there; plain directories (tests) still hold the control files as
/// regular files and need them unlinked first.
fn remove_cpuset_dir(path: &Path) -> std::io::Result<()> {
    match fs::remove_dir(path) {
        Err(e)
            if e.raw_os_error() == Some(libc::ENOTEMPTY)
                && CONTROL_FILES.iter().any(|f| path.join(f).is_file()) =>
        {
            for file in CONTROL_FILES {
                let control = path.join(file);
                if control.is_file() {
                    if let Err(e) = fs::remove_file(&control) {
                        warn!("could not unlink {}: {e}", control.display());
                    }
                }
            }
            fs::remove_dir(path)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[allow(unsafe_code)]
    fn own_ids() -> (u32, u32) {
        // SAFETY: getuid/getgid take no arguments and cannot fail.
        unsafe { (libc::getuid(), libc::getgid()) }
    }

    fn store(root: &Path) -> CpusetStore {
        CpusetStore::new(root, None)
    }

    #[test]
    fn test_base_path_derivation() {
        let s = CpusetStore::new("/dev/cpuset", None);
        assert_eq!(
            s.base_path(100).unwrap(),
            PathBuf::from("/dev/cpuset/slurm100")
        );

        let named = CpusetStore::new("/dev/cpuset", Some("node3".into()));
        assert_eq!(
            named.base_path(100).unwrap(),
            PathBuf::from("/dev/cpuset/slurm_node3_100")
        );
    }

    #[test]
    fn test_task_path_derivation() {
        let s = CpusetStore::new("/dev/cpuset", None);
        let base = s.base_path(100).unwrap();
        assert_eq!(
            s.task_path(&base, 100, 0, 2).unwrap(),
            PathBuf::from("/dev/cpuset/slurm100/slurm100.0_2")
        );
    }

    #[test]
    fn test_path_too_long() {
        let long_root = "/x".repeat(MAX_PATH / 2);
        let s = CpusetStore::new(long_root, None);
        assert!(matches!(
            s.base_path(1),
            Err(CpusetError::PathTooLong { .. })
        ));
    }

    #[test]
    fn test_create_base_twice() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        let (uid, gid) = own_ids();
        let base = s.base_path(7).unwrap();

        s.create_base(&base, uid, gid).unwrap();
        s.create_base(&base, uid, gid).unwrap();
        assert!(base.is_dir());
    }

    #[test]
    fn test_write_read_cpus_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        let (uid, gid) = own_ids();
        let base = s.base_path(7).unwrap();
        s.create_base(&base, uid, gid).unwrap();

        let mask = CpuMask::from_cpulist("1-2", 4);
        s.write_cpus(&base, &mask).unwrap();
        assert_eq!(s.read_cpus(&base, 4).unwrap(), mask);
    }

    #[test]
    fn test_seed_from_parent() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("cpus"), "0-3").unwrap();
        fs::write(dir.path().join("mems"), "0").unwrap();

        let s = store(dir.path());
        let (uid, gid) = own_ids();
        let base = s.base_path(9).unwrap();
        s.create_base(&base, uid, gid).unwrap();

        assert_eq!(fs::read_to_string(base.join("cpus")).unwrap(), "0-3");
        assert_eq!(fs::read_to_string(base.join("mems")).unwrap(), "0");
    }

    #[test]
    fn test_attach_pid_appends() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        let (uid, gid) = own_ids();
        let base = s.base_path(7).unwrap();
        s.create_base(&base, uid, gid).unwrap();

        s.attach_pid(&base, 100).unwrap();
        s.attach_pid(&base, 101).unwrap();
        let tasks = fs::read_to_string(base.join("tasks")).unwrap();
        assert_eq!(tasks, "100\n101\n");
    }

    #[test]
    fn test_remove_tree_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        let (uid, gid) = own_ids();
        let base = s.base_path(5).unwrap();
        s.create_base(&base, uid, gid).unwrap();
        let task = s.task_path(&base, 5, 0, 0).unwrap();
        s.create_task_cpuset(&task, uid, gid).unwrap();
        s.write_cpus(&task, &CpuMask::from_cpulist("0", 4)).unwrap();

        s.remove_tree(&base).unwrap();
        assert!(!base.exists());
        // Second call is a no-op success.
        s.remove_tree(&base).unwrap();
    }

    #[test]
    fn test_remove_tree_skips_foreign_entries() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        let (uid, gid) = own_ids();
        let base = s.base_path(5).unwrap();
        s.create_base(&base, uid, gid).unwrap();
        fs::create_dir(base.join("other")).unwrap();

        // The foreign child is left alone, so the base cannot go away.
        assert!(matches!(
            s.remove_tree(&base),
            Err(CpusetError::RemoveFailed { .. })
        ));
        assert!(base.join("other").is_dir());
    }

    #[test]
    fn test_remove_task_cpuset_already_gone() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        s.remove_task_cpuset(&dir.path().join("slurm1.0_0")).unwrap();
    }
}
