//! Network namespace handles and scoped execution.

use std::io;
use thiserror::Error;

/// Errors opening or entering a network namespace.
#[derive(Debug, Error)]
pub enum NetnsError {
    /// The path no longer exists; DEL treats this as already cleaned up.
    #[error("failed to Statfs {path:?}: {source}")]
    NotExist {
        path: String,
        #[source]
        source: io::Error,
    },

    /// The path exists but is not a namespace bind mount.
    #[error("unknown FS magic on {path:?}: {magic:x}")]
    NotNetns { path: String, magic: i64 },

    #[error("failed to {operation} {path:?}: {source}")]
    Os {
        operation: &'static str,
        path: String,
        #[source]
        source: io::Error,
    },
}

impl NetnsError {
    pub fn is_not_exist(&self) -> bool {
        matches!(self, Self::NotExist { .. })
    }
}

/// A handle on a network namespace.
pub trait Netns {
    /// The path the handle was opened from.
    fn path(&self) -> &str;

    /// Runs `f` with the calling thread switched into this namespace.
    ///
    /// The original namespace is restored before returning, on the error
    /// path as well as on success.
    fn run<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: From<NetnsError>;
}

#[cfg(target_os = "linux")]
mod linux {
    use super::{Netns, NetnsError};
    use nix::errno::Errno;
    use nix::sched::{setns, CloneFlags};
    use nix::sys::statfs::{statfs, NSFS_MAGIC, PROC_SUPER_MAGIC};
    use std::fs::File;
    use std::io;
    use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
    use tracing::{error, trace};

    const THREAD_NETNS: &str = "/proc/thread-self/ns/net";

    /// An open network namespace file descriptor.
    #[derive(Debug)]
    pub struct LinuxNetns {
        path: String,
        fd: OwnedFd,
    }

    impl LinuxNetns {
        /// Opens a namespace bind mount (or `/proc/<pid>/ns/net` link).
        pub fn open(path: &str) -> Result<Self, NetnsError> {
            let stat = statfs(path).map_err(|errno| match errno {
                Errno::ENOENT => NetnsError::NotExist {
                    path: path.to_string(),
                    source: io::Error::from(errno),
                },
                _ => NetnsError::Os {
                    operation: "Statfs",
                    path: path.to_string(),
                    source: io::Error::from(errno),
                },
            })?;

            let fs_type = stat.filesystem_type();
            if fs_type != NSFS_MAGIC && fs_type != PROC_SUPER_MAGIC {
                return Err(NetnsError::NotNetns {
                    path: path.to_string(),
                    magic: fs_type.0 as i64,
                });
            }

            let fd = File::open(path).map_err(|source| NetnsError::Os {
                operation: "open",
                path: path.to_string(),
                source,
            })?;

            Ok(Self {
                path: path.to_string(),
                fd: fd.into(),
            })
        }

        /// Opens the calling thread's current namespace.
        pub fn current() -> Result<Self, NetnsError> {
            Self::open(THREAD_NETNS)
        }

        fn enter(&self) -> Result<(), NetnsError> {
            setns(self.fd.as_fd(), CloneFlags::CLONE_NEWNET).map_err(|errno| NetnsError::Os {
                operation: "setns",
                path: self.path.clone(),
                source: io::Error::from(errno),
            })
        }
    }

    impl AsRawFd for LinuxNetns {
        fn as_raw_fd(&self) -> RawFd {
            self.fd.as_raw_fd()
        }
    }

    /// Switches the thread back to `origin` when dropped during unwinding.
    struct Restore<'a> {
        origin: &'a LinuxNetns,
        armed: bool,
    }

    impl Restore<'_> {
        fn finish(mut self) -> Result<(), NetnsError> {
            self.armed = false;
            self.origin.enter()
        }
    }

    impl Drop for Restore<'_> {
        fn drop(&mut self) {
            if self.armed {
                if let Err(e) = self.origin.enter() {
                    error!(error = %e, "Failed to restore original network namespace");
                }
            }
        }
    }

    impl Netns for LinuxNetns {
        fn path(&self) -> &str {
            &self.path
        }

        fn run<T, E, F>(&self, f: F) -> Result<T, E>
        where
            F: FnOnce() -> Result<T, E>,
            E: From<NetnsError>,
        {
            let origin = LinuxNetns::current()?;
            self.enter()?;
            trace!(netns = %self.path, "Entered network namespace");

            let guard = Restore {
                origin: &origin,
                armed: true,
            };
            let out = f();
            guard.finish()?;

            trace!(netns = %self.path, "Restored network namespace");
            out
        }
    }
}

#[cfg(target_os = "linux")]
pub use linux::LinuxNetns;

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    #[test]
    fn test_open_missing_path_is_not_exist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone");
        let err = LinuxNetns::open(path.to_str().unwrap()).unwrap_err();
        assert!(err.is_not_exist(), "unexpected error: {err}");
        assert!(err.to_string().starts_with("failed to Statfs"));
    }

    #[test]
    fn test_open_regular_file_is_not_netns() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let err = LinuxNetns::open(file.path().to_str().unwrap()).unwrap_err();
        assert!(matches!(err, NetnsError::NotNetns { .. }), "unexpected error: {err}");
    }
}
