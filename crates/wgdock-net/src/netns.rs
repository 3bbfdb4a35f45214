//! Network namespace handles.
//!
//! A [`NetnsHandle`] wraps an open fd on a namespace file. Namespace
//! creation and every operation that must run *inside* a namespace happen
//! on a short-lived scoped thread that `setns(2)`s itself to the target;
//! the calling thread's namespace is never touched.

use std::fs::{self, File};
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::path::Path;

use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sched::{setns, unshare, CloneFlags};
use wgdock_common::{paths, WgdockError, WgdockResult};

/// Namespace file of the calling thread.
const THREAD_NS_PATH: &str = "/proc/thread-self/ns/net";

/// An open handle on a network namespace.
///
/// The namespace stays alive at least as long as the handle; an anonymous
/// namespace is released by the kernel when the last handle closes.
#[derive(Debug)]
pub struct NetnsHandle {
    file: File,
}

impl NetnsHandle {
    /// Handle on the calling thread's current namespace.
    pub fn current() -> WgdockResult<Self> {
        let file = File::open(THREAD_NS_PATH)?;
        Ok(Self { file })
    }

    /// Handle on the namespace of process `pid`.
    ///
    /// Opening pid 1 yields the true host namespace even when the plugin
    /// itself runs inside a container.
    pub fn from_pid(pid: u32) -> WgdockResult<Self> {
        let file = File::open(format!("/proc/{pid}/ns/net"))?;
        Ok(Self { file })
    }

    /// Create a new network namespace.
    ///
    /// With a `name`, the namespace is additionally bind-mounted under the
    /// standard namespace directory so tools like `ip netns` can see it;
    /// such a namespace must be removed with [`delete_named`] on teardown.
    pub fn create(name: Option<&str>) -> WgdockResult<Self> {
        let file = std::thread::scope(|scope| {
            let worker = scope.spawn(move || -> WgdockResult<File> {
                unshare(CloneFlags::CLONE_NEWNET).map_err(|e| WgdockError::NetlinkError {
                    op: "unshare(CLONE_NEWNET)".into(),
                    cause: e.to_string(),
                })?;
                if let Some(name) = name {
                    bind_mount_current(name)?;
                }
                Ok(File::open(THREAD_NS_PATH)?)
            });
            worker.join().map_err(|_| worker_panicked())?
        })?;

        tracing::debug!(fd = file.as_raw_fd(), name, "Created network namespace");
        Ok(Self { file })
    }

    /// Run `f` on a thread pinned inside this namespace.
    ///
    /// The worker thread enters the namespace, runs the closure, and exits.
    /// Child processes spawned by the closure inherit the namespace, which
    /// is how iptables invocations are scoped to the root namespace.
    pub fn run_in<T, F>(&self, f: F) -> WgdockResult<T>
    where
        T: Send,
        F: FnOnce() -> WgdockResult<T> + Send,
    {
        std::thread::scope(|scope| {
            let worker = scope.spawn(move || -> WgdockResult<T> {
                setns(self.file.as_fd(), CloneFlags::CLONE_NEWNET).map_err(|e| {
                    WgdockError::NetlinkError {
                        op: "setns".into(),
                        cause: e.to_string(),
                    }
                })?;
                f()
            });
            worker.join().map_err(|_| worker_panicked())?
        })
    }

    /// Raw fd of the namespace file, for netlink attributes.
    #[must_use]
    pub fn raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

/// Remove the bind mount of a named namespace.
///
/// The namespace itself is released once the last handle on it closes.
pub fn delete_named(name: &str) -> WgdockResult<()> {
    let target = paths::netns_path(name);
    umount2(&target, MntFlags::MNT_DETACH).map_err(|e| WgdockError::NetlinkError {
        op: format!("umount {}", target.display()),
        cause: e.to_string(),
    })?;
    fs::remove_file(&target)?;
    tracing::debug!(name, "Deleted named namespace");
    Ok(())
}

/// Bind-mount the calling thread's namespace under the standard directory.
///
/// Runs on the unshared worker thread, so "current" is the new namespace.
fn bind_mount_current(name: &str) -> WgdockResult<()> {
    fs::create_dir_all(&*paths::NETNS_DIR)?;
    let target = paths::netns_path(name);
    File::create(&target)?;

    let mounted = mount(
        Some(Path::new(THREAD_NS_PATH)),
        &target,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    );
    if let Err(e) = mounted {
        let _ = fs::remove_file(&target);
        return Err(WgdockError::NetlinkError {
            op: format!("bind mount {}", target.display()),
            cause: e.to_string(),
        });
    }
    Ok(())
}

fn worker_panicked() -> WgdockError {
    WgdockError::Internal {
        message: "namespace worker thread panicked".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_namespace_opens() {
        // Any process can open its own namespace file.
        let ns = NetnsHandle::current().unwrap();
        assert!(ns.raw_fd() >= 0);
    }

    #[test]
    fn run_in_returns_closure_result() {
        // setns needs CAP_SYS_ADMIN even for the namespace we are already in.
        if !nix::unistd::geteuid().is_root() {
            return;
        }
        let ns = NetnsHandle::current().unwrap();
        let out = ns.run_in(|| Ok(21 * 2)).unwrap();
        assert_eq!(out, 42);
    }
}
