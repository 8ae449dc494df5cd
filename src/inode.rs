//! The inode record: a stable (device, inode-number) identity paired with
//! the path-only descriptor that keeps it pinned open.
//!
//! Grounded in `original_source/pafs/inode.h`/`inode.cc`.

use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::path::Path;

use parking_lot::Mutex;

use crate::error::Error;
use crate::error::Result;
use crate::owned::OwnedFd;
use crate::syscalls;

/// A single source-tree inode the server has vended a kernel handle for.
///
/// `dev`/`ino` are frozen at construction and never change. `fd` stays
/// valid for the record's entire lifetime. `generation` is computed lazily
/// on first request and then cached for the rest of the record's life --
/// it is not expected to change while we hold the descriptor open.
#[derive(Debug)]
pub struct Inode {
    fd: OwnedFd,
    ino: u64,
    dev: u64,
    generation: Mutex<Option<Result<i32>>>,
    poll_handle: Mutex<Option<fuser::PollHandle>>,
}

impl Inode {
    /// Opens `path` (relative to `parent_fd`, or absolute if `parent_fd` is
    /// `libc::AT_FDCWD`) as a path-only, symlink-non-following descriptor
    /// and freezes its (device, inode) identity.
    pub fn open(path: &Path, parent_fd: RawFd) -> Result<Self> {
        let fd = syscalls::openat(
            parent_fd,
            path,
            libc::O_PATH | libc::O_NOFOLLOW | libc::O_CLOEXEC,
            0,
        )?;
        let st = syscalls::fstatat_fd(fd.as_raw_fd())?;
        Ok(Self {
            fd,
            ino: st.st_ino,
            dev: st.st_dev,
            generation: Mutex::new(None),
            poll_handle: Mutex::new(None),
        })
    }

    /// Builds a record from an already-opened path-only descriptor and a
    /// (ino, dev) pair already known from a prior `fstatat` (used by
    /// `create`, which must stat the just-created file before it can open
    /// a second, path-only descriptor to intern).
    pub fn open_with_fd(fd: OwnedFd, ino: u64, dev: u64) -> Self {
        Self {
            fd,
            ino,
            dev,
            generation: Mutex::new(None),
            poll_handle: Mutex::new(None),
        }
    }

    pub fn stat(&self) -> Result<libc::stat> {
        syscalls::fstatat_fd(self.fd.as_raw_fd())
    }

    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn ino(&self) -> u64 {
        self.ino
    }

    pub fn dev(&self) -> u64 {
        self.dev
    }

    /// The filesystem generation number, via `ioctl(FS_IOC_GETVERSION)`
    /// against `/proc/self/fd/<n>`. Computed once and memoized.
    pub fn generation(&self) -> Result<i32> {
        let mut cached = self.generation.lock();
        if cached.is_none() {
            *cached = Some(get_generation(self.fd.as_raw_fd()));
        }
        cached.clone().expect("just populated above")
    }

    /// Registers a poll handle to notify on the next write, replacing
    /// (and dropping) any previously registered one.
    pub fn add_poll_handle(&self, handle: fuser::PollHandle) {
        *self.poll_handle.lock() = Some(handle);
    }

    pub fn notify_poll_event(&self, notifier: &fuser::Notifier) {
        if let Some(handle) = self.poll_handle.lock().as_ref() {
            if let Err(err) = notifier.poll(*handle) {
                log::error!("failed to notify poll handle: {err}");
            }
        }
    }
}

fn get_generation(fd: RawFd) -> Result<i32> {
    let path = CString::new(format!("/proc/self/fd/{fd}")).expect("no interior NUL");
    let myfd = syscalls::open(&path, libc::O_RDONLY | libc::O_CLOEXEC, 0)?;
    let mut version: libc::c_int = 0;
    syscalls::ioctl_getversion(myfd.as_raw_fd(), &mut version)?;
    Ok(version)
}

impl Error {
    /// Convenience used when a handler needs to report a cross-device
    /// attempt (spec section 4.4's failed-precondition guard).
    pub fn cross_device(context: &str) -> Self {
        Self::new(crate::error::ErrorKind::FailedPrecondition, context)
    }
}
