//! Thin, `Result`-returning wrappers over the raw syscalls the dispatcher
//! needs, each tagging its failure with the syscall name as context.
//!
//! Grounded in `original_source/pafs/syscalls.h`/`syscalls.cc`. Everything
//! here is descriptor-relative (the `*at` family) so the dispatcher never
//! has to re-resolve a path from the mount root -- the whole point being
//! immunity to symlink/rename races on the source tree (spec section 1).

use std::ffi::CStr;
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::Path;

use crate::error::Error;
use crate::error::Result;
use crate::owned::OwnedDir;
use crate::owned::OwnedFd;

fn path_to_cstring(path: &Path) -> CString {
    CString::new(path.as_os_str().as_bytes()).expect("path must not contain a NUL byte")
}

fn check(ret: libc::c_int, context: &str) -> Result<()> {
    if ret == -1 {
        Err(Error::last_os_error(context))
    } else {
        Ok(())
    }
}

/// `/proc/self/fd/<fd>`, used everywhere a path-only or `O_PATH` descriptor
/// needs to be fed to a syscall that only accepts paths (xattrs, access,
/// reopening for read/write).
pub fn proc_self_fd(fd: RawFd) -> CString {
    CString::new(format!("/proc/self/fd/{fd}")).expect("no interior NUL")
}

pub fn open(path: &CStr, flags: libc::c_int, mode: libc::mode_t) -> Result<OwnedFd> {
    let fd = unsafe { libc::open(path.as_ptr(), flags, mode as libc::c_uint) };
    if fd < 0 {
        return Err(Error::last_os_error("open"));
    }
    Ok(OwnedFd::from_raw(fd))
}

pub fn openat(dirfd: RawFd, path: &Path, flags: libc::c_int, mode: libc::mode_t) -> Result<OwnedFd> {
    let cpath = path_to_cstring(path);
    let fd = unsafe { libc::openat(dirfd, cpath.as_ptr(), flags, mode as libc::c_uint) };
    if fd < 0 {
        return Err(Error::last_os_error("openat"));
    }
    Ok(OwnedFd::from_raw(fd))
}

/// `fstatat(fd, "", AT_EMPTY_PATH | AT_SYMLINK_NOFOLLOW)` -- stats the
/// descriptor itself, following no further symlinks.
pub fn fstatat_fd(fd: RawFd) -> Result<libc::stat> {
    let empty = CString::new("").unwrap();
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    let ret = unsafe {
        libc::fstatat(
            fd,
            empty.as_ptr(),
            &mut st,
            libc::AT_EMPTY_PATH | libc::AT_SYMLINK_NOFOLLOW,
        )
    };
    check(ret, "fstatat")?;
    Ok(st)
}

pub fn ioctl_getversion(fd: RawFd, version: &mut libc::c_int) -> Result<()> {
    const FS_IOC_GETVERSION: libc::c_ulong = 0x8004_7601;
    let ret = unsafe { libc::ioctl(fd, FS_IOC_GETVERSION, version as *mut libc::c_int) };
    check(ret, "ioctl(FS_IOC_GETVERSION)")
}

pub fn fdopendir(fd: OwnedFd) -> Result<OwnedDir> {
    let raw = fd.into_raw();
    let dir = unsafe { libc::fdopendir(raw) };
    if dir.is_null() {
        let err = Error::last_os_error("fdopendir");
        unsafe { libc::close(raw) };
        return Err(err);
    }
    Ok(OwnedDir::from_raw(dir))
}

pub fn readdir(dir: &OwnedDir) -> Result<Option<libc::dirent64>> {
    unsafe { *libc::__errno_location() = 0 };
    let entry = unsafe { libc::readdir64(dir.as_raw() as *mut libc::DIR) };
    if entry.is_null() {
        let errno = unsafe { *libc::__errno_location() };
        if errno != 0 {
            return Err(Error::from_errno(errno, "readdir"));
        }
        return Ok(None);
    }
    Ok(Some(unsafe { *entry }))
}

pub fn telldir(dir: &OwnedDir) -> i64 {
    unsafe { libc::telldir(dir.as_raw()) as i64 }
}

pub fn seekdir(dir: &OwnedDir, loc: i64) {
    unsafe { libc::seekdir(dir.as_raw(), loc as libc::c_long) };
}

pub fn dirfd(dir: &OwnedDir) -> Result<RawFd> {
    let fd = unsafe { libc::dirfd(dir.as_raw()) };
    if fd < 0 {
        return Err(Error::last_os_error("dirfd"));
    }
    Ok(fd)
}

pub fn fchmod(fd: RawFd, mode: libc::mode_t) -> Result<()> {
    check(unsafe { libc::fchmod(fd, mode) }, "fchmod")
}

pub fn fchownat(fd: RawFd, uid: libc::uid_t, gid: libc::gid_t) -> Result<()> {
    let empty = CString::new("").unwrap();
    let ret = unsafe {
        libc::fchownat(
            fd,
            empty.as_ptr(),
            uid,
            gid,
            libc::AT_EMPTY_PATH | libc::AT_SYMLINK_NOFOLLOW,
        )
    };
    check(ret, "fchownat")
}

pub fn ftruncate(fd: RawFd, length: libc::off_t) -> Result<()> {
    check(unsafe { libc::ftruncate(fd, length) }, "ftruncate")
}

pub fn futimens(fd: RawFd, times: &[libc::timespec; 2]) -> Result<()> {
    check(unsafe { libc::futimens(fd, times.as_ptr()) }, "futimens")
}

pub fn readlinkat(dirfd: RawFd, path: &Path, buf: &mut [u8]) -> Result<usize> {
    let cpath = path_to_cstring(path);
    let n = unsafe {
        libc::readlinkat(
            dirfd,
            cpath.as_ptr(),
            buf.as_mut_ptr() as *mut libc::c_char,
            buf.len(),
        )
    };
    if n < 0 {
        return Err(Error::last_os_error("readlinkat"));
    }
    Ok(n as usize)
}

pub fn mknodat(dirfd: RawFd, path: &Path, mode: libc::mode_t, dev: libc::dev_t) -> Result<()> {
    let cpath = path_to_cstring(path);
    check(
        unsafe { libc::mknodat(dirfd, cpath.as_ptr(), mode, dev) },
        "mknodat",
    )
}

pub fn mkdirat(dirfd: RawFd, path: &Path, mode: libc::mode_t) -> Result<()> {
    let cpath = path_to_cstring(path);
    check(unsafe { libc::mkdirat(dirfd, cpath.as_ptr(), mode) }, "mkdirat")
}

pub fn unlinkat(dirfd: RawFd, path: &Path, flags: libc::c_int) -> Result<()> {
    let cpath = path_to_cstring(path);
    check(
        unsafe { libc::unlinkat(dirfd, cpath.as_ptr(), flags) },
        "unlinkat",
    )
}

pub fn symlinkat(target: &Path, newdirfd: RawFd, linkpath: &Path) -> Result<()> {
    let ctarget = path_to_cstring(target);
    let clink = path_to_cstring(linkpath);
    check(
        unsafe { libc::symlinkat(ctarget.as_ptr(), newdirfd, clink.as_ptr()) },
        "symlinkat",
    )
}

pub fn renameat2(
    olddirfd: RawFd,
    oldpath: &Path,
    newdirfd: RawFd,
    newpath: &Path,
    flags: libc::c_uint,
) -> Result<()> {
    let coldpath = path_to_cstring(oldpath);
    let cnewpath = path_to_cstring(newpath);
    let ret = unsafe {
        libc::syscall(
            libc::SYS_renameat2,
            olddirfd,
            coldpath.as_ptr(),
            newdirfd,
            cnewpath.as_ptr(),
            flags,
        )
    };
    if ret == -1 {
        return Err(Error::last_os_error("renameat2"));
    }
    Ok(())
}

pub fn linkat(
    olddirfd: RawFd,
    oldpath: &Path,
    newdirfd: RawFd,
    newpath: &Path,
    flags: libc::c_int,
) -> Result<()> {
    let coldpath = path_to_cstring(oldpath);
    let cnewpath = path_to_cstring(newpath);
    check(
        unsafe { libc::linkat(olddirfd, coldpath.as_ptr(), newdirfd, cnewpath.as_ptr(), flags) },
        "linkat",
    )
}

pub fn dup(fd: RawFd) -> Result<OwnedFd> {
    let new_fd = unsafe { libc::dup(fd) };
    if new_fd < 0 {
        return Err(Error::last_os_error("dup"));
    }
    Ok(OwnedFd::from_raw(new_fd))
}

pub fn fsync(fd: RawFd) -> Result<()> {
    check(unsafe { libc::fsync(fd) }, "fsync")
}

pub fn fdatasync(fd: RawFd) -> Result<()> {
    check(unsafe { libc::fdatasync(fd) }, "fdatasync")
}

pub fn fstatvfs(fd: RawFd) -> Result<libc::statvfs> {
    let mut buf: libc::statvfs = unsafe { std::mem::zeroed() };
    check(unsafe { libc::fstatvfs(fd, &mut buf) }, "fstatvfs")?;
    Ok(buf)
}

pub fn setxattr(path: &CStr, name: &CStr, value: &[u8], flags: libc::c_int) -> Result<()> {
    let ret = unsafe {
        libc::setxattr(
            path.as_ptr(),
            name.as_ptr(),
            value.as_ptr() as *const libc::c_void,
            value.len(),
            flags,
        )
    };
    check(ret, "setxattr")
}

pub fn getxattr(path: &CStr, name: &CStr, buf: &mut [u8]) -> Result<usize> {
    let n = unsafe {
        libc::getxattr(
            path.as_ptr(),
            name.as_ptr(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
        )
    };
    if n < 0 {
        return Err(Error::last_os_error("getxattr"));
    }
    Ok(n as usize)
}

/// Queries the required buffer size by calling with a null/zero-length
/// buffer, per spec section 4.4's "size==0 reports only required size".
pub fn getxattr_size(path: &CStr, name: &CStr) -> Result<usize> {
    let n = unsafe { libc::getxattr(path.as_ptr(), name.as_ptr(), std::ptr::null_mut(), 0) };
    if n < 0 {
        return Err(Error::last_os_error("getxattr"));
    }
    Ok(n as usize)
}

pub fn listxattr(path: &CStr, buf: &mut [u8]) -> Result<usize> {
    let n = unsafe {
        libc::listxattr(
            path.as_ptr(),
            buf.as_mut_ptr() as *mut libc::c_char,
            buf.len(),
        )
    };
    if n < 0 {
        return Err(Error::last_os_error("listxattr"));
    }
    Ok(n as usize)
}

pub fn listxattr_size(path: &CStr) -> Result<usize> {
    let n = unsafe { libc::listxattr(path.as_ptr(), std::ptr::null_mut(), 0) };
    if n < 0 {
        return Err(Error::last_os_error("listxattr"));
    }
    Ok(n as usize)
}

pub fn removexattr(path: &CStr, name: &CStr) -> Result<()> {
    check(unsafe { libc::removexattr(path.as_ptr(), name.as_ptr()) }, "removexattr")
}

pub fn access(path: &CStr, mode: libc::c_int) -> Result<()> {
    check(unsafe { libc::access(path.as_ptr(), mode) }, "access")
}

pub fn flock(fd: RawFd, operation: libc::c_int) -> Result<()> {
    check(unsafe { libc::flock(fd, operation) }, "flock")
}

pub fn fallocate(fd: RawFd, mode: libc::c_int, offset: libc::off_t, len: libc::off_t) -> Result<()> {
    check(unsafe { libc::fallocate(fd, mode, offset, len) }, "fallocate")
}

pub fn copy_file_range(
    fd_in: RawFd,
    off_in: Option<&mut libc::off_t>,
    fd_out: RawFd,
    off_out: Option<&mut libc::off_t>,
    len: usize,
    flags: libc::c_uint,
) -> Result<usize> {
    let off_in_ptr = off_in.map_or(std::ptr::null_mut(), |r| r as *mut _);
    let off_out_ptr = off_out.map_or(std::ptr::null_mut(), |r| r as *mut _);
    let n = unsafe {
        libc::syscall(
            libc::SYS_copy_file_range,
            fd_in,
            off_in_ptr,
            fd_out,
            off_out_ptr,
            len,
            flags,
        )
    };
    if n < 0 {
        return Err(Error::last_os_error("copy_file_range"));
    }
    Ok(n as usize)
}

pub fn lseek(fd: RawFd, offset: libc::off_t, whence: libc::c_int) -> Result<libc::off_t> {
    let off = unsafe { libc::lseek(fd, offset, whence) };
    if off < 0 {
        return Err(Error::last_os_error("lseek"));
    }
    Ok(off)
}

pub fn poll(fds: &mut [libc::pollfd], timeout_ms: libc::c_int) -> Result<libc::c_int> {
    let n = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
    if n < 0 {
        return Err(Error::last_os_error("poll"));
    }
    Ok(n)
}

pub fn fcntl_getlk(fd: RawFd, lock: &mut libc::flock) -> Result<()> {
    check(unsafe { libc::fcntl(fd, libc::F_GETLK, lock as *mut libc::flock) }, "fcntl(F_GETLK)")
}

pub fn fcntl_setlk(fd: RawFd, lock: &libc::flock, wait: bool) -> Result<()> {
    let cmd = if wait { libc::F_SETLKW } else { libc::F_SETLK };
    check(unsafe { libc::fcntl(fd, cmd, lock as *const libc::flock) }, "fcntl(F_SETLK)")
}
