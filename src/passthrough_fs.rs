//! The filesystem core: routes every FUSE callback to a source-directory
//! syscall via a descriptor-relative path, using [`InodeCache`] to resolve
//! kernel-vended handles back to live descriptors.
//!
//! Grounded end-to-end in `original_source/pafs/page_align_fs.h`/`.cc`.

use std::ffi::CString;
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use fuser::AccessFlags;
use fuser::CopyFileRangeFlags;
use fuser::Errno;
use fuser::FileAttr;
use fuser::FileHandle;
use fuser::FileType;
use fuser::Filesystem;
use fuser::FopenFlags;
use fuser::ForgetOne;
use fuser::Generation;
use fuser::INodeNo;
use fuser::KernelConfig;
use fuser::LockOwner;
use fuser::Notifier;
use fuser::OpenFlags;
use fuser::PollEvents;
use fuser::PollFlags;
use fuser::PollNotifier;
use fuser::RenameFlags;
use fuser::ReplyAttr;
use fuser::ReplyCreate;
use fuser::ReplyData;
use fuser::ReplyDirectory;
use fuser::ReplyDirectoryPlus;
use fuser::ReplyEmpty;
use fuser::ReplyEntry;
use fuser::ReplyLock;
use fuser::ReplyLseek;
use fuser::ReplyOpen;
use fuser::ReplyPoll;
use fuser::ReplyStatfs;
use fuser::ReplyWrite;
use fuser::ReplyXattr;
use fuser::Request;
use fuser::TimeOrNow;
use fuser::WriteFlags;
use log::error;
use log::info;
use log::warn;
use parking_lot::Mutex;

use crate::cache::CachedInode;
use crate::cache::InodeCache;
use crate::cache::Key;
use crate::config::Options;
use crate::error::Error;
use crate::error::ErrorKind;
use crate::error::Result;
use crate::inode::Inode;
use crate::owned::OwnedDir;
use crate::reply::fail_or_log;
use crate::reply::ok_or_log;
use crate::syscalls;

pub struct PassthroughFs {
    root: Arc<Inode>,
    cache: Arc<InodeCache>,
    opts: Options,
    // Shared with `main` via `notifier_handle` so the session's `Notifier`
    // (only obtainable *after* the filesystem has been moved into a
    // `Session`) can still be threaded back in.
    notifier: Arc<Mutex<Option<Notifier>>>,
}

impl PassthroughFs {
    pub fn new(source: &Path, opts: Options) -> Result<Self> {
        let root = Inode::open(source, libc::AT_FDCWD)?;
        let st = root.stat()?;
        if st.st_mode & libc::S_IFMT != libc::S_IFDIR {
            return Err(Error::new(
                ErrorKind::FailedPrecondition,
                format!("{} is not a directory", source.display()),
            ));
        }
        Ok(Self {
            root: Arc::new(root),
            cache: InodeCache::new(),
            opts,
            notifier: Arc::new(Mutex::new(None)),
        })
    }

    /// Lets `main` hand the server a [`Notifier`] once the session exists,
    /// so `Poll` registrations can actually be fired from `write`.
    pub fn notifier_handle(&self) -> Arc<Mutex<Option<Notifier>>> {
        Arc::clone(&self.notifier)
    }

    fn get_inode(&self, ino: INodeNo) -> Arc<Inode> {
        if ino == INodeNo::ROOT {
            return Arc::clone(&self.root);
        }
        let ptr = u64::from(ino) as *const Inode;
        // Safe because every non-root handle we hand out is the address of
        // an `Arc<Inode>` the cache still owns, and the kernel never
        // re-sends a handle after a matching `forget`.
        unsafe {
            Arc::increment_strong_count(ptr);
            Arc::from_raw(ptr)
        }
    }

    fn key_of(inode: &Inode) -> Key {
        (inode.dev(), inode.ino())
    }

    fn handle_of(cached: &CachedInode) -> u64 {
        Arc::as_ptr(&cached.arc()) as u64
    }

    fn find_or_create_child(&self, parent: &Inode, name: &OsStr) -> Result<CachedInode> {
        let inode = Inode::open(Path::new(name), parent.fd())?;
        Ok(self.cache.insert(inode))
    }

    fn entry_param(&self, cached: &CachedInode, with_generation: bool) -> Result<(libc::stat, u64)> {
        let st = cached.stat()?;
        let generation = if with_generation {
            cached.generation().unwrap_or(0) as u64
        } else {
            0
        };
        Ok((st, generation))
    }

    fn reply_with_lookup(&self, parent: &Inode, name: &OsStr, reply: ReplyEntry) {
        let cached = match self.find_or_create_child(parent, name) {
            Ok(c) => c,
            Err(err) => {
                error!("{err}");
                reply.error(Errno::from_i32(err.errno()));
                return;
            }
        };
        if cached.dev() != self.root.dev() {
            // Cross-device: do not retain the ref we just took.
            let err = Error::cross_device("lookup crosses a device boundary");
            reply.error(Errno::from_i32(err.errno()));
            return;
        }
        match self.entry_param(&cached, true) {
            Ok((st, generation)) => {
                let ino = INodeNo(Self::handle_of(&cached));
                // Ownership of the +1 ref transfers to the kernel now that
                // we're replying successfully; don't drop `cached` here.
                std::mem::forget(cached);
                reply.entry(
                    &self.opts.entry_timeout,
                    &stat_to_attr(ino, &st),
                    Generation(generation),
                );
            }
            Err(err) => {
                error!("{err}");
                reply.error(Errno::from_i32(err.errno()));
                // `cached` drops here, unwinding the ref we took.
            }
        }
    }

    fn reply_with_attrs(&self, ino: INodeNo, inode: &Inode, reply: ReplyAttr) {
        match inode.stat() {
            Ok(st) => reply.attr(&self.opts.attr_timeout, &stat_to_attr(ino, &st)),
            Err(err) => {
                error!("{err}");
                reply.error(Errno::from_i32(err.errno()));
            }
        }
    }

    fn proc_path(fd: RawFd) -> CString {
        syscalls::proc_self_fd(fd)
    }

    fn dirent_name(entry: &libc::dirent64) -> Vec<u8> {
        entry
            .d_name
            .iter()
            .take_while(|&&c| c != 0)
            .map(|&c| c as u8)
            .collect()
    }

    /// `fi.noflush = (flags & O_ACCMODE) == O_RDONLY; fi.parallel_direct_writes = 1;`
    fn open_reply_flags(open_flags: libc::c_int) -> FopenFlags {
        let mut fopen_flags = FopenFlags::FOPEN_PARALLEL_DIRECT_WRITES;
        if open_flags & libc::O_ACCMODE == libc::O_RDONLY {
            fopen_flags |= FopenFlags::FOPEN_NOFLUSH;
        }
        fopen_flags
    }

    /// Resolves `".."` the same way every other entry is resolved --
    /// `openat(parent_fd, "..", O_PATH|O_NOFOLLOW)` plus intern/find --
    /// except at the mounted root, where `openat` would escape the
    /// exposed source tree: there, `".."` loops back to the root itself
    /// without ever touching the host filesystem above it.
    ///
    /// Returns the ino to report plus the cache ref backing it, when one
    /// was taken (`None` for the root self-loop, which holds no new ref).
    fn resolve_dotdot(&self, ino: INodeNo, parent: &Inode) -> Result<(INodeNo, Option<CachedInode>)> {
        if ino == INodeNo::ROOT {
            return Ok((INodeNo::ROOT, None));
        }
        let cached = self.find_or_create_child(parent, OsStr::new(".."))?;
        if cached.dev() == self.root.dev() && cached.ino() == self.root.ino() {
            // Same identity as root; drop this ref and report the root's
            // own reserved handle instead of minting a second record for it.
            return Ok((INodeNo::ROOT, None));
        }
        let dotdot_ino = INodeNo(Self::handle_of(&cached));
        Ok((dotdot_ino, Some(cached)))
    }
}

fn dirent_type(d_type: u8) -> FileType {
    match d_type {
        libc::DT_DIR => FileType::Directory,
        libc::DT_REG => FileType::RegularFile,
        libc::DT_LNK => FileType::Symlink,
        libc::DT_FIFO => FileType::NamedPipe,
        libc::DT_SOCK => FileType::Socket,
        libc::DT_CHR => FileType::CharDevice,
        libc::DT_BLK => FileType::BlockDevice,
        _ => FileType::RegularFile,
    }
}

fn stat_to_attr(ino: INodeNo, st: &libc::stat) -> FileAttr {
    let kind = match st.st_mode & libc::S_IFMT {
        libc::S_IFDIR => FileType::Directory,
        libc::S_IFLNK => FileType::Symlink,
        libc::S_IFCHR => FileType::CharDevice,
        libc::S_IFBLK => FileType::BlockDevice,
        libc::S_IFIFO => FileType::NamedPipe,
        libc::S_IFSOCK => FileType::Socket,
        _ => FileType::RegularFile,
    };
    FileAttr {
        ino,
        size: st.st_size as u64,
        blocks: st.st_blocks as u64,
        atime: system_time(st.st_atime, st.st_atime_nsec),
        mtime: system_time(st.st_mtime, st.st_mtime_nsec),
        ctime: system_time(st.st_ctime, st.st_ctime_nsec),
        crtime: UNIX_EPOCH,
        kind,
        perm: (st.st_mode & 0o7777) as u16,
        nlink: st.st_nlink as u32,
        uid: st.st_uid,
        gid: st.st_gid,
        rdev: st.st_rdev as u32,
        blksize: st.st_blksize as u32,
        flags: 0,
    }
}

fn system_time(sec: i64, nsec: i64) -> SystemTime {
    if sec >= 0 {
        UNIX_EPOCH + Duration::new(sec as u64, nsec as u32)
    } else {
        UNIX_EPOCH - Duration::new((-sec) as u64, 0)
    }
}

fn time_or_now_to_timespec(t: Option<TimeOrNow>) -> libc::timespec {
    match t {
        None => libc::timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_OMIT,
        },
        Some(TimeOrNow::Now) => libc::timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_NOW,
        },
        Some(TimeOrNow::SpecificTime(t)) => {
            let dur = t.duration_since(UNIX_EPOCH).unwrap_or_default();
            libc::timespec {
                tv_sec: dur.as_secs() as libc::time_t,
                tv_nsec: dur.subsec_nanos() as i64,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_rejects_a_non_directory_source() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("not_a_dir");
        std::fs::write(&file, b"hi").unwrap();
        let err = PassthroughFs::new(&file, Options::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FailedPrecondition);
    }

    #[test]
    fn new_accepts_a_directory_source() {
        let dir = tempfile::tempdir().unwrap();
        assert!(PassthroughFs::new(dir.path(), Options::default()).is_ok());
    }

    #[test]
    fn dirent_type_maps_known_kinds() {
        assert_eq!(dirent_type(libc::DT_DIR), FileType::Directory);
        assert_eq!(dirent_type(libc::DT_REG), FileType::RegularFile);
        assert_eq!(dirent_type(libc::DT_LNK), FileType::Symlink);
    }

    #[test]
    fn dirent_type_falls_back_to_regular_file() {
        assert_eq!(dirent_type(libc::DT_UNKNOWN), FileType::RegularFile);
    }

    #[test]
    fn system_time_handles_pre_epoch_seconds() {
        let t = system_time(-5, 0);
        assert!(t < UNIX_EPOCH);
        assert_eq!(UNIX_EPOCH.duration_since(t).unwrap(), Duration::from_secs(5));
    }

    #[test]
    fn stat_to_attr_reads_s_ifmt_directory_bit() {
        let dir = tempfile::tempdir().unwrap();
        let inode = Inode::open(dir.path(), libc::AT_FDCWD).unwrap();
        let st = inode.stat().unwrap();
        let attr = stat_to_attr(INodeNo::ROOT, &st);
        assert_eq!(attr.kind, FileType::Directory);
        assert_eq!(attr.ino, INodeNo::ROOT);
    }

    #[test]
    fn time_or_now_to_timespec_omits_on_none() {
        let ts = time_or_now_to_timespec(None);
        assert_eq!(ts.tv_nsec, libc::UTIME_OMIT);
    }

    #[test]
    fn find_or_create_child_round_trips_through_cache() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("child"), b"hi").unwrap();
        let fs = PassthroughFs::new(dir.path(), Options::default()).unwrap();
        let cached = fs.find_or_create_child(&fs.root, OsStr::new("child")).unwrap();
        assert_eq!(cached.dev(), fs.root.dev());
        assert_ne!(PassthroughFs::handle_of(&cached), 0);
    }
}

impl Filesystem for PassthroughFs {
    fn init(&mut self, _req: &Request, config: &mut KernelConfig) -> std::io::Result<()> {
        info!("negotiated fuse connection: {config:?}");
        Ok(())
    }

    fn destroy(&mut self) {
        info!("unmounting");
    }

    fn lookup(&self, _req: &Request, parent: INodeNo, name: &OsStr, reply: ReplyEntry) {
        let parent_inode = self.get_inode(parent);
        self.reply_with_lookup(&parent_inode, name, reply);
    }

    fn forget(&self, _req: &Request, ino: INodeNo, nlookup: u64) {
        if ino == INodeNo::ROOT || nlookup == 0 {
            return;
        }
        let inode = self.get_inode(ino);
        let key = Self::key_of(&inode);
        drop(inode);
        if let Err(err) = self.cache.unref_by(key, nlookup) {
            error!("forget: {err}");
        }
    }

    fn batch_forget(&self, _req: &Request, nodes: &[ForgetOne]) {
        for node in nodes {
            self.forget(_req, node.nodeid(), node.nlookup());
        }
    }

    fn getattr(&self, _req: &Request, ino: INodeNo, _fh: Option<FileHandle>, reply: ReplyAttr) {
        let inode = self.get_inode(ino);
        self.reply_with_attrs(ino, &inode, reply);
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &self,
        _req: &Request,
        ino: INodeNo,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<FileHandle>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<fuser::BsdFileFlags>,
        reply: ReplyAttr,
    ) {
        let inode = self.get_inode(ino);
        let fd = fh.map(|h| u64::from(h) as RawFd).unwrap_or_else(|| inode.fd());

        let result = (|| -> Result<()> {
            if let Some(mode) = mode {
                syscalls::fchmod(fd, mode as libc::mode_t)?;
            }
            if uid.is_some() || gid.is_some() {
                syscalls::fchownat(
                    fd,
                    uid.unwrap_or(u32::MAX),
                    gid.unwrap_or(u32::MAX),
                )?;
            }
            if let Some(size) = size {
                syscalls::ftruncate(fd, size as libc::off_t)?;
            }
            if atime.is_some() || mtime.is_some() {
                let times = [
                    time_or_now_to_timespec(atime),
                    time_or_now_to_timespec(mtime),
                ];
                syscalls::futimens(fd, &times)?;
            }
            Ok(())
        })();

        match fail_or_log(reply, result) {
            Some(reply) => self.reply_with_attrs(ino, &inode, reply),
            None => {}
        }
    }

    fn readlink(&self, _req: &Request, ino: INodeNo, reply: ReplyData) {
        let inode = self.get_inode(ino);
        let proc_path = Self::proc_path(inode.fd());
        let mut buf = vec![0u8; libc::PATH_MAX as usize + 1];
        // readlinkat has no AT_EMPTY_PATH form, so go through /proc/self/fd
        // like every other path-requiring syscall in this module.
        match syscalls::readlinkat(libc::AT_FDCWD, Path::new(proc_path.to_str().unwrap_or_default()), &mut buf) {
            Ok(n) if n == buf.len() => {
                reply.error(Errno::from_i32(libc::ENAMETOOLONG));
            }
            Ok(n) => reply.data(&buf[..n]),
            Err(err) => reply.error(Errno::from_i32(err.errno())),
        }
    }

    fn mknod(
        &self,
        _req: &Request,
        parent: INodeNo,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let parent_inode = self.get_inode(parent);
        let result = syscalls::mknodat(parent_inode.fd(), Path::new(name), mode as libc::mode_t, rdev as libc::dev_t);
        match fail_or_log(reply, result) {
            Some(reply) => self.reply_with_lookup(&parent_inode, name, reply),
            None => {}
        }
    }

    fn mkdir(
        &self,
        _req: &Request,
        parent: INodeNo,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let parent_inode = self.get_inode(parent);
        let result = syscalls::mkdirat(parent_inode.fd(), Path::new(name), mode as libc::mode_t);
        match fail_or_log(reply, result) {
            Some(reply) => self.reply_with_lookup(&parent_inode, name, reply),
            None => {}
        }
    }

    fn unlink(&self, _req: &Request, parent: INodeNo, name: &OsStr, reply: ReplyEmpty) {
        let parent_inode = self.get_inode(parent);
        let result = syscalls::unlinkat(parent_inode.fd(), Path::new(name), 0);
        ok_or_log(reply, result);
    }

    fn rmdir(&self, _req: &Request, parent: INodeNo, name: &OsStr, reply: ReplyEmpty) {
        let parent_inode = self.get_inode(parent);
        let result = syscalls::unlinkat(parent_inode.fd(), Path::new(name), libc::AT_REMOVEDIR);
        ok_or_log(reply, result);
    }

    fn symlink(
        &self,
        _req: &Request,
        parent: INodeNo,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let parent_inode = self.get_inode(parent);
        let result = syscalls::symlinkat(target, parent_inode.fd(), Path::new(link_name));
        match fail_or_log(reply, result) {
            Some(reply) => self.reply_with_lookup(&parent_inode, link_name, reply),
            None => {}
        }
    }

    fn rename(
        &self,
        _req: &Request,
        parent: INodeNo,
        name: &OsStr,
        newparent: INodeNo,
        newname: &OsStr,
        flags: RenameFlags,
        reply: ReplyEmpty,
    ) {
        let old_parent = self.get_inode(parent);
        let new_parent = self.get_inode(newparent);
        let result = syscalls::renameat2(
            old_parent.fd(),
            Path::new(name),
            new_parent.fd(),
            Path::new(newname),
            flags.bits(),
        );
        ok_or_log(reply, result);
    }

    fn link(
        &self,
        _req: &Request,
        ino: INodeNo,
        newparent: INodeNo,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let inode = self.get_inode(ino);
        let new_parent = self.get_inode(newparent);
        let self_path = Self::proc_path(inode.fd());
        let result = syscalls::linkat(
            libc::AT_FDCWD,
            Path::new(self_path.to_str().unwrap_or_default()),
            new_parent.fd(),
            Path::new(newname),
            libc::AT_SYMLINK_FOLLOW,
        );
        match fail_or_log(reply, result) {
            Some(reply) => self.reply_with_lookup(&new_parent, newname, reply),
            None => {}
        }
    }

    fn open(&self, _req: &Request, ino: INodeNo, flags: OpenFlags, reply: ReplyOpen) {
        let inode = self.get_inode(ino);
        let self_path = Self::proc_path(inode.fd());
        let open_flags = (flags.0 & !libc::O_NOFOLLOW) | libc::O_CLOEXEC;
        match syscalls::open(&self_path, open_flags, 0) {
            Ok(fd) => {
                let raw = fd.into_raw();
                reply.opened(FileHandle(raw as u64), Self::open_reply_flags(open_flags));
            }
            Err(err) => reply.error(Errno::from_i32(err.errno())),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn read(
        &self,
        _req: &Request,
        _ino: INodeNo,
        fh: FileHandle,
        offset: u64,
        size: u32,
        _flags: OpenFlags,
        _lock_owner: Option<LockOwner>,
        reply: ReplyData,
    ) {
        let fd = u64::from(fh) as RawFd;
        let mut buf = vec![0u8; size as usize];
        let n = unsafe {
            libc::pread(
                fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                offset as libc::off_t,
            )
        };
        if n < 0 {
            reply.error(Errno::from_i32(
                Error::last_os_error("pread").errno(),
            ));
        } else {
            reply.data(&buf[..n as usize]);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &self,
        _req: &Request,
        ino: INodeNo,
        fh: FileHandle,
        offset: u64,
        data: &[u8],
        _write_flags: WriteFlags,
        _flags: OpenFlags,
        _lock_owner: Option<LockOwner>,
        reply: ReplyWrite,
    ) {
        let fd = u64::from(fh) as RawFd;
        let n = unsafe {
            libc::pwrite(
                fd,
                data.as_ptr() as *const libc::c_void,
                data.len(),
                offset as libc::off_t,
            )
        };
        if n < 0 {
            reply.error(Errno::from_i32(Error::last_os_error("pwrite").errno()));
            return;
        }
        reply.written(n as u32);

        let inode = self.get_inode(ino);
        if let Some(notifier) = self.notifier.lock().as_ref() {
            inode.notify_poll_event(notifier);
        }
    }

    fn flush(&self, _req: &Request, _ino: INodeNo, fh: FileHandle, _lock_owner: LockOwner, reply: ReplyEmpty) {
        let fd = u64::from(fh) as RawFd;
        // Dup then close the dup so close() errors propagate without
        // closing the real handle, which `release` still owns.
        let result = syscalls::dup(fd).and_then(|dup_fd| {
            let raw = dup_fd.into_raw();
            if unsafe { libc::close(raw) } == -1 {
                Err(Error::last_os_error("close"))
            } else {
                Ok(())
            }
        });
        ok_or_log(reply, result);
    }

    fn release(
        &self,
        _req: &Request,
        _ino: INodeNo,
        fh: FileHandle,
        _flags: OpenFlags,
        _lock_owner: Option<LockOwner>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let fd = u64::from(fh) as RawFd;
        if unsafe { libc::close(fd) } == -1 {
            warn!("failed to close fd {fd}: {}", std::io::Error::last_os_error());
        }
        reply.ok();
    }

    fn fsync(&self, _req: &Request, _ino: INodeNo, fh: FileHandle, datasync: bool, reply: ReplyEmpty) {
        let fd = u64::from(fh) as RawFd;
        let result = if datasync {
            syscalls::fdatasync(fd)
        } else {
            syscalls::fsync(fd)
        };
        ok_or_log(reply, result);
    }

    fn opendir(&self, _req: &Request, ino: INodeNo, _flags: OpenFlags, reply: ReplyOpen) {
        let inode = self.get_inode(ino);
        let result = (|| -> Result<u64> {
            let fd = syscalls::dup(inode.fd())?;
            let dir = syscalls::fdopendir(fd)?;
            Ok(Box::into_raw(Box::new(dir)) as u64)
        })();
        match result {
            Ok(handle) => reply.opened(FileHandle(handle), FopenFlags::empty()),
            Err(err) => reply.error(Errno::from_i32(err.errno())),
        }
    }

    fn readdir(&self, _req: &Request, ino: INodeNo, fh: FileHandle, offset: u64, mut reply: ReplyDirectory) {
        let dir_ptr = u64::from(fh) as *mut OwnedDir;
        let dir = unsafe { &*dir_ptr };
        let parent = self.get_inode(ino);
        syscalls::seekdir(dir, offset as i64);

        loop {
            let entry = match syscalls::readdir(dir) {
                Ok(Some(e)) => e,
                Ok(None) => break,
                Err(err) => {
                    reply.error(Errno::from_i32(err.errno()));
                    return;
                }
            };
            let name_bytes = Self::dirent_name(&entry);
            let name = OsStr::from_bytes(&name_bytes);
            let next_offset = syscalls::telldir(dir);
            let kind = dirent_type(entry.d_type);

            // Intern/find the child like every other handler so the
            // reported ino is the same pointer-based handle `lookup` and
            // `getattr` would report for it. Plain ReadDir establishes no
            // kernel reference, so the ref taken here is dropped right
            // back -- a net-zero refcount change, not a skip of interning.
            let entry_ino = if name == "." {
                ino
            } else if name == ".." {
                match self.resolve_dotdot(ino, &parent) {
                    Ok((dotdot_ino, _ref_dropped_immediately)) => dotdot_ino,
                    Err(err) => {
                        reply.error(Errno::from_i32(err.errno()));
                        return;
                    }
                }
            } else {
                match self.find_or_create_child(&parent, name) {
                    Ok(cached) => INodeNo(Self::handle_of(&cached)),
                    Err(err) => {
                        reply.error(Errno::from_i32(err.errno()));
                        return;
                    }
                }
            };

            if reply.add(entry_ino, next_offset as u64, kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn readdirplus(&self, _req: &Request, ino: INodeNo, fh: FileHandle, offset: u64, mut reply: ReplyDirectoryPlus) {
        let dir_ptr = u64::from(fh) as *mut OwnedDir;
        let dir = unsafe { &*dir_ptr };
        let parent = self.get_inode(ino);
        syscalls::seekdir(dir, offset as i64);

        // Refs taken for children successfully handed to the kernel this
        // call; unref'd on early failure, forgotten (ref kept) on success.
        let mut staged: Vec<CachedInode> = Vec::new();

        let result = (|| -> Result<()> {
            loop {
                let entry = match syscalls::readdir(dir)? {
                    Some(e) => e,
                    None => break,
                };
                let name_bytes = Self::dirent_name(&entry);
                let name = OsStr::from_bytes(&name_bytes);
                let next_offset = syscalls::telldir(dir) as u64;

                if name == "." {
                    // Known simplification: "." reuses the directory's own
                    // already-resolved attrs and handle, since the kernel
                    // does not follow up on "." with a further request keyed
                    // on its reported ino.
                    let st = parent.stat()?;
                    let attr = stat_to_attr(ino, &st);
                    if reply.add(ino, next_offset, name, &self.opts.entry_timeout, &attr, Generation(0)) {
                        break;
                    }
                    continue;
                }

                if name == ".." {
                    let (dotdot_ino, dotdot_ref) = self.resolve_dotdot(ino, &parent)?;
                    let st = match &dotdot_ref {
                        Some(cached) => cached.stat()?,
                        None => self.root.stat()?,
                    };
                    let attr = stat_to_attr(dotdot_ino, &st);
                    let full = reply.add(dotdot_ino, next_offset, name, &self.opts.entry_timeout, &attr, Generation(0));
                    if full {
                        break;
                    }
                    if let Some(cached) = dotdot_ref {
                        staged.push(cached);
                    }
                    continue;
                }

                let cached = self.find_or_create_child(&parent, name)?;
                let (st, generation) = self.entry_param(&cached, true)?;
                let child_ino = INodeNo(Self::handle_of(&cached));
                let attr = stat_to_attr(child_ino, &st);
                let full = reply.add(child_ino, next_offset, name, &self.opts.entry_timeout, &attr, Generation(generation));
                if full {
                    // Not actually handed to the kernel: drop the ref we
                    // just took instead of staging it.
                    break;
                }
                staged.push(cached);
            }
            Ok(())
        })();

        match result {
            Ok(()) => {
                for cached in staged {
                    std::mem::forget(cached);
                }
                reply.ok();
            }
            Err(err) => {
                drop(staged);
                reply.error(Errno::from_i32(err.errno()));
            }
        }
    }

    fn releasedir(&self, _req: &Request, _ino: INodeNo, fh: FileHandle, _flags: OpenFlags, reply: ReplyEmpty) {
        let dir_ptr = u64::from(fh) as *mut OwnedDir;
        drop(unsafe { Box::from_raw(dir_ptr) });
        reply.ok();
    }

    fn fsyncdir(&self, _req: &Request, _ino: INodeNo, fh: FileHandle, datasync: bool, reply: ReplyEmpty) {
        let dir_ptr = u64::from(fh) as *mut OwnedDir;
        let dir = unsafe { &*dir_ptr };
        let result = syscalls::dirfd(dir).and_then(|fd| {
            if datasync {
                syscalls::fdatasync(fd)
            } else {
                syscalls::fsync(fd)
            }
        });
        ok_or_log(reply, result);
    }

    fn statfs(&self, _req: &Request, ino: INodeNo, reply: ReplyStatfs) {
        let inode = self.get_inode(ino);
        match syscalls::fstatvfs(inode.fd()) {
            Ok(st) => reply.statfs(
                st.f_blocks,
                st.f_bfree,
                st.f_bavail,
                st.f_files,
                st.f_ffree,
                st.f_bsize as u32,
                st.f_namemax as u32,
                st.f_frsize as u32,
            ),
            Err(err) => reply.error(Errno::from_i32(err.errno())),
        }
    }

    fn setxattr(
        &self,
        _req: &Request,
        ino: INodeNo,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let inode = self.get_inode(ino);
        let path = Self::proc_path(inode.fd());
        let cname = CString::new(name.as_bytes()).unwrap_or_default();
        let result = syscalls::setxattr(&path, &cname, value, flags);
        ok_or_log(reply, result);
    }

    fn getxattr(&self, _req: &Request, ino: INodeNo, name: &OsStr, size: u32, reply: ReplyXattr) {
        let inode = self.get_inode(ino);
        let path = Self::proc_path(inode.fd());
        let cname = CString::new(name.as_bytes()).unwrap_or_default();
        if size == 0 {
            match syscalls::getxattr_size(&path, &cname) {
                Ok(n) => reply.size(n as u32),
                Err(err) => reply.error(Errno::from_i32(err.errno())),
            }
            return;
        }
        let mut buf = vec![0u8; size as usize];
        match syscalls::getxattr(&path, &cname, &mut buf) {
            Ok(n) => reply.data(&buf[..n]),
            Err(err) => reply.error(Errno::from_i32(err.errno())),
        }
    }

    fn listxattr(&self, _req: &Request, ino: INodeNo, size: u32, reply: ReplyXattr) {
        let inode = self.get_inode(ino);
        let path = Self::proc_path(inode.fd());
        if size == 0 {
            match syscalls::listxattr_size(&path) {
                Ok(n) => reply.size(n as u32),
                Err(err) => reply.error(Errno::from_i32(err.errno())),
            }
            return;
        }
        let mut buf = vec![0u8; size as usize];
        match syscalls::listxattr(&path, &mut buf) {
            Ok(n) => reply.data(&buf[..n]),
            Err(err) => reply.error(Errno::from_i32(err.errno())),
        }
    }

    fn removexattr(&self, _req: &Request, ino: INodeNo, name: &OsStr, reply: ReplyEmpty) {
        let inode = self.get_inode(ino);
        let path = Self::proc_path(inode.fd());
        let cname = CString::new(name.as_bytes()).unwrap_or_default();
        let result = syscalls::removexattr(&path, &cname);
        ok_or_log(reply, result);
    }

    fn access(&self, _req: &Request, ino: INodeNo, mask: AccessFlags, reply: ReplyEmpty) {
        // faccessat has no AT_EMPTY_PATH variant, so go through the
        // /proc/self/fd form like everything else that needs a path.
        let inode = self.get_inode(ino);
        let path = Self::proc_path(inode.fd());
        let result = syscalls::access(&path, mask.bits());
        ok_or_log(reply, result);
    }

    fn create(
        &self,
        _req: &Request,
        parent: INodeNo,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let parent_inode = self.get_inode(parent);
        let open_flags = flags | libc::O_CREAT | libc::O_CLOEXEC;
        let open_flags = open_flags & !libc::O_NOFOLLOW;
        let fd = match syscalls::openat(parent_inode.fd(), Path::new(name), open_flags, mode as libc::mode_t) {
            Ok(fd) => fd,
            Err(err) => {
                reply.error(Errno::from_i32(err.errno()));
                return;
            }
        };
        let st = match syscalls::fstatat_fd(fd.as_raw_fd()) {
            Ok(st) => st,
            Err(err) => {
                reply.error(Errno::from_i32(err.errno()));
                return;
            }
        };
        if st.st_dev != self.root.dev() {
            let err = Error::cross_device("create crosses a device boundary");
            reply.error(Errno::from_i32(err.errno()));
            return;
        }
        // Re-open as a path-only descriptor for the cache record; the
        // original fd becomes the kernel's file handle for this open.
        let path_fd = match syscalls::openat(
            parent_inode.fd(),
            Path::new(name),
            libc::O_PATH | libc::O_NOFOLLOW | libc::O_CLOEXEC,
            0,
        ) {
            Ok(fd) => fd,
            Err(err) => {
                reply.error(Errno::from_i32(err.errno()));
                return;
            }
        };
        let inode = Inode::open_with_fd(path_fd, st.st_ino, st.st_dev);
        let cached = self.cache.insert(inode);
        let generation = cached.generation().unwrap_or(0) as u64;
        let ino = INodeNo(Self::handle_of(&cached));
        std::mem::forget(cached);
        let raw_fd = fd.into_raw();
        reply.created(
            &self.opts.entry_timeout,
            &stat_to_attr(ino, &st),
            Generation(generation),
            FileHandle(raw_fd as u64),
            Self::open_reply_flags(open_flags),
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn getlk(
        &self,
        _req: &Request,
        _ino: INodeNo,
        fh: FileHandle,
        _lock_owner: LockOwner,
        start: u64,
        end: u64,
        typ: i32,
        pid: u32,
        reply: ReplyLock,
    ) {
        let fd = u64::from(fh) as RawFd;
        let mut lock = libc::flock {
            l_type: typ as libc::c_short,
            l_whence: libc::SEEK_SET as libc::c_short,
            l_start: start as libc::off_t,
            l_len: (end.saturating_sub(start)) as libc::off_t,
            l_pid: pid as libc::pid_t,
        };
        match syscalls::fcntl_getlk(fd, &mut lock) {
            Ok(()) => reply.locked(
                lock.l_start as u64,
                (lock.l_start + lock.l_len) as u64,
                lock.l_type as i32,
                lock.l_pid as u32,
            ),
            Err(err) => reply.error(Errno::from_i32(err.errno())),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setlk(
        &self,
        _req: &Request,
        _ino: INodeNo,
        fh: FileHandle,
        _lock_owner: LockOwner,
        start: u64,
        end: u64,
        typ: i32,
        pid: u32,
        sleep: bool,
        reply: ReplyEmpty,
    ) {
        let fd = u64::from(fh) as RawFd;
        // Known limitation (recorded in DESIGN.md): this uses the server's
        // own pid, not the caller's, so a subsequent GetLk can misreport
        // the lock holder.
        let lock = libc::flock {
            l_type: typ as libc::c_short,
            l_whence: libc::SEEK_SET as libc::c_short,
            l_start: start as libc::off_t,
            l_len: (end.saturating_sub(start)) as libc::off_t,
            l_pid: pid as libc::pid_t,
        };
        let result = syscalls::fcntl_setlk(fd, &lock, sleep);
        ok_or_log(reply, result);
    }

    fn poll(
        &self,
        _req: &Request,
        ino: INodeNo,
        fh: FileHandle,
        ph: PollNotifier,
        _events: PollEvents,
        _flags: PollFlags,
        reply: ReplyPoll,
    ) {
        let inode = self.get_inode(ino);
        inode.add_poll_handle(ph.handle());
        let fd = u64::from(fh) as RawFd;
        let mut fds = [libc::pollfd {
            fd,
            events: libc::POLLIN | libc::POLLOUT | libc::POLLERR | libc::POLLHUP,
            revents: 0,
        }];
        match syscalls::poll(&mut fds, 0) {
            Ok(_) => reply.poll(PollEvents::from_bits_truncate(fds[0].revents as u32)),
            Err(err) => reply.error(Errno::from_i32(err.errno())),
        }
    }

    fn fallocate(
        &self,
        _req: &Request,
        _ino: INodeNo,
        fh: FileHandle,
        offset: u64,
        length: u64,
        mode: i32,
        reply: ReplyEmpty,
    ) {
        let fd = u64::from(fh) as RawFd;
        let result = syscalls::fallocate(fd, mode, offset as libc::off_t, length as libc::off_t);
        ok_or_log(reply, result);
    }

    fn lseek(&self, _req: &Request, _ino: INodeNo, fh: FileHandle, offset: i64, whence: i32, reply: ReplyLseek) {
        let fd = u64::from(fh) as RawFd;
        match syscalls::lseek(fd, offset as libc::off_t, whence) {
            Ok(off) => reply.offset(off as i64),
            Err(err) => reply.error(Errno::from_i32(err.errno())),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn copy_file_range(
        &self,
        _req: &Request,
        _ino_in: INodeNo,
        fh_in: FileHandle,
        offset_in: u64,
        _ino_out: INodeNo,
        fh_out: FileHandle,
        offset_out: u64,
        len: u64,
        _flags: CopyFileRangeFlags,
        reply: ReplyWrite,
    ) {
        let fd_in = u64::from(fh_in) as RawFd;
        let fd_out = u64::from(fh_out) as RawFd;
        let mut off_in = offset_in as libc::off_t;
        let mut off_out = offset_out as libc::off_t;
        match syscalls::copy_file_range(fd_in, Some(&mut off_in), fd_out, Some(&mut off_out), len as usize, 0) {
            Ok(n) => reply.written(n as u32),
            Err(err) => reply.error(Errno::from_i32(err.errno())),
        }
    }
}
