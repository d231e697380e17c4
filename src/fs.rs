//! The kernel-facing operation surface.
//!
//! Every handler rejects requests carrying pid 0 (the kernel never sends
//! those for well-formed upcalls), takes the filesystem-wide mutex for its
//! whole body, loads the involved inodes from the store, enforces the POSIX
//! preconditions and writes the results back. Throughput is one operation
//! at a time; the store is the single source of truth and each operation
//! sees a consistent snapshot because nothing else runs concurrently.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request, TimeOrNow,
};
use libc::{c_int, EBADF, EEXIST, EINVAL, EIO, ENOENT, ENOSYS, ENOTEMPTY};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::common::{FileMode, TimeSpec};
use crate::inode::Inode;
use crate::models::{Dirent, DirentKind};
use crate::store::{StoreError, StoreGateway, StoreResult};
use crate::ROOT_INUMBER;

/// The kernel may cache entries and attributes for as long as it likes:
/// nothing mutates the store behind its back and it handles invalidation
/// itself.
const TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Advertised capacity: 2 GiB of 1-byte blocks.
const TOTAL_BLOCKS: u64 = 1 << 31;

type OpResult<T> = Result<T, c_int>;

pub struct LedgerFs {
    store: StoreGateway,
    uid: u32,
    gid: u32,
    /// Serializes every kernel-facing operation end-to-end, across all
    /// store round trips of the operation.
    lock: Mutex<()>,
    /// Transient kernel reference counts keyed by inumber: incremented on
    /// every reply that hands the kernel an entry, decremented by forget.
    /// Dies with the process; the persistent nlink is not involved.
    lookups: Mutex<HashMap<u64, u64>>,
}

impl LedgerFs {
    /// Connect the core to a store, creating the root directory on first
    /// mount.
    pub fn new(store: StoreGateway, uid: u32, gid: u32) -> StoreResult<Self> {
        match Inode::load(&store, ROOT_INUMBER) {
            Ok(_) => {}
            Err(StoreError::NotFound(_)) => {
                Inode::create(&store, ROOT_INUMBER, FileMode::dir(0o700), uid, gid)?;
                info!("root inode created");
            }
            Err(e) => return Err(e),
        }
        Ok(Self {
            store,
            uid,
            gid,
            lock: Mutex::new(()),
            lookups: Mutex::new(HashMap::new()),
        })
    }

    /// Fetch an inode the kernel presented. The kernel only learns
    /// inumbers from us and we never invalidate them, so absence is a
    /// broken invariant, not an error to report.
    fn must_inode(&self, inumber: u64) -> OpResult<Inode> {
        match Inode::load(&self.store, inumber) {
            Ok(inode) => Ok(inode),
            Err(StoreError::NotFound(_)) => {
                panic!("kernel-referenced inode {inumber} missing from store")
            }
            Err(e) => {
                warn!(inumber, error = %e, "inode fetch failed");
                Err(EIO)
            }
        }
    }

    fn errno(e: StoreError) -> c_int {
        warn!(error = %e, "store error");
        EIO
    }

    /// Record one more kernel reference to `inumber`.
    fn retain(&self, inumber: u64) {
        *self.lookups.lock().entry(inumber).or_insert(0) += 1;
    }

    /// Kernel references currently held against `inumber`.
    fn held(&self, inumber: u64) -> u64 {
        self.lookups.lock().get(&inumber).copied().unwrap_or(0)
    }

    pub(crate) fn do_lookup(&self, parent: u64, name: &[u8]) -> OpResult<FileAttr> {
        let parent = self.must_inode(parent)?;
        let Some((child_ino, _)) = parent.lookup_child(name).map_err(Self::errno)? else {
            return Err(ENOENT);
        };
        let mut child = self.must_inode(child_ino)?;
        child.atime = TimeSpec::now();
        child.persist().map_err(Self::errno)?;
        self.retain(child_ino);
        Ok(child.attr())
    }

    pub(crate) fn do_getattr(&self, ino: u64) -> OpResult<FileAttr> {
        let mut inode = self.must_inode(ino)?;
        inode.atime = TimeSpec::now();
        inode.persist().map_err(Self::errno)?;
        Ok(inode.attr())
    }

    pub(crate) fn do_setattr(
        &self,
        ino: u64,
        size: Option<u64>,
        mode: Option<u32>,
        mtime: Option<TimeSpec>,
        fh: Option<u64>,
    ) -> OpResult<FileAttr> {
        if let Some(size) = size {
            // A truncate to a nonzero length has to come through an open
            // file descriptor; open(O_TRUNC) to zero is allowed.
            if fh.is_none() && size != 0 {
                return Err(EBADF);
            }
        }
        let mut inode = self.must_inode(ino)?;
        inode
            .set_attributes(size, mode, mtime)
            .map_err(Self::errno)?;
        Ok(inode.attr())
    }

    /// Shared by mkdir, mknod and create.
    pub(crate) fn make_node(
        &self,
        parent_ino: u64,
        name: &[u8],
        mode: FileMode,
    ) -> OpResult<FileAttr> {
        let mut parent = self.must_inode(parent_ino)?;
        if parent.lookup_child(name).map_err(Self::errno)?.is_some() {
            return Err(EEXIST);
        }
        let inumber = self.store.next_inumber().map_err(Self::errno)?;
        let child =
            Inode::create(&self.store, inumber, mode, self.uid, self.gid).map_err(Self::errno)?;
        parent
            .add_child(inumber, name, child.dirent_kind())
            .map_err(Self::errno)?;
        self.retain(inumber);
        Ok(child.attr())
    }

    pub(crate) fn do_rename(
        &self,
        old_parent: u64,
        old_name: &[u8],
        new_parent: u64,
        new_name: &[u8],
    ) -> OpResult<()> {
        let mut old_dir = self.must_inode(old_parent)?;
        let Some((child_ino, child_kind)) = old_dir.lookup_child(old_name).map_err(Self::errno)?
        else {
            return Err(ENOENT);
        };

        // An existing target may be replaced unless it is a non-empty
        // directory.
        let mut new_dir = self.must_inode(new_parent)?;
        if let Some((existing_ino, _)) = new_dir.lookup_child(new_name).map_err(Self::errno)? {
            let existing = self.must_inode(existing_ino)?;
            if existing.is_dir() && existing.len().map_err(Self::errno)? != 0 {
                return Err(ENOTEMPTY);
            }
            new_dir.remove_child(new_name).map_err(Self::errno)?;
        }

        // Link the new name first, then drop the old one; the entry lists
        // are re-read from the store on every mutation, so this also holds
        // up when both parents are the same directory.
        new_dir
            .add_child(child_ino, new_name, child_kind)
            .map_err(Self::errno)?;
        old_dir.remove_child(old_name).map_err(Self::errno)?;
        Ok(())
    }

    /// Shared by unlink and rmdir: drop the name, tombstone the child, and
    /// erase it right away when the kernel holds no reference.
    fn remove_entry(&self, parent_ino: u64, name: &[u8], must_be_empty: bool) -> OpResult<()> {
        let mut parent = self.must_inode(parent_ino)?;
        let Some((child_ino, _)) = parent.lookup_child(name).map_err(Self::errno)? else {
            return Err(ENOENT);
        };
        let mut child = self.must_inode(child_ino)?;
        if must_be_empty && child.len().map_err(Self::errno)? != 0 {
            return Err(ENOTEMPTY);
        }
        parent.remove_child(name).map_err(Self::errno)?;

        child.nlink = child.nlink.saturating_sub(1);
        child.to_be_deleted = true;
        child.atime = TimeSpec::now();
        child.persist().map_err(Self::errno)?;

        if self.held(child_ino) == 0 {
            child.delete().map_err(Self::errno)?;
        }
        Ok(())
    }

    pub(crate) fn do_unlink(&self, parent: u64, name: &[u8]) -> OpResult<()> {
        self.remove_entry(parent, name, false)
    }

    pub(crate) fn do_rmdir(&self, parent: u64, name: &[u8]) -> OpResult<()> {
        self.remove_entry(parent, name, true)
    }

    pub(crate) fn do_open(&self, ino: u64, want_dir: bool) -> OpResult<()> {
        let mut inode = self.must_inode(ino)?;
        if want_dir {
            assert!(inode.is_dir(), "opendir routed to non-directory inode {ino}");
        } else {
            assert!(inode.is_file(), "open routed to non-file inode {ino}");
        }
        inode.atime = TimeSpec::now();
        inode.persist().map_err(Self::errno)?;
        Ok(())
    }

    pub(crate) fn do_read(&self, ino: u64, offset: u64, size: usize) -> OpResult<Vec<u8>> {
        let mut inode = self.must_inode(ino)?;
        let mut buf = vec![0u8; size];
        // End-of-file is reported to the kernel as a short read, never as
        // an error.
        let (n, _eof) = inode.read_at(&mut buf, offset).map_err(Self::errno)?;
        buf.truncate(n);
        inode.atime = TimeSpec::now();
        inode.persist().map_err(Self::errno)?;
        Ok(buf)
    }

    pub(crate) fn do_write(&self, ino: u64, offset: u64, data: &[u8]) -> OpResult<u32> {
        let mut inode = self.must_inode(ino)?;
        let n = inode.write_at(data, offset).map_err(Self::errno)?;
        Ok(n as u32)
    }

    pub(crate) fn do_readdir(
        &self,
        ino: u64,
        offset: u64,
        sink: impl FnMut(&Dirent) -> bool,
    ) -> OpResult<()> {
        let mut inode = self.must_inode(ino)?;
        inode.read_dir(offset, sink).map_err(Self::errno)
    }

    pub(crate) fn do_fallocate(
        &self,
        ino: u64,
        mode: i32,
        offset: u64,
        length: u64,
    ) -> OpResult<()> {
        if mode != 0 {
            return Err(ENOSYS);
        }
        let mut inode = self.must_inode(ino)?;
        inode.fallocate(offset, length).map_err(Self::errno)
    }

    /// Returns (bfree, inodes used, inodes free).
    pub(crate) fn do_statfs(&self) -> OpResult<(u64, u64, u64)> {
        let used = self.store.space_used();
        let files = self.store.next_inumber().map_err(Self::errno)? - 1;
        let bfree = TOTAL_BLOCKS.saturating_sub(used);
        let ffree = i64::MAX as u64 - files;
        Ok((bfree, files, ffree))
    }

    /// Drop kernel references announced by a forget message; once the last
    /// one is gone a tombstoned inode is erased together with its blob.
    pub(crate) fn do_forget(&self, ino: u64, nlookup: u64) {
        let mut lookups = self.lookups.lock();
        let remaining = match lookups.get_mut(&ino) {
            Some(count) => {
                *count = count.saturating_sub(nlookup);
                *count
            }
            None => return,
        };
        if remaining != 0 {
            return;
        }
        lookups.remove(&ino);
        drop(lookups);

        match Inode::load(&self.store, ino) {
            Ok(inode) if inode.to_be_deleted => {
                debug!(inumber = ino, "erasing tombstoned inode");
                if let Err(e) = inode.delete() {
                    warn!(inumber = ino, error = %e, "could not erase inode");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(inumber = ino, error = %e, "forget could not load inode"),
        }
    }
}

/// True when the request must be bounced with EINVAL: a zero pid means the
/// kernel delivered a malformed or spoofed upcall.
fn deny_pid0(req: &Request<'_>) -> bool {
    if req.pid() == 0 {
        warn!(unique = req.unique(), "request from pid 0 rejected");
        return true;
    }
    false
}

fn mtime_spec(mtime: Option<TimeOrNow>) -> Option<TimeSpec> {
    mtime.map(|t| match t {
        TimeOrNow::SpecificTime(t) => t.into(),
        TimeOrNow::Now => TimeSpec::now(),
    })
}

impl Filesystem for LedgerFs {
    fn lookup(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        if deny_pid0(req) {
            return reply.error(EINVAL);
        }
        let _guard = self.lock.lock();
        debug!(parent, name = ?name, "lookup");
        match self.do_lookup(parent, name.as_bytes()) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(e),
        }
    }

    fn forget(&mut self, req: &Request<'_>, ino: u64, nlookup: u64) {
        if deny_pid0(req) {
            return;
        }
        let _guard = self.lock.lock();
        debug!(ino, nlookup, "forget");
        self.do_forget(ino, nlookup);
    }

    fn getattr(&mut self, req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        if deny_pid0(req) {
            return reply.error(EINVAL);
        }
        let _guard = self.lock.lock();
        debug!(ino, "getattr");
        match self.do_getattr(ino) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(e) => reply.error(e),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        if deny_pid0(req) {
            return reply.error(EINVAL);
        }
        let _guard = self.lock.lock();
        debug!(ino, ?size, ?mode, "setattr");
        match self.do_setattr(ino, size, mode, mtime_spec(mtime), fh) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(e) => reply.error(e),
        }
    }

    fn mknod(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        if deny_pid0(req) {
            return reply.error(EINVAL);
        }
        let _guard = self.lock.lock();
        debug!(parent, name = ?name, mode, "mknod");
        match self.make_node(parent, name.as_bytes(), FileMode::file(mode)) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(e),
        }
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        if deny_pid0(req) {
            return reply.error(EINVAL);
        }
        let _guard = self.lock.lock();
        debug!(parent, name = ?name, mode, "mkdir");
        match self.make_node(parent, name.as_bytes(), FileMode::dir(mode)) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(e),
        }
    }

    fn unlink(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        if deny_pid0(req) {
            return reply.error(EINVAL);
        }
        let _guard = self.lock.lock();
        debug!(parent, name = ?name, "unlink");
        match self.do_unlink(parent, name.as_bytes()) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn rmdir(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        if deny_pid0(req) {
            return reply.error(EINVAL);
        }
        let _guard = self.lock.lock();
        debug!(parent, name = ?name, "rmdir");
        match self.do_rmdir(parent, name.as_bytes()) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn rename(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        if deny_pid0(req) {
            return reply.error(EINVAL);
        }
        let _guard = self.lock.lock();
        debug!(parent, name = ?name, newparent, newname = ?newname, "rename");
        match self.do_rename(parent, name.as_bytes(), newparent, newname.as_bytes()) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn open(&mut self, req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        if deny_pid0(req) {
            return reply.error(EINVAL);
        }
        let _guard = self.lock.lock();
        debug!(ino, "open");
        match self.do_open(ino, false) {
            Ok(()) => reply.opened(0, 0),
            Err(e) => reply.error(e),
        }
    }

    fn read(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        if deny_pid0(req) {
            return reply.error(EINVAL);
        }
        if offset < 0 {
            return reply.error(EINVAL);
        }
        let _guard = self.lock.lock();
        debug!(ino, offset, size, "read");
        match self.do_read(ino, offset as u64, size as usize) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        if deny_pid0(req) {
            return reply.error(EINVAL);
        }
        if offset < 0 {
            return reply.error(EINVAL);
        }
        let _guard = self.lock.lock();
        debug!(ino, offset, len = data.len(), "write");
        match self.do_write(ino, offset as u64, data) {
            Ok(written) => reply.written(written),
            Err(e) => reply.error(e),
        }
    }

    // There is no write-back cache: every write already reached the store.
    fn flush(&mut self, req: &Request<'_>, ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        if deny_pid0(req) {
            return reply.error(EINVAL);
        }
        let _guard = self.lock.lock();
        debug!(ino, "flush");
        reply.ok();
    }

    fn opendir(&mut self, req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        if deny_pid0(req) {
            return reply.error(EINVAL);
        }
        let _guard = self.lock.lock();
        debug!(ino, "opendir");
        match self.do_open(ino, true) {
            Ok(()) => reply.opened(0, 0),
            Err(e) => reply.error(e),
        }
    }

    fn readdir(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        if deny_pid0(req) {
            return reply.error(EINVAL);
        }
        if offset < 0 {
            return reply.error(EINVAL);
        }
        let _guard = self.lock.lock();
        debug!(ino, offset, "readdir");
        let result = self.do_readdir(ino, offset as u64, |entry| {
            let kind = match entry.kind {
                DirentKind::Dir => FileType::Directory,
                _ => FileType::RegularFile,
            };
            reply.add(
                entry.inumber,
                entry.offset as i64,
                kind,
                OsStr::from_bytes(&entry.name),
            )
        });
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn statfs(&mut self, req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        if deny_pid0(req) {
            return reply.error(EINVAL);
        }
        let _guard = self.lock.lock();
        debug!("statfs");
        match self.do_statfs() {
            Ok((bfree, files, ffree)) => {
                reply.statfs(TOTAL_BLOCKS, bfree, bfree, files, ffree, 1, 255, 1)
            }
            Err(e) => reply.error(e),
        }
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        if deny_pid0(req) {
            return reply.error(EINVAL);
        }
        let _guard = self.lock.lock();
        debug!(parent, name = ?name, mode, "create");
        match self.make_node(parent, name.as_bytes(), FileMode::file(mode)) {
            Ok(attr) => reply.created(&TTL, &attr, 0, 0, 0),
            Err(e) => reply.error(e),
        }
    }

    fn fallocate(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        length: i64,
        mode: i32,
        reply: ReplyEmpty,
    ) {
        if deny_pid0(req) {
            return reply.error(EINVAL);
        }
        if offset < 0 || length < 0 {
            return reply.error(EINVAL);
        }
        let _guard = self.lock.lock();
        debug!(ino, offset, length, mode, "fallocate");
        match self.do_fallocate(ino, mode, offset as u64, length as u64) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }
}
