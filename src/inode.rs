//! In-memory façade over a single inode.
//!
//! An [`Inode`] is one record fetched from the store plus a gateway handle.
//! Every mutating method persists the blob first (when it changed) and the
//! record second, before returning; there is no write-back cache, the store
//! is the single source of truth.

use std::ops::{Deref, DerefMut};

use fuser::{FileAttr, FileType};

use crate::common::{FileMode, TimeSpec};
use crate::models::{Dirent, DirentKind, InodeRecord};
use crate::store::{StoreError, StoreGateway, StoreResult};

pub struct Inode {
    rec: InodeRecord,
    store: StoreGateway,
}

impl Deref for Inode {
    type Target = InodeRecord;

    fn deref(&self) -> &Self::Target {
        &self.rec
    }
}

impl DerefMut for Inode {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.rec
    }
}

impl Inode {
    /// Load an existing inode from the store.
    pub fn load(store: &StoreGateway, inumber: u64) -> StoreResult<Self> {
        let rec = store.get_inode(inumber)?;
        Ok(Self {
            rec,
            store: store.clone(),
        })
    }

    /// Allocate a fresh inode and persist it immediately. Directories also
    /// get an empty entry list so readdir works before the first insert.
    pub fn create(
        store: &StoreGateway,
        inumber: u64,
        mode: FileMode,
        uid: u32,
        gid: u32,
    ) -> StoreResult<Self> {
        let now = TimeSpec::now();
        let rec = InodeRecord {
            inumber,
            size: 0,
            nlink: 1,
            mode: mode.bits(),
            atime: now,
            mtime: now,
            ctime: now,
            crtime: now,
            uid,
            gid,
            to_be_deleted: false,
        };
        let inode = Self {
            rec,
            store: store.clone(),
        };
        inode.persist()?;
        if inode.is_dir() {
            inode.write_children(&[])?;
        }
        Ok(inode)
    }

    pub fn mode(&self) -> FileMode {
        FileMode::from_bits_truncate(self.rec.mode)
    }

    pub fn is_dir(&self) -> bool {
        self.mode().is_dir()
    }

    pub fn is_symlink(&self) -> bool {
        self.mode().is_symlink()
    }

    pub fn is_file(&self) -> bool {
        self.mode().is_file()
    }

    /// The dirent type a parent directory records for this inode.
    pub fn dirent_kind(&self) -> DirentKind {
        if self.is_dir() {
            DirentKind::Dir
        } else {
            DirentKind::File
        }
    }

    /// Flush the record to the store. Must be called after any attribute
    /// change for it to become permanent.
    pub fn persist(&self) -> StoreResult<()> {
        self.store.upsert_inode(&self.rec)
    }

    /// Erase this inode and its blob.
    pub fn delete(&self) -> StoreResult<()> {
        self.store.delete_inode(self.rec.inumber)
    }

    /// Kernel-facing attribute view.
    pub fn attr(&self) -> FileAttr {
        let kind = if self.is_dir() {
            FileType::Directory
        } else if self.is_symlink() {
            FileType::Symlink
        } else {
            FileType::RegularFile
        };
        FileAttr {
            ino: self.rec.inumber,
            size: self.rec.size,
            // statfs advertises 1-byte blocks
            blocks: self.rec.size,
            atime: self.rec.atime.into(),
            mtime: self.rec.mtime.into(),
            ctime: self.rec.ctime.into(),
            crtime: self.rec.crtime.into(),
            kind,
            perm: self.mode().perm(),
            nlink: self.rec.nlink,
            uid: self.rec.uid,
            gid: self.rec.gid,
            rdev: 0,
            blksize: 512,
            flags: 0,
        }
    }

    fn children(&self) -> StoreResult<Vec<Dirent>> {
        assert!(
            self.is_dir(),
            "directory operation on non-directory inode {}",
            self.rec.inumber
        );
        let blob = self.store.get_blob(self.rec.inumber)?;
        if blob.is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_slice(&blob).map_err(|e| StoreError::backend(self.rec.inumber, e))
    }

    fn write_children(&self, entries: &[Dirent]) -> StoreResult<()> {
        let blob =
            serde_json::to_vec(entries).map_err(|e| StoreError::backend(self.rec.inumber, e))?;
        self.store.upsert_blob(self.rec.inumber, &blob)
    }

    /// Number of live entries in the directory.
    pub fn len(&self) -> StoreResult<usize> {
        Ok(self.children()?.iter().filter(|e| !e.is_free()).count())
    }

    /// Find a live entry by name. Names are unique per directory, enforced
    /// by the existence check at creation time.
    pub fn lookup_child(&self, name: &[u8]) -> StoreResult<Option<(u64, DirentKind)>> {
        Ok(self
            .children()?
            .into_iter()
            .find(|e| !e.is_free() && e.name == name)
            .map(|e| (e.inumber, e.kind)))
    }

    /// Insert an entry, reusing the first free slot if one exists and
    /// appending otherwise. Touches the parent's atime and mtime.
    pub fn add_child(&mut self, inumber: u64, name: &[u8], kind: DirentKind) -> StoreResult<()> {
        debug_assert!(kind != DirentKind::Free);
        let now = TimeSpec::now();
        self.rec.atime = now;
        self.rec.mtime = now;

        let mut entries = self.children()?;
        match entries.iter().position(|e| e.is_free()) {
            Some(slot) => {
                entries[slot] = Dirent {
                    offset: slot as u64 + 1,
                    inumber,
                    name: name.to_vec(),
                    kind,
                };
            }
            None => {
                let offset = entries.len() as u64 + 1;
                entries.push(Dirent {
                    offset,
                    inumber,
                    name: name.to_vec(),
                    kind,
                });
            }
        }
        self.write_children(&entries)?;
        self.persist()
    }

    /// Tombstone an entry, keeping its offset. The caller guarantees the
    /// entry exists.
    pub fn remove_child(&mut self, name: &[u8]) -> StoreResult<()> {
        let now = TimeSpec::now();
        self.rec.atime = now;
        self.rec.mtime = now;

        let mut entries = self.children()?;
        let slot = entries
            .iter()
            .position(|e| !e.is_free() && e.name == name)
            .unwrap_or_else(|| {
                panic!(
                    "removing unknown entry {:?} from inode {}",
                    String::from_utf8_lossy(name),
                    self.rec.inumber
                )
            });
        entries[slot] = Dirent::free(slot as u64 + 1);
        self.write_children(&entries)?;
        self.persist()
    }

    /// Stream entries to `sink` starting at the readdir cookie `offset`.
    /// `sink` returns true once the kernel buffer is full. Free slots are
    /// skipped but still consume offsets, so cookies stay stable.
    pub fn read_dir(
        &mut self,
        offset: u64,
        mut sink: impl FnMut(&Dirent) -> bool,
    ) -> StoreResult<()> {
        let entries = self.children()?;
        self.rec.atime = TimeSpec::now();
        self.persist()?;
        for entry in entries.iter().skip(offset as usize) {
            if entry.is_free() {
                continue;
            }
            if sink(entry) {
                break;
            }
        }
        Ok(())
    }

    /// Read into `buf` from byte offset `off`. Returns the number of bytes
    /// copied and whether the end of the file was reached; end-of-file is
    /// not an error, just a short read.
    pub fn read_at(&self, buf: &mut [u8], off: u64) -> StoreResult<(usize, bool)> {
        assert!(
            self.is_file(),
            "file read on non-file inode {}",
            self.rec.inumber
        );
        let content = self.store.get_blob(self.rec.inumber)?;
        let off = off as usize;
        if off > content.len() {
            return Ok((0, true));
        }
        let n = buf.len().min(content.len() - off);
        buf[..n].copy_from_slice(&content[off..off + n]);
        Ok((n, n < buf.len()))
    }

    /// Write `data` at byte offset `off`, zero-extending the content when
    /// the write reaches past the current end.
    pub fn write_at(&mut self, data: &[u8], off: u64) -> StoreResult<usize> {
        assert!(
            self.is_file(),
            "file write on non-file inode {}",
            self.rec.inumber
        );
        let now = TimeSpec::now();
        self.rec.atime = now;
        self.rec.mtime = now;

        let mut content = self.store.get_blob(self.rec.inumber)?;
        let end = off as usize + data.len();
        if content.len() < end {
            content.resize(end, 0);
            self.rec.size = end as u64;
        }
        content[off as usize..end].copy_from_slice(data);
        self.store.upsert_blob(self.rec.inumber, &content)?;
        self.persist()?;
        Ok(data.len())
    }

    /// Apply a setattr request. A given size truncates or zero-extends the
    /// content; mode replaces the mode bits wholesale; mtime defaults to
    /// now when not supplied. atime and ctime always move to now.
    pub fn set_attributes(
        &mut self,
        size: Option<u64>,
        mode: Option<u32>,
        mtime: Option<TimeSpec>,
    ) -> StoreResult<()> {
        let now = TimeSpec::now();
        self.rec.atime = now;
        self.rec.ctime = now;
        self.rec.mtime = mtime.unwrap_or(now);

        if let Some(size) = size {
            let mut content = self.store.get_blob(self.rec.inumber)?;
            content.resize(size as usize, 0);
            self.store.upsert_blob(self.rec.inumber, &content)?;
            self.rec.size = size;
        }
        if let Some(mode) = mode {
            self.rec.mode = mode;
        }
        self.persist()
    }

    /// Grow-only allocation: extend with zeros when `offset + length`
    /// reaches past the current size, otherwise leave everything untouched.
    pub fn fallocate(&mut self, offset: u64, length: u64) -> StoreResult<()> {
        assert!(
            self.is_file(),
            "fallocate on non-file inode {}",
            self.rec.inumber
        );
        let new_size = offset + length;
        let mut content = self.store.get_blob(self.rec.inumber)?;
        if new_size as usize > content.len() {
            content.resize(new_size as usize, 0);
            let now = TimeSpec::now();
            self.rec.size = new_size;
            self.rec.atime = now;
            self.rec.mtime = now;
            self.rec.ctime = now;
            self.store.upsert_blob(self.rec.inumber, &content)?;
            self.persist()?;
        }
        Ok(())
    }
}
