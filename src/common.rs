//! Scalar types shared across the crate.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// POSIX mode bits: the file-type nibble plus permission bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FileMode: u32 {
        const S_IFMT  = 0o170000;
        const S_IFDIR = 0o040000;
        const S_IFREG = 0o100000;
        const S_IFLNK = 0o120000;
        const PERM    = 0o007777;
    }
}

impl FileMode {
    /// Directory mode with the given permission bits.
    pub fn dir(perm: u32) -> Self {
        Self::S_IFDIR | Self::from_bits_truncate(perm & Self::PERM.bits())
    }

    /// Regular-file mode with the given permission bits.
    pub fn file(perm: u32) -> Self {
        Self::S_IFREG | Self::from_bits_truncate(perm & Self::PERM.bits())
    }

    pub fn is_dir(self) -> bool {
        self.bits() & Self::S_IFMT.bits() == Self::S_IFDIR.bits()
    }

    pub fn is_symlink(self) -> bool {
        self.bits() & Self::S_IFMT.bits() == Self::S_IFLNK.bits()
    }

    pub fn is_file(self) -> bool {
        !(self.is_dir() || self.is_symlink())
    }

    /// Permission bits only, as the kernel wants them in stat output.
    pub fn perm(self) -> u16 {
        (self.bits() & Self::PERM.bits()) as u16
    }
}

/// Seconds/nanoseconds timestamp as persisted inside inode records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSpec {
    pub sec: i64,
    pub nsec: u32,
}

impl TimeSpec {
    pub fn now() -> Self {
        SystemTime::now().into()
    }
}

impl From<SystemTime> for TimeSpec {
    fn from(t: SystemTime) -> Self {
        // Pre-epoch times clamp to the epoch.
        let d = t.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
        TimeSpec {
            sec: d.as_secs() as i64,
            nsec: d.subsec_nanos(),
        }
    }
}

impl From<TimeSpec> for SystemTime {
    fn from(t: TimeSpec) -> Self {
        UNIX_EPOCH + Duration::new(t.sec.max(0) as u64, t.nsec)
    }
}
