//! Host-facing records and the translations between them and the wire.

use crate::ninep::protocol::{
    self, Qid, Stat, L_O_ACCMODE, L_O_APPEND, L_O_CREAT, L_O_DIRECT, L_O_DIRECTORY, L_O_DSYNC,
    L_O_EXCL, L_O_LARGEFILE, L_O_NOATIME, L_O_NOFOLLOW, L_O_SYNC, L_O_TRUNC,
};

/// Stable node id; equal to the server qid path.
pub type InodeId = u64;

// File mode type bits (S_IF* constants)
pub const S_IFMT: u32 = 0o170000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFLNK: u32 = 0o120000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timestamp {
    pub sec: u64,
    pub nsec: u64,
}

/// Snapshot of one node's attributes, projected from Rgetattr.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileStat {
    pub dev: u64,
    pub ino: InodeId,
    pub mode: u32,
    pub nlink: u64,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    pub size: u64,
    pub blksize: u64,
    pub blocks: u64,
    pub atime: Timestamp,
    pub mtime: Timestamp,
    pub ctime: Timestamp,
    pub crtime: Timestamp,
}

impl FileStat {
    pub fn from_wire(dev: u64, ino: InodeId, stat: &Stat) -> Self {
        FileStat {
            dev,
            ino,
            mode: stat.mode,
            nlink: stat.nlink,
            uid: stat.uid,
            gid: stat.gid,
            rdev: stat.rdev,
            size: stat.size,
            blksize: stat.blksize,
            blocks: stat.blocks,
            atime: Timestamp { sec: stat.atime_sec, nsec: stat.atime_nsec },
            mtime: Timestamp { sec: stat.mtime_sec, nsec: stat.mtime_nsec },
            ctime: Timestamp { sec: stat.ctime_sec, nsec: stat.ctime_nsec },
            crtime: Timestamp { sec: stat.btime_sec, nsec: stat.btime_nsec },
        }
    }
}

/// Explicit timestamp or "whatever the server's clock says".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUpdate {
    Now,
    At(Timestamp),
}

/// The fields a write-stat may change. Unset fields are left alone.
#[derive(Debug, Clone, Default)]
pub struct SetAttributes {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<TimeUpdate>,
    pub mtime: Option<TimeUpdate>,
}

impl SetAttributes {
    pub fn is_empty(&self) -> bool {
        self.mode.is_none()
            && self.uid.is_none()
            && self.gid.is_none()
            && self.size.is_none()
            && self.atime.is_none()
            && self.mtime.is_none()
    }

    /// Project to the Tsetattr valid mask and field values.
    pub fn to_wire(&self) -> (u32, u32, u32, u32, u64, (u64, u64), (u64, u64)) {
        let mut valid = 0u32;
        let mode = self.mode.map(|m| { valid |= protocol::SETATTR_MODE; m }).unwrap_or(0);
        let uid = self.uid.map(|u| { valid |= protocol::SETATTR_UID; u }).unwrap_or(0);
        let gid = self.gid.map(|g| { valid |= protocol::SETATTR_GID; g }).unwrap_or(0);
        let size = self.size.map(|s| { valid |= protocol::SETATTR_SIZE; s }).unwrap_or(0);

        let atime = match self.atime {
            Some(TimeUpdate::Now) => {
                valid |= protocol::SETATTR_ATIME;
                (0, 0)
            }
            Some(TimeUpdate::At(ts)) => {
                valid |= protocol::SETATTR_ATIME | protocol::SETATTR_ATIME_SET;
                (ts.sec, ts.nsec)
            }
            None => (0, 0),
        };
        let mtime = match self.mtime {
            Some(TimeUpdate::Now) => {
                valid |= protocol::SETATTR_MTIME;
                (0, 0)
            }
            Some(TimeUpdate::At(ts)) => {
                valid |= protocol::SETATTR_MTIME | protocol::SETATTR_MTIME_SET;
                (ts.sec, ts.nsec)
            }
            None => (0, 0),
        };

        (valid, mode, uid, gid, size, atime, mtime)
    }
}

/// Volume-level info projected from Rstatfs for the host's
/// read-fs-info call.
#[derive(Debug, Clone, Default)]
pub struct FsInfo {
    pub block_size: u32,
    pub io_size: u32,
    pub total_blocks: u64,
    pub free_blocks: u64,
    pub total_nodes: u64,
    pub free_nodes: u64,
    pub max_name_len: u32,
    pub volume_name: String,
    pub read_only: bool,
    pub persistent: bool,
    pub supports_attrs: bool,
}

/// One host directory entry emitted by read-dir.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostDirEntry {
    pub ino: InodeId,
    pub name: String,
}

/// Fixed part of the host dirent record (dev, ino, reclen, padding).
pub const DIRENT_HEADER_LEN: usize = 16;

/// Space one entry consumes in the host's dirent buffer.
pub fn dirent_record_len(name: &str) -> usize {
    DIRENT_HEADER_LEN + name.len() + 1
}

const OPEN_FLAG_MASK: u32 = L_O_ACCMODE
    | L_O_CREAT
    | L_O_EXCL
    | L_O_TRUNC
    | L_O_APPEND
    | L_O_DSYNC
    | L_O_DIRECT
    | L_O_LARGEFILE
    | L_O_DIRECTORY
    | L_O_NOFOLLOW
    | L_O_NOATIME
    | L_O_SYNC;

/// Host open flags follow Linux semantics, so translation is a mask
/// down to the bits the protocol defines.
pub fn translate_open_flags(flags: u32) -> u32 {
    flags & OPEN_FLAG_MASK
}

/// Seed a mode from the qid type until the first getattr lands.
pub fn mode_from_qid(qid: &Qid) -> u32 {
    if qid.is_dir() {
        S_IFDIR | 0o755
    } else if qid.is_symlink() {
        S_IFLNK | 0o777
    } else {
        S_IFREG | 0o644
    }
}
