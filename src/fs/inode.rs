//! Per-node operations: open files, directory iteration, lookup,
//! creation, and stat caching.
//!
//! An inode owns one long-lived metadata fid. Opens and directory
//! iterations clone it into dedicated fids held by cookies, so the
//! metadata fid never changes state server-side. The inode lock
//! serializes everything that clones fids or touches the cached stat.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::ninep::errors::{P9Error, Result};
use crate::ninep::protocol::{
    DirEntry, Qid, AT_REMOVEDIR, GETATTR_ALL, GETATTR_BASIC, L_O_CREAT, L_O_RDONLY,
};
use crate::fs::types::{
    dirent_record_len, mode_from_qid, translate_open_flags, FileStat, HostDirEntry, InodeId,
    SetAttributes, S_IFDIR, S_IFLNK, S_IFMT, S_IFREG,
};
use crate::fs::volume::Volume;

/// Bytes requested per Treaddir refill.
const DIR_BUFFER_SIZE: u32 = 4096;

/// State of one open file.
#[derive(Debug)]
pub struct FileCookie {
    pub(crate) fid: u32,
    pub flags: u32,
    pub position: u64,
}

/// State of one directory iteration: a dedicated fid, the server
/// continuation offset, and the read-ahead buffer.
#[derive(Debug)]
pub struct DirCookie {
    pub(crate) fid: u32,
    offset: u64,
    buf: Vec<u8>,
    pos: usize,
    eof: bool,
}

pub struct Inode {
    volume: Weak<Volume>,
    id: InodeId,
    fid: u32,
    qid: Qid,
    mode: AtomicU32,
    size: AtomicU64,
    stat_valid: AtomicBool,
    lock: Mutex<()>,
}

impl Inode {
    pub(crate) fn new(volume: Weak<Volume>, id: InodeId, fid: u32, qid: Qid) -> Self {
        Inode {
            volume,
            id,
            fid,
            qid,
            mode: AtomicU32::new(mode_from_qid(&qid)),
            size: AtomicU64::new(0),
            stat_valid: AtomicBool::new(false),
            lock: Mutex::new(()),
        }
    }

    /// Prime the stat cache from the server.
    pub(crate) async fn init(&self) -> Result<()> {
        let vol = self.volume()?;
        let rg = vol.client().getattr(self.fid, GETATTR_BASIC).await?;
        self.mode.store(rg.stat.mode, Ordering::Relaxed);
        self.size.store(rg.stat.size, Ordering::Relaxed);
        self.stat_valid.store(true, Ordering::Relaxed);
        Ok(())
    }

    pub fn id(&self) -> InodeId {
        self.id
    }

    pub fn fid(&self) -> u32 {
        self.fid
    }

    pub fn qid(&self) -> &Qid {
        &self.qid
    }

    pub fn mode(&self) -> u32 {
        self.mode.load(Ordering::Relaxed)
    }

    pub fn cached_size(&self) -> u64 {
        self.size.load(Ordering::Relaxed)
    }

    pub fn is_dir(&self) -> bool {
        self.mode() & S_IFMT == S_IFDIR
    }

    pub fn is_file(&self) -> bool {
        self.mode() & S_IFMT == S_IFREG
    }

    pub fn is_symlink(&self) -> bool {
        self.mode() & S_IFMT == S_IFLNK
    }

    fn volume(&self) -> Result<Arc<Volume>> {
        self.volume.upgrade().ok_or(P9Error::NoInit)
    }

    /// Clone the metadata fid and lopen the clone.
    pub async fn open(&self, flags: u32) -> Result<FileCookie> {
        debug!(ino = self.id, flags, "open");
        let vol = self.volume()?;
        let client = vol.client();

        let _guard = self.lock.lock().await;

        let newfid = client.allocate_fid()?;
        client.walk(self.fid, newfid, "").await?;
        if let Err(err) = client.lopen(newfid, translate_open_flags(flags)).await {
            let _ = client.clunk(newfid).await;
            client.release_fid(newfid);
            return Err(err);
        }

        Ok(FileCookie { fid: newfid, flags, position: 0 })
    }

    /// Clunk a cookie's fid and give the slot back.
    pub async fn free_cookie(&self, cookie: FileCookie) {
        let Ok(vol) = self.volume() else { return };
        let client = vol.client();
        if let Err(err) = client.clunk(cookie.fid).await {
            warn!(ino = self.id, fid = cookie.fid, %err, "clunk of file cookie failed");
        }
        client.release_fid(cookie.fid);
    }

    /// Read at `pos`, chopping the transfer into iounit-sized RPCs. A
    /// short reply ends the loop and the accumulated count is returned.
    pub async fn read(&self, cookie: &FileCookie, pos: u64, buf: &mut [u8]) -> Result<usize> {
        let vol = self.volume()?;
        let client = vol.client();
        let iounit = client.iounit() as usize;

        let mut total = 0;
        while total < buf.len() {
            let chunk = (buf.len() - total).min(iounit);
            let n = client
                .read(cookie.fid, pos + total as u64, &mut buf[total..total + chunk])
                .await?;
            total += n;
            if n < chunk {
                break; // EOF or partial
            }
        }
        Ok(total)
    }

    /// Write at `pos` with the same chunking rule as `read`. Invalidates
    /// the cached size.
    pub async fn write(&self, cookie: &FileCookie, pos: u64, data: &[u8]) -> Result<usize> {
        let vol = self.volume()?;
        if vol.is_read_only() {
            return Err(P9Error::ReadOnly);
        }
        let client = vol.client();
        let iounit = client.iounit() as usize;

        let mut total = 0;
        while total < data.len() {
            let chunk = (data.len() - total).min(iounit);
            let n = client
                .write(cookie.fid, pos + total as u64, &data[total..total + chunk])
                .await?;
            total += n;
            if n < chunk {
                break;
            }
        }

        self.stat_valid.store(false, Ordering::Relaxed);
        Ok(total)
    }

    /// Resolve `name` to an inode id, materializing the inode in the
    /// volume cache if it is not already there.
    pub async fn lookup(&self, name: &str) -> Result<InodeId> {
        if !self.is_dir() {
            return Err(P9Error::NotADirectory);
        }
        if name == "." {
            return Ok(self.id);
        }

        let vol = self.volume()?;
        let (child_fid, qid) = self.walk_to_child(name).await?;
        let inode = vol.get_inode(child_fid, qid).await?;
        Ok(inode.id())
    }

    /// Create and open a file under this directory.
    pub async fn create(&self, name: &str, flags: u32, perms: u32) -> Result<(FileCookie, InodeId)> {
        debug!(ino = self.id, name, perms, "create");
        if !self.is_dir() {
            return Err(P9Error::NotADirectory);
        }
        let vol = self.volume()?;
        if vol.is_read_only() {
            return Err(P9Error::ReadOnly);
        }
        let client = vol.client();

        let _guard = self.lock.lock().await;

        // Lcreate rebinds the fid to the new file, so work on a clone.
        let open_fid = client.allocate_fid()?;
        client.walk(self.fid, open_fid, "").await?;

        let p9_flags = translate_open_flags(flags) | L_O_CREAT;
        let mode = S_IFREG | (perms & 0o7777);
        let qid = match client.lcreate(open_fid, name, p9_flags, mode, 0).await {
            Ok((qid, _iounit)) => qid,
            Err(err) => {
                let _ = client.clunk(open_fid).await;
                client.release_fid(open_fid);
                return Err(err);
            }
        };

        // A separate metadata fid backs the new inode.
        let inode = match self.walk_to_child(name).await {
            Ok((meta_fid, meta_qid)) => {
                debug_assert_eq!(meta_qid.path, qid.path);
                vol.get_inode(meta_fid, meta_qid).await
            }
            Err(err) => Err(err),
        };
        match inode {
            Ok(inode) => Ok((FileCookie { fid: open_fid, flags, position: 0 }, inode.id())),
            Err(err) => {
                let _ = client.clunk(open_fid).await;
                client.release_fid(open_fid);
                Err(err)
            }
        }
    }

    /// Open a dedicated fid for directory iteration.
    pub async fn open_dir(&self) -> Result<DirCookie> {
        if !self.is_dir() {
            return Err(P9Error::NotADirectory);
        }
        let vol = self.volume()?;
        let client = vol.client();

        let _guard = self.lock.lock().await;

        let newfid = client.allocate_fid()?;
        client.walk(self.fid, newfid, "").await?;
        if let Err(err) = client.lopen(newfid, L_O_RDONLY).await {
            let _ = client.clunk(newfid).await;
            client.release_fid(newfid);
            return Err(err);
        }

        Ok(DirCookie {
            fid: newfid,
            offset: 0,
            buf: Vec::new(),
            pos: 0,
            eof: false,
        })
    }

    pub async fn free_dir_cookie(&self, cookie: DirCookie) {
        let Ok(vol) = self.volume() else { return };
        let client = vol.client();
        if let Err(err) = client.clunk(cookie.fid).await {
            warn!(ino = self.id, fid = cookie.fid, %err, "clunk of dir cookie failed");
        }
        client.release_fid(cookie.fid);
    }

    /// Emit up to `max` entries that fit in `buffer_size` bytes of host
    /// dirent records. Refills the read-ahead buffer with Treaddir as
    /// needed; an entry that does not fit ends the batch, and is an
    /// overflow error only if nothing was emitted.
    pub async fn read_dir(
        &self,
        cookie: &mut DirCookie,
        buffer_size: usize,
        max: u32,
    ) -> Result<Vec<HostDirEntry>> {
        let vol = self.volume()?;
        let client = vol.client();

        let mut out = Vec::new();
        let mut budget = buffer_size;

        while (out.len() as u32) < max {
            if cookie.pos >= cookie.buf.len() {
                if cookie.eof {
                    break;
                }
                cookie.buf = client
                    .readdir(cookie.fid, cookie.offset, DIR_BUFFER_SIZE)
                    .await?;
                cookie.pos = 0;
                if cookie.buf.is_empty() {
                    cookie.eof = true;
                    break;
                }
            }

            let (entry, used) = DirEntry::parse(&cookie.buf[cookie.pos..])?;
            let name = entry
                .name
                .as_str()
                .map_err(|_| P9Error::InvalidArgument)?
                .to_string();

            let record = dirent_record_len(&name);
            if record > budget {
                if out.is_empty() {
                    return Err(P9Error::BufferOverflow);
                }
                break;
            }
            budget -= record;

            cookie.pos += used;
            cookie.offset = entry.offset;
            out.push(HostDirEntry { ino: entry.qid.path, name });
        }

        Ok(out)
    }

    /// Restart iteration from the beginning.
    pub fn rewind_dir(&self, cookie: &mut DirCookie) {
        cookie.offset = 0;
        cookie.buf.clear();
        cookie.pos = 0;
        cookie.eof = false;
    }

    /// Unlink a file under this directory.
    pub async fn remove(&self, name: &str) -> Result<()> {
        debug!(ino = self.id, name, "remove");
        if !self.is_dir() {
            return Err(P9Error::NotADirectory);
        }
        let vol = self.volume()?;
        if vol.is_read_only() {
            return Err(P9Error::ReadOnly);
        }
        let _guard = self.lock.lock().await;
        vol.client().unlinkat(self.fid, name, 0).await
    }

    /// Unlink a subdirectory.
    pub async fn remove_dir(&self, name: &str) -> Result<()> {
        debug!(ino = self.id, name, "rmdir");
        if !self.is_dir() {
            return Err(P9Error::NotADirectory);
        }
        let vol = self.volume()?;
        if vol.is_read_only() {
            return Err(P9Error::ReadOnly);
        }
        let _guard = self.lock.lock().await;
        vol.client().unlinkat(self.fid, name, AT_REMOVEDIR).await
    }

    /// Rename `from_name` here to `to_name` under `to_dir`, which may be
    /// a different directory.
    pub async fn rename(&self, from_name: &str, to_dir: &Inode, to_name: &str) -> Result<()> {
        debug!(ino = self.id, from_name, to = to_dir.id, to_name, "rename");
        if !self.is_dir() || !to_dir.is_dir() {
            return Err(P9Error::NotADirectory);
        }
        let vol = self.volume()?;
        if vol.is_read_only() {
            return Err(P9Error::ReadOnly);
        }
        vol.client()
            .renameat(self.fid, from_name, to_dir.fid, to_name)
            .await
    }

    pub async fn create_dir(&self, name: &str, perms: u32) -> Result<()> {
        debug!(ino = self.id, name, perms, "mkdir");
        if !self.is_dir() {
            return Err(P9Error::NotADirectory);
        }
        let vol = self.volume()?;
        if vol.is_read_only() {
            return Err(P9Error::ReadOnly);
        }
        let mode = S_IFDIR | (perms & 0o7777);
        vol.client().mkdir(self.fid, name, mode, 0).await.map(|_qid| ())
    }

    pub async fn create_symlink(&self, name: &str, target: &str) -> Result<()> {
        debug!(ino = self.id, name, target, "symlink");
        if !self.is_dir() {
            return Err(P9Error::NotADirectory);
        }
        let vol = self.volume()?;
        if vol.is_read_only() {
            return Err(P9Error::ReadOnly);
        }
        vol.client().symlink(self.fid, name, target, 0).await.map(|_qid| ())
    }

    /// Hard-link `target` as `name` under this directory.
    pub async fn create_link(&self, name: &str, target: &Inode) -> Result<()> {
        debug!(ino = self.id, name, target = target.id, "link");
        if !self.is_dir() {
            return Err(P9Error::NotADirectory);
        }
        let vol = self.volume()?;
        if vol.is_read_only() {
            return Err(P9Error::ReadOnly);
        }
        vol.client().link(self.fid, target.fid, name).await
    }

    /// Read this symlink's target; bounded by `max_len`.
    pub async fn read_link(&self, max_len: usize) -> Result<String> {
        if !self.is_symlink() {
            return Err(P9Error::InvalidArgument);
        }
        let vol = self.volume()?;
        vol.client().readlink(self.fid, max_len).await
    }

    pub async fn sync(&self) -> Result<()> {
        let vol = self.volume()?;
        if vol.is_read_only() {
            return Ok(());
        }
        vol.client().fsync(self.fid, false).await
    }

    /// Fetch fresh attributes and refresh the cache.
    pub async fn read_stat(&self) -> Result<FileStat> {
        let vol = self.volume()?;
        let _guard = self.lock.lock().await;

        let rg = vol.client().getattr(self.fid, GETATTR_ALL).await?;
        let stat = FileStat::from_wire(vol.dev(), self.id, &rg.stat);

        self.mode.store(stat.mode, Ordering::Relaxed);
        self.size.store(stat.size, Ordering::Relaxed);
        self.stat_valid.store(true, Ordering::Relaxed);

        Ok(stat)
    }

    /// Push selected attributes and drop the stat cache.
    pub async fn write_stat(&self, attrs: &SetAttributes) -> Result<()> {
        let vol = self.volume()?;
        if vol.is_read_only() {
            return Err(P9Error::ReadOnly);
        }
        if attrs.is_empty() {
            return Ok(());
        }
        let _guard = self.lock.lock().await;

        let (valid, mode, uid, gid, size, atime, mtime) = attrs.to_wire();
        vol.client()
            .setattr(self.fid, valid, mode, uid, gid, size, atime, mtime)
            .await?;

        self.stat_valid.store(false, Ordering::Relaxed);
        Ok(())
    }

    /// Walk one component to a fresh fid. The caller owns the returned
    /// fid.
    pub(crate) async fn walk_to_child(&self, name: &str) -> Result<(u32, Qid)> {
        // A name with no components would clone instead of walking.
        if name.split('/').all(str::is_empty) {
            return Err(P9Error::InvalidArgument);
        }
        let vol = self.volume()?;
        let client = vol.client();

        let child_fid = client.allocate_fid()?;
        match client.walk(self.fid, child_fid, name).await? {
            Some(qid) => Ok((child_fid, qid)),
            None => {
                // clone: the server bound the fid but produced no child qid
                let _ = client.clunk(child_fid).await;
                client.release_fid(child_fid);
                Err(P9Error::NotFound)
            }
        }
    }
}
