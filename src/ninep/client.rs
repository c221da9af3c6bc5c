//! 9P2000.L transaction client.
//!
//! One method per protocol operation. Every transaction runs the same
//! template: allocate a tag, serialize the T-message, send and receive
//! under the request lock, release the tag, then type-check the reply.
//! The request lock admits one transaction at a time, which together
//! with the transport's one-frame-at-a-time contract keeps requests and
//! responses paired by position as well as by tag.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::errors::{P9Error, Result};
use super::pool::{FidPool, TagPool};
use super::protocol::*;
use super::transport::Transport;

pub struct P9Client {
    transport: Arc<dyn Transport>,
    fids: FidPool,
    tags: TagPool,
    msize: AtomicU32,
    iounit: AtomicU32,
    connected: AtomicBool,
    request_lock: Mutex<()>,
}

impl P9Client {
    /// The msize proposal is clamped to what the transport can carry.
    pub fn new(transport: Arc<dyn Transport>, msize: u32) -> Self {
        let msize = msize
            .clamp(MIN_MSIZE, MAX_MSIZE)
            .min(transport.max_message_size());
        P9Client {
            transport,
            fids: FidPool::default(),
            tags: TagPool::default(),
            msize: AtomicU32::new(msize),
            iounit: AtomicU32::new(msize - IO_OVERHEAD),
            connected: AtomicBool::new(false),
            request_lock: Mutex::new(()),
        }
    }

    pub fn msize(&self) -> u32 {
        self.msize.load(Ordering::Relaxed)
    }

    /// Largest read or write payload per RPC.
    pub fn iounit(&self) -> u32 {
        self.iounit.load(Ordering::Relaxed)
    }

    pub fn root_fid(&self) -> u32 {
        ROOT_FID
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn allocate_fid(&self) -> Result<u32> {
        self.fids.allocate().ok_or(P9Error::TooManyHandles)
    }

    pub fn release_fid(&self, fid: u32) {
        self.fids.release(fid);
    }

    /// Fids currently marked in use, the root included.
    pub fn fids_in_use(&self) -> usize {
        self.fids.in_use()
    }

    pub fn tags_in_use(&self) -> usize {
        self.tags.in_use()
    }

    /// Negotiate the protocol version and attach to the server root.
    ///
    /// The root binds to the reserved fid 0. On a failed attach the
    /// reservation is dropped so a torn-down client leaves no fid
    /// marked in use.
    pub async fn connect(&self, aname: &str) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }

        let proposed = self.msize();
        let reply = self
            .transact(
                NOTAG,
                Message::Tversion(Tversion {
                    msize: proposed,
                    version: P9String::new(VERSION_9P2000L),
                }),
            )
            .await?;
        let rv = match reply {
            Message::Rversion(rv) => rv,
            other => return Err(P9Error::protocol(format!("bad Rversion: {other:?}"))),
        };

        let server_version = rv.version.as_str().map_err(|_| P9Error::InvalidArgument)?;
        if server_version != VERSION_9P2000L {
            warn!(%server_version, "server does not speak 9P2000.L");
            return Err(P9Error::NotSupported);
        }
        if rv.msize < MIN_MSIZE {
            return Err(P9Error::protocol(format!("server msize {} too small", rv.msize)));
        }

        let msize = proposed.min(rv.msize);
        self.msize.store(msize, Ordering::Relaxed);
        self.iounit.store(msize - IO_OVERHEAD, Ordering::Relaxed);

        // Attach with no auth fid; root lands on the reserved slot.
        self.fids.reserve(ROOT_FID);
        let attach = self
            .rpc(Message::Tattach(Tattach {
                fid: ROOT_FID,
                afid: NOFID,
                uname: P9String::new(""),
                aname: P9String::new(aname),
                n_uname: NONUNAME,
            }))
            .await;
        match attach {
            Ok(Message::Rattach(ra)) => {
                debug!(msize, iounit = self.iounit(), qid = ?ra.qid, "attached");
                self.connected.store(true, Ordering::Relaxed);
                Ok(())
            }
            Ok(other) => {
                self.fids.release(ROOT_FID);
                Err(P9Error::protocol(format!("bad Rattach: {other:?}")))
            }
            Err(err) => {
                self.fids.release(ROOT_FID);
                Err(err)
            }
        }
    }

    /// Clunk the root (best effort) and drop the connection state.
    pub async fn disconnect(&self) {
        if !self.is_connected() {
            return;
        }
        if let Err(err) = self.clunk(ROOT_FID).await {
            warn!(%err, "clunk of root fid failed during disconnect");
        }
        self.fids.release(ROOT_FID);
        self.connected.store(false, Ordering::Relaxed);
    }

    /// One transaction with a caller-supplied tag. Only Tversion passes
    /// NOTAG; everything else goes through `rpc`.
    async fn transact(&self, tag: u16, body: Message) -> Result<Message> {
        let expected = body.type_code() + 1;
        let frame = P9Message::new(tag, body).to_bytes()?;
        if frame.len() > self.msize() as usize {
            return Err(P9Error::BufferOverflow);
        }

        let reply = {
            let _guard = self.request_lock.lock().await;
            self.transport.send(&frame).await?;
            self.transport.receive().await?
        };

        if reply.len() > self.msize() as usize {
            return Err(P9Error::protocol(format!(
                "oversize reply: {} bytes",
                reply.len()
            )));
        }
        let resp = P9Message::parse(&reply)?;
        if resp.tag != tag {
            return Err(P9Error::protocol(format!(
                "tag mismatch: sent {tag}, got {}",
                resp.tag
            )));
        }
        match resp.body {
            Message::Rlerror(e) => Err(P9Error::from_errno(e.ecode)),
            body if resp.type_ == expected => Ok(body),
            body => Err(P9Error::protocol(format!(
                "unexpected response type {} (expected {expected}): {body:?}",
                resp.type_
            ))),
        }
    }

    /// Allocate a tag, run the transaction, release the tag on every path.
    async fn rpc(&self, body: Message) -> Result<Message> {
        let tag = self.tags.allocate().ok_or(P9Error::TooManyHandles)?;
        let result = self.transact(tag, body).await;
        self.tags.release(tag);
        result
    }

    /// Walk from `fid` to `newfid` along a slash-separated path. An
    /// empty path clones the fid. Returns the qid of the final
    /// component, or None for a pure clone.
    ///
    /// On any failure, including a partial walk (the server matched
    /// fewer components than requested and left `newfid` unbound),
    /// `newfid` is released from the pool before returning.
    pub async fn walk(&self, fid: u32, newfid: u32, path: &str) -> Result<Option<Qid>> {
        let names: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        match self.walk_names(fid, newfid, &names).await {
            Ok(qids) if qids.len() < names.len() => {
                self.fids.release(newfid);
                Err(P9Error::NotFound)
            }
            Ok(qids) => Ok(qids.last().copied()),
            Err(err) => {
                self.fids.release(newfid);
                Err(err)
            }
        }
    }

    /// Raw Twalk. The caller owns `newfid` cleanup.
    pub async fn walk_names(&self, fid: u32, newfid: u32, names: &[&str]) -> Result<Vec<Qid>> {
        debug!(fid, newfid, ?names, "walk");
        let tw = Twalk {
            fid,
            newfid,
            nwname: names.len() as u16,
            wnames: names.iter().map(|n| P9String::new(n)).collect(),
        };
        match self.rpc(Message::Twalk(tw)).await? {
            Message::Rwalk(rw) => {
                if rw.wqids.len() > names.len() {
                    return Err(P9Error::protocol("walk returned too many qids"));
                }
                Ok(rw.wqids)
            }
            other => Err(P9Error::protocol(format!("bad Rwalk: {other:?}"))),
        }
    }

    /// Lopen. A zero server iounit falls back to the negotiated default.
    pub async fn lopen(&self, fid: u32, flags: u32) -> Result<(Qid, u32)> {
        debug!(fid, flags, "lopen");
        match self.rpc(Message::Tlopen(Tlopen { fid, flags })).await? {
            Message::Rlopen(rl) => {
                let iounit = if rl.iounit > 0 { rl.iounit } else { self.iounit() };
                Ok((rl.qid, iounit))
            }
            other => Err(P9Error::protocol(format!("bad Rlopen: {other:?}"))),
        }
    }

    /// Lcreate: atomically create `name` under the directory bound to
    /// `fid` and rebind `fid` to the new file. Clone first if the
    /// directory fid must survive.
    pub async fn lcreate(
        &self,
        fid: u32,
        name: &str,
        flags: u32,
        mode: u32,
        gid: u32,
    ) -> Result<(Qid, u32)> {
        debug!(fid, name, flags, "lcreate");
        let tc = Tlcreate {
            fid,
            name: P9String::new(name),
            flags,
            mode,
            gid,
        };
        match self.rpc(Message::Tlcreate(tc)).await? {
            Message::Rlcreate(rc) => {
                let iounit = if rc.iounit > 0 { rc.iounit } else { self.iounit() };
                Ok((rc.qid, iounit))
            }
            other => Err(P9Error::protocol(format!("bad Rlcreate: {other:?}"))),
        }
    }

    /// Read into `buf`, capped at one iounit. Short reads are the
    /// caller's to loop over.
    pub async fn read(&self, fid: u32, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let count = u32::try_from(buf.len()).unwrap_or(u32::MAX).min(self.iounit());
        match self.rpc(Message::Tread(Tread { fid, offset, count })).await? {
            Message::Rread(rr) => {
                if rr.data.len() > buf.len() {
                    return Err(P9Error::protocol("read reply exceeds request"));
                }
                buf[..rr.data.len()].copy_from_slice(&rr.data);
                Ok(rr.data.len())
            }
            other => Err(P9Error::protocol(format!("bad Rread: {other:?}"))),
        }
    }

    /// Write from `data`, capped at one iounit. Returns the count the
    /// server accepted.
    pub async fn write(&self, fid: u32, offset: u64, data: &[u8]) -> Result<usize> {
        let count = u32::try_from(data.len())
            .unwrap_or(u32::MAX)
            .min(self.iounit()) as usize;
        let tw = Twrite {
            fid,
            offset,
            count: count as u32,
            data: data[..count].to_vec(),
        };
        match self.rpc(Message::Twrite(tw)).await? {
            Message::Rwrite(rw) => {
                if rw.count as usize > count {
                    return Err(P9Error::protocol("write reply exceeds request"));
                }
                Ok(rw.count as usize)
            }
            other => Err(P9Error::protocol(format!("bad Rwrite: {other:?}"))),
        }
    }

    /// Release a fid server-side. The pool slot is the caller's.
    pub async fn clunk(&self, fid: u32) -> Result<()> {
        debug!(fid, "clunk");
        match self.rpc(Message::Tclunk(Tclunk { fid })).await? {
            Message::Rclunk(_) => Ok(()),
            other => Err(P9Error::protocol(format!("bad Rclunk: {other:?}"))),
        }
    }

    /// Legacy remove-by-fid. The server clunks the fid whether or not
    /// the unlink succeeds, so the pool slot is released on every path.
    pub async fn remove(&self, fid: u32) -> Result<()> {
        debug!(fid, "remove");
        let result = self.rpc(Message::Tremove(Tremove { fid })).await;
        self.fids.release(fid);
        match result? {
            Message::Rremove(_) => Ok(()),
            other => Err(P9Error::protocol(format!("bad Rremove: {other:?}"))),
        }
    }

    /// Getattr always carries the full 17-field record; `mask` advises
    /// the server which fields to compute.
    pub async fn getattr(&self, fid: u32, mask: u64) -> Result<Rgetattr> {
        match self
            .rpc(Message::Tgetattr(Tgetattr { fid, request_mask: mask }))
            .await?
        {
            Message::Rgetattr(rg) => Ok(rg),
            other => Err(P9Error::protocol(format!("bad Rgetattr: {other:?}"))),
        }
    }

    /// Setattr writes only the fields selected by `valid`.
    #[allow(clippy::too_many_arguments)]
    pub async fn setattr(
        &self,
        fid: u32,
        valid: u32,
        mode: u32,
        uid: u32,
        gid: u32,
        size: u64,
        atime: (u64, u64),
        mtime: (u64, u64),
    ) -> Result<()> {
        let ts = Tsetattr {
            fid,
            valid,
            mode,
            uid,
            gid,
            size,
            atime_sec: atime.0,
            atime_nsec: atime.1,
            mtime_sec: mtime.0,
            mtime_nsec: mtime.1,
        };
        match self.rpc(Message::Tsetattr(ts)).await? {
            Message::Rsetattr(_) => Ok(()),
            other => Err(P9Error::protocol(format!("bad Rsetattr: {other:?}"))),
        }
    }

    /// One Treaddir chunk. Returns the raw entry stream; `offset` is the
    /// server continuation cookie from the last consumed entry.
    pub async fn readdir(&self, fid: u32, offset: u64, count: u32) -> Result<Vec<u8>> {
        let count = count.min(self.iounit());
        match self
            .rpc(Message::Treaddir(Treaddir { fid, offset, count }))
            .await?
        {
            Message::Rreaddir(rd) => Ok(rd.data),
            other => Err(P9Error::protocol(format!("bad Rreaddir: {other:?}"))),
        }
    }

    pub async fn mkdir(&self, dfid: u32, name: &str, mode: u32, gid: u32) -> Result<Qid> {
        debug!(dfid, name, mode, "mkdir");
        let tm = Tmkdir {
            dfid,
            name: P9String::new(name),
            mode,
            gid,
        };
        match self.rpc(Message::Tmkdir(tm)).await? {
            Message::Rmkdir(rm) => Ok(rm.qid),
            other => Err(P9Error::protocol(format!("bad Rmkdir: {other:?}"))),
        }
    }

    /// Unlinkat: `flags` is 0 for files, AT_REMOVEDIR for directories.
    pub async fn unlinkat(&self, dfid: u32, name: &str, flags: u32) -> Result<()> {
        debug!(dfid, name, flags, "unlinkat");
        let tu = Tunlinkat {
            dirfid: dfid,
            name: P9String::new(name),
            flags,
        };
        match self.rpc(Message::Tunlinkat(tu)).await? {
            Message::Runlinkat(_) => Ok(()),
            other => Err(P9Error::protocol(format!("bad Runlinkat: {other:?}"))),
        }
    }

    /// Renameat supports cross-directory renames; neither fid changes.
    pub async fn renameat(
        &self,
        old_dfid: u32,
        old_name: &str,
        new_dfid: u32,
        new_name: &str,
    ) -> Result<()> {
        debug!(old_dfid, old_name, new_dfid, new_name, "renameat");
        let tr = Trenameat {
            olddirfid: old_dfid,
            oldname: P9String::new(old_name),
            newdirfid: new_dfid,
            newname: P9String::new(new_name),
        };
        match self.rpc(Message::Trenameat(tr)).await? {
            Message::Rrenameat(_) => Ok(()),
            other => Err(P9Error::protocol(format!("bad Rrenameat: {other:?}"))),
        }
    }

    pub async fn statfs(&self, fid: u32) -> Result<Rstatfs> {
        match self.rpc(Message::Tstatfs(Tstatfs { fid })).await? {
            Message::Rstatfs(rs) => Ok(rs),
            other => Err(P9Error::protocol(format!("bad Rstatfs: {other:?}"))),
        }
    }

    pub async fn fsync(&self, fid: u32, data_only: bool) -> Result<()> {
        let tf = Tfsync {
            fid,
            datasync: data_only as u32,
        };
        match self.rpc(Message::Tfsync(tf)).await? {
            Message::Rfsync(_) => Ok(()),
            other => Err(P9Error::protocol(format!("bad Rfsync: {other:?}"))),
        }
    }

    /// Read a symlink target. A target that would not fit the caller's
    /// bound is an error, not a truncation.
    pub async fn readlink(&self, fid: u32, max_len: usize) -> Result<String> {
        match self.rpc(Message::Treadlink(Treadlink { fid })).await? {
            Message::Rreadlink(rl) => {
                let target = rl
                    .target
                    .as_str()
                    .map_err(|_| P9Error::InvalidArgument)?
                    .to_string();
                if target.len() >= max_len {
                    return Err(P9Error::NameTooLong);
                }
                Ok(target)
            }
            other => Err(P9Error::protocol(format!("bad Rreadlink: {other:?}"))),
        }
    }

    pub async fn symlink(&self, dfid: u32, name: &str, target: &str, gid: u32) -> Result<Qid> {
        debug!(dfid, name, target, "symlink");
        let ts = Tsymlink {
            dfid,
            name: P9String::new(name),
            symtgt: P9String::new(target),
            gid,
        };
        match self.rpc(Message::Tsymlink(ts)).await? {
            Message::Rsymlink(rs) => Ok(rs.qid),
            other => Err(P9Error::protocol(format!("bad Rsymlink: {other:?}"))),
        }
    }

    /// Hard-link the file bound to `fid` as `name` under `dfid`.
    pub async fn link(&self, dfid: u32, fid: u32, name: &str) -> Result<()> {
        debug!(dfid, fid, name, "link");
        let tl = Tlink {
            dfid,
            fid,
            name: P9String::new(name),
        };
        match self.rpc(Message::Tlink(tl)).await? {
            Message::Rlink(_) => Ok(()),
            other => Err(P9Error::protocol(format!("bad Rlink: {other:?}"))),
        }
    }
}
