//! One mounted 9P tree: connection lifecycle, mount options, and the
//! qid-keyed inode cache.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use tracing::{info, warn};

use crate::ninep::client::P9Client;
use crate::ninep::errors::{P9Error, Result};
use crate::ninep::protocol::{Qid, DEFAULT_MSIZE, GETATTR_BASIC, MAX_MSIZE, MIN_MSIZE};
use crate::ninep::transport::TransportRegistry;
use crate::fs::inode::Inode;
use crate::fs::types::{FsInfo, InodeId};

static NEXT_DEV: AtomicU64 = AtomicU64::new(1);

/// Options recognized in the comma-separated mount argument string.
/// Unknown keys are ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountOptions {
    /// Transport tag; matches a registry entry. Required.
    pub tag: String,
    /// Subtree selector presented at attach.
    pub aname: String,
    /// Proposed msize, clamped to the protocol bounds.
    pub msize: u32,
}

impl MountOptions {
    pub fn parse(args: &str) -> Result<Self> {
        let mut tag = None;
        let mut aname = String::new();
        let mut msize = DEFAULT_MSIZE;

        for opt in args.split(',').filter(|s| !s.is_empty()) {
            let (key, value) = match opt.split_once('=') {
                Some((k, v)) => (k, v),
                None => (opt, ""),
            };
            match key {
                "tag" => tag = Some(value.to_string()),
                "aname" => aname = value.to_string(),
                "msize" => {
                    let parsed = value.parse::<u32>().map_err(|_| P9Error::InvalidArgument)?;
                    msize = parsed.clamp(MIN_MSIZE, MAX_MSIZE);
                }
                _ => {} // ignore
            }
        }

        let tag = tag.ok_or(P9Error::InvalidArgument)?;
        if tag.is_empty() {
            return Err(P9Error::InvalidArgument);
        }
        Ok(MountOptions { tag, aname, msize })
    }
}

pub struct Volume {
    client: Arc<P9Client>,
    inodes: DashMap<InodeId, Arc<Inode>>,
    root_id: OnceLock<InodeId>,
    mount_tag: String,
    read_only: bool,
    dev: u64,
}

impl Volume {
    /// Mount: parse options, find the transport, connect, probe the
    /// root, and build the root inode. Returns the volume and the root
    /// inode id.
    pub async fn mount(
        registry: &TransportRegistry,
        device: &str,
        read_only: bool,
        args: &str,
    ) -> Result<(Arc<Volume>, InodeId)> {
        let opts = MountOptions::parse(args)?;

        let transport = registry
            .find(&opts.tag)
            .ok_or(P9Error::DeviceNotReady)?;

        let client = Arc::new(P9Client::new(transport, opts.msize));
        client.connect(&opts.aname).await?;

        let root_attr = match client.getattr(client.root_fid(), GETATTR_BASIC).await {
            Ok(rg) => rg,
            Err(err) => {
                client.disconnect().await;
                return Err(err);
            }
        };

        let volume = Arc::new(Volume {
            client,
            inodes: DashMap::new(),
            root_id: OnceLock::new(),
            mount_tag: opts.tag.clone(),
            read_only,
            dev: NEXT_DEV.fetch_add(1, Ordering::Relaxed),
        });

        let root = match volume.get_inode(volume.client.root_fid(), root_attr.stat.qid).await {
            Ok(inode) => inode,
            Err(err) => {
                volume.client.disconnect().await;
                return Err(err);
            }
        };
        let root_id = root.id();
        let _ = volume.root_id.set(root_id);

        info!(
            device,
            tag = %volume.mount_tag,
            aname = %opts.aname,
            msize = volume.client.msize(),
            read_only,
            root = root_id,
            "mounted 9p volume"
        );
        Ok((volume, root_id))
    }

    /// Drop every cached inode, clunking their fids, then disconnect.
    pub async fn unmount(&self) -> Result<()> {
        let ids: Vec<InodeId> = self.inodes.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            self.put_inode(id).await;
        }
        self.client.disconnect().await;
        info!(tag = %self.mount_tag, "unmounted 9p volume");
        Ok(())
    }

    pub fn client(&self) -> &Arc<P9Client> {
        &self.client
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn dev(&self) -> u64 {
        self.dev
    }

    pub fn mount_tag(&self) -> &str {
        &self.mount_tag
    }

    pub fn root_id(&self) -> Result<InodeId> {
        self.root_id.get().copied().ok_or(P9Error::NoInit)
    }

    /// The caching rule: an inode id is its qid path. If the id is
    /// already cached the incoming fid is redundant and gets clunked;
    /// otherwise the fid becomes the new inode's metadata fid.
    pub async fn get_inode(self: &Arc<Self>, fid: u32, qid: Qid) -> Result<Arc<Inode>> {
        let id = qid.path;

        if let Some(entry) = self.inodes.get(&id) {
            let cached = entry.value().clone();
            drop(entry);
            self.discard_fid(fid, &cached).await;
            return Ok(cached);
        }

        let inode = Arc::new(Inode::new(Arc::downgrade(self), id, fid, qid));
        if let Err(err) = inode.init().await {
            if fid != self.client.root_fid() {
                let _ = self.client.clunk(fid).await;
                self.client.release_fid(fid);
            }
            return Err(err);
        }

        // A concurrent lookup may have cached the id while we were
        // talking to the server; the first one in wins.
        let raced = match self.inodes.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(occupied) => Some(occupied.get().clone()),
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(inode.clone());
                None
            }
        };
        match raced {
            Some(cached) => {
                self.discard_fid(fid, &cached).await;
                Ok(cached)
            }
            None => Ok(inode),
        }
    }

    /// Fetch a cached inode without touching the server.
    pub fn inode_by_id(&self, id: InodeId) -> Option<Arc<Inode>> {
        self.inodes.get(&id).map(|entry| entry.value().clone())
    }

    /// Host put-vnode: forget the inode and clunk its metadata fid. The
    /// root fid stays bound until disconnect.
    pub async fn put_inode(&self, id: InodeId) {
        if let Some((_, inode)) = self.inodes.remove(&id) {
            if inode.fid() != self.client.root_fid() {
                if let Err(err) = self.client.clunk(inode.fid()).await {
                    warn!(ino = id, fid = inode.fid(), %err, "clunk failed on put");
                }
                self.client.release_fid(inode.fid());
            }
        }
    }

    /// Statfs on the root, projected for the host.
    pub async fn read_fs_info(&self) -> Result<FsInfo> {
        let statfs = self.client.statfs(self.client.root_fid()).await?;
        Ok(FsInfo {
            block_size: statfs.bsize,
            io_size: self.client.iounit(),
            total_blocks: statfs.blocks,
            free_blocks: statfs.bfree,
            total_nodes: statfs.files,
            free_nodes: statfs.ffree,
            max_name_len: statfs.namelen,
            volume_name: self.mount_tag.clone(),
            read_only: self.read_only,
            persistent: true,
            supports_attrs: true,
        })
    }

    /// Nothing is dirty volume-wide; files sync individually.
    pub async fn sync(&self) -> Result<()> {
        Ok(())
    }

    async fn discard_fid(&self, fid: u32, cached: &Arc<Inode>) {
        if fid != self.client.root_fid() && fid != cached.fid() {
            let _ = self.client.clunk(fid).await;
            self.client.release_fid(fid);
        }
    }
}
