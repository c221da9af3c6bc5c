//! Host-facing operation set.
//!
//! [`VfsOps`] enumerates every callback the host VFS layer drives, and
//! [`NinePFs`] is the thin dispatch that resolves node ids and forwards
//! to [`Inode`]/[`Volume`] methods. Paging, async I/O, attribute
//! directories, queries and index operations are intentionally absent;
//! access checks are delegated to the server via operation errors.

use std::sync::Arc;

use async_trait::async_trait;

use crate::ninep::errors::{P9Error, Result};
use crate::ninep::transport::TransportRegistry;
use crate::fs::inode::{DirCookie, FileCookie, Inode};
use crate::fs::types::{FileStat, FsInfo, HostDirEntry, InodeId, SetAttributes};
use crate::fs::volume::Volume;

#[async_trait]
pub trait VfsOps {
    // volume
    async fn read_fs_info(&self) -> Result<FsInfo>;
    async fn sync_fs(&self) -> Result<()>;
    async fn unmount(&self) -> Result<()>;

    // vnodes
    async fn lookup(&self, dir: InodeId, name: &str) -> Result<InodeId>;
    async fn put_vnode(&self, id: InodeId) -> Result<()>;
    async fn remove_vnode(&self, id: InodeId) -> Result<()>;

    // files
    async fn open(&self, id: InodeId, flags: u32) -> Result<FileCookie>;
    async fn close(&self, id: InodeId, cookie: &mut FileCookie) -> Result<()>;
    async fn free_cookie(&self, id: InodeId, cookie: FileCookie) -> Result<()>;
    async fn read(&self, id: InodeId, cookie: &FileCookie, pos: u64, buf: &mut [u8])
        -> Result<usize>;
    async fn write(&self, id: InodeId, cookie: &FileCookie, pos: u64, data: &[u8])
        -> Result<usize>;
    async fn create(&self, dir: InodeId, name: &str, flags: u32, perms: u32)
        -> Result<(FileCookie, InodeId)>;
    async fn unlink(&self, dir: InodeId, name: &str) -> Result<()>;
    async fn rename(&self, from_dir: InodeId, from_name: &str, to_dir: InodeId, to_name: &str)
        -> Result<()>;

    // directories
    async fn mkdir(&self, dir: InodeId, name: &str, perms: u32) -> Result<()>;
    async fn rmdir(&self, dir: InodeId, name: &str) -> Result<()>;
    async fn open_dir(&self, id: InodeId) -> Result<DirCookie>;
    async fn close_dir(&self, id: InodeId, cookie: &mut DirCookie) -> Result<()>;
    async fn free_dir_cookie(&self, id: InodeId, cookie: DirCookie) -> Result<()>;
    async fn read_dir(
        &self,
        id: InodeId,
        cookie: &mut DirCookie,
        buffer_size: usize,
        max: u32,
    ) -> Result<Vec<HostDirEntry>>;
    async fn rewind_dir(&self, id: InodeId, cookie: &mut DirCookie) -> Result<()>;

    // attributes and links
    async fn read_stat(&self, id: InodeId) -> Result<FileStat>;
    async fn write_stat(&self, id: InodeId, attrs: &SetAttributes) -> Result<()>;
    async fn read_link(&self, id: InodeId, max_len: usize) -> Result<String>;
    async fn create_symlink(&self, dir: InodeId, name: &str, target: &str) -> Result<()>;
    async fn fsync(&self, id: InodeId) -> Result<()>;
}

/// A mounted 9P file system as the host sees it.
pub struct NinePFs {
    volume: Arc<Volume>,
}

impl NinePFs {
    /// Mount and return the file system plus its root node id.
    pub async fn mount(
        registry: &TransportRegistry,
        device: &str,
        read_only: bool,
        args: &str,
    ) -> Result<(NinePFs, InodeId)> {
        let (volume, root_id) = Volume::mount(registry, device, read_only, args).await?;
        Ok((NinePFs { volume }, root_id))
    }

    pub fn volume(&self) -> &Arc<Volume> {
        &self.volume
    }

    fn inode(&self, id: InodeId) -> Result<Arc<Inode>> {
        self.volume.inode_by_id(id).ok_or(P9Error::NotFound)
    }
}

#[async_trait]
impl VfsOps for NinePFs {
    async fn read_fs_info(&self) -> Result<FsInfo> {
        self.volume.read_fs_info().await
    }

    async fn sync_fs(&self) -> Result<()> {
        self.volume.sync().await
    }

    async fn unmount(&self) -> Result<()> {
        self.volume.unmount().await
    }

    async fn lookup(&self, dir: InodeId, name: &str) -> Result<InodeId> {
        self.inode(dir)?.lookup(name).await
    }

    async fn put_vnode(&self, id: InodeId) -> Result<()> {
        self.volume.put_inode(id).await;
        Ok(())
    }

    async fn remove_vnode(&self, id: InodeId) -> Result<()> {
        // the node was unlinked server-side; only local state remains
        self.volume.put_inode(id).await;
        Ok(())
    }

    async fn open(&self, id: InodeId, flags: u32) -> Result<FileCookie> {
        self.inode(id)?.open(flags).await
    }

    async fn close(&self, _id: InodeId, _cookie: &mut FileCookie) -> Result<()> {
        // teardown happens in free_cookie
        Ok(())
    }

    async fn free_cookie(&self, id: InodeId, cookie: FileCookie) -> Result<()> {
        self.inode(id)?.free_cookie(cookie).await;
        Ok(())
    }

    async fn read(
        &self,
        id: InodeId,
        cookie: &FileCookie,
        pos: u64,
        buf: &mut [u8],
    ) -> Result<usize> {
        self.inode(id)?.read(cookie, pos, buf).await
    }

    async fn write(
        &self,
        id: InodeId,
        cookie: &FileCookie,
        pos: u64,
        data: &[u8],
    ) -> Result<usize> {
        self.inode(id)?.write(cookie, pos, data).await
    }

    async fn create(
        &self,
        dir: InodeId,
        name: &str,
        flags: u32,
        perms: u32,
    ) -> Result<(FileCookie, InodeId)> {
        self.inode(dir)?.create(name, flags, perms).await
    }

    async fn unlink(&self, dir: InodeId, name: &str) -> Result<()> {
        self.inode(dir)?.remove(name).await
    }

    async fn rename(
        &self,
        from_dir: InodeId,
        from_name: &str,
        to_dir: InodeId,
        to_name: &str,
    ) -> Result<()> {
        let from = self.inode(from_dir)?;
        let to = self.inode(to_dir)?;
        from.rename(from_name, &to, to_name).await
    }

    async fn mkdir(&self, dir: InodeId, name: &str, perms: u32) -> Result<()> {
        self.inode(dir)?.create_dir(name, perms).await
    }

    async fn rmdir(&self, dir: InodeId, name: &str) -> Result<()> {
        self.inode(dir)?.remove_dir(name).await
    }

    async fn open_dir(&self, id: InodeId) -> Result<DirCookie> {
        self.inode(id)?.open_dir().await
    }

    async fn close_dir(&self, _id: InodeId, _cookie: &mut DirCookie) -> Result<()> {
        Ok(())
    }

    async fn free_dir_cookie(&self, id: InodeId, cookie: DirCookie) -> Result<()> {
        self.inode(id)?.free_dir_cookie(cookie).await;
        Ok(())
    }

    async fn read_dir(
        &self,
        id: InodeId,
        cookie: &mut DirCookie,
        buffer_size: usize,
        max: u32,
    ) -> Result<Vec<HostDirEntry>> {
        self.inode(id)?.read_dir(cookie, buffer_size, max).await
    }

    async fn rewind_dir(&self, id: InodeId, cookie: &mut DirCookie) -> Result<()> {
        self.inode(id)?.rewind_dir(cookie);
        Ok(())
    }

    async fn read_stat(&self, id: InodeId) -> Result<FileStat> {
        self.inode(id)?.read_stat().await
    }

    async fn write_stat(&self, id: InodeId, attrs: &SetAttributes) -> Result<()> {
        self.inode(id)?.write_stat(attrs).await
    }

    async fn read_link(&self, id: InodeId, max_len: usize) -> Result<String> {
        self.inode(id)?.read_link(max_len).await
    }

    async fn create_symlink(&self, dir: InodeId, name: &str, target: &str) -> Result<()> {
        self.inode(dir)?.create_symlink(name, target).await
    }

    async fn fsync(&self, id: InodeId) -> Result<()> {
        self.inode(id)?.sync().await
    }
}
