//! Client-side implementation of the 9P2000.L distributed file-system
//! protocol.
//!
//! The crate splits into two layers. [`ninep`] is the protocol engine:
//! the wire codec, fid/tag pools, the framed [`Transport`] contract and
//! the transaction client. [`fs`] adapts that engine to a host VFS:
//! volumes, inodes, open-file and directory cookies, and the
//! [`VfsOps`] dispatch surface a kernel or FUSE glue layer drives.
//!
//! A mount goes through a [`TransportRegistry`]: register a transport
//! under a tag, then mount with `tag=<name>` in the argument string.
//!
//! ```no_run
//! use std::sync::Arc;
//! use ninepfs::{NinePFs, TransportRegistry};
//! use ninepfs::ninep::transport::TcpTransport;
//!
//! # async fn demo() -> ninepfs::Result<()> {
//! let registry = TransportRegistry::new();
//! let tcp = TcpTransport::connect("export", "127.0.0.1:564").await?;
//! registry.register(Arc::new(tcp))?;
//!
//! let (fs, root) = NinePFs::mount(&registry, "/dev/9p", false, "tag=export").await?;
//! # let _ = (fs, root);
//! # Ok(())
//! # }
//! ```

pub mod fs;
pub mod ninep;

pub use fs::types::{FileStat, FsInfo, HostDirEntry, InodeId, SetAttributes, TimeUpdate};
pub use fs::vfs::{NinePFs, VfsOps};
pub use fs::volume::{MountOptions, Volume};
pub use ninep::client::P9Client;
pub use ninep::errors::{P9Error, Result};
pub use ninep::transport::{Transport, TransportRegistry};

#[cfg(test)]
pub(crate) mod test_util;
