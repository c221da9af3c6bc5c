//! File-system adaptation layer: volumes, inodes, cookies, and the
//! host-facing dispatch.

pub mod inode;
pub mod types;
pub mod vfs;
pub mod volume;
