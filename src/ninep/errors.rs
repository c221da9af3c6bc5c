//! Error taxonomy and the Rlerror errno mapping.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, P9Error>;

#[derive(Error, Debug)]
pub enum P9Error {
    #[error("entry not found")]
    NotFound,

    #[error("permission denied")]
    PermissionDenied,

    #[error("entry already exists")]
    Exists,

    #[error("is a directory")]
    IsDirectory,

    #[error("not a directory")]
    NotADirectory,

    #[error("invalid argument")]
    InvalidArgument,

    #[error("name too long")]
    NameTooLong,

    #[error("directory not empty")]
    NotEmpty,

    #[error("cross-device link")]
    CrossDevice,

    #[error("device not ready")]
    DeviceNotReady,

    #[error("read-only volume")]
    ReadOnly,

    #[error("no space left on device")]
    NoSpace,

    #[error("out of fids or tags")]
    TooManyHandles,

    #[error("buffer overflow")]
    BufferOverflow,

    #[error("operation not supported")]
    NotSupported,

    #[error("out of memory")]
    OutOfMemory,

    #[error("not initialized")]
    NoInit,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] deku::DekuError),

    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl P9Error {
    pub fn protocol(msg: impl Into<String>) -> Self {
        P9Error::Protocol(msg.into())
    }

    /// Map a Linux errno carried by Rlerror to the local taxonomy.
    /// Unrecognized values collapse to a generic I/O error.
    pub fn from_errno(errno: u32) -> Self {
        match errno as i32 {
            libc::ENOENT => P9Error::NotFound,
            libc::EACCES | libc::EPERM => P9Error::PermissionDenied,
            libc::EEXIST => P9Error::Exists,
            libc::EISDIR => P9Error::IsDirectory,
            libc::ENOTDIR => P9Error::NotADirectory,
            libc::EINVAL => P9Error::InvalidArgument,
            libc::ENAMETOOLONG => P9Error::NameTooLong,
            libc::ENOTEMPTY => P9Error::NotEmpty,
            libc::EXDEV => P9Error::CrossDevice,
            libc::ENXIO | libc::ENODEV => P9Error::DeviceNotReady,
            libc::EROFS => P9Error::ReadOnly,
            libc::ENOSPC => P9Error::NoSpace,
            libc::ENFILE | libc::EMFILE => P9Error::TooManyHandles,
            libc::EOVERFLOW => P9Error::BufferOverflow,
            libc::EOPNOTSUPP | libc::ENOSYS => P9Error::NotSupported,
            libc::ENOMEM => P9Error::OutOfMemory,
            other => P9Error::Io(std::io::Error::from_raw_os_error(other)),
        }
    }
}
