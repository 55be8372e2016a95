use std::num::ParseIntError;

use thiserror::Error;

use crate::BufferId;
use crate::ChannelId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("out of DMA memory")]
    NoMemory,
    #[error("invalid user address range {addr:#x}+{len:#x}")]
    InvalidAddress { addr: usize, len: usize },
    #[error("user address range {addr:#x}+{len:#x} overlaps a registered buffer")]
    AlreadyMapped { addr: usize, len: usize },
    #[error("buffer {0} is referenced by an in-flight transfer")]
    BufferBusy(BufferId),
    #[error("{0} not found")]
    NotFound(Resource),
    #[error("no idle channel available")]
    NoChannelAvailable,
    #[error("channel does not support the requested mode")]
    UnsupportedMode,
    #[error("range {offset:#x}+{len:#x} exceeds buffer of {size:#x} bytes")]
    OutOfRange {
        offset: usize,
        len: usize,
        size: usize,
    },
    #[error("buffer direction does not match channel direction")]
    DirectionMismatch,
    #[error("channel {0} is busy")]
    ChannelBusy(ChannelId),
    #[error("failed to build descriptor chain: {0}")]
    DescriptorBuildFailed(String),
    #[error("timed out waiting for transfer")]
    Timeout,
    #[error("DMA hardware error: {0}")]
    HardwareError(String),
    #[error("invalid parameter: {0}")]
    InvalidParam(String),
    #[error("mapping into virtual memory failed")]
    Mmap,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    ParseInt(#[from] ParseIntError),
}

/// Kind of object a lookup failed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Buffer(BufferId),
    Channel(ChannelId),
    Transfer(u64),
    Mapping(u64),
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Resource::Buffer(id) => write!(f, "buffer {}", id),
            Resource::Channel(id) => write!(f, "channel {}", id),
            Resource::Transfer(id) => write!(f, "transfer {}", id),
            Resource::Mapping(off) => write!(f, "mapping at offset {:#x}", off),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Stable status code handed back through the ioctl boundary.
///
/// Values are negated errno numbers, `0` is success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusCode(pub i32);

impl StatusCode {
    pub const OK: StatusCode = StatusCode(0);

    pub fn is_ok(self) -> bool {
        self.0 == 0
    }

    pub fn errno(self) -> i32 {
        -self.0
    }
}

impl From<&Error> for StatusCode {
    fn from(e: &Error) -> StatusCode {
        let errno = match e {
            Error::NoMemory => libc::ENOMEM,
            Error::InvalidAddress { .. } => libc::EFAULT,
            Error::AlreadyMapped { .. } => libc::EEXIST,
            Error::BufferBusy(_) | Error::ChannelBusy(_) => libc::EBUSY,
            Error::NotFound(_) => libc::ENOENT,
            Error::NoChannelAvailable => libc::ENODEV,
            Error::UnsupportedMode => libc::EOPNOTSUPP,
            Error::OutOfRange { .. } => libc::ERANGE,
            Error::DirectionMismatch | Error::InvalidParam(_) | Error::ParseInt(_) => libc::EINVAL,
            Error::DescriptorBuildFailed(_) => libc::ENOSPC,
            Error::Timeout => libc::ETIMEDOUT,
            Error::HardwareError(_) | Error::Mmap => libc::EIO,
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        };
        StatusCode(-errno)
    }
}

impl From<Error> for StatusCode {
    fn from(e: Error) -> StatusCode {
        StatusCode::from(&e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_errors_share_a_code() {
        assert_eq!(
            StatusCode::from(Error::BufferBusy(BufferId(3))),
            StatusCode::from(Error::ChannelBusy(ChannelId(1)))
        );
        assert_eq!(StatusCode::from(Error::Timeout).errno(), libc::ETIMEDOUT);
    }

    #[test]
    fn io_errors_keep_their_errno() {
        let e = Error::from(std::io::Error::from_raw_os_error(libc::EACCES));
        assert_eq!(StatusCode::from(e), StatusCode(-libc::EACCES));
    }

    #[test]
    fn messages_name_the_resource() {
        let e = Error::NotFound(Resource::Buffer(BufferId(7)));
        assert_eq!(e.to_string(), "buffer 7 not found");
    }
}
