use std::io;

use thiserror::Error;

/// Errors surfaced by the core operations and the formatter. The first
/// five map onto the POSIX codes the kernel bridge expects.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("name too long")]
    NameTooLong,
    #[error("no such file or directory")]
    NotFound,
    #[error("no space left on volume")]
    NoSpace,
    #[error("file too large")]
    TooLarge,
    #[error("directory listing sink is full")]
    OutOfMemory,
    #[error("not a usable vsfs image: {0}")]
    BadImage(&'static str),
    #[error("a volume is already present (pass the force flag to overwrite)")]
    VolumePresent,
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl FsError {
    /// POSIX errno for the kernel bridge; the bridge negates it on the
    /// wire where its protocol calls for that.
    pub fn errno(&self) -> i32 {
        match self {
            FsError::NameTooLong => libc::ENAMETOOLONG,
            FsError::NotFound => libc::ENOENT,
            FsError::NoSpace => libc::ENOSPC,
            FsError::TooLarge => libc::EFBIG,
            FsError::OutOfMemory => libc::ENOMEM,
            FsError::BadImage(_) | FsError::VolumePresent => libc::EINVAL,
            FsError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

pub type Result<T> = std::result::Result<T, FsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(FsError::NotFound.errno(), libc::ENOENT);
        assert_eq!(FsError::NoSpace.errno(), libc::ENOSPC);
        assert_eq!(FsError::TooLarge.errno(), libc::EFBIG);
        assert_eq!(FsError::NameTooLong.errno(), libc::ENAMETOOLONG);
        assert_eq!(FsError::OutOfMemory.errno(), libc::ENOMEM);
    }
}
