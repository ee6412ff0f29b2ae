//! Owned, droppable file descriptors.

use crate::error::Error;
use derive_more::From;
use nix::{
    fcntl::{fcntl, FcntlArg, FdFlag},
    sys::stat::fstat,
    unistd::close,
};
use std::{
    mem,
    os::unix::io::{AsRawFd, IntoRawFd, RawFd},
};

/// Wrapper for `RawFd` that closes the file descriptor when dropped.
///
/// Descriptors received from a peer are handed out as `Fd`, so the
/// receiver owns them and nothing is duplicated implicitly.
#[derive(Debug, From, PartialEq, Eq)]
pub struct Fd(RawFd);

impl Fd {
    /// Set or clear the close-on-exec flag.
    pub fn set_cloexec(&self, enable: bool) -> Result<(), Error> {
        set_cloexec(self.0, enable)
    }

    /// Device and inode of the open file, used to compare descriptors
    /// that were passed between processes.
    pub fn identity(&self) -> Result<(u64, u64), Error> {
        let stat = fstat(self.0)?;
        Ok((stat.st_dev as u64, stat.st_ino as u64))
    }
}

impl Drop for Fd {
    fn drop(&mut self) {
        let _ = close(self.0);
    }
}

impl IntoRawFd for Fd {
    fn into_raw_fd(self) -> RawFd {
        let fd = self.0;
        mem::forget(self);
        fd
    }
}

impl AsRawFd for Fd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

pub(crate) fn set_cloexec(fd: RawFd, add: bool) -> Result<(), Error> {
    let mut flags = FdFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFD)?);
    flags.set(FdFlag::FD_CLOEXEC, add);
    fcntl(fd, FcntlArg::F_SETFD(flags))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::dup;
    use std::net::TcpListener;

    #[test]
    fn test_identity() {
        let first = Fd::from(TcpListener::bind("127.0.0.1:0").unwrap().into_raw_fd());
        let second = Fd::from(TcpListener::bind("127.0.0.1:0").unwrap().into_raw_fd());
        let copy = Fd::from(dup(first.as_raw_fd()).unwrap());
        assert_ne!(first.as_raw_fd(), copy.as_raw_fd());
        assert_eq!(first.identity().unwrap(), copy.identity().unwrap());
        assert_ne!(first.identity().unwrap(), second.identity().unwrap());

        first.set_cloexec(true).unwrap();
        let flags = fcntl(first.as_raw_fd(), FcntlArg::F_GETFD).unwrap();
        let flags = FdFlag::from_bits_truncate(flags);
        assert!(flags.contains(FdFlag::FD_CLOEXEC));
    }
}
