//! `UnixStream` extensions to support file descriptor passing.

use crate::net::{set_cloexec, Fd};
use async_trait::async_trait;
use nix::sys::socket::{
    recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags, UnixAddr,
};
use std::{
    io::{self, IoSlice, IoSliceMut, Result},
    os::unix::io::{AsRawFd, RawFd},
    slice,
};
use tokio::io::Interest;

pub use tokio::net::UnixStream;

/// Number of descriptors we make room for when receiving.  The protocol
/// attaches at most one; a second slot lets us notice and close extras.
const MAX_FDS: usize = 2;

#[async_trait]
pub trait UnixStreamExt {
    /// Send `buf` in a single `sendmsg` with an optional descriptor attached.
    async fn send_with_fd(&self, buf: &[u8], fd: Option<RawFd>) -> Result<usize>;

    /// Receive into `buf` and return the byte count and the first attached
    /// descriptor.  Any additional descriptors are closed.
    async fn recv_with_fd(&self, buf: &mut [u8]) -> Result<(usize, Option<Fd>)>;
}

#[async_trait]
impl UnixStreamExt for UnixStream {
    async fn send_with_fd(&self, buf: &[u8], fd: Option<RawFd>) -> Result<usize> {
        loop {
            self.writable().await?;

            match self.try_io(Interest::WRITABLE, || send_with_fd_to(self.as_raw_fd(), buf, fd)) {
                Ok(count) => break Ok(count),
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                    ) =>
                {
                    continue
                }
                Err(err) => break Err(err),
            }
        }
    }

    async fn recv_with_fd(&self, buf: &mut [u8]) -> Result<(usize, Option<Fd>)> {
        loop {
            self.readable().await?;

            match self.try_io(Interest::READABLE, || {
                recv_with_fd_from(self.as_raw_fd(), buf)
            }) {
                Ok(result) => break Ok(result),
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                    ) =>
                {
                    continue
                }
                Err(err) => break Err(err),
            }
        }
    }
}

fn send_with_fd_to(socket: RawFd, buf: &[u8], fd: Option<RawFd>) -> Result<usize> {
    let iov = [IoSlice::new(buf)];
    let fds = fd.map(|fd| [fd]);
    let cmsg = fds.as_ref().map(|fds| ControlMessage::ScmRights(&fds[..]));
    let cmsgs = cmsg.as_ref().map(slice::from_ref).unwrap_or(&[]);

    sendmsg::<UnixAddr>(socket, &iov, cmsgs, MsgFlags::empty(), None).map_err(io::Error::from)
}

fn recv_with_fd_from(socket: RawFd, buf: &mut [u8]) -> Result<(usize, Option<Fd>)> {
    let mut iov = [IoSliceMut::new(buf)];
    let mut cmsg_buffer = nix::cmsg_space!([RawFd; MAX_FDS]);

    let msg = recvmsg::<UnixAddr>(socket, &mut iov, Some(&mut cmsg_buffer), MsgFlags::empty())
        .map_err(io::Error::from)?;

    let mut fds = Vec::new();
    for cmsg in msg.cmsgs() {
        if let ControlMessageOwned::ScmRights(received) = cmsg {
            fds.extend(received.into_iter().map(Fd::from));
        }
    }
    if msg.flags.contains(MsgFlags::MSG_CTRUNC) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "ancillary data truncated",
        ));
    }

    // We only return one fd per message and auto-close all the
    // remaining ones once the `Fd` is dropped.
    let fd = fds.into_iter().next();
    if let Some(fd) = &fd {
        set_cloexec(fd.as_raw_fd(), true).map_err(io::Error::from)?;
    }

    Ok((msg.bytes, fd))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{net::TcpListener, os::unix::io::IntoRawFd};

    #[tokio::test]
    async fn test_fd_passing() {
        let (sender, receiver) = UnixStream::pair().unwrap();
        let listener = Fd::from(TcpListener::bind("127.0.0.1:0").unwrap().into_raw_fd());

        let sent = sender
            .send_with_fd(b"listen", Some(listener.as_raw_fd()))
            .await
            .unwrap();
        assert_eq!(sent, 6);

        let mut buf = [0u8; 16];
        let (count, fd) = receiver.recv_with_fd(&mut buf).await.unwrap();
        assert_eq!(&buf[..count], b"listen");

        let fd = fd.expect("descriptor must be attached");
        assert_ne!(fd.as_raw_fd(), listener.as_raw_fd());
        assert_eq!(fd.identity().unwrap(), listener.identity().unwrap());
    }

    #[tokio::test]
    async fn test_no_fd_attached() {
        let (sender, receiver) = UnixStream::pair().unwrap();
        sender.send_with_fd(b"plain", None).await.unwrap();

        let mut buf = [0u8; 16];
        let (count, fd) = receiver.recv_with_fd(&mut buf).await.unwrap();
        assert_eq!(&buf[..count], b"plain");
        assert!(fd.is_none());
    }

    #[tokio::test]
    async fn test_peer_closed() {
        let (sender, receiver) = UnixStream::pair().unwrap();
        drop(sender);

        let mut buf = [0u8; 16];
        let (count, fd) = receiver.recv_with_fd(&mut buf).await.unwrap();
        assert_eq!(count, 0);
        assert!(fd.is_none());
    }
}
