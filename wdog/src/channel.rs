//! A framed, bidirectional watchdog connection.

use crate::{
    error::Error,
    message::{Header, Kind, ListenSocketRecord, Message, ProtocolError},
    net::{Fd, UnixStream, UnixStreamExt},
};
use bytes::Bytes;
use nix::errno::Errno;
use std::{
    io,
    os::unix::io::{AsRawFd, RawFd},
    path::Path,
};
use zerocopy::AsBytes;

/// One end of a watchdog connection.
#[derive(Debug)]
pub struct Channel {
    socket: UnixStream,
    last_sent: Option<Kind>,
    last_received: Option<Kind>,
    /// Request whose reply is deferred, e.g. a `Restart`.
    awaiting_reply: Option<Kind>,
}

impl From<UnixStream> for Channel {
    fn from(socket: UnixStream) -> Self {
        Self {
            socket,
            last_sent: None,
            last_received: None,
            awaiting_reply: None,
        }
    }
}

impl Channel {
    /// Connect to the watchdog socket.
    pub async fn connect<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        Ok(UnixStream::connect(path).await?.into())
    }

    /// Create a connected channel pair.
    pub fn pair() -> Result<(Self, Self), Error> {
        let (a, b) = UnixStream::pair()?;
        Ok((a.into(), b.into()))
    }

    pub fn last_sent(&self) -> Option<Kind> {
        self.last_sent
    }

    pub fn last_received(&self) -> Option<Kind> {
        self.last_received
    }

    pub fn awaiting_reply(&self) -> Option<Kind> {
        self.awaiting_reply
    }

    pub fn set_awaiting_reply(&mut self, kind: Option<Kind>) {
        self.awaiting_reply = kind;
    }

    pub(crate) fn socket(&self) -> &UnixStream {
        &self.socket
    }

    /// Send a message.  Returns the number of body bytes written.
    pub async fn send(&mut self, message: &Message) -> Result<usize, Error> {
        let body = message.to_body()?;
        let sent = self.send_frame(&body, None).await?;
        self.last_sent = Some(message.kind());
        Ok(sent)
    }

    /// Send a `GetListenSocketReply`: the descriptor is attached on
    /// success, a negated errno is carried in the record otherwise.
    pub async fn send_listen_socket(&mut self, result: Result<&Fd, Errno>) -> Result<usize, Error> {
        let (record, fd) = match result {
            Ok(fd) => (ListenSocketRecord::new(fd.as_raw_fd()), Some(fd.as_raw_fd())),
            Err(errno) => (ListenSocketRecord::new(-(errno as i32)), None),
        };
        let message = Message::new(
            Kind::GetListenSocketReply,
            Bytes::copy_from_slice(record.as_bytes()),
        )?;
        let body = message.to_body()?;
        let sent = self.send_frame(&body, fd).await?;
        self.last_sent = Some(message.kind());
        Ok(sent)
    }

    async fn send_frame(&self, body: &[u8], fd: Option<RawFd>) -> Result<usize, Error> {
        let header = Header {
            length: body.len() as u32,
        };
        let sent = self.socket.send_with_fd(header.as_bytes(), None).await?;
        if sent != Header::LENGTH {
            return Err(short_write());
        }

        let sent = self.socket.send_with_fd(body, fd).await?;
        if sent != body.len() {
            return Err(short_write());
        }

        Ok(sent)
    }

    /// Receive the next message and the descriptor attached to it.
    ///
    /// A peer that closed the connection yields `Kind::EmptyRead`.
    pub async fn recv(&mut self) -> Result<(Message, Option<Fd>), Error> {
        let mut fd = None;
        let mut header = Header::default();

        let received = self.recv_exact(header.as_bytes_mut(), &mut fd).await?;
        if received == 0 {
            self.last_received = Some(Kind::EmptyRead);
            return Ok((Message::empty_read(), None));
        } else if received != Header::LENGTH {
            return Err(ProtocolError::BadHeader(received).into());
        }

        let length = header.length as usize;
        if length < Message::KIND_LENGTH || length > Message::MAX_BODY {
            return Err(ProtocolError::BadLength(header.length).into());
        }

        let mut body = vec![0u8; length];
        let received = self.recv_exact(&mut body, &mut fd).await?;
        if received != length {
            return Err(ProtocolError::Truncated(length, received).into());
        }

        let message = Message::from_body(Bytes::from(body))?;
        self.last_received = Some(message.kind());

        Ok((message, fd))
    }

    /// Fill `buf` unless the peer closes the connection first.
    async fn recv_exact(&self, buf: &mut [u8], fd: &mut Option<Fd>) -> Result<usize, Error> {
        let mut offset = 0;
        while offset < buf.len() {
            let (count, received) = self.socket.recv_with_fd(&mut buf[offset..]).await?;
            if fd.is_none() {
                *fd = received;
            }
            if count == 0 {
                break;
            }
            offset += count;
        }
        Ok(offset)
    }
}

impl AsRawFd for Channel {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

fn short_write() -> Error {
    io::Error::new(io::ErrorKind::WriteZero, "short message").into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{net::TcpListener, os::unix::io::IntoRawFd};

    #[tokio::test]
    async fn test_round_trip() {
        let (mut a, mut b) = Channel::pair().unwrap();

        for size in [0, 1, 255, Message::MAX_PAYLOAD] {
            let message = Message::new(Kind::ReconfigStatus, vec![b'x'; size]).unwrap();
            let sent = a.send(&message).await.unwrap();
            assert_eq!(sent, Message::KIND_LENGTH + size);

            let (received, fd) = b.recv().await.unwrap();
            assert_eq!(received, message);
            assert!(fd.is_none());
        }

        assert_eq!(a.last_sent(), Some(Kind::ReconfigStatus));
        assert_eq!(b.last_received(), Some(Kind::ReconfigStatus));
    }

    #[tokio::test]
    async fn test_listen_socket_reply() {
        let (mut a, mut b) = Channel::pair().unwrap();
        let listener = Fd::from(TcpListener::bind("127.0.0.1:0").unwrap().into_raw_fd());

        a.send_listen_socket(Ok(&listener)).await.unwrap();
        let (message, fd) = b.recv().await.unwrap();
        assert!(message.listen_socket_status().unwrap() >= 0);
        let fd = fd.expect("descriptor attached");
        assert_eq!(fd.identity().unwrap(), listener.identity().unwrap());

        a.send_listen_socket(Err(Errno::EADDRINUSE)).await.unwrap();
        let (message, fd) = b.recv().await.unwrap();
        assert_eq!(
            message.listen_socket_status().unwrap(),
            -(Errno::EADDRINUSE as i32)
        );
        assert!(fd.is_none());
    }

    #[tokio::test]
    async fn test_empty_read() {
        let (a, mut b) = Channel::pair().unwrap();
        drop(a);

        let (message, fd) = b.recv().await.unwrap();
        assert_eq!(message.kind(), Kind::EmptyRead);
        assert!(fd.is_none());
        assert_eq!(b.last_received(), Some(Kind::EmptyRead));
    }

    #[tokio::test]
    async fn test_shape_violation_on_receive() {
        let (a, mut b) = Channel::pair().unwrap();

        let mut body = u32::from(Kind::ReconfigStatusDone).to_ne_bytes().to_vec();
        body.extend_from_slice(b"not empty");
        a.send_frame(&body, None).await.unwrap();

        match b.recv().await {
            Err(Error::Protocol(ProtocolError::MustBeEmpty(Kind::ReconfigStatusDone))) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_truncated_frames() {
        let (a, mut b) = Channel::pair().unwrap();
        a.socket.send_with_fd(&[1, 2], None).await.unwrap();
        drop(a);
        match b.recv().await {
            Err(Error::Protocol(ProtocolError::BadHeader(2))) => {}
            other => panic!("unexpected result: {:?}", other),
        }

        let (a, mut b) = Channel::pair().unwrap();
        let header = Header { length: 64 };
        a.socket.send_with_fd(header.as_bytes(), None).await.unwrap();
        a.socket.send_with_fd(&[0u8; 8], None).await.unwrap();
        drop(a);
        match b.recv().await {
            Err(Error::Protocol(ProtocolError::Truncated(64, 8))) => {}
            other => panic!("unexpected result: {:?}", other),
        }

        let (a, mut b) = Channel::pair().unwrap();
        let header = Header {
            length: Message::MAX_BODY as u32 + 1,
        };
        a.socket.send_with_fd(header.as_bytes(), None).await.unwrap();
        assert!(matches!(
            b.recv().await,
            Err(Error::Protocol(ProtocolError::BadLength(_)))
        ));
    }

    #[tokio::test]
    async fn test_synthetic_kind_not_sent() {
        let (mut a, _b) = Channel::pair().unwrap();
        assert!(matches!(
            a.send(&Message::empty_read()).await,
            Err(Error::Protocol(ProtocolError::Synthetic(Kind::EmptyRead)))
        ));
    }
}
