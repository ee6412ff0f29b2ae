//! Client side of the watchdog protocol.
//!
//! [`Client`] is used by the supervised worker, [`AdminClient`] by
//! administrative tools that restart, reconfigure or stop the server.

use crate::{
    channel::Channel,
    config,
    error::Error,
    message::{Kind, ListenSocketKey, Message, PasswordRequest, ProtocolError},
    net::Fd,
    process::{ENV_SOCKET, ENV_STARTED},
};
use nix::errno::Errno;
use std::{
    collections::VecDeque,
    env,
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
};
use zeroize::Zeroizing;

/// Returns true if this process was started by the watchdog.
pub fn supervised() -> bool {
    env::var_os(ENV_STARTED).is_some()
}

/// The worker's connection to the watchdog.
#[derive(Debug)]
pub struct Client {
    channel: Channel,
    /// Commands pushed by the watchdog while waiting for a reply.
    pending: VecDeque<Message>,
    end_init: bool,
}

impl From<Channel> for Client {
    fn from(channel: Channel) -> Self {
        Self {
            channel,
            pending: VecDeque::new(),
            end_init: false,
        }
    }
}

impl Client {
    pub async fn connect<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        Channel::connect(path).await.map(Into::into)
    }

    /// Connect to the socket named in the environment.
    pub async fn from_env() -> Result<Self, Error> {
        let path = env::var_os(ENV_SOCKET).ok_or(Error::NotSupervised)?;
        Self::connect(PathBuf::from(path)).await
    }

    async fn request(&mut self, message: Message) -> Result<(Message, Option<Fd>), Error> {
        let expected = message
            .kind()
            .reply()
            .ok_or(Error::UnexpectedReply(message.kind().name()))?;
        self.channel.send(&message).await?;

        loop {
            let (reply, fd) = self.channel.recv().await?;
            match reply.kind() {
                kind if kind == expected => return Ok((reply, fd)),
                Kind::EmptyRead => return Err(Error::Closed),
                Kind::Reconfigure | Kind::Rotate | Kind::Terminate => {
                    self.pending.push_back(reply)
                }
                kind => return Err(Error::UnexpectedReply(kind.name())),
            }
        }
    }

    /// Get a bound listen socket from the watchdog.
    pub async fn get_listen_socket(&mut self, key: &ListenSocketKey) -> Result<Fd, Error> {
        let (reply, fd) = self
            .request(Message::encode(Kind::GetListenSocket, key)?)
            .await?;
        let status = reply.listen_socket_status()?;
        match fd {
            Some(fd) if status >= 0 => Ok(fd),
            _ if status < 0 => match status.checked_neg() {
                Some(errno) => Err(Error::ListenSocket(Errno::from_i32(errno))),
                None => Err(ProtocolError::Malformed(
                    Kind::GetListenSocketReply,
                    format!("invalid status {}", status),
                )
                .into()),
            },
            // A positive status without a descriptor lost the transfer.
            _ => Err(Error::ListenSocket(Errno::EBADF)),
        }
    }

    pub async fn close_listen_socket(&mut self, key: &ListenSocketKey) -> Result<(), Error> {
        self.request(Message::encode(Kind::CloseListenSocket, key)?)
            .await
            .map(|_| ())
    }

    /// Report the end of initialization.  This channel becomes the
    /// worker's admin channel and receives commands from now on.
    pub async fn end_init(&mut self, workers: u32) -> Result<(), Error> {
        if self.end_init {
            return Err(Error::Busy("initialization"));
        }
        self.request(Message::encode(Kind::EndInit, &workers)?)
            .await?;
        self.end_init = true;
        Ok(())
    }

    /// Get a password.  Increase `serial` after a value was rejected.
    pub async fn get_password(
        &mut self,
        prompt: &str,
        serial: u32,
    ) -> Result<Zeroizing<String>, Error> {
        let request = PasswordRequest {
            prompt: prompt.to_string(),
            serial,
        };
        let (reply, _) = self
            .request(Message::encode(Kind::GetPassword, &request)?)
            .await?;
        reply
            .decode::<Option<String>>()?
            .map(Zeroizing::new)
            .ok_or(Error::PasswordUnavailable)
    }

    /// Use `path` for the watchdog's PID file.
    pub async fn set_pid_path(&mut self, path: &Path) -> Result<(), Error> {
        let payload = path.as_os_str().as_bytes().to_vec();
        self.request(Message::new(Kind::SetPidPath, payload)?)
            .await
            .map(|_| ())
    }

    /// Tell the watchdog that the server is terminating.
    pub async fn terminate(&mut self) -> Result<(), Error> {
        match self.request(Message::empty(Kind::Terminate)?).await {
            Ok(_) | Err(Error::Closed) => Ok(()),
            Err(err) => Err(err),
        }
    }

    pub async fn reconfigure_status(&mut self, status: &str) -> Result<(), Error> {
        self.request(Message::text(Kind::ReconfigStatus, status)?)
            .await
            .map(|_| ())
    }

    pub async fn reconfigure_done(&mut self) -> Result<(), Error> {
        self.request(Message::empty(Kind::ReconfigStatusDone)?)
            .await
            .map(|_| ())
    }

    /// Wait for the next command from the watchdog.  `Kind::EmptyRead`
    /// means that the watchdog went away.
    pub async fn next_command(&mut self) -> Result<Message, Error> {
        if let Some(message) = self.pending.pop_front() {
            return Ok(message);
        }
        let (message, _) = self.channel.recv().await?;
        Ok(message)
    }
}

/// A transient administrative connection.
#[derive(Debug)]
pub struct AdminClient {
    channel: Channel,
}

impl AdminClient {
    pub async fn connect<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        Ok(Self {
            channel: Channel::connect(path).await?,
        })
    }

    /// Connect to the watchdog that uses `temp_dir`.
    pub async fn for_temp_dir<P: AsRef<Path>>(temp_dir: P) -> Result<Self, Error> {
        Self::connect(config::socket_path(temp_dir)).await
    }

    async fn recv(&mut self) -> Result<Message, Error> {
        let (message, _) = self.channel.recv().await?;
        match message.kind() {
            Kind::EmptyRead => Err(Error::Closed),
            _ => Ok(message),
        }
    }

    async fn expect_reply(&mut self, expected: Kind) -> Result<Message, Error> {
        let message = self.recv().await?;
        if message.kind() != expected {
            return Err(Error::UnexpectedReply(message.kind().name()));
        }
        Ok(message)
    }

    /// Restart the server.  Returns once the new server finished its
    /// initialization.  The watchdog's stderr goes to `status_file`
    /// while the restart is in progress.
    pub async fn restart(&mut self, status_file: Option<&Path>) -> Result<(), Error> {
        let payload = status_file
            .map(|path| path.as_os_str().as_bytes().to_vec())
            .unwrap_or_default();
        self.channel
            .send(&Message::new(Kind::Restart, payload)?)
            .await?;

        let reply = self.expect_reply(Kind::RestartReply).await?;
        match reply.as_str()? {
            "" => Ok(()),
            status => Err(Error::Rejected(status.to_string())),
        }
    }

    /// Reconfigure the server and return the status lines.
    pub async fn reconfigure(&mut self) -> Result<Vec<String>, Error> {
        self.channel
            .send(&Message::empty(Kind::Reconfigure)?)
            .await?;
        self.collect_status(true).await
    }

    /// Attach to a running reconfiguration.
    pub async fn reconfigure_status(&mut self) -> Result<Vec<String>, Error> {
        self.channel
            .send(&Message::empty(Kind::GetReconfigStatus)?)
            .await?;
        self.collect_status(false).await
    }

    async fn collect_status(&mut self, expect_ack: bool) -> Result<Vec<String>, Error> {
        let mut acked = !expect_ack;
        let mut lines = Vec::new();
        loop {
            let message = self.recv().await?;
            match message.kind() {
                Kind::ReconfigureReply if !acked => acked = true,
                Kind::GetReconfigStatusReply if message.payload().is_empty() => break,
                Kind::GetReconfigStatusReply => lines.push(message.as_str()?.to_string()),
                kind => return Err(Error::UnexpectedReply(kind.name())),
            }
        }
        if !acked {
            return Err(Error::UnexpectedReply(Kind::GetReconfigStatusReply.name()));
        }
        Ok(lines)
    }

    /// Ask the server to reopen its log files.
    pub async fn rotate(&mut self) -> Result<(), Error> {
        self.channel.send(&Message::empty(Kind::Rotate)?).await?;
        self.expect_reply(Kind::RotateReply).await.map(|_| ())
    }

    /// Stop the server and the watchdog.
    pub async fn stop(&mut self) -> Result<(), Error> {
        self.channel
            .send(&Message::empty(Kind::Terminate)?)
            .await?;
        self.expect_reply(Kind::TerminateReply).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ListenSocketRecord;
    use bytes::Bytes;
    use zerocopy::AsBytes;

    #[tokio::test]
    async fn test_pushed_commands_are_queued() {
        let (local, mut watchdog) = Channel::pair().unwrap();
        let mut client = Client::from(local);

        let worker = tokio::spawn(async move {
            client.reconfigure_status("ok").await.unwrap();
            let command = client.next_command().await.unwrap();
            assert_eq!(command.kind(), Kind::Rotate);
            let command = client.next_command().await.unwrap();
            assert_eq!(command.kind(), Kind::EmptyRead);
        });

        let (message, _) = watchdog.recv().await.unwrap();
        assert_eq!(message.as_str().unwrap(), "ok");
        watchdog
            .send(&Message::empty(Kind::Rotate).unwrap())
            .await
            .unwrap();
        watchdog
            .send(&Message::empty(Kind::ReconfigStatusReply).unwrap())
            .await
            .unwrap();
        drop(watchdog);

        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_listen_socket_error() {
        let (local, mut watchdog) = Channel::pair().unwrap();
        let mut client = Client::from(local);

        let worker = tokio::spawn(async move {
            let key = ListenSocketKey::new("http", None, 80, crate::message::Family::Inet);
            client.get_listen_socket(&key).await
        });

        let (message, _) = watchdog.recv().await.unwrap();
        assert_eq!(message.kind(), Kind::GetListenSocket);
        watchdog
            .send_listen_socket(Err(Errno::EACCES))
            .await
            .unwrap();

        assert!(matches!(
            worker.await.unwrap(),
            Err(Error::ListenSocket(Errno::EACCES))
        ));
    }

    #[tokio::test]
    async fn test_listen_socket_invalid_status() {
        let (local, mut watchdog) = Channel::pair().unwrap();
        let mut client = Client::from(local);

        let worker = tokio::spawn(async move {
            let key = ListenSocketKey::new("http", None, 80, crate::message::Family::Inet);
            client.get_listen_socket(&key).await
        });

        watchdog.recv().await.unwrap();
        let record = ListenSocketRecord::new(i32::MIN);
        let reply = Message::new(
            Kind::GetListenSocketReply,
            Bytes::copy_from_slice(record.as_bytes()),
        )
        .unwrap();
        watchdog.send(&reply).await.unwrap();

        assert!(matches!(
            worker.await.unwrap(),
            Err(Error::Protocol(ProtocolError::Malformed(
                Kind::GetListenSocketReply,
                _
            )))
        ));
    }

    #[tokio::test]
    async fn test_restart_rejected() {
        let (local, mut watchdog) = Channel::pair().unwrap();
        let mut admin = AdminClient { channel: local };

        let request = tokio::spawn(async move { admin.restart(None).await });

        let (message, _) = watchdog.recv().await.unwrap();
        assert_eq!(message.kind(), Kind::Restart);
        assert!(message.payload().is_empty());
        watchdog
            .send(&Message::new(Kind::RestartReply, Bytes::from_static(b"busy")).unwrap())
            .await
            .unwrap();

        match request.await.unwrap() {
            Err(Error::Rejected(status)) => assert_eq!(status, "busy"),
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
