use crate::message::ProtocolError;
use derive_more::{Display, From};
use nix::errno::Errno;
use std::{borrow::Cow, io, path::PathBuf};

/// Common errors.
#[derive(Debug, Display, From)]
pub enum Error {
    #[display(fmt = "I/O error: {}", "_0")]
    IoError(io::Error),
    #[display(fmt = "{}", "_0")]
    UnixError(nix::Error),
    #[display(fmt = "Protocol error: {}", "_0")]
    Protocol(ProtocolError),
    #[display(fmt = "Serialization error: {}", "_0")]
    Bincode(bincode::Error),
    #[display(fmt = "Connection table full ({} channels)", "_0")]
    #[from(ignore)]
    TableFull(usize),
    #[display(fmt = "Unknown channel {}", "_0")]
    #[from(ignore)]
    UnknownChannel(u64),
    #[display(fmt = "Watchdog not ready")]
    #[from(ignore)]
    NotReady,
    #[display(fmt = "{} already in progress", "_0")]
    #[from(ignore)]
    Busy(&'static str),
    #[display(fmt = "Listen socket error: {}", "_0")]
    #[from(ignore)]
    ListenSocket(Errno),
    #[display(fmt = "Password not available")]
    #[from(ignore)]
    PasswordUnavailable,
    #[display(fmt = "Unexpected reply {}", "_0")]
    #[from(ignore)]
    UnexpectedReply(&'static str),
    #[display(fmt = "Request failed: {}", "_0")]
    #[from(ignore)]
    Rejected(String),
    #[display(fmt = "Channel closed")]
    #[from(ignore)]
    Closed,
    #[display(fmt = "Invalid path {}", "_0.display()")]
    #[from(ignore)]
    InvalidPath(PathBuf),
    #[display(fmt = "Username '{}' not found", "_0")]
    #[from(ignore)]
    UserNotFound(Cow<'static, str>),
    #[display(fmt = "{}", "_0")]
    #[from(ignore)]
    Setup(Cow<'static, str>),
    #[display(fmt = "Not running under a watchdog")]
    #[from(ignore)]
    NotSupervised,
}

impl std::error::Error for Error {}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::IoError(err) => err,
            err => io::Error::new(io::ErrorKind::Other, err.to_string()),
        }
    }
}
