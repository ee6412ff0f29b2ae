//! Watchdog messages and the static name and payload-shape tables.

use bytes::{BufMut, Bytes, BytesMut};
use derive_more::Display;
use serde::{de::DeserializeOwned, Serialize};
use serde_derive::{Deserialize, Serialize};
use std::{convert::TryFrom, fmt, mem, str};
use zerocopy::{AsBytes, FromBytes};

macro_rules! kinds {
    ($($kind:ident = $value:literal => $name:literal,)+) => {
        /// Message kinds in wire order.
        ///
        /// The ordinals `0` and `Kind::LAST` are sentinels and never valid
        /// on the wire.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(u32)]
        pub enum Kind {
            $($kind = $value,)+
        }

        impl Kind {
            /// All valid kinds in ordinal order.
            pub const ALL: &'static [Kind] = &[$(Kind::$kind,)+];

            /// Human-readable name, only used for logging.
            pub fn name(self) -> &'static str {
                match self {
                    $(Kind::$kind => $name,)+
                }
            }
        }

        impl TryFrom<u32> for Kind {
            type Error = ProtocolError;

            fn try_from(value: u32) -> Result<Self, Self::Error> {
                match value {
                    $($value => Ok(Kind::$kind),)+
                    _ => Err(ProtocolError::InvalidKind(value)),
                }
            }
        }
    };
}

kinds! {
    GetPassword = 1 => "GetPWD",
    GetPasswordReply = 2 => "GetPWDreply",
    GetListenSocket = 3 => "GetLS",
    GetListenSocketReply = 4 => "GetLSreply",
    CloseListenSocket = 5 => "CloseLS",
    CloseListenSocketReply = 6 => "CloseLSreply",
    EndInit = 7 => "EndInit",
    EndInitReply = 8 => "EndInitreply",
    EndInitReplyAck = 9 => "EndInitreplyAck",
    SetPidPath = 10 => "SetPIDpath",
    SetPidPathReply = 11 => "SetPIDpathreply",
    Restart = 12 => "Restart",
    RestartReply = 13 => "Restartreply",
    Terminate = 14 => "Terminate",
    TerminateReply = 15 => "Terminatereply",
    Reconfigure = 16 => "Reconfigure",
    ReconfigureReply = 17 => "Reconfigurereply",
    GetReconfigStatus = 18 => "GetReconfigStatus",
    GetReconfigStatusReply = 19 => "GetReconfigStatusreply",
    ReconfigStatus = 20 => "ReconfigStatus",
    ReconfigStatusReply = 21 => "ReconfigStatusreply",
    ReconfigStatusDone = 22 => "ReconfigStatusDone",
    ReconfigStatusDoneReply = 23 => "ReconfigStatusDonereply",
    EmptyRead = 24 => "EmptyRead",
    Rotate = 25 => "Rotate",
    RotateReply = 26 => "Rotatereply",
    PeerReconfigure = 27 => "PeerReconfigure",
    PeerReconfigureReply = 28 => "PeerReconfigurereply",
    PeerReopenLogs = 29 => "PeerReopenLogs",
    PeerReopenLogsReply = 30 => "PeerReopenLogsreply",
    IdentifyStatsChannel = 31 => "IdentifyStatsChannel",
    IdentifyStatsChannelAck = 32 => "IdentifyStatsChannelAck",
    StatsMessageBegin = 33 => "StatsMessageBegin",
    ReqStatsData = 34 => "ReqStatsData",
    RespStatsData = 35 => "RespStatsData",
    RespStatsDataAck = 36 => "RespStatsDataAck",
    RespError = 37 => "RespError",
    StatsNotification = 38 => "StatsNotification",
    StatsNotificationAck = 39 => "StatsNotificationAck",
    StatsMessageLast = 40 => "StatsMessageLast",
}

impl Kind {
    pub const FIRST: u32 = 0;
    pub const LAST: u32 = 41;

    /// The payload shape required for this kind.
    pub fn shape(self) -> Shape {
        match self {
            Kind::GetPasswordReply => Shape::MustBeNonEmpty,
            Kind::CloseListenSocketReply
            | Kind::EndInitReply
            | Kind::SetPidPathReply
            | Kind::TerminateReply
            | Kind::ReconfigureReply
            | Kind::RotateReply
            | Kind::PeerReconfigure
            | Kind::ReconfigStatusDone => Shape::MustBeEmpty,
            _ => Shape::Unconstrained,
        }
    }

    /// The reply kind for a request kind.
    pub fn reply(self) -> Option<Kind> {
        let reply = match self {
            Kind::GetPassword => Kind::GetPasswordReply,
            Kind::GetListenSocket => Kind::GetListenSocketReply,
            Kind::CloseListenSocket => Kind::CloseListenSocketReply,
            Kind::EndInit => Kind::EndInitReply,
            Kind::SetPidPath => Kind::SetPidPathReply,
            Kind::Restart => Kind::RestartReply,
            Kind::Terminate => Kind::TerminateReply,
            Kind::Reconfigure => Kind::ReconfigureReply,
            Kind::GetReconfigStatus => Kind::GetReconfigStatusReply,
            Kind::ReconfigStatus => Kind::ReconfigStatusReply,
            Kind::ReconfigStatusDone => Kind::ReconfigStatusDoneReply,
            Kind::Rotate => Kind::RotateReply,
            Kind::PeerReconfigure => Kind::PeerReconfigureReply,
            Kind::PeerReopenLogs => Kind::PeerReopenLogsReply,
            Kind::IdentifyStatsChannel => Kind::IdentifyStatsChannelAck,
            _ => return None,
        };
        Some(reply)
    }

    /// Returns true if this kind answers a request.
    pub fn is_reply(self) -> bool {
        Kind::ALL.iter().any(|kind| kind.reply() == Some(self))
    }

    /// Returns true for the stats sub-range owned by the stats subsystem.
    pub fn is_stats(self) -> bool {
        (Kind::StatsMessageBegin..=Kind::StatsMessageLast).contains(&self)
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl From<Kind> for u32 {
    fn from(kind: Kind) -> Self {
        kind as u32
    }
}

/// Payload-shape constraint of a message kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Shape {
    Unconstrained = 0,
    MustBeEmpty = 1,
    MustBeNonEmpty = 2,
}

impl Shape {
    pub fn check(self, kind: Kind, payload: &[u8]) -> Result<(), ProtocolError> {
        match self {
            Shape::MustBeEmpty if !payload.is_empty() => Err(ProtocolError::MustBeEmpty(kind)),
            Shape::MustBeNonEmpty if payload.is_empty() => {
                Err(ProtocolError::MustBeNonEmpty(kind))
            }
            _ => Ok(()),
        }
    }
}

/// Violations of the message framing or of the per-kind rules.
#[derive(Debug, Display, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[display(fmt = "{} payload must be empty", "_0")]
    MustBeEmpty(Kind),
    #[display(fmt = "{} payload must not be empty", "_0")]
    MustBeNonEmpty(Kind),
    #[display(fmt = "invalid message kind {}", "_0")]
    InvalidKind(u32),
    #[display(fmt = "payload of {} bytes exceeds the maximum", "_0")]
    Oversize(usize),
    #[display(fmt = "short length header ({} bytes)", "_0")]
    BadHeader(usize),
    #[display(fmt = "invalid body length {}", "_0")]
    BadLength(u32),
    #[display(fmt = "truncated body ({} of {} bytes)", "_1", "_0")]
    Truncated(usize, usize),
    #[display(fmt = "malformed {} payload: {}", "_0", "_1")]
    Malformed(Kind, String),
    #[display(fmt = "unexpected {}", "_0")]
    Unexpected(Kind),
    #[display(fmt = "{} cannot be sent", "_0")]
    Synthetic(Kind),
}

impl std::error::Error for ProtocolError {}

/// The fixed-size frame header, sent with its own write.
#[derive(Debug, AsBytes, FromBytes, Default)]
#[repr(C)]
pub(crate) struct Header {
    /// Length of the following body.
    pub length: u32,
}

impl Header {
    pub const LENGTH: usize = mem::size_of::<Self>();
}

/// The fixed record carried by `GetListenSocketReply`.
#[derive(Debug, AsBytes, FromBytes, Default)]
#[repr(C)]
pub(crate) struct ListenSocketRecord {
    /// Non-negative if a descriptor is attached, otherwise a negated errno.
    pub status: i32,
    pub inline: [u8; 10],
    _padding: [u8; 2],
}

impl ListenSocketRecord {
    pub const LENGTH: usize = mem::size_of::<Self>();

    pub fn new(status: i32) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }
}

/// A typed watchdog message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    kind: Kind,
    payload: Bytes,
}

impl Message {
    /// Maximum body size (kind and payload).
    pub const MAX_BODY: usize = 4096;
    /// Size of the kind ordinal at the start of the body.
    pub const KIND_LENGTH: usize = mem::size_of::<u32>();
    /// Maximum payload size.
    pub const MAX_PAYLOAD: usize = Self::MAX_BODY - Self::KIND_LENGTH;

    /// Create a new message, rejecting payloads that violate the shape table.
    pub fn new<P: Into<Bytes>>(kind: Kind, payload: P) -> Result<Self, ProtocolError> {
        let payload = payload.into();
        if payload.len() > Self::MAX_PAYLOAD {
            return Err(ProtocolError::Oversize(payload.len()));
        }
        kind.shape().check(kind, &payload)?;
        Ok(Self { kind, payload })
    }

    pub fn empty(kind: Kind) -> Result<Self, ProtocolError> {
        Self::new(kind, Bytes::new())
    }

    pub fn text(kind: Kind, text: &str) -> Result<Self, ProtocolError> {
        Self::new(kind, Bytes::copy_from_slice(text.as_bytes()))
    }

    /// Create a message with a bincode-encoded payload.
    pub fn encode<T: Serialize>(kind: Kind, data: &T) -> Result<Self, ProtocolError> {
        let payload = bincode::serialize(data)
            .map_err(|err| ProtocolError::Malformed(kind, err.to_string()))?;
        Self::new(kind, payload)
    }

    /// The synthetic message returned when the peer closed the channel.
    pub fn empty_read() -> Self {
        Self {
            kind: Kind::EmptyRead,
            payload: Bytes::new(),
        }
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Decode a bincode payload.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        bincode::deserialize(&self.payload)
            .map_err(|err| ProtocolError::Malformed(self.kind, err.to_string()))
    }

    /// The payload as UTF-8 text.
    pub fn as_str(&self) -> Result<&str, ProtocolError> {
        str::from_utf8(&self.payload)
            .map_err(|err| ProtocolError::Malformed(self.kind, err.to_string()))
    }

    /// The status of a `GetListenSocketReply` record.
    pub fn listen_socket_status(&self) -> Result<i32, ProtocolError> {
        if self.kind != Kind::GetListenSocketReply {
            return Err(ProtocolError::Unexpected(self.kind));
        }
        if self.payload.len() != ListenSocketRecord::LENGTH {
            return Err(ProtocolError::Malformed(
                self.kind,
                format!("record of {} bytes", self.payload.len()),
            ));
        }
        let mut record = ListenSocketRecord::default();
        record.as_bytes_mut().copy_from_slice(&self.payload);
        Ok(record.status)
    }

    /// Encode the frame body (kind ordinal followed by the payload).
    pub(crate) fn to_body(&self) -> Result<Bytes, ProtocolError> {
        if self.kind == Kind::EmptyRead {
            return Err(ProtocolError::Synthetic(self.kind));
        }
        let mut body = BytesMut::with_capacity(Self::KIND_LENGTH + self.payload.len());
        body.put_slice(&u32::from(self.kind).to_ne_bytes());
        body.put_slice(&self.payload);
        Ok(body.freeze())
    }

    /// Decode and validate a received frame body.
    pub(crate) fn from_body(mut body: Bytes) -> Result<Self, ProtocolError> {
        if body.len() < Self::KIND_LENGTH || body.len() > Self::MAX_BODY {
            return Err(ProtocolError::BadLength(body.len() as u32));
        }
        let mut ordinal = [0u8; Self::KIND_LENGTH];
        ordinal.copy_from_slice(&body[..Self::KIND_LENGTH]);
        let kind = Kind::try_from(u32::from_ne_bytes(ordinal))?;
        if kind == Kind::EmptyRead {
            return Err(ProtocolError::Synthetic(kind));
        }
        let payload = body.split_off(Self::KIND_LENGTH);
        Self::new(kind, payload)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({} bytes)", self.kind, self.payload.len())
    }
}

/// Address family of a listen socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Family {
    Inet,
    Inet6,
    Unix,
}

/// Key of a registered listen socket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ListenSocketKey {
    pub name: String,
    /// Bind address; `None` binds the wildcard address.  For
    /// `Family::Unix` this is the socket path.
    pub addr: Option<String>,
    pub port: u16,
    pub family: Family,
    pub backlog: i32,
    /// Send buffer size, `0` keeps the system default.
    pub send_buffer: usize,
    /// Receive buffer size, `0` keeps the system default.
    pub recv_buffer: usize,
}

impl ListenSocketKey {
    pub fn new<S: Into<String>>(name: S, addr: Option<&str>, port: u16, family: Family) -> Self {
        Self {
            name: name.into(),
            addr: addr.map(ToOwned::to_owned),
            port,
            family,
            backlog: 128,
            send_buffer: 0,
            recv_buffer: 0,
        }
    }
}

impl fmt::Display for ListenSocketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({:?} {}:{})",
            self.name,
            self.family,
            self.addr.as_deref().unwrap_or("*"),
            self.port
        )
    }
}

/// Payload of `GetPassword`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasswordRequest {
    pub prompt: String,
    pub serial: u32,
}
