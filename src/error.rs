//! Error types returned by every module of this crate.
use strum::Display;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    WebRTCError(#[from] webrtc::Error),
    #[error(transparent)]
    JsonError(#[from] serde_json::Error),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error(transparent)]
    ChannelError(#[from] ChannelError),
    #[error(transparent)]
    TransportError(#[from] TransportError),
    #[error(transparent)]
    SessionError(#[from] SessionError),
    #[error(transparent)]
    ConfigError(#[from] ConfigError),
}

impl Error {
    pub fn new_channel(message: String, kind: ChannelErrorKind) -> Error {
        Error::ChannelError(ChannelError { kind, message })
    }

    pub fn new_transport(message: String, kind: TransportErrorKind) -> Error {
        Error::TransportError(TransportError { kind, message })
    }

    pub fn new_session(message: String, kind: SessionErrorKind) -> Error {
        Error::SessionError(SessionError { kind, message })
    }

    pub fn new_config(message: String, kind: ConfigErrorKind) -> Error {
        Error::ConfigError(ConfigError { kind, message })
    }

    /// Returns the channel error kind when this is a [`ChannelError`].
    pub fn channel_kind(&self) -> Option<&ChannelErrorKind> {
        match self {
            Error::ChannelError(err) => Some(&err.kind),
            _ => None,
        }
    }

    pub fn transport_kind(&self) -> Option<&TransportErrorKind> {
        match self {
            Error::TransportError(err) => Some(&err.kind),
            _ => None,
        }
    }
}

/// Failures of the persistent signaling connection.
#[derive(thiserror::Error, Debug)]
#[error("{kind}: {message}")]
pub struct ChannelError {
    pub kind: ChannelErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub enum ChannelErrorKind {
    ConnectionError,
    ReadTimeoutError,
    WriteTimeoutError,
    MessageTooLargeError,
    DecodeError,
    ClosedError,
}

/// Failures reported by, or about, a media peer.
#[derive(thiserror::Error, Debug)]
#[error("{kind}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub enum TransportErrorKind {
    SignalingStateInvalidError,
    LocalDescriptionError,
    TrackEndedError,
    PortRangeError,
}

#[derive(thiserror::Error, Debug)]
#[error("{kind}: {message}")]
pub struct SessionError {
    pub kind: SessionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub enum SessionErrorKind {
    PeerNotFoundError,
    UnexpectedPayloadError,
}

#[derive(thiserror::Error, Debug)]
#[error("{kind}: {message}")]
pub struct ConfigError {
    pub kind: ConfigErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub enum ConfigErrorKind {
    InvalidEnvError,
    InvalidPortRangeError,
}
