//! Connection-layer errors and the protocol reason codes they map to.

use serde::Serialize;
use thiserror::Error;

/// SSH disconnect reason codes (RFC 4253 section 11.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    ProtocolError,
    ServiceNotAvailable,
    ByApplication,
}

impl DisconnectReason {
    /// Numeric code as sent in `SSH_MSG_DISCONNECT`.
    pub fn code(self) -> u32 {
        match self {
            DisconnectReason::ProtocolError => 2,
            DisconnectReason::ServiceNotAvailable => 7,
            DisconnectReason::ByApplication => 11,
        }
    }
}

/// Reason codes for `SSH_MSG_CHANNEL_OPEN_FAILURE` (RFC 4254 section 5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OpenFailureReason {
    AdministrativelyProhibited,
    ConnectFailed,
    UnknownChannelType,
    ResourceShortage,
}

impl OpenFailureReason {
    pub fn code(self) -> u32 {
        match self {
            OpenFailureReason::AdministrativelyProhibited => 1,
            OpenFailureReason::ConnectFailed => 2,
            OpenFailureReason::UnknownChannelType => 3,
            OpenFailureReason::ResourceShortage => 4,
        }
    }
}

/// Errors raised while dispatching connection-layer messages.
///
/// Protocol violations are reported to the owning session, which is expected
/// to disconnect with [`ConnectionError::disconnect_reason`]. Failures the
/// protocol has a response for (denied forwarding, failed connects) never
/// surface here; they become open-failure messages instead.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("unknown channel type: {0}")]
    UnknownChannelType(String),

    #[error("unknown request type: {0}")]
    UnknownRequestType(String),

    #[error("invalid server channel id {0}")]
    InvalidChannelId(u32),

    #[error("channel {id} is not a {expected} channel")]
    WrongChannelKind { id: u32, expected: &'static str },

    #[error("channel {0} is closed")]
    ChannelClosed(u32),

    #[error("duplicate server channel id {0}")]
    DuplicateChannelId(u32),

    #[error("connection service is closed")]
    ServiceClosed,

    #[error("transport closed")]
    TransportClosed,
}

impl ConnectionError {
    /// Whether the peer violated the connection protocol.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            ConnectionError::UnknownChannelType(_)
                | ConnectionError::UnknownRequestType(_)
                | ConnectionError::InvalidChannelId(_)
                | ConnectionError::WrongChannelKind { .. }
        )
    }

    /// Disconnect reason the session should use when it tears down the transport.
    pub fn disconnect_reason(&self) -> DisconnectReason {
        match self {
            ConnectionError::UnknownChannelType(_)
            | ConnectionError::UnknownRequestType(_)
            | ConnectionError::InvalidChannelId(_)
            | ConnectionError::WrongChannelKind { .. }
            | ConnectionError::DuplicateChannelId(_) => DisconnectReason::ProtocolError,
            ConnectionError::ChannelClosed(_)
            | ConnectionError::ServiceClosed
            | ConnectionError::TransportClosed => DisconnectReason::ByApplication,
        }
    }
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;
