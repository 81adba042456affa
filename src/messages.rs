//! Decoded connection-layer messages.
//!
//! The transport hands the service one [`ConnectionMessage`] at a time. Open
//! and request messages carry their subtype as a tagged variant; anything the
//! decoder did not recognize keeps its raw discriminator in an `Other` arm so
//! the dispatcher can answer it with the right failure.

use serde::Serialize;

use crate::error::OpenFailureReason;

/// An inbound connection-protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionMessage {
    ChannelOpen(ChannelOpen),
    ChannelRequest(ChannelRequest),
    ChannelData { recipient_channel: u32, data: Vec<u8> },
    WindowAdjust { recipient_channel: u32, bytes_to_add: u32 },
    ChannelEof { recipient_channel: u32 },
    ChannelClose { recipient_channel: u32 },
}

impl ConnectionMessage {
    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionMessage::ChannelOpen(_) => "channel-open",
            ConnectionMessage::ChannelRequest(_) => "channel-request",
            ConnectionMessage::ChannelData { .. } => "channel-data",
            ConnectionMessage::WindowAdjust { .. } => "window-adjust",
            ConnectionMessage::ChannelEof { .. } => "channel-eof",
            ConnectionMessage::ChannelClose { .. } => "channel-close",
        }
    }
}

/// `SSH_MSG_CHANNEL_OPEN`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpen {
    /// The peer's id for the new channel.
    pub sender_channel: u32,
    pub initial_window_size: u32,
    pub maximum_packet_size: u32,
    pub kind: ChannelOpenKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelOpenKind {
    Session,
    DirectTcpIp(DirectTcpIpParams),
    Other(String),
}

impl ChannelOpenKind {
    /// The wire discriminator (`channel type` string).
    pub fn channel_type(&self) -> &str {
        match self {
            ChannelOpenKind::Session => "session",
            ChannelOpenKind::DirectTcpIp(_) => "direct-tcpip",
            ChannelOpenKind::Other(name) => name,
        }
    }
}

/// Type-specific fields of a `direct-tcpip` open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirectTcpIpParams {
    pub host_to_connect: String,
    pub port_to_connect: u32,
    pub originator_address: String,
    pub originator_port: u32,
}

/// `SSH_MSG_CHANNEL_REQUEST`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRequest {
    /// Server-assigned id of the target channel.
    pub recipient_channel: u32,
    pub want_reply: bool,
    pub kind: RequestKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestKind {
    Exec { command: String },
    PtyReq(PtyParams),
    Subsystem { name: String },
    Shell,
    Other(String),
}

impl RequestKind {
    pub fn request_type(&self) -> &str {
        match self {
            RequestKind::Exec { .. } => "exec",
            RequestKind::PtyReq(_) => "pty-req",
            RequestKind::Subsystem { .. } => "subsystem",
            RequestKind::Shell => "shell",
            RequestKind::Other(name) => name,
        }
    }
}

/// Terminal parameters of a `pty-req`. Logged only; no terminal is modeled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PtyParams {
    pub term: String,
    pub cols: u32,
    pub rows: u32,
}

/// A message the service hands back to the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    OpenConfirmation {
        recipient_channel: u32,
        sender_channel: u32,
        initial_window_size: u32,
        maximum_packet_size: u32,
    },
    OpenFailure {
        recipient_channel: u32,
        reason: OpenFailureReason,
        description: String,
    },
    RequestSuccess {
        recipient_channel: u32,
    },
    RequestFailure {
        recipient_channel: u32,
    },
    Data {
        recipient_channel: u32,
        data: Vec<u8>,
    },
    WindowAdjust {
        recipient_channel: u32,
        bytes_to_add: u32,
    },
    Eof {
        recipient_channel: u32,
    },
    Close {
        recipient_channel: u32,
    },
    ExitStatus {
        recipient_channel: u32,
        exit_status: u32,
    },
}

impl OutboundMessage {
    /// The peer-visible channel id the message is addressed to.
    pub fn recipient_channel(&self) -> u32 {
        match self {
            OutboundMessage::OpenConfirmation { recipient_channel, .. }
            | OutboundMessage::OpenFailure { recipient_channel, .. }
            | OutboundMessage::RequestSuccess { recipient_channel }
            | OutboundMessage::RequestFailure { recipient_channel }
            | OutboundMessage::Data { recipient_channel, .. }
            | OutboundMessage::WindowAdjust { recipient_channel, .. }
            | OutboundMessage::Eof { recipient_channel }
            | OutboundMessage::Close { recipient_channel }
            | OutboundMessage::ExitStatus { recipient_channel, .. } => *recipient_channel,
        }
    }
}
