//! Chanmux connection service
//!
//! The connection layer of an SSH server: multiplexes session and
//! `direct-tcpip` channels over one authenticated transport, with per-channel
//! flow control, request handling, TCP forwarding and a demonstration shell.

pub mod channel;
pub mod config;
pub mod error;
pub mod events;
pub mod forward;
pub mod messages;
pub mod server;
pub mod service;
pub mod shell;

pub use channel::{Channel, ChannelInfo, ChannelInput, ChannelKind, ChannelState};
pub use config::ServiceConfig;
pub use error::{ConnectionError, ConnectionResult, DisconnectReason, OpenFailureReason};
pub use events::{
    AuthContext, ConnectionHandler, DefaultHandler, DirectTcpIpRequested, SessionRequestKind,
    SessionRequested,
};
pub use messages::{ConnectionMessage, OutboundMessage};
pub use service::ConnectionService;
