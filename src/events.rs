//! Notifications the connection service raises to the owning application.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::channel::{Channel, ChannelInfo};
use crate::error::OpenFailureReason;

/// Result of user authentication, produced by the authentication service and
/// consulted when the application authorizes channel requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    pub username: String,
    /// Method that succeeded (e.g. `publickey`, `password`, `none`).
    pub method: String,
    pub peer_addr: Option<SocketAddr>,
}

impl AuthContext {
    pub fn new(username: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            method: method.into(),
            peer_addr: None,
        }
    }

    pub fn with_peer_addr(mut self, peer_addr: SocketAddr) -> Self {
        self.peer_addr = Some(peer_addr);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionRequestKind {
    Exec { command: String },
    Subsystem { name: String },
}

/// A session channel asked to run a command or subsystem.
///
/// The channel handle stays usable until the channel closes; the application
/// can register a data consumer on it, send output, and close it.
#[derive(Clone)]
pub struct SessionRequested {
    pub channel: Arc<Channel>,
    pub kind: SessionRequestKind,
    pub auth: Arc<AuthContext>,
}

impl SessionRequested {
    pub fn command_text(&self) -> Option<&str> {
        match &self.kind {
            SessionRequestKind::Exec { command } => Some(command),
            SessionRequestKind::Subsystem { .. } => None,
        }
    }

    pub fn subsystem_name(&self) -> Option<&str> {
        match &self.kind {
            SessionRequestKind::Subsystem { name } => Some(name),
            SessionRequestKind::Exec { .. } => None,
        }
    }
}

/// A peer asked to forward a connection to `host:port`.
///
/// Starts out denied. The handler calls [`allow`](Self::allow) or
/// [`deny`](Self::deny) before returning. No server channel id exists yet;
/// one is assigned only once the outbound connect succeeds.
#[derive(Debug, Clone)]
pub struct DirectTcpIpRequested {
    /// The peer's id for the channel it is trying to open.
    pub client_channel_id: u32,
    pub host: String,
    pub port: u32,
    pub originator_address: String,
    pub originator_port: u32,
    pub auth: Arc<AuthContext>,
    allowed: bool,
    reason: OpenFailureReason,
    description: Option<String>,
}

impl DirectTcpIpRequested {
    pub(crate) fn new(
        client_channel_id: u32,
        host: String,
        port: u32,
        originator_address: String,
        originator_port: u32,
        auth: Arc<AuthContext>,
    ) -> Self {
        Self {
            client_channel_id,
            host,
            port,
            originator_address,
            originator_port,
            auth,
            allowed: false,
            reason: OpenFailureReason::AdministrativelyProhibited,
            description: None,
        }
    }

    pub fn allow(&mut self) {
        self.allowed = true;
    }

    pub fn deny(&mut self, reason: OpenFailureReason, description: impl Into<String>) {
        self.allowed = false;
        self.reason = reason;
        self.description = Some(description.into());
    }

    pub fn is_allowed(&self) -> bool {
        self.allowed
    }

    pub fn reason(&self) -> OpenFailureReason {
        self.reason
    }

    /// Description sent with the open-failure, `"not specified"` unless set.
    pub fn description(&self) -> &str {
        self.description.as_deref().unwrap_or("not specified")
    }
}

/// Application callbacks for one connection service.
///
/// Called synchronously from dispatch; implementations that need to do I/O
/// should spawn it. The defaults accept every forward and ignore the rest.
pub trait ConnectionHandler: Send + Sync {
    /// An `exec` or `subsystem` request was acknowledged.
    fn session_requested(&self, _request: SessionRequested) {}

    /// Decide whether a `direct-tcpip` open may connect.
    fn direct_tcpip_requested(&self, request: &mut DirectTcpIpRequested) {
        request.allow();
    }

    /// A channel left the live set.
    fn channel_closed(&self, _channel: &ChannelInfo) {}
}

/// Handler used when the application registers none.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHandler;

impl ConnectionHandler for DefaultHandler {}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> DirectTcpIpRequested {
        DirectTcpIpRequested::new(
            9,
            "localhost".to_string(),
            80,
            "10.0.0.1".to_string(),
            50000,
            Arc::new(AuthContext::new("alice", "publickey")),
        )
    }

    #[test]
    fn test_direct_tcpip_request_defaults() {
        let req = request();
        assert!(!req.is_allowed());
        assert_eq!(req.description(), "not specified");
        assert_eq!(req.reason(), OpenFailureReason::AdministrativelyProhibited);
    }

    #[test]
    fn test_session_request_text_by_kind() {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let table = crate::channel::ChannelTable::new(Arc::new(DefaultHandler));
        let weak = Arc::downgrade(&table);
        let channel = table
            .accept(|id| {
                Channel::new(
                    id,
                    crate::channel::PeerParams {
                        client_channel_id: 1,
                        initial_window_size: 100,
                        maximum_packet_size: 100,
                    },
                    crate::channel::ChannelKind::Session,
                    &crate::config::ChannelConfig::default(),
                    crate::channel::Outbound::new(tx),
                    weak,
                )
            })
            .unwrap();
        let auth = Arc::new(AuthContext::new("alice", "publickey"));

        let exec = SessionRequested {
            channel: channel.clone(),
            kind: SessionRequestKind::Exec {
                command: "uptime".to_string(),
            },
            auth: auth.clone(),
        };
        assert_eq!(exec.command_text(), Some("uptime"));
        assert_eq!(exec.subsystem_name(), None);

        let subsystem = SessionRequested {
            channel,
            kind: SessionRequestKind::Subsystem {
                name: "sftp".to_string(),
            },
            auth,
        };
        assert_eq!(subsystem.command_text(), None);
        assert_eq!(subsystem.subsystem_name(), Some("sftp"));
    }

    #[test]
    fn test_default_handler_allows_forwarding() {
        let mut req = request();
        DefaultHandler.direct_tcpip_requested(&mut req);
        assert!(req.is_allowed());
    }

    #[test]
    fn test_deny_sets_reason_and_description() {
        let mut req = request();
        req.allow();
        req.deny(OpenFailureReason::ResourceShortage, "too many forwards");
        assert!(!req.is_allowed());
        assert_eq!(req.reason(), OpenFailureReason::ResourceShortage);
        assert_eq!(req.description(), "too many forwards");
    }
}
