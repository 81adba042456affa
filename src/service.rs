//! The connection service: one per authenticated session.
//!
//! Routes every inbound connection-layer message to the channel it names,
//! opens and confirms new channels, answers channel requests, and tears all
//! channels down when the session ends.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::channel::{Channel, ChannelInfo, ChannelKind, ChannelTable, Outbound, PeerParams};
use crate::config::{ChannelConfig, ShellConfig};
use crate::error::{ConnectionError, ConnectionResult, OpenFailureReason};
use crate::events::{
    AuthContext, ConnectionHandler, DirectTcpIpRequested, SessionRequestKind, SessionRequested,
};
use crate::forward::{self, Connector, TcpConnector};
use crate::messages::{
    ChannelOpen, ChannelOpenKind, ChannelRequest, ConnectionMessage, DirectTcpIpParams,
    OutboundMessage, PtyParams, RequestKind,
};
use crate::shell;

/// Connection-layer dispatcher for one session.
///
/// Messages must be handed to [`handle_message`](Self::handle_message) one at
/// a time, from within a Tokio runtime. Channel consumers (shell, forwards,
/// application handlers) run on their own tasks.
pub struct ConnectionService {
    table: Arc<ChannelTable>,
    outbound: Outbound,
    auth: Arc<AuthContext>,
    channel_config: ChannelConfig,
    shell_config: ShellConfig,
    connector: Arc<dyn Connector>,
}

impl ConnectionService {
    pub fn new(
        auth: Arc<AuthContext>,
        outbound: mpsc::UnboundedSender<OutboundMessage>,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Self {
        Self {
            table: ChannelTable::new(handler),
            outbound: Outbound::new(outbound),
            auth,
            channel_config: ChannelConfig::default(),
            shell_config: ShellConfig::default(),
            connector: Arc::new(TcpConnector::default()),
        }
    }

    pub fn with_channel_config(mut self, config: ChannelConfig) -> Self {
        self.channel_config = config;
        self
    }

    pub fn with_shell_config(mut self, config: ShellConfig) -> Self {
        self.shell_config = config;
        self
    }

    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn auth(&self) -> &Arc<AuthContext> {
        &self.auth
    }

    /// Live channels, ordered by server channel id.
    pub fn channels(&self) -> Vec<ChannelInfo> {
        self.table.snapshot().iter().map(|c| c.info()).collect()
    }

    pub fn channel_count(&self) -> usize {
        self.table.len()
    }

    /// Look up a live channel by its server-assigned id.
    pub fn channel(&self, server_channel_id: u32) -> ConnectionResult<Arc<Channel>> {
        self.table.get(server_channel_id)
    }

    /// Dispatch one decoded message.
    ///
    /// Any peer-visible failure response has already been sent when this
    /// returns an error; the caller decides whether to disconnect.
    pub fn handle_message(&self, message: ConnectionMessage) -> ConnectionResult<()> {
        debug!("Dispatching {}", message.name());
        match message {
            ConnectionMessage::ChannelOpen(open) => self.handle_channel_open(open),
            ConnectionMessage::ChannelRequest(request) => self.handle_channel_request(request),
            ConnectionMessage::ChannelData {
                recipient_channel,
                data,
            } => self.table.get(recipient_channel)?.on_data(data),
            ConnectionMessage::WindowAdjust {
                recipient_channel,
                bytes_to_add,
            } => {
                self.table
                    .get(recipient_channel)?
                    .on_window_adjust(bytes_to_add);
                Ok(())
            }
            ConnectionMessage::ChannelEof { recipient_channel } => {
                debug!("Channel EOF: {}", recipient_channel);
                self.table.get(recipient_channel)?.on_eof();
                Ok(())
            }
            ConnectionMessage::ChannelClose { recipient_channel } => {
                debug!("Channel closed by peer: {}", recipient_channel);
                self.table.get(recipient_channel)?.on_close()
            }
        }
    }

    /// Force-close every live channel and refuse new ones.
    pub fn close_service(&self) {
        let channels = self.table.shut();
        info!(
            "Closing connection service for '{}' ({} live channel(s))",
            self.auth.username,
            channels.len()
        );
        for channel in channels {
            channel.force_close();
        }
    }

    fn handle_channel_open(&self, open: ChannelOpen) -> ConnectionResult<()> {
        let peer = PeerParams {
            client_channel_id: open.sender_channel,
            initial_window_size: open.initial_window_size,
            maximum_packet_size: open.maximum_packet_size,
        };
        match open.kind {
            ChannelOpenKind::Session => self.open_session(peer),
            ChannelOpenKind::DirectTcpIp(params) => self.open_direct_tcpip(peer, params),
            ChannelOpenKind::Other(channel_type) => {
                warn!("Rejecting unknown channel type '{}'", channel_type);
                self.outbound.send(OutboundMessage::OpenFailure {
                    recipient_channel: open.sender_channel,
                    reason: OpenFailureReason::UnknownChannelType,
                    description: format!("Unknown channel type: {channel_type}."),
                })?;
                Err(ConnectionError::UnknownChannelType(channel_type))
            }
        }
    }

    fn open_session(&self, peer: PeerParams) -> ConnectionResult<()> {
        let channel = accept_channel(
            &self.table,
            peer,
            ChannelKind::Session,
            &self.channel_config,
            &self.outbound,
        )?;
        info!(
            "Session channel opened: server={} client={}",
            channel.server_channel_id(),
            channel.client_channel_id()
        );
        self.outbound.send(channel.open_confirmation())
    }

    fn open_direct_tcpip(
        &self,
        peer: PeerParams,
        params: DirectTcpIpParams,
    ) -> ConnectionResult<()> {
        info!(
            "Direct-tcpip request: {}:{} from {}:{}",
            params.host_to_connect,
            params.port_to_connect,
            params.originator_address,
            params.originator_port
        );

        let mut request = DirectTcpIpRequested::new(
            peer.client_channel_id,
            params.host_to_connect.clone(),
            params.port_to_connect,
            params.originator_address.clone(),
            params.originator_port,
            self.auth.clone(),
        );
        self.table.handler().direct_tcpip_requested(&mut request);
        if !request.is_allowed() {
            info!(
                "Direct-tcpip to {}:{} denied: {}",
                params.host_to_connect,
                params.port_to_connect,
                request.description()
            );
            return self.outbound.send(OutboundMessage::OpenFailure {
                recipient_channel: peer.client_channel_id,
                reason: request.reason(),
                description: request.description().to_string(),
            });
        }

        let connect = self
            .connector
            .connect(&params.host_to_connect, params.port_to_connect);
        let table = self.table.clone();
        let outbound = self.outbound.clone();
        let channel_config = self.channel_config;
        tokio::spawn(async move {
            let open_failure =
                |reason: OpenFailureReason, description: String| OutboundMessage::OpenFailure {
                    recipient_channel: peer.client_channel_id,
                    reason,
                    description,
                };

            let stream = match connect.await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(
                        "Connect to {}:{} failed: {}",
                        params.host_to_connect, params.port_to_connect, e
                    );
                    let _ = outbound.send(open_failure(OpenFailureReason::ConnectFailed, e.to_string()));
                    return;
                }
            };

            let kind = ChannelKind::DirectTcpIp(params.clone());
            let channel = match accept_channel(&table, peer, kind, &channel_config, &outbound) {
                Ok(channel) => channel,
                Err(e) => {
                    warn!("Dropping forward to {}: {}", params.host_to_connect, e);
                    let _ = outbound.send(open_failure(OpenFailureReason::ConnectFailed, e.to_string()));
                    return;
                }
            };
            let input = match channel.subscribe() {
                Ok(input) => input,
                Err(e) => {
                    channel.force_close();
                    let _ = outbound.send(open_failure(OpenFailureReason::ConnectFailed, e.to_string()));
                    return;
                }
            };
            if outbound.send(channel.open_confirmation()).is_err() {
                channel.force_close();
                return;
            }
            info!(
                "Forwarding channel {} to {}:{}",
                channel.server_channel_id(),
                params.host_to_connect,
                params.port_to_connect
            );
            forward::spawn_pumps(channel, stream, input);
        });
        Ok(())
    }

    fn handle_channel_request(&self, request: ChannelRequest) -> ConnectionResult<()> {
        let ChannelRequest {
            recipient_channel,
            want_reply,
            kind,
        } = request;
        match kind {
            RequestKind::Exec { command } => self.handle_exec(recipient_channel, want_reply, command),
            RequestKind::PtyReq(pty) => self.handle_pty(recipient_channel, want_reply, pty),
            RequestKind::Subsystem { name } => {
                self.handle_subsystem(recipient_channel, want_reply, name)
            }
            RequestKind::Shell => self.handle_shell(recipient_channel, want_reply),
            RequestKind::Other(request_type) => {
                warn!(
                    "Unknown request type '{}' on channel {}",
                    request_type, recipient_channel
                );
                if want_reply {
                    let channel = self.table.get(recipient_channel)?;
                    self.outbound.send(OutboundMessage::RequestFailure {
                        recipient_channel: channel.client_channel_id(),
                    })?;
                }
                Err(ConnectionError::UnknownRequestType(request_type))
            }
        }
    }

    fn session_channel(&self, server_channel_id: u32) -> ConnectionResult<Arc<Channel>> {
        let channel = self.table.get(server_channel_id)?;
        match channel.kind() {
            ChannelKind::Session => Ok(channel),
            ChannelKind::DirectTcpIp(_) => Err(ConnectionError::WrongChannelKind {
                id: server_channel_id,
                expected: "session",
            }),
        }
    }

    fn reply_success(&self, channel: &Channel, want_reply: bool) -> ConnectionResult<()> {
        if !want_reply {
            return Ok(());
        }
        self.outbound.send(OutboundMessage::RequestSuccess {
            recipient_channel: channel.client_channel_id(),
        })
    }

    fn handle_pty(&self, id: u32, want_reply: bool, pty: PtyParams) -> ConnectionResult<()> {
        let channel = self.session_channel(id)?;
        debug!(
            "PTY request: channel={}, term={}, cols={}, rows={}",
            id, pty.term, pty.cols, pty.rows
        );
        self.reply_success(&channel, want_reply)
    }

    fn handle_subsystem(&self, id: u32, want_reply: bool, name: String) -> ConnectionResult<()> {
        let channel = self.session_channel(id)?;
        self.reply_success(&channel, want_reply)?;
        info!("Subsystem request on channel {}: {}", id, name);
        self.table.handler().session_requested(SessionRequested {
            channel,
            kind: SessionRequestKind::Subsystem { name },
            auth: self.auth.clone(),
        });
        Ok(())
    }

    fn handle_exec(&self, id: u32, want_reply: bool, command: String) -> ConnectionResult<()> {
        let channel = self.session_channel(id)?;
        self.reply_success(&channel, want_reply)?;
        info!("Exec request on channel {}: {}", id, command);
        self.table.handler().session_requested(SessionRequested {
            channel,
            kind: SessionRequestKind::Exec { command },
            auth: self.auth.clone(),
        });
        Ok(())
    }

    fn handle_shell(&self, id: u32, want_reply: bool) -> ConnectionResult<()> {
        let channel = self.session_channel(id)?;
        let input = channel.subscribe()?;
        self.reply_success(&channel, want_reply)?;
        info!("Shell request on channel {}", id);
        shell::spawn_shell(channel, input, self.shell_config.clone());
        Ok(())
    }
}

/// Add an open channel to `table` under the next server id.
fn accept_channel(
    table: &Arc<ChannelTable>,
    peer: PeerParams,
    kind: ChannelKind,
    config: &ChannelConfig,
    outbound: &Outbound,
) -> ConnectionResult<Arc<Channel>> {
    let weak = Arc::downgrade(table);
    table.accept(|id| {
        let channel = Channel::new(id, peer, kind, config, outbound.clone(), weak);
        channel.mark_open();
        channel
    })
}
