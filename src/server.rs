//! Development transport: connection-layer messages as JSON lines over TCP.
//!
//! Each accepted socket gets its own [`ConnectionService`]. The first line a
//! client sends is a `userauth` record standing in for the authentication
//! service; every later line is one connection message. Outbound messages
//! are written back one JSON object per line, and a protocol violation ends
//! the connection with a `disconnect` line.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::channel::ChannelInfo;
use crate::config::{ForwardingConfig, ServiceConfig};
use crate::error::{ConnectionError, DisconnectReason, OpenFailureReason};
use crate::events::{AuthContext, ConnectionHandler, DirectTcpIpRequested, SessionRequested};
use crate::forward::TcpConnector;
use crate::messages::{
    ChannelOpen, ChannelOpenKind, ChannelRequest, ConnectionMessage, DirectTcpIpParams,
    OutboundMessage, PtyParams, RequestKind,
};
use crate::service::ConnectionService;

/// Exit status reported for commands the demo console does not know.
const UNKNOWN_COMMAND_STATUS: u32 = 127;

/// One inbound JSON line.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireMessage {
    Userauth {
        username: String,
        #[serde(default = "default_auth_method")]
        method: String,
    },
    ChannelOpen {
        channel_type: String,
        sender_channel: u32,
        initial_window_size: u32,
        maximum_packet_size: u32,
        host_to_connect: Option<String>,
        port_to_connect: Option<u32>,
        originator_address: Option<String>,
        originator_port: Option<u32>,
    },
    ChannelRequest {
        recipient_channel: u32,
        request_type: String,
        #[serde(default)]
        want_reply: bool,
        command: Option<String>,
        subsystem_name: Option<String>,
        term: Option<String>,
        cols: Option<u32>,
        rows: Option<u32>,
    },
    ChannelData {
        recipient_channel: u32,
        data: WirePayload,
    },
    WindowAdjust {
        recipient_channel: u32,
        bytes_to_add: u32,
    },
    ChannelEof {
        recipient_channel: u32,
    },
    ChannelClose {
        recipient_channel: u32,
    },
}

fn default_auth_method() -> String {
    "none".to_string()
}

/// Channel data given either as text or as raw bytes.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WirePayload {
    Text(String),
    Bytes(Vec<u8>),
}

impl WirePayload {
    fn into_bytes(self) -> Vec<u8> {
        match self {
            WirePayload::Text(text) => text.into_bytes(),
            WirePayload::Bytes(bytes) => bytes,
        }
    }
}

#[derive(Debug)]
enum Inbound {
    Userauth { username: String, method: String },
    Message(ConnectionMessage),
}

/// Final line written before the server drops a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename = "disconnect")]
struct Disconnect {
    reason: DisconnectReason,
    code: u32,
    description: String,
}

impl Disconnect {
    fn new(reason: DisconnectReason, description: impl Into<String>) -> Self {
        Self {
            reason,
            code: reason.code(),
            description: description.into(),
        }
    }

    fn from_error(err: &ConnectionError) -> Self {
        Self::new(err.disconnect_reason(), err.to_string())
    }
}

fn decode_line(line: &str) -> Result<Inbound> {
    let wire: WireMessage = serde_json::from_str(line).context("Malformed message")?;
    let message = match wire {
        WireMessage::Userauth { username, method } => {
            return Ok(Inbound::Userauth { username, method });
        }
        WireMessage::ChannelOpen {
            channel_type,
            sender_channel,
            initial_window_size,
            maximum_packet_size,
            host_to_connect,
            port_to_connect,
            originator_address,
            originator_port,
        } => {
            let kind = match channel_type.as_str() {
                "session" => ChannelOpenKind::Session,
                "direct-tcpip" => ChannelOpenKind::DirectTcpIp(DirectTcpIpParams {
                    host_to_connect: host_to_connect
                        .ok_or_else(|| anyhow!("direct-tcpip open without host_to_connect"))?,
                    port_to_connect: port_to_connect
                        .ok_or_else(|| anyhow!("direct-tcpip open without port_to_connect"))?,
                    originator_address: originator_address.unwrap_or_default(),
                    originator_port: originator_port.unwrap_or_default(),
                }),
                _ => ChannelOpenKind::Other(channel_type),
            };
            ConnectionMessage::ChannelOpen(ChannelOpen {
                sender_channel,
                initial_window_size,
                maximum_packet_size,
                kind,
            })
        }
        WireMessage::ChannelRequest {
            recipient_channel,
            request_type,
            want_reply,
            command,
            subsystem_name,
            term,
            cols,
            rows,
        } => {
            let kind = match request_type.as_str() {
                "exec" => RequestKind::Exec {
                    command: command.ok_or_else(|| anyhow!("exec request without command"))?,
                },
                "subsystem" => RequestKind::Subsystem {
                    name: subsystem_name
                        .ok_or_else(|| anyhow!("subsystem request without subsystem_name"))?,
                },
                "pty-req" => RequestKind::PtyReq(PtyParams {
                    term: term.unwrap_or_default(),
                    cols: cols.unwrap_or_default(),
                    rows: rows.unwrap_or_default(),
                }),
                "shell" => RequestKind::Shell,
                _ => RequestKind::Other(request_type),
            };
            ConnectionMessage::ChannelRequest(ChannelRequest {
                recipient_channel,
                want_reply,
                kind,
            })
        }
        WireMessage::ChannelData {
            recipient_channel,
            data,
        } => ConnectionMessage::ChannelData {
            recipient_channel,
            data: data.into_bytes(),
        },
        WireMessage::WindowAdjust {
            recipient_channel,
            bytes_to_add,
        } => ConnectionMessage::WindowAdjust {
            recipient_channel,
            bytes_to_add,
        },
        WireMessage::ChannelEof { recipient_channel } => {
            ConnectionMessage::ChannelEof { recipient_channel }
        }
        WireMessage::ChannelClose { recipient_channel } => {
            ConnectionMessage::ChannelClose { recipient_channel }
        }
    };
    Ok(Inbound::Message(message))
}

/// Check if a hostname refers to localhost.
fn is_localhost(host: &str) -> bool {
    host == "localhost"
        || host == "127.0.0.1"
        || host == "::1"
        || host == "[::1]"
        || host == "0.0.0.0"
}

/// Application side of the development server.
///
/// Applies the forwarding policy from the configuration and answers every
/// `exec`/`subsystem` with the console's unknown-command reply.
pub struct PolicyHandler {
    forwarding: ForwardingConfig,
}

impl PolicyHandler {
    pub fn new(forwarding: ForwardingConfig) -> Self {
        Self { forwarding }
    }
}

impl ConnectionHandler for PolicyHandler {
    fn session_requested(&self, request: SessionRequested) {
        let text = request
            .command_text()
            .or(request.subsystem_name())
            .unwrap_or_default()
            .to_string();
        info!(
            "{} requested '{}' on channel {}",
            request.auth.username,
            text,
            request.channel.server_channel_id()
        );
        let channel = request.channel;
        tokio::spawn(async move {
            let reply = format!("Unknown command: {text}\r\n");
            if let Err(e) = channel.send_data(reply.as_bytes()).await {
                debug!("Could not answer channel {}: {}", channel.server_channel_id(), e);
                return;
            }
            if let Err(e) = channel.close(Some(UNKNOWN_COMMAND_STATUS)) {
                debug!("Could not close channel {}: {}", channel.server_channel_id(), e);
            }
        });
    }

    fn direct_tcpip_requested(&self, request: &mut DirectTcpIpRequested) {
        if !self.forwarding.allow_direct_tcpip {
            request.deny(
                OpenFailureReason::AdministrativelyProhibited,
                "Port forwarding is disabled",
            );
            return;
        }
        if !self.forwarding.allow_nonlocal_destinations && !is_localhost(&request.host) {
            warn!(
                "Denying forward for {} to non-local destination {}:{}",
                request.auth.username, request.host, request.port
            );
            let description = format!("Forwarding to {} is not permitted", request.host);
            request.deny(OpenFailureReason::AdministrativelyProhibited, description);
            return;
        }
        request.allow();
    }

    fn channel_closed(&self, channel: &ChannelInfo) {
        debug!(
            "Channel {} ({}) closed, open since {}",
            channel.server_channel_id,
            channel.kind.name(),
            channel.opened_at.to_rfc3339()
        );
    }
}

/// JSON form of an outbound message. Open-failures also carry the numeric
/// reason code.
fn outbound_frame(message: &OutboundMessage) -> Result<serde_json::Value> {
    let mut frame = serde_json::to_value(message).context("Failed to encode message")?;
    if let OutboundMessage::OpenFailure { reason, .. } = message {
        frame["reason_code"] = reason.code().into();
    }
    Ok(frame)
}

async fn write_line<T: Serialize>(writer: &mut OwnedWriteHalf, value: &T) -> Result<()> {
    let mut line = serde_json::to_vec(value).context("Failed to encode message")?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    Ok(())
}

/// Write outbound messages until the session ends, then the disconnect line
/// if there is one.
async fn write_frames(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<OutboundMessage>,
    mut disconnect: oneshot::Receiver<Disconnect>,
) -> Result<()> {
    loop {
        tokio::select! {
            message = rx.recv() => match message {
                Some(message) => write_line(&mut writer, &outbound_frame(&message)?).await?,
                None => break,
            },
            ending = &mut disconnect => {
                while let Ok(message) = rx.try_recv() {
                    write_line(&mut writer, &outbound_frame(&message)?).await?;
                }
                if let Ok(ending) = ending {
                    write_line(&mut writer, &ending).await?;
                }
                break;
            }
        }
    }
    writer.shutdown().await?;
    Ok(())
}

/// Serve one client connection to completion.
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    config: Arc<ServiceConfig>,
) -> Result<()> {
    let (read_half, write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    let (tx, rx) = mpsc::unbounded_channel();
    let (disconnect_tx, disconnect_rx) = oneshot::channel();
    let writer = tokio::spawn(write_frames(write_half, rx, disconnect_rx));

    let auth = match lines.next_line().await? {
        Some(line) => match decode_line(&line) {
            Ok(Inbound::Userauth { username, method }) => {
                AuthContext::new(username, method).with_peer_addr(peer_addr)
            }
            _ => {
                let _ = disconnect_tx.send(Disconnect::new(
                    DisconnectReason::ServiceNotAvailable,
                    "Expected userauth",
                ));
                writer.await??;
                bail!("{} did not authenticate", peer_addr);
            }
        },
        None => return Ok(()),
    };
    let service = ConnectionService::new(
        Arc::new(auth),
        tx,
        Arc::new(PolicyHandler::new(config.forwarding.clone())),
    )
    .with_channel_config(config.channel)
    .with_shell_config(config.shell.clone())
    .with_connector(Arc::new(TcpConnector::new(
        config.forwarding.connect_timeout(),
    )));
    info!(
        "{} authenticated as '{}' ({})",
        peer_addr,
        service.auth().username,
        service.auth().method
    );

    let ending = loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break None,
            Err(e) => {
                warn!("Read error from {}: {}", peer_addr, e);
                break None;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let message = match decode_line(&line) {
            Ok(Inbound::Message(message)) => message,
            Ok(Inbound::Userauth { .. }) => {
                break Some(Disconnect::new(
                    DisconnectReason::ProtocolError,
                    "Unexpected userauth",
                ));
            }
            Err(e) => {
                warn!("Bad message from {}: {:#}", peer_addr, e);
                break Some(Disconnect::new(
                    DisconnectReason::ProtocolError,
                    format!("{e:#}"),
                ));
            }
        };
        match service.handle_message(message) {
            Ok(()) => {}
            Err(e) if e.is_protocol_violation() => {
                warn!("Protocol violation from {}: {}", peer_addr, e);
                break Some(Disconnect::from_error(&e));
            }
            Err(ConnectionError::TransportClosed) => break None,
            Err(e) => warn!("Message from {} not handled: {}", peer_addr, e),
        }
    };

    service.close_service();
    // The writer exits only once `disconnect_tx` is consumed or dropped.
    match ending {
        Some(ending) => {
            let _ = disconnect_tx.send(ending);
        }
        None => drop(disconnect_tx),
    }
    writer.await??;
    info!(
        "Connection from {} ({}) closed",
        peer_addr,
        service.auth().username
    );
    Ok(())
}

/// Accept connections on `listener` until Ctrl-C.
pub async fn serve(listener: TcpListener, config: Arc<ServiceConfig>) -> Result<()> {
    info!("Connection service listening on {}", listener.local_addr()?);

    loop {
        let (stream, peer_addr) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                return Ok(());
            }
        };
        debug!("Accepted connection from {}", peer_addr);

        let config = config.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, peer_addr, config).await {
                warn!("Connection error: {:#}", e);
            }
        });
    }
}

/// Bind the configured address and serve.
pub async fn run_server(config: Arc<ServiceConfig>) -> Result<()> {
    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .with_context(|| format!("Invalid listen address: {}", config.listen_addr))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    serve(listener, config).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};
    use tokio::net::tcp::OwnedReadHalf;

    fn message(line: &str) -> ConnectionMessage {
        match decode_line(line).unwrap() {
            Inbound::Message(message) => message,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_decode_channel_open() {
        let msg = message(
            r#"{"type":"channel_open","channel_type":"session","sender_channel":5,
                "initial_window_size":1000,"maximum_packet_size":1000}"#,
        );
        assert_eq!(
            msg,
            ConnectionMessage::ChannelOpen(ChannelOpen {
                sender_channel: 5,
                initial_window_size: 1000,
                maximum_packet_size: 1000,
                kind: ChannelOpenKind::Session,
            })
        );

        let msg = message(
            r#"{"type":"channel_open","channel_type":"x11","sender_channel":1,
                "initial_window_size":1,"maximum_packet_size":1}"#,
        );
        match msg {
            ConnectionMessage::ChannelOpen(open) => {
                assert_eq!(open.kind, ChannelOpenKind::Other("x11".to_string()))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_decode_direct_tcpip_requires_destination() {
        let msg = message(
            r#"{"type":"channel_open","channel_type":"direct-tcpip","sender_channel":2,
                "initial_window_size":10,"maximum_packet_size":10,
                "host_to_connect":"localhost","port_to_connect":8080,
                "originator_address":"10.0.0.2","originator_port":40000}"#,
        );
        match msg {
            ConnectionMessage::ChannelOpen(open) => match open.kind {
                ChannelOpenKind::DirectTcpIp(params) => {
                    assert_eq!(params.host_to_connect, "localhost");
                    assert_eq!(params.port_to_connect, 8080);
                    assert_eq!(params.originator_port, 40000);
                }
                other => panic!("unexpected {other:?}"),
            },
            other => panic!("unexpected {other:?}"),
        }

        assert!(
            decode_line(
                r#"{"type":"channel_open","channel_type":"direct-tcpip","sender_channel":2,
                    "initial_window_size":10,"maximum_packet_size":10}"#
            )
            .is_err()
        );
    }

    #[test]
    fn test_decode_requests() {
        let msg = message(
            r#"{"type":"channel_request","recipient_channel":0,"request_type":"exec",
                "want_reply":true,"command":"echo hi"}"#,
        );
        assert_eq!(
            msg,
            ConnectionMessage::ChannelRequest(ChannelRequest {
                recipient_channel: 0,
                want_reply: true,
                kind: RequestKind::Exec {
                    command: "echo hi".to_string()
                },
            })
        );

        let msg = message(
            r#"{"type":"channel_request","recipient_channel":3,"request_type":"env"}"#,
        );
        assert_eq!(
            msg,
            ConnectionMessage::ChannelRequest(ChannelRequest {
                recipient_channel: 3,
                want_reply: false,
                kind: RequestKind::Other("env".to_string()),
            })
        );

        assert!(
            decode_line(r#"{"type":"channel_request","recipient_channel":0,"request_type":"exec"}"#)
                .is_err()
        );
    }

    #[test]
    fn test_decode_data_as_text_or_bytes() {
        assert_eq!(
            message(r#"{"type":"channel_data","recipient_channel":0,"data":"ls\r"}"#),
            ConnectionMessage::ChannelData {
                recipient_channel: 0,
                data: b"ls\r".to_vec()
            }
        );
        assert_eq!(
            message(r#"{"type":"channel_data","recipient_channel":0,"data":[27,91,66]}"#),
            ConnectionMessage::ChannelData {
                recipient_channel: 0,
                data: vec![27, 91, 66]
            }
        );
    }

    #[test]
    fn test_decode_userauth_defaults_method() {
        match decode_line(r#"{"type":"userauth","username":"alice"}"#).unwrap() {
            Inbound::Userauth { username, method } => {
                assert_eq!(username, "alice");
                assert_eq!(method, "none");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(decode_line("not json").is_err());
    }

    #[test]
    fn test_is_localhost() {
        assert!(is_localhost("localhost"));
        assert!(is_localhost("127.0.0.1"));
        assert!(is_localhost("::1"));
        assert!(is_localhost("[::1]"));
        assert!(!is_localhost("example.com"));
        assert!(!is_localhost("10.0.0.1"));
    }

    fn forward_request(host: &str) -> DirectTcpIpRequested {
        DirectTcpIpRequested::new(
            1,
            host.to_string(),
            80,
            "10.0.0.2".to_string(),
            40000,
            Arc::new(AuthContext::new("alice", "publickey")),
        )
    }

    #[test]
    fn test_policy_denies_non_local_destinations() {
        let handler = PolicyHandler::new(ForwardingConfig::default());

        let mut req = forward_request("localhost");
        handler.direct_tcpip_requested(&mut req);
        assert!(req.is_allowed());

        let mut req = forward_request("db.internal");
        handler.direct_tcpip_requested(&mut req);
        assert!(!req.is_allowed());
        assert_eq!(req.reason(), OpenFailureReason::AdministrativelyProhibited);
        assert_eq!(req.description(), "Forwarding to db.internal is not permitted");

        let handler = PolicyHandler::new(ForwardingConfig {
            allow_nonlocal_destinations: true,
            ..ForwardingConfig::default()
        });
        let mut req = forward_request("db.internal");
        handler.direct_tcpip_requested(&mut req);
        assert!(req.is_allowed());
    }

    #[test]
    fn test_policy_denies_when_forwarding_disabled() {
        let handler = PolicyHandler::new(ForwardingConfig {
            allow_direct_tcpip: false,
            ..ForwardingConfig::default()
        });
        let mut req = forward_request("localhost");
        handler.direct_tcpip_requested(&mut req);
        assert!(!req.is_allowed());
        assert_eq!(req.description(), "Port forwarding is disabled");
    }

    struct Client {
        lines: tokio::io::Lines<BufReader<OwnedReadHalf>>,
        writer: OwnedWriteHalf,
    }

    impl Client {
        async fn connect() -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(serve(listener, Arc::new(ServiceConfig::default())));

            let stream = TcpStream::connect(addr).await.unwrap();
            let (read_half, writer) = stream.into_split();
            Self {
                lines: BufReader::new(read_half).lines(),
                writer,
            }
        }

        async fn send(&mut self, value: Value) {
            let mut line = value.to_string().into_bytes();
            line.push(b'\n');
            self.writer.write_all(&line).await.unwrap();
        }

        async fn recv(&mut self) -> Option<Value> {
            let line = tokio::time::timeout(
                std::time::Duration::from_secs(5),
                self.lines.next_line(),
            )
            .await
            .unwrap()
            .unwrap()?;
            Some(serde_json::from_str(&line).unwrap())
        }

        async fn open_session(&mut self, sender_channel: u32) -> Value {
            self.send(json!({
                "type": "channel_open",
                "channel_type": "session",
                "sender_channel": sender_channel,
                "initial_window_size": 1000,
                "maximum_packet_size": 1000,
            }))
            .await;
            self.recv().await.unwrap()
        }
    }

    #[tokio::test]
    async fn test_exec_over_the_wire() {
        let mut client = Client::connect().await;
        client
            .send(json!({"type": "userauth", "username": "alice", "method": "publickey"}))
            .await;

        let confirmation = client.open_session(5).await;
        assert_eq!(confirmation["type"], "open_confirmation");
        assert_eq!(confirmation["recipient_channel"], 5);
        assert_eq!(confirmation["sender_channel"], 0);
        assert_eq!(confirmation["initial_window_size"], 2 * 1024 * 1024);
        assert_eq!(confirmation["maximum_packet_size"], 32 * 1024);

        client
            .send(json!({
                "type": "channel_request",
                "recipient_channel": 0,
                "request_type": "exec",
                "want_reply": true,
                "command": "ls",
            }))
            .await;
        assert_eq!(
            client.recv().await.unwrap(),
            json!({"type": "request_success", "recipient_channel": 5})
        );
        let data = client.recv().await.unwrap();
        assert_eq!(data["type"], "data");
        assert_eq!(data["data"], json!(b"Unknown command: ls\r\n".to_vec()));
        assert_eq!(
            client.recv().await.unwrap(),
            json!({"type": "exit_status", "recipient_channel": 5, "exit_status": 127})
        );
        assert_eq!(
            client.recv().await.unwrap(),
            json!({"type": "close", "recipient_channel": 5})
        );
    }

    #[tokio::test]
    async fn test_protocol_violation_disconnects() {
        let mut client = Client::connect().await;
        client.send(json!({"type": "userauth", "username": "bob"})).await;
        client
            .send(json!({
                "type": "channel_open",
                "channel_type": "x11",
                "sender_channel": 4,
                "initial_window_size": 1000,
                "maximum_packet_size": 1000,
            }))
            .await;

        assert_eq!(
            client.recv().await.unwrap(),
            json!({
                "type": "open_failure",
                "recipient_channel": 4,
                "reason": "unknown_channel_type",
                "reason_code": 3,
                "description": "Unknown channel type: x11.",
            })
        );
        let disconnect = client.recv().await.unwrap();
        assert_eq!(disconnect["type"], "disconnect");
        assert_eq!(disconnect["reason"], "protocol_error");
        assert_eq!(disconnect["code"], 2);
        assert!(client.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_client_eof_ends_connection() {
        let mut client = Client::connect().await;
        client.send(json!({"type": "userauth", "username": "carol"})).await;
        let confirmation = client.open_session(2).await;
        assert_eq!(confirmation["type"], "open_confirmation");

        client.writer.shutdown().await.unwrap();
        assert!(client.recv().await.is_none());
    }

    #[test]
    fn test_open_failure_frame_carries_reason_code() {
        let frame = outbound_frame(&OutboundMessage::OpenFailure {
            recipient_channel: 6,
            reason: OpenFailureReason::ConnectFailed,
            description: "connection refused".to_string(),
        })
        .unwrap();
        assert_eq!(frame["reason"], "connect_failed");
        assert_eq!(frame["reason_code"], 2);

        let frame = outbound_frame(&OutboundMessage::Eof {
            recipient_channel: 6,
        })
        .unwrap();
        assert_eq!(frame, json!({"type": "eof", "recipient_channel": 6}));
    }

    #[tokio::test]
    async fn test_first_line_must_authenticate() {
        let mut client = Client::connect().await;
        let reply = client.open_session(1).await;
        assert_eq!(reply["type"], "disconnect");
        assert_eq!(reply["reason"], "service_not_available");
        assert_eq!(reply["code"], 7);
        assert!(client.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_connections_are_independent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, Arc::new(ServiceConfig::default())));

        let mut clients = Vec::new();
        for name in ["alice", "bob"] {
            let stream = TcpStream::connect(addr).await.unwrap();
            let (read_half, writer) = stream.into_split();
            let mut client = Client {
                lines: BufReader::new(read_half).lines(),
                writer,
            };
            client.send(json!({"type": "userauth", "username": name})).await;
            clients.push(client);
        }

        for client in clients.iter_mut() {
            let confirmation = client.open_session(9).await;
            assert_eq!(confirmation["sender_channel"], 0);
        }
    }
}
