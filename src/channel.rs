//! Channels multiplexed over one connection.
//!
//! A [`Channel`] tracks both flow-control windows, the open/EOF/close state
//! machine and the consumer registered for its inbound data. Live channels
//! are owned by a [`ChannelTable`]; everything else (application handlers,
//! forwarding pumps, the shell task) only holds `Arc` references that go
//! stale once the channel closes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Notify, mpsc};
use tracing::{debug, warn};

use crate::config::ChannelConfig;
use crate::error::{ConnectionError, ConnectionResult};
use crate::events::ConnectionHandler;
use crate::messages::{DirectTcpIpParams, OutboundMessage};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Channel lifecycle. Ordered: a channel only ever moves to a later state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    Opening,
    Open,
    EofReceived,
    /// One side has sent close, waiting for the other.
    Closing,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelKind {
    Session,
    DirectTcpIp(DirectTcpIpParams),
}

impl ChannelKind {
    pub fn name(&self) -> &'static str {
        match self {
            ChannelKind::Session => "session",
            ChannelKind::DirectTcpIp(_) => "direct-tcpip",
        }
    }
}

/// Input delivered to a channel's registered data consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelInput {
    Data(Vec<u8>),
    Eof,
}

/// Point-in-time view of a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelInfo {
    pub server_channel_id: u32,
    pub client_channel_id: u32,
    pub kind: ChannelKind,
    pub state: ChannelState,
    pub client_window_size: u32,
    pub server_window_size: u32,
    pub opened_at: DateTime<Utc>,
}

/// Sending half of the transport, shared by the service and its channels.
#[derive(Debug, Clone)]
pub struct Outbound {
    tx: mpsc::UnboundedSender<OutboundMessage>,
}

impl Outbound {
    pub fn new(tx: mpsc::UnboundedSender<OutboundMessage>) -> Self {
        Self { tx }
    }

    pub fn send(&self, message: OutboundMessage) -> ConnectionResult<()> {
        self.tx
            .send(message)
            .map_err(|_| ConnectionError::TransportClosed)
    }
}

/// Parameters the peer supplied when opening the channel.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PeerParams {
    pub client_channel_id: u32,
    pub initial_window_size: u32,
    pub maximum_packet_size: u32,
}

#[derive(Debug)]
struct FlowState {
    state: ChannelState,
    /// Bytes we may still send to the peer.
    client_window: u32,
    /// Bytes the peer may still send to us.
    server_window: u32,
    local_eof: bool,
    local_closed: bool,
    peer_closed: bool,
    input: Option<mpsc::UnboundedSender<ChannelInput>>,
}

impl FlowState {
    fn advance(&mut self, next: ChannelState) -> bool {
        if next > self.state {
            self.state = next;
            true
        } else {
            false
        }
    }

    fn sending_stopped(&self) -> bool {
        self.local_eof || self.local_closed || self.peer_closed || self.state == ChannelState::Closed
    }
}

/// One multiplexed stream.
#[derive(Debug)]
pub struct Channel {
    server_channel_id: u32,
    client_channel_id: u32,
    kind: ChannelKind,
    server_initial_window: u32,
    server_max_packet: u32,
    client_max_packet: u32,
    opened_at: DateTime<Utc>,
    flow: Mutex<FlowState>,
    /// Signalled on window growth and on every close step.
    changed: Notify,
    outbound: Outbound,
    table: Weak<ChannelTable>,
}

impl Channel {
    pub(crate) fn new(
        server_channel_id: u32,
        peer: PeerParams,
        kind: ChannelKind,
        config: &ChannelConfig,
        outbound: Outbound,
        table: Weak<ChannelTable>,
    ) -> Arc<Self> {
        Arc::new(Self {
            server_channel_id,
            client_channel_id: peer.client_channel_id,
            kind,
            server_initial_window: config.initial_window_size,
            server_max_packet: config.max_packet_size,
            client_max_packet: peer.maximum_packet_size.max(1),
            opened_at: Utc::now(),
            flow: Mutex::new(FlowState {
                state: ChannelState::Opening,
                client_window: peer.initial_window_size,
                server_window: config.initial_window_size,
                local_eof: false,
                local_closed: false,
                peer_closed: false,
                input: None,
            }),
            changed: Notify::new(),
            outbound,
            table,
        })
    }

    pub fn server_channel_id(&self) -> u32 {
        self.server_channel_id
    }

    /// The peer's id for this channel; every outbound message is addressed to it.
    pub fn client_channel_id(&self) -> u32 {
        self.client_channel_id
    }

    pub fn kind(&self) -> &ChannelKind {
        &self.kind
    }

    pub fn state(&self) -> ChannelState {
        lock(&self.flow).state
    }

    pub fn client_window_size(&self) -> u32 {
        lock(&self.flow).client_window
    }

    pub fn server_window_size(&self) -> u32 {
        lock(&self.flow).server_window
    }

    pub fn info(&self) -> ChannelInfo {
        let flow = lock(&self.flow);
        ChannelInfo {
            server_channel_id: self.server_channel_id,
            client_channel_id: self.client_channel_id,
            kind: self.kind.clone(),
            state: flow.state,
            client_window_size: flow.client_window,
            server_window_size: flow.server_window,
            opened_at: self.opened_at,
        }
    }

    pub(crate) fn open_confirmation(&self) -> OutboundMessage {
        OutboundMessage::OpenConfirmation {
            recipient_channel: self.client_channel_id,
            sender_channel: self.server_channel_id,
            initial_window_size: self.server_initial_window,
            maximum_packet_size: self.server_max_packet,
        }
    }

    pub(crate) fn mark_open(&self) {
        lock(&self.flow).advance(ChannelState::Open);
    }

    /// Register the consumer of this channel's inbound data, replacing any
    /// previous one.
    pub fn subscribe(&self) -> ConnectionResult<mpsc::UnboundedReceiver<ChannelInput>> {
        let mut flow = lock(&self.flow);
        if flow.peer_closed || flow.state == ChannelState::Closed {
            return Err(ConnectionError::ChannelClosed(self.server_channel_id));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        flow.input = Some(tx);
        Ok(rx)
    }

    /// Send `data` to the peer, split at its max packet size.
    ///
    /// Waits for window-adjusts while the client window is exhausted. Fails
    /// once we have sent EOF or either side has closed the channel.
    pub async fn send_data(&self, data: &[u8]) -> ConnectionResult<()> {
        let mut rest = data;
        while !rest.is_empty() {
            let notified = self.changed.notified();
            let sent = {
                let mut flow = lock(&self.flow);
                if flow.sending_stopped() {
                    return Err(ConnectionError::ChannelClosed(self.server_channel_id));
                }
                let n = rest
                    .len()
                    .min(flow.client_window as usize)
                    .min(self.client_max_packet as usize);
                if n > 0 {
                    flow.client_window -= n as u32;
                    self.outbound.send(OutboundMessage::Data {
                        recipient_channel: self.client_channel_id,
                        data: rest[..n].to_vec(),
                    })?;
                }
                n
            };
            if sent == 0 {
                debug!(
                    "Channel {} waiting for window ({} bytes pending)",
                    self.server_channel_id,
                    rest.len()
                );
                notified.await;
                continue;
            }
            rest = &rest[sent..];
        }
        Ok(())
    }

    /// Tell the peer we will send no more data.
    pub fn send_eof(&self) -> ConnectionResult<()> {
        let mut flow = lock(&self.flow);
        if flow.sending_stopped() {
            return Ok(());
        }
        flow.local_eof = true;
        self.outbound.send(OutboundMessage::Eof {
            recipient_channel: self.client_channel_id,
        })
    }

    /// Start (or complete) the close handshake from our side.
    pub fn close(&self, exit_status: Option<u32>) -> ConnectionResult<()> {
        let both_closed = {
            let mut flow = lock(&self.flow);
            if flow.local_closed || flow.state == ChannelState::Closed {
                return Ok(());
            }
            flow.local_closed = true;
            if let Some(exit_status) = exit_status {
                self.outbound.send(OutboundMessage::ExitStatus {
                    recipient_channel: self.client_channel_id,
                    exit_status,
                })?;
            }
            self.outbound.send(OutboundMessage::Close {
                recipient_channel: self.client_channel_id,
            })?;
            flow.advance(ChannelState::Closing);
            flow.peer_closed
        };
        self.changed.notify_waiters();
        debug!("Channel {} close sent", self.server_channel_id);
        if both_closed {
            self.finish();
        }
        Ok(())
    }

    /// Resolves once either side has started closing the channel.
    pub async fn closed(&self) {
        loop {
            let notified = self.changed.notified();
            {
                let flow = lock(&self.flow);
                if flow.local_closed || flow.peer_closed || flow.state == ChannelState::Closed {
                    return;
                }
            }
            notified.await;
        }
    }

    pub(crate) fn on_data(&self, data: Vec<u8>) -> ConnectionResult<()> {
        let len = u32::try_from(data.len()).unwrap_or(u32::MAX);
        let mut flow = lock(&self.flow);
        if flow.local_closed || flow.peer_closed {
            debug!(
                "Dropping {} bytes for closing channel {}",
                len, self.server_channel_id
            );
            return Ok(());
        }
        if len > flow.server_window {
            warn!(
                "Peer exceeded window on channel {} ({} > {})",
                self.server_channel_id, len, flow.server_window
            );
        }
        flow.server_window = flow.server_window.saturating_sub(len);
        if flow.server_window <= self.server_max_packet {
            let bytes_to_add = self.server_initial_window - flow.server_window;
            if bytes_to_add > 0 {
                self.outbound.send(OutboundMessage::WindowAdjust {
                    recipient_channel: self.client_channel_id,
                    bytes_to_add,
                })?;
            }
            flow.server_window = self.server_initial_window;
        }
        match &flow.input {
            Some(input) => {
                if input.send(ChannelInput::Data(data)).is_err() {
                    debug!("Data consumer for channel {} is gone", self.server_channel_id);
                    flow.input = None;
                }
            }
            None => debug!(
                "No data consumer on channel {}, dropping {} bytes",
                self.server_channel_id, len
            ),
        }
        Ok(())
    }

    pub(crate) fn on_window_adjust(&self, bytes_to_add: u32) {
        {
            let mut flow = lock(&self.flow);
            flow.client_window = flow.client_window.saturating_add(bytes_to_add);
            debug!(
                "Channel {} client window now {}",
                self.server_channel_id, flow.client_window
            );
        }
        self.changed.notify_waiters();
    }

    pub(crate) fn on_eof(&self) {
        let mut flow = lock(&self.flow);
        flow.advance(ChannelState::EofReceived);
        if let Some(input) = &flow.input {
            let _ = input.send(ChannelInput::Eof);
        }
    }

    pub(crate) fn on_close(&self) -> ConnectionResult<()> {
        let sent = {
            let mut flow = lock(&self.flow);
            flow.peer_closed = true;
            flow.input = None;
            flow.advance(ChannelState::Closing);
            if flow.local_closed {
                Ok(())
            } else {
                flow.local_closed = true;
                self.outbound.send(OutboundMessage::Close {
                    recipient_channel: self.client_channel_id,
                })
            }
        };
        self.changed.notify_waiters();
        self.finish();
        sent
    }

    /// Tear the channel down without telling the peer.
    pub(crate) fn force_close(&self) {
        {
            let mut flow = lock(&self.flow);
            flow.input = None;
        }
        self.finish();
    }

    fn finish(&self) {
        let newly_closed = {
            let mut flow = lock(&self.flow);
            flow.input = None;
            flow.advance(ChannelState::Closed)
        };
        self.changed.notify_waiters();
        if newly_closed {
            if let Some(table) = self.table.upgrade() {
                table.remove(self.server_channel_id);
            }
        }
    }
}

/// The live-channel set of one connection service.
pub(crate) struct ChannelTable {
    next_id: AtomicU32,
    inner: Mutex<TableInner>,
    handler: Arc<dyn ConnectionHandler>,
}

#[derive(Default)]
struct TableInner {
    channels: HashMap<u32, Arc<Channel>>,
    closed: bool,
}

impl ChannelTable {
    pub(crate) fn new(handler: Arc<dyn ConnectionHandler>) -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU32::new(0),
            inner: Mutex::new(TableInner::default()),
            handler,
        })
    }

    pub(crate) fn handler(&self) -> &Arc<dyn ConnectionHandler> {
        &self.handler
    }

    fn allocate_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Allocate the next server id, build the channel for it and add it to
    /// the live set in one step, so ids follow acceptance order.
    pub(crate) fn accept(
        &self,
        build: impl FnOnce(u32) -> Arc<Channel>,
    ) -> ConnectionResult<Arc<Channel>> {
        let mut inner = lock(&self.inner);
        if inner.closed {
            return Err(ConnectionError::ServiceClosed);
        }
        let channel = build(self.allocate_id());
        let id = channel.server_channel_id();
        if inner.channels.contains_key(&id) {
            return Err(ConnectionError::DuplicateChannelId(id));
        }
        inner.channels.insert(id, channel.clone());
        Ok(channel)
    }

    pub(crate) fn get(&self, server_channel_id: u32) -> ConnectionResult<Arc<Channel>> {
        lock(&self.inner)
            .channels
            .get(&server_channel_id)
            .cloned()
            .ok_or(ConnectionError::InvalidChannelId(server_channel_id))
    }

    pub(crate) fn remove(&self, server_channel_id: u32) -> Option<Arc<Channel>> {
        let removed = lock(&self.inner).channels.remove(&server_channel_id);
        if let Some(channel) = &removed {
            debug!("Channel {} removed", server_channel_id);
            self.handler.channel_closed(&channel.info());
        }
        removed
    }

    /// Stop accepting channels and hand back the ones still live.
    pub(crate) fn shut(&self) -> Vec<Arc<Channel>> {
        let mut inner = lock(&self.inner);
        inner.closed = true;
        inner.channels.values().cloned().collect()
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<Channel>> {
        let mut channels: Vec<_> = lock(&self.inner).channels.values().cloned().collect();
        channels.sort_by_key(|c| c.server_channel_id());
        channels
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.inner).channels.len()
    }
}
