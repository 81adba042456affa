//! Outbound connections for `direct-tcpip` channels.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::channel::{Channel, ChannelInput};

/// Opens the outbound socket of a forward.
///
/// Owns any timeout policy; the connection service only awaits the result.
pub trait Connector: Send + Sync {
    fn connect(&self, host: &str, port: u32) -> BoxFuture<'static, io::Result<TcpStream>>;
}

/// Plain TCP connect bounded by a timeout.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    timeout: Duration,
}

impl TcpConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl Connector for TcpConnector {
    fn connect(&self, host: &str, port: u32) -> BoxFuture<'static, io::Result<TcpStream>> {
        let host = host.to_string();
        let timeout = self.timeout;
        Box::pin(async move {
            let port = u16::try_from(port).map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidInput, format!("invalid port {port}"))
            })?;
            match tokio::time::timeout(timeout, TcpStream::connect((host.as_str(), port))).await {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect to {host}:{port} timed out"),
                )),
            }
        })
    }
}

/// Bridge a connected socket and a live channel until either side ends.
pub(crate) fn spawn_pumps(
    channel: Arc<Channel>,
    stream: TcpStream,
    mut input: mpsc::UnboundedReceiver<ChannelInput>,
) {
    let id = channel.server_channel_id();
    let (mut read_half, mut write_half) = stream.into_split();

    // Socket -> channel
    let reader = channel.clone();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 32768];
        loop {
            tokio::select! {
                _ = reader.closed() => break,
                read = read_half.read(&mut buf) => match read {
                    Ok(0) => {
                        debug!("Forward target closed on channel {}", id);
                        let _ = reader.send_eof();
                        let _ = reader.close(None);
                        break;
                    }
                    Ok(n) => {
                        if reader.send_data(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("Forward read error on channel {}: {}", id, e);
                        let _ = reader.close(None);
                        break;
                    }
                },
            }
        }
    });

    // Channel -> socket
    tokio::spawn(async move {
        while let Some(item) = input.recv().await {
            match item {
                ChannelInput::Data(data) => {
                    if let Err(e) = write_half.write_all(&data).await {
                        warn!("Forward write error on channel {}: {}", id, e);
                        let _ = channel.close(None);
                        break;
                    }
                }
                ChannelInput::Eof => {
                    let _ = write_half.shutdown().await;
                }
            }
        }
        info!("Forward on channel {} finished", id);
    });
}
