//! TCP transport using tokio.

use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::chat::error::ChannelError;
use crate::chat::transport::{ConnectionId, NetEvent, READ_CHUNK_SIZE};

/// One open TCP connection: the write half, plus the task that reads the
/// other half and forwards data as [`NetEvent::Data`].
///
/// Dropping it stops the reader and closes the socket.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    peer_addr: String,
    writer: OwnedWriteHalf,
    reader: JoinHandle<()>,
}

impl Connection {
    /// Take ownership of `stream` and start reading it.
    pub fn open(id: ConnectionId, stream: TcpStream, events: UnboundedSender<NetEvent>) -> Self {
        let peer_addr = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let _ = stream.set_nodelay(true);

        let (mut read_half, writer) = stream.into_split();

        let reader = tokio::spawn(async move {
            let mut buf = vec![0u8; READ_CHUNK_SIZE];
            loop {
                match read_half.read(&mut buf).await {
                    Ok(0) => {
                        let _ = events.send(NetEvent::Closed { id });
                        break;
                    }
                    Ok(n) => {
                        trace!(id, n, "read");
                        if events
                            .send(NetEvent::Data {
                                id,
                                bytes: buf[..n].to_vec(),
                            })
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(error) => {
                        let _ = events.send(NetEvent::ReadFailed { id, error });
                        break;
                    }
                }
            }
        });

        debug!(id, peer = %peer_addr, "connection opened");
        Self {
            id,
            peer_addr,
            writer,
            reader,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }

    /// Write one protocol unit. See [`write_unit`].
    pub async fn write(&mut self, data: &[u8]) -> Result<(), ChannelError> {
        write_unit(&mut self.writer, data).await
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
        debug!(id = self.id, peer = %self.peer_addr, "connection released");
    }
}

/// Write all of `data` and flush.
///
/// Waits for socket readiness as often as needed, so a frame larger than the
/// free send buffer goes out in several writes. Only real I/O failures are
/// reported.
pub async fn write_unit(writer: &mut OwnedWriteHalf, data: &[u8]) -> Result<(), ChannelError> {
    writer.write_all(data).await.map_err(send_failed)?;
    writer.flush().await.map_err(send_failed)?;
    trace!(len = data.len(), "wrote unit");
    Ok(())
}

fn send_failed(e: std::io::Error) -> ChannelError {
    ChannelError::Transport(format!("Failed to send packet: {}", e))
}

/// Bind a listener.
pub async fn bind(addr: &str) -> Result<TcpListener, ChannelError> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| ChannelError::Transport(format!("Failed to listen on {}: {}", addr, e)))
}

/// Accept connections forever, forwarding each as [`NetEvent::Accepted`].
pub fn spawn_acceptor(listener: TcpListener, events: UnboundedSender<NetEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    if events.send(NetEvent::Accepted { stream, peer }).is_err() {
                        break;
                    }
                }
                Err(error) => {
                    let _ = events.send(NetEvent::AcceptFailed(error));
                    break;
                }
            }
        }
    })
}

/// Start an outbound connect attempt tagged with `id`.
pub fn spawn_connector(
    id: ConnectionId,
    host: String,
    port: u16,
    events: UnboundedSender<NetEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let event = match TcpStream::connect((host.as_str(), port)).await {
            Ok(stream) => NetEvent::Connected { id, stream },
            Err(error) => NetEvent::ConnectFailed { id, error },
        };
        let _ = events.send(event);
    })
}

/// Address a listener actually bound to.
pub fn local_addr(listener: &TcpListener) -> Result<SocketAddr, ChannelError> {
    listener
        .local_addr()
        .map_err(|e| ChannelError::Transport(format!("Failed to get local addr: {}", e)))
}
