//! Transport layer for channel connections.
//!
//! Socket readers, the acceptor and connect attempts run as small tasks that do
//! nothing but forward what happened as [`NetEvent`]s. The channel's event loop
//! consumes them one at a time.

mod tcp;

pub use tcp::{bind, local_addr, spawn_acceptor, spawn_connector, write_unit, Connection};

use std::net::SocketAddr;

use tokio::net::TcpStream;

/// Read buffer size for socket reader tasks.
pub const READ_CHUNK_SIZE: usize = 8192;

/// Identifies one connection or connect attempt, so events from released
/// connections can be told apart from the live one.
pub type ConnectionId = u64;

/// Something that happened on the network.
#[derive(Debug)]
pub enum NetEvent {
    /// An outbound connect attempt succeeded.
    Connected { id: ConnectionId, stream: TcpStream },
    /// An outbound connect attempt failed.
    ConnectFailed { id: ConnectionId, error: std::io::Error },
    /// The listener accepted a connection.
    Accepted { stream: TcpStream, peer: SocketAddr },
    /// The listener failed and stopped.
    AcceptFailed(std::io::Error),
    /// Bytes arrived on a connection.
    Data { id: ConnectionId, bytes: Vec<u8> },
    /// The peer closed the connection.
    Closed { id: ConnectionId },
    /// Reading from a connection failed.
    ReadFailed { id: ConnectionId, error: std::io::Error },
}
