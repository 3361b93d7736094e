//! Event loop that runs a [`Channel`] over TCP.
//!
//! One tokio task owns the channel. Commands from [`ChannelHandle`]s and
//! network events from the transport tasks are handled strictly one at a time,
//! each to completion, so no locking is needed around the channel state.

use std::net::SocketAddr;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::chat::channel::{Channel, ChannelEvent, ConnectionState};
use crate::chat::config::ChannelConfig;
use crate::chat::error::ChannelError;
use crate::chat::transport::{self, Connection, ConnectionId, NetEvent};
use crate::crypto::Identity;

/// Receives what the channel has to say.
///
/// Called from the event loop; implementations should return quickly.
pub trait ChannelHandler: Send + 'static {
    /// A decrypted message from the peer.
    fn on_message(&mut self, message: Vec<u8>);

    /// Connection status changed.
    fn on_status(&mut self, status: &str);

    /// Something went wrong. Never fatal to the process.
    fn on_error(&mut self, error: ChannelError);
}

impl ChannelHandler for mpsc::UnboundedSender<ChannelEvent> {
    fn on_message(&mut self, message: Vec<u8>) {
        let _ = self.send(ChannelEvent::Message(message));
    }

    fn on_status(&mut self, status: &str) {
        let _ = self.send(ChannelEvent::Status(status.to_string()));
    }

    fn on_error(&mut self, error: ChannelError) {
        let _ = self.send(ChannelEvent::Error(error));
    }
}

/// Requests from a [`ChannelHandle`].
#[derive(Debug)]
enum Command {
    Connect {
        host: String,
        port: u16,
        reply: oneshot::Sender<Result<(), ChannelError>>,
    },
    Listen {
        port: u16,
        reply: oneshot::Sender<Result<SocketAddr, ChannelError>>,
    },
    Send {
        message: Vec<u8>,
        reply: oneshot::Sender<Result<(), ChannelError>>,
    },
    State {
        reply: oneshot::Sender<ConnectionState>,
    },
    PeerKey {
        reply: oneshot::Sender<Option<[u8; 32]>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// Cheap, cloneable handle to a running channel.
///
/// Once the channel is closed every call fails with a state error.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl ChannelHandle {
    /// Connect to `host:port` as initiator. Drops any current connection.
    ///
    /// Returns once the attempt has started; the outcome is reported through
    /// the handler.
    pub async fn connect(&self, host: &str, port: u16) -> Result<(), ChannelError> {
        let (reply, rx) = oneshot::channel();
        self.request(
            Command::Connect {
                host: host.to_string(),
                port,
                reply,
            },
            rx,
        )
        .await?
    }

    /// Listen for an inbound peer on `port` (0 picks a free port).
    pub async fn listen(&self, port: u16) -> Result<SocketAddr, ChannelError> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Listen { port, reply }, rx).await?
    }

    /// Encrypt and send one message. Fails with a state error unless secure.
    pub async fn send(&self, message: impl Into<Vec<u8>>) -> Result<(), ChannelError> {
        let (reply, rx) = oneshot::channel();
        self.request(
            Command::Send {
                message: message.into(),
                reply,
            },
            rx,
        )
        .await?
    }

    /// Current connection state.
    pub async fn state(&self) -> ConnectionState {
        let (reply, rx) = oneshot::channel();
        self.request(Command::State { reply }, rx)
            .await
            .unwrap_or(ConnectionState::Closed)
    }

    /// Public key of the peer, once secure.
    pub async fn peer_key(&self) -> Option<[u8; 32]> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::PeerKey { reply }, rx)
            .await
            .ok()
            .flatten()
    }

    /// Close the channel for good.
    pub async fn close(&self) {
        let (reply, rx) = oneshot::channel();
        let _ = self.request(Command::Close { reply }, rx).await;
    }

    async fn request<T>(
        &self,
        command: Command,
        rx: oneshot::Receiver<T>,
    ) -> Result<T, ChannelError> {
        self.commands
            .send(command)
            .map_err(|_| ChannelError::State("Channel closed"))?;
        rx.await.map_err(|_| ChannelError::State("Channel closed"))
    }
}

/// Start a channel on the current tokio runtime.
pub fn spawn<H: ChannelHandler>(
    identity: Identity,
    config: ChannelConfig,
    handler: H,
) -> (ChannelHandle, JoinHandle<()>) {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (net_tx, net_rx) = mpsc::unbounded_channel();

    let service = Service {
        channel: Channel::new(identity, &config),
        config,
        handler,
        net_tx,
        next_id: 0,
        pending_connect: None,
        connection: None,
        listener: None,
        handshake_deadline: None,
    };
    let task = tokio::spawn(service.run(commands_rx, net_rx));

    (
        ChannelHandle {
            commands: commands_tx,
        },
        task,
    )
}

struct PendingConnect {
    id: ConnectionId,
    task: JoinHandle<()>,
}

struct Service<H> {
    channel: Channel,
    config: ChannelConfig,
    handler: H,
    net_tx: mpsc::UnboundedSender<NetEvent>,
    next_id: ConnectionId,
    pending_connect: Option<PendingConnect>,
    connection: Option<Connection>,
    listener: Option<JoinHandle<()>>,
    handshake_deadline: Option<Instant>,
}

impl<H: ChannelHandler> Service<H> {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut net: mpsc::UnboundedReceiver<NetEvent>,
    ) {
        loop {
            let deadline = self.handshake_deadline;
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    if !self.handle_command(command).await {
                        break;
                    }
                }
                Some(event) = net.recv() => self.handle_net(event).await,
                _ = wait_for(deadline) => self.handshake_timed_out(),
            }
        }

        if self.channel.state() != ConnectionState::Closed {
            self.shutdown();
        }
        debug!("channel event loop stopped");
    }

    /// Returns false once the channel is closed.
    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Connect { host, port, reply } => {
                let result = self.connect(host, port);
                if let Err(e) = &result {
                    self.handler.on_error(e.clone());
                }
                let _ = reply.send(result);
            }
            Command::Listen { port, reply } => {
                let result = self.listen(port).await;
                match &result {
                    Ok(addr) => self.handler.on_status(&format!("Listening on {}", addr.port())),
                    Err(e) => self.handler.on_error(e.clone()),
                }
                let _ = reply.send(result);
            }
            Command::Send { message, reply } => {
                let result = self.send(&message).await;
                if let Err(e) = &result {
                    self.handler.on_error(e.clone());
                }
                let _ = reply.send(result);
            }
            Command::State { reply } => {
                let _ = reply.send(self.channel.state());
            }
            Command::PeerKey { reply } => {
                let _ = reply.send(self.channel.session().map(|s| *s.peer_public()));
            }
            Command::Close { reply } => {
                self.shutdown();
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    fn connect(&mut self, host: String, port: u16) -> Result<(), ChannelError> {
        self.channel.start_connect()?;
        if self.release_connection() {
            self.handler.on_status("Disconnected");
        }
        self.abort_pending_connect();

        let id = self.allocate_id();
        info!(id, %host, port, "connecting");
        let task = transport::spawn_connector(id, host, port, self.net_tx.clone());
        self.pending_connect = Some(PendingConnect { id, task });
        Ok(())
    }

    async fn listen(&mut self, port: u16) -> Result<SocketAddr, ChannelError> {
        if self.channel.state() == ConnectionState::Closed {
            return Err(ChannelError::State("Channel closed"));
        }

        let addr = format!("{}:{}", self.config.bind_addr, port);
        let listener = transport::bind(&addr).await?;
        let local = transport::local_addr(&listener)?;

        if let Some(old) = self.listener.take() {
            old.abort();
        }
        self.listener = Some(transport::spawn_acceptor(listener, self.net_tx.clone()));
        info!(%local, "listening");
        Ok(local)
    }

    async fn send(&mut self, message: &[u8]) -> Result<(), ChannelError> {
        let frame = self.channel.seal(message)?;
        let Some(connection) = self.connection.as_mut() else {
            return Err(ChannelError::not_connected());
        };

        if let Err(e) = connection.write(&frame).await {
            if e.is_fatal() {
                warn!(error = %e, "write failed, dropping connection");
                self.drop_connection();
            }
            return Err(e);
        }
        Ok(())
    }

    async fn handle_net(&mut self, event: NetEvent) {
        match event {
            NetEvent::Connected { id, stream } => self.on_connected(id, stream).await,
            NetEvent::ConnectFailed { id, error } => {
                if !self.is_pending(id) {
                    return;
                }
                self.pending_connect = None;
                self.channel.connect_failed();
                self.handler
                    .on_error(ChannelError::Transport(format!("Failed to connect: {}", error)));
            }
            NetEvent::Accepted { stream, peer } => self.on_accepted(stream, peer).await,
            NetEvent::AcceptFailed(error) => {
                self.listener = None;
                self.handler
                    .on_error(ChannelError::Transport(format!("Failed to accept: {}", error)));
            }
            NetEvent::Data { id, bytes } => {
                if !self.is_current(id) {
                    debug!(id, "ignoring data from released connection");
                    return;
                }
                self.on_data(&bytes);
            }
            NetEvent::Closed { id } => {
                if self.is_current(id) {
                    self.drop_connection();
                }
            }
            NetEvent::ReadFailed { id, error } => {
                if self.is_current(id) {
                    self.handler.on_error(error.into());
                    self.drop_connection();
                }
            }
        }
    }

    async fn on_connected(&mut self, id: ConnectionId, stream: TcpStream) {
        if !self.is_pending(id) || self.channel.state() != ConnectionState::Connecting {
            debug!(id, "dropping stale outbound connection");
            return;
        }
        self.pending_connect = None;

        let own_key = match self.channel.connection_opened() {
            Ok(key) => key,
            Err(e) => {
                self.handler.on_error(e);
                return;
            }
        };

        let connection = Connection::open(id, stream, self.net_tx.clone());
        self.adopt(connection, &own_key, "Connected").await;
    }

    async fn on_accepted(&mut self, stream: TcpStream, peer: SocketAddr) {
        if !self.channel.can_accept() {
            info!(%peer, state = %self.channel.state(), "rejecting inbound connection, already connected");
            drop(stream);
            return;
        }

        let own_key = match self.channel.accept() {
            Ok(key) => key,
            Err(e) => {
                self.handler.on_error(e);
                return;
            }
        };
        self.abort_pending_connect();

        let id = self.allocate_id();
        let connection = Connection::open(id, stream, self.net_tx.clone());
        self.adopt(connection, &own_key, "Client connected").await;
    }

    /// Make `connection` the live one and send our public key on it.
    async fn adopt(&mut self, mut connection: Connection, own_key: &[u8], status: &str) {
        if let Err(e) = connection.write(own_key).await {
            warn!(error = %e, "could not send public key");
            self.channel.connection_lost();
            self.handler.on_error(e);
            return;
        }

        info!(id = connection.id(), peer = connection.peer_addr(), role = ?self.channel.role(), "handshaking");
        self.connection = Some(connection);
        self.handshake_deadline = self.config.handshake_timeout().map(|t| Instant::now() + t);
        self.handler.on_status(status);
    }

    fn on_data(&mut self, bytes: &[u8]) {
        for event in self.channel.receive(bytes) {
            match event {
                ChannelEvent::Message(message) => self.handler.on_message(message),
                ChannelEvent::Status(status) => self.handler.on_status(&status),
                ChannelEvent::Error(error) => self.handler.on_error(error),
            }
        }

        match self.channel.state() {
            ConnectionState::Secure => self.handshake_deadline = None,
            ConnectionState::Disconnected => {
                // The channel tore the connection down (handshake or protocol error).
                self.release_connection();
                self.handshake_deadline = None;
                self.handler.on_status("Disconnected");
            }
            _ => {}
        }
    }

    fn handshake_timed_out(&mut self) {
        self.handshake_deadline = None;
        if let Some(error) = self.channel.handshake_timed_out() {
            self.release_connection();
            self.handler.on_error(error);
            self.handler.on_status("Disconnected");
        }
    }

    /// The live connection ended: release it and tell the consumer.
    fn drop_connection(&mut self) {
        self.release_connection();
        self.handshake_deadline = None;
        if self.channel.connection_lost() {
            self.handler.on_status("Disconnected");
        }
    }

    fn shutdown(&mut self) {
        self.release_connection();
        self.abort_pending_connect();
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
        self.handshake_deadline = None;
        self.channel.close();
        info!("channel closed");
        self.handler.on_status("Closed");
    }

    /// Returns true if a connection was released.
    fn release_connection(&mut self) -> bool {
        self.connection.take().is_some()
    }

    fn abort_pending_connect(&mut self) {
        if let Some(pending) = self.pending_connect.take() {
            pending.task.abort();
        }
    }

    fn is_pending(&self, id: ConnectionId) -> bool {
        self.pending_connect.as_ref().map(|p| p.id) == Some(id)
    }

    fn is_current(&self, id: ConnectionId) -> bool {
        self.connection.as_ref().map(|c| c.id()) == Some(id)
    }

    fn allocate_id(&mut self) -> ConnectionId {
        self.next_id += 1;
        self.next_id
    }
}

async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn loopback() -> ChannelConfig {
        ChannelConfig::default().with_bind_addr("127.0.0.1")
    }

    #[test]
    fn test_sender_is_a_handler() {
        let (mut tx, mut rx) = mpsc::unbounded_channel::<ChannelEvent>();
        tx.on_message(b"m".to_vec());
        tx.on_status("Connected");
        tx.on_error(ChannelError::Decryption);

        assert_eq!(rx.try_recv().unwrap(), ChannelEvent::Message(b"m".to_vec()));
        assert_eq!(
            rx.try_recv().unwrap(),
            ChannelEvent::Status("Connected".to_string())
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            ChannelEvent::Error(ChannelError::Decryption)
        );
    }

    #[test]
    fn test_sender_handler_ignores_dropped_receiver() {
        let (mut tx, rx) = mpsc::unbounded_channel::<ChannelEvent>();
        drop(rx);
        tx.on_status("Disconnected");
    }

    #[tokio::test]
    async fn test_listen_reports_port() {
        let (tx, mut rx) = mpsc::unbounded_channel::<ChannelEvent>();
        let (handle, _task) = spawn(Identity::generate(), loopback(), tx);

        let addr = handle.listen(0).await.unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(
            rx.recv().await.unwrap(),
            ChannelEvent::Status(format!("Listening on {}", addr.port()))
        );
        assert_eq!(handle.state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_close_stops_the_loop() {
        let (tx, mut rx) = mpsc::unbounded_channel::<ChannelEvent>();
        let (handle, task) = spawn(Identity::generate(), loopback(), tx);

        handle.close().await;
        assert_eq!(
            rx.recv().await.unwrap(),
            ChannelEvent::Status("Closed".to_string())
        );
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(handle.state().await, ConnectionState::Closed);
        assert_eq!(handle.peer_key().await, None);
        assert_eq!(handle.listen(0).await, Err(ChannelError::State("Channel closed")));
    }

    #[tokio::test]
    async fn test_dropping_every_handle_closes() {
        let (tx, mut rx) = mpsc::unbounded_channel::<ChannelEvent>();
        let (handle, task) = spawn(Identity::generate(), loopback(), tx);
        drop(handle);

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            rx.recv().await.unwrap(),
            ChannelEvent::Status("Closed".to_string())
        );
    }
}
