//! Connection state machine for one secure channel.
//!
//! `Channel` does no I/O. The event loop in [`crate::chat::service`] tells it
//! what the transport did (opened, accepted, data, closed) and writes out the
//! bytes it returns. Every method runs to completion, so the receive buffer and
//! the peer session are never observed half-updated.

use tracing::{debug, info, warn};

use crate::chat::config::ChannelConfig;
use crate::chat::error::ChannelError;
use crate::chat::reassembly::{Reassembler, Unit};
use crate::crypto::{
    body_len, decode_frame, derive_session, encode_frame, Identity, PeerSession, Role,
    PUBLIC_KEY_SIZE,
};

/// Status text emitted once the handshake completes.
pub const STATUS_SECURE: &str = "Secure channel established";

/// Lifecycle of the channel's single connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection.
    Disconnected,
    /// Outbound connect in progress.
    Connecting,
    /// Transport open, waiting for the peer's public key.
    Handshaking,
    /// Session keys derived; frames flow.
    Secure,
    /// Shut down for good.
    Closed,
}

impl ConnectionState {
    /// True while a peer holds the channel.
    pub fn is_live(self) -> bool {
        matches!(self, ConnectionState::Handshaking | ConnectionState::Secure)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Handshaking => "handshaking",
            ConnectionState::Secure => "secure",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Something the consumer should hear about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// A decrypted application message.
    Message(Vec<u8>),
    /// Human readable connection status.
    Status(String),
    /// A non-fatal (to the process) error.
    Error(ChannelError),
}

/// The secure channel state machine.
#[derive(Debug)]
pub struct Channel {
    identity: Identity,
    state: ConnectionState,
    role: Option<Role>,
    session: Option<PeerSession>,
    reassembler: Reassembler,
}

impl Channel {
    pub fn new(identity: Identity, config: &ChannelConfig) -> Self {
        Self {
            identity,
            state: ConnectionState::Disconnected,
            role: None,
            session: None,
            reassembler: Reassembler::new(config.max_frame_size),
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Role of the current connection, if any.
    pub fn role(&self) -> Option<Role> {
        self.role
    }

    /// Keys of the current connection, present only in `Secure`.
    pub fn session(&self) -> Option<&PeerSession> {
        self.session.as_ref()
    }

    /// Begin an outbound connection as initiator.
    ///
    /// Any current connection is dropped first; the caller must release its
    /// transport.
    pub fn start_connect(&mut self) -> Result<(), ChannelError> {
        self.ensure_open()?;
        self.reset(ConnectionState::Connecting);
        self.role = Some(Role::Initiator);
        debug!("connecting as initiator");
        Ok(())
    }

    /// The outbound transport is open. Returns our public key to send.
    pub fn connection_opened(&mut self) -> Result<[u8; PUBLIC_KEY_SIZE], ChannelError> {
        if self.state != ConnectionState::Connecting {
            return Err(ChannelError::State("No connection attempt in progress"));
        }
        self.state = ConnectionState::Handshaking;
        Ok(self.identity.public_bytes())
    }

    /// The outbound connect attempt failed.
    pub fn connect_failed(&mut self) {
        if self.state == ConnectionState::Connecting {
            self.reset(ConnectionState::Disconnected);
        }
    }

    /// Whether an inbound connection would be adopted right now.
    pub fn can_accept(&self) -> bool {
        !self.state.is_live() && self.state != ConnectionState::Closed
    }

    /// Adopt an inbound connection as responder. Returns our public key to send.
    ///
    /// Refused while another connection is handshaking or secure; that
    /// connection is left untouched. A pending outbound attempt is abandoned.
    pub fn accept(&mut self) -> Result<[u8; PUBLIC_KEY_SIZE], ChannelError> {
        self.ensure_open()?;
        if self.state.is_live() {
            return Err(ChannelError::State("Already connected"));
        }
        self.reset(ConnectionState::Handshaking);
        self.role = Some(Role::Responder);
        debug!("accepted connection as responder");
        Ok(self.identity.public_bytes())
    }

    /// Feed bytes read from the transport.
    ///
    /// Handshake and protocol errors tear the connection down (the state
    /// drops to `Disconnected` and the caller must close the transport).
    /// A frame that fails authentication is dropped and reported; the
    /// connection stays secure.
    pub fn receive(&mut self, data: &[u8]) -> Vec<ChannelEvent> {
        let mut events = Vec::new();
        if !self.state.is_live() {
            debug!(len = data.len(), state = %self.state, "ignoring data outside a live connection");
            return events;
        }

        self.reassembler.extend(data);

        loop {
            let handshake_done = self.state == ConnectionState::Secure;
            let unit = match self.reassembler.next_unit(handshake_done) {
                Ok(Some(unit)) => unit,
                Ok(None) => break,
                Err(e) => {
                    self.fail(e, &mut events);
                    break;
                }
            };

            match unit {
                Unit::PeerKey(peer_key) => {
                    if let Err(e) = self.complete_handshake(&peer_key) {
                        self.fail(e, &mut events);
                        break;
                    }
                    events.push(ChannelEvent::Status(STATUS_SECURE.to_string()));
                }
                Unit::Frame(body) => {
                    let Some(session) = self.session.as_ref() else {
                        break;
                    };
                    match decode_frame(&body, session.rx()) {
                        Ok(message) => events.push(ChannelEvent::Message(message)),
                        Err(e) => {
                            debug!(len = body.len(), "frame failed authentication");
                            if self.fail(e.into(), &mut events) {
                                break;
                            }
                        }
                    }
                }
            }
        }

        events
    }

    /// Encrypt `plaintext` into a wire frame. Only allowed in `Secure`.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, ChannelError> {
        let session = match (self.state, self.session.as_ref()) {
            (ConnectionState::Secure, Some(session)) => session,
            _ => return Err(ChannelError::not_connected()),
        };

        let max = self.reassembler_limit();
        if body_len(plaintext.len()) > max {
            return Err(ChannelError::Protocol(format!(
                "Message too large: {} bytes (max frame {})",
                plaintext.len(),
                max
            )));
        }

        Ok(encode_frame(plaintext, session.tx())?)
    }

    /// The transport closed or failed. Returns true if a connection was dropped.
    pub fn connection_lost(&mut self) -> bool {
        match self.state {
            ConnectionState::Closed | ConnectionState::Disconnected => false,
            _ => {
                self.reset(ConnectionState::Disconnected);
                true
            }
        }
    }

    /// The peer did not finish the handshake in time.
    pub fn handshake_timed_out(&mut self) -> Option<ChannelError> {
        if self.state != ConnectionState::Handshaking {
            return None;
        }
        warn!("handshake timed out");
        self.reset(ConnectionState::Disconnected);
        Some(ChannelError::Transport("Handshake timed out".to_string()))
    }

    /// Shut the channel down for good.
    pub fn close(&mut self) {
        self.reset(ConnectionState::Closed);
    }

    fn complete_handshake(&mut self, peer_key: &[u8; PUBLIC_KEY_SIZE]) -> Result<(), ChannelError> {
        let Some(role) = self.role else {
            return Err(ChannelError::Protocol("Handshake without a role".to_string()));
        };

        match derive_session(role, &self.identity, peer_key) {
            Ok(session) => {
                info!(%role, peer = %crate::crypto::fingerprint(session.peer_public()), "secure channel established");
                self.session = Some(session);
                self.state = ConnectionState::Secure;
                Ok(())
            }
            Err(e) => {
                warn!(%role, error = %e, "handshake failed");
                Err(e.into())
            }
        }
    }

    /// Report `error`. Fatal errors drop the connection. Returns true if they did.
    fn fail(&mut self, error: ChannelError, events: &mut Vec<ChannelEvent>) -> bool {
        let fatal = error.is_fatal();
        if fatal {
            warn!(error = %error, "dropping connection");
            self.reset(ConnectionState::Disconnected);
        } else {
            warn!(error = %error, "dropping frame");
        }
        events.push(ChannelEvent::Error(error));
        fatal
    }

    fn ensure_open(&self) -> Result<(), ChannelError> {
        if self.state == ConnectionState::Closed {
            return Err(ChannelError::State("Channel closed"));
        }
        Ok(())
    }

    fn reassembler_limit(&self) -> usize {
        self.reassembler.max_frame_size()
    }

    /// Drop all per-connection state and move to `state`.
    fn reset(&mut self, state: ConnectionState) {
        self.session = None;
        self.role = None;
        self.reassembler.clear();
        self.state = state;
    }
}
