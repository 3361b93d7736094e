//! Integration tests for tether
//!
//! Channels talk to each other (or to a hand-driven raw socket) over loopback
//! TCP. Every wait is bounded so a broken handshake fails instead of hanging.

use std::time::Duration;

use tempfile::tempdir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::time::{sleep, timeout};

use tether::chat::{
    self, ChannelConfig, ChannelError, ChannelEvent, ChannelHandle, ConnectionState, STATUS_SECURE,
};
use tether::crypto::{
    decode_frame, derive_session, encode_frame, load_or_create, Identity, IdentityOrigin,
    KeyExchangeError, Role, IDENTITY_FILE_SIZE, LENGTH_PREFIX_SIZE, PUBLIC_KEY_SIZE,
};

const WAIT: Duration = Duration::from_secs(10);

type Events = UnboundedReceiver<ChannelEvent>;

fn loopback_config() -> ChannelConfig {
    ChannelConfig::default().with_bind_addr("127.0.0.1")
}

fn start(identity: Identity, config: ChannelConfig) -> (ChannelHandle, Events) {
    let (tx, rx) = mpsc::unbounded_channel::<ChannelEvent>();
    let (handle, _task) = chat::spawn(identity, config, tx);
    (handle, rx)
}

async fn next_event(events: &mut Events) -> ChannelEvent {
    timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for a channel event")
        .expect("event stream ended")
}

/// Collects events up to and including the status `status`.
async fn wait_for_status(events: &mut Events, status: &str) -> Vec<ChannelEvent> {
    let mut seen = Vec::new();
    loop {
        let event = next_event(events).await;
        let done = event == ChannelEvent::Status(status.to_string());
        seen.push(event);
        if done {
            return seen;
        }
    }
}

async fn wait_for_message(events: &mut Events) -> Vec<u8> {
    loop {
        if let ChannelEvent::Message(message) = next_event(events).await {
            return message;
        }
    }
}

async fn wait_for_state(handle: &ChannelHandle, state: ConnectionState) {
    let poll = async {
        while handle.state().await != state {
            sleep(Duration::from_millis(20)).await;
        }
    };
    timeout(WAIT, poll)
        .await
        .unwrap_or_else(|_| panic!("channel never reached {}", state));
}

/// A listening channel plus a connected one, both secure.
async fn secure_pair() -> (
    (ChannelHandle, Events, Identity),
    (ChannelHandle, Events, Identity),
    u16,
) {
    let server_id = Identity::generate();
    let client_id = Identity::generate();

    let (server, mut server_events) = start(server_id.clone(), loopback_config());
    let (client, mut client_events) = start(client_id.clone(), loopback_config());

    let addr = server.listen(0).await.unwrap();
    let port = addr.port();
    wait_for_status(&mut server_events, &format!("Listening on {}", port)).await;

    client.connect("127.0.0.1", port).await.unwrap();

    let seen = wait_for_status(&mut client_events, STATUS_SECURE).await;
    assert!(seen.contains(&ChannelEvent::Status("Connected".to_string())));
    let seen = wait_for_status(&mut server_events, STATUS_SECURE).await;
    assert!(seen.contains(&ChannelEvent::Status("Client connected".to_string())));

    (
        (server, server_events, server_id),
        (client, client_events, client_id),
        port,
    )
}

/// Reads one frame off a raw socket and returns its body.
async fn read_frame(stream: &mut TcpStream) -> Vec<u8> {
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    stream.read_exact(&mut prefix).await.unwrap();
    let mut body = vec![0u8; u32::from_le_bytes(prefix) as usize];
    stream.read_exact(&mut body).await.unwrap();
    body
}

#[tokio::test]
async fn test_end_to_end_chat() {
    let ((server, mut server_events, server_id), (client, mut client_events, client_id), _) =
        secure_pair().await;

    assert_eq!(server.state().await, ConnectionState::Secure);
    assert_eq!(client.state().await, ConnectionState::Secure);
    assert_eq!(server.peer_key().await, Some(client_id.public_bytes()));
    assert_eq!(client.peer_key().await, Some(server_id.public_bytes()));

    client.send("hello from the initiator").await.unwrap();
    assert_eq!(
        wait_for_message(&mut server_events).await,
        b"hello from the initiator"
    );

    server.send("hello back").await.unwrap();
    assert_eq!(wait_for_message(&mut client_events).await, b"hello back");

    // Several messages in a row arrive in order.
    for i in 0..20 {
        client.send(format!("message {}", i)).await.unwrap();
    }
    for i in 0..20 {
        assert_eq!(
            wait_for_message(&mut server_events).await,
            format!("message {}", i).into_bytes()
        );
    }
}

#[tokio::test]
async fn test_binary_and_empty_messages() {
    let ((server, mut server_events, _), (client, _client_events, _), _) = secure_pair().await;

    let large: Vec<u8> = (0..4096).map(|i| (i % 251) as u8).collect();
    client.send(large.clone()).await.unwrap();
    assert_eq!(wait_for_message(&mut server_events).await, large);

    client.send(Vec::new()).await.unwrap();
    assert_eq!(wait_for_message(&mut server_events).await, Vec::<u8>::new());

    drop(server);
}

#[tokio::test]
async fn test_multi_megabyte_message() {
    let ((server, mut server_events, _), (client, mut client_events, _), _) = secure_pair().await;

    // Far larger than the kernel send buffer.
    let big: Vec<u8> = (0..6 * 1024 * 1024).map(|i| (i % 241) as u8).collect();
    client.send(big.clone()).await.unwrap();
    assert_eq!(client.state().await, ConnectionState::Secure);

    // Sealing and opening several MiB is slow in debug builds.
    let receive = async {
        loop {
            match server_events.recv().await {
                Some(ChannelEvent::Message(message)) => return message,
                Some(_) => continue,
                None => panic!("event stream ended"),
            }
        }
    };
    let received = timeout(Duration::from_secs(60), receive)
        .await
        .expect("large message never arrived");
    assert_eq!(received.len(), big.len());
    assert!(received == big);

    // The connection is still usable both ways.
    server.send("got it").await.unwrap();
    assert_eq!(wait_for_message(&mut client_events).await, b"got it");
}

#[tokio::test]
async fn test_connect_while_secure_switches_peer() {
    let ((old_server, mut old_server_events, _), (client, mut client_events, _), _) =
        secure_pair().await;

    let new_id = Identity::generate();
    let (new_server, mut new_server_events) = start(new_id.clone(), loopback_config());
    let new_port = new_server.listen(0).await.unwrap().port();

    client.connect("127.0.0.1", new_port).await.unwrap();

    // The old connection is released before the new attempt.
    let seen = wait_for_status(&mut client_events, STATUS_SECURE).await;
    let disconnected = seen
        .iter()
        .position(|e| *e == ChannelEvent::Status("Disconnected".to_string()))
        .expect("no Disconnected status");
    let connected = seen
        .iter()
        .position(|e| *e == ChannelEvent::Status("Connected".to_string()))
        .expect("no Connected status");
    assert!(disconnected < connected);

    // The old peer sees its socket close.
    wait_for_status(&mut old_server_events, "Disconnected").await;
    assert_eq!(old_server.state().await, ConnectionState::Disconnected);

    // The new session is with the new peer.
    wait_for_status(&mut new_server_events, STATUS_SECURE).await;
    assert_eq!(client.state().await, ConnectionState::Secure);
    assert_eq!(client.peer_key().await, Some(new_id.public_bytes()));

    client.send("moved").await.unwrap();
    assert_eq!(wait_for_message(&mut new_server_events).await, b"moved");
}

#[tokio::test]
async fn test_close_disconnects_peer() {
    let ((server, mut server_events, _), (client, mut client_events, _), _) = secure_pair().await;

    client.close().await;
    wait_for_status(&mut client_events, "Closed").await;
    assert_eq!(client.state().await, ConnectionState::Closed);

    wait_for_status(&mut server_events, "Disconnected").await;
    assert_eq!(server.state().await, ConnectionState::Disconnected);
    assert_eq!(server.peer_key().await, None);
}

#[tokio::test]
async fn test_second_inbound_connection_rejected() {
    let ((server, mut server_events, _), (client, mut client_events, client_id), port) =
        secure_pair().await;

    let (intruder, _intruder_events) = start(Identity::generate(), loopback_config());
    intruder.connect("127.0.0.1", port).await.unwrap();
    wait_for_state(&intruder, ConnectionState::Disconnected).await;

    // The existing session is untouched.
    assert_eq!(server.state().await, ConnectionState::Secure);
    assert_eq!(server.peer_key().await, Some(client_id.public_bytes()));

    client.send("still here").await.unwrap();
    assert_eq!(wait_for_message(&mut server_events).await, b"still here");
    server.send("and so am I").await.unwrap();
    assert_eq!(wait_for_message(&mut client_events).await, b"and so am I");
}

#[tokio::test]
async fn test_listener_accepts_again_after_disconnect() {
    let ((server, mut server_events, _), (client, _, _), port) = secure_pair().await;

    client.close().await;
    wait_for_status(&mut server_events, "Disconnected").await;

    let (next, mut next_events) = start(Identity::generate(), loopback_config());
    next.connect("127.0.0.1", port).await.unwrap();
    wait_for_status(&mut next_events, STATUS_SECURE).await;
    wait_for_status(&mut server_events, STATUS_SECURE).await;

    next.send("second peer").await.unwrap();
    assert_eq!(wait_for_message(&mut server_events).await, b"second peer");
}

#[tokio::test]
async fn test_send_outside_secure_is_state_error() {
    let (channel, mut events) = start(Identity::generate(), loopback_config());

    assert_eq!(channel.state().await, ConnectionState::Disconnected);
    assert_eq!(
        channel.send("too early").await,
        Err(ChannelError::State("Not connected"))
    );
    assert_eq!(
        next_event(&mut events).await,
        ChannelEvent::Error(ChannelError::State("Not connected"))
    );

    channel.close().await;
    assert_eq!(channel.state().await, ConnectionState::Closed);
    assert_eq!(
        channel.send("too late").await,
        Err(ChannelError::State("Channel closed"))
    );
    assert!(channel.connect("127.0.0.1", 1).await.is_err());
}

#[tokio::test]
async fn test_connect_refused_reports_transport_error() {
    // Bind then drop to find a port nobody listens on.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let (channel, mut events) = start(Identity::generate(), loopback_config());
    channel.connect("127.0.0.1", port).await.unwrap();

    assert!(matches!(
        next_event(&mut events).await,
        ChannelEvent::Error(ChannelError::Transport(_))
    ));
    assert_eq!(channel.state().await, ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_listen_on_taken_port_fails() {
    let (first, _first_events) = start(Identity::generate(), loopback_config());
    let addr = first.listen(0).await.unwrap();

    let (second, mut second_events) = start(Identity::generate(), loopback_config());
    assert!(matches!(
        second.listen(addr.port()).await,
        Err(ChannelError::Transport(_))
    ));
    assert!(matches!(
        next_event(&mut second_events).await,
        ChannelEvent::Error(ChannelError::Transport(_))
    ));
}

#[tokio::test]
async fn test_raw_peer_speaks_the_wire_format() {
    let server_id = Identity::generate();
    let (server, mut server_events) = start(server_id.clone(), loopback_config());
    let port = server.listen(0).await.unwrap().port();

    let raw_id = Identity::generate();
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

    // The responder sends its raw public key first.
    let mut server_key = [0u8; PUBLIC_KEY_SIZE];
    stream.read_exact(&mut server_key).await.unwrap();
    assert_eq!(server_key, server_id.public_bytes());

    stream.write_all(&raw_id.public_bytes()).await.unwrap();
    let session = derive_session(Role::Initiator, &raw_id, &server_key).unwrap();
    wait_for_status(&mut server_events, STATUS_SECURE).await;

    // "hi" is a 46-byte frame; deliver it in three pieces.
    let wire = encode_frame(b"hi", session.tx()).unwrap();
    assert_eq!(wire.len(), 46);
    for piece in [&wire[..3], &wire[3..30], &wire[30..]] {
        stream.write_all(piece).await.unwrap();
        stream.flush().await.unwrap();
        sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(wait_for_message(&mut server_events).await, b"hi");

    server.send("hello raw").await.unwrap();
    let body = read_frame(&mut stream).await;
    assert_eq!(decode_frame(&body, session.rx()).unwrap(), b"hello raw");
}

#[tokio::test]
async fn test_tampered_frame_dropped_session_survives() {
    let (server, mut server_events) = start(Identity::generate(), loopback_config());
    let port = server.listen(0).await.unwrap().port();

    let raw_id = Identity::generate();
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut server_key = [0u8; PUBLIC_KEY_SIZE];
    stream.read_exact(&mut server_key).await.unwrap();
    stream.write_all(&raw_id.public_bytes()).await.unwrap();
    let session = derive_session(Role::Initiator, &raw_id, &server_key).unwrap();
    wait_for_status(&mut server_events, STATUS_SECURE).await;

    let mut bad = encode_frame(b"forged", session.tx()).unwrap();
    bad[LENGTH_PREFIX_SIZE + 30] ^= 0x01;
    stream.write_all(&bad).await.unwrap();
    assert_eq!(
        next_event(&mut server_events).await,
        ChannelEvent::Error(ChannelError::Decryption)
    );

    let good = encode_frame(b"genuine", session.tx()).unwrap();
    stream.write_all(&good).await.unwrap();
    assert_eq!(wait_for_message(&mut server_events).await, b"genuine");
    assert_eq!(server.state().await, ConnectionState::Secure);
}

#[tokio::test]
async fn test_bad_peer_key_fails_handshake() {
    let (server, mut server_events) = start(Identity::generate(), loopback_config());
    let port = server.listen(0).await.unwrap().port();

    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut server_key = [0u8; PUBLIC_KEY_SIZE];
    stream.read_exact(&mut server_key).await.unwrap();

    // The all-zero point yields an all-zero shared secret.
    stream.write_all(&[0u8; PUBLIC_KEY_SIZE]).await.unwrap();

    let seen = wait_for_status(&mut server_events, "Disconnected").await;
    assert!(seen.contains(&ChannelEvent::Error(ChannelError::Handshake(
        KeyExchangeError::NonContributory
    ))));
    assert!(!seen.contains(&ChannelEvent::Status(STATUS_SECURE.to_string())));
    assert_eq!(server.state().await, ConnectionState::Disconnected);

    // The server hung up on us.
    let mut rest = Vec::new();
    let n = timeout(WAIT, stream.read_to_end(&mut rest))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0);
}

#[tokio::test]
async fn test_oversized_frame_tears_down() {
    let config = loopback_config().with_max_frame_size(1024);
    let (server, mut server_events) = start(Identity::generate(), config);
    let port = server.listen(0).await.unwrap().port();

    let raw_id = Identity::generate();
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut server_key = [0u8; PUBLIC_KEY_SIZE];
    stream.read_exact(&mut server_key).await.unwrap();
    stream.write_all(&raw_id.public_bytes()).await.unwrap();
    wait_for_status(&mut server_events, STATUS_SECURE).await;

    stream.write_all(&u32::MAX.to_le_bytes()).await.unwrap();

    let seen = wait_for_status(&mut server_events, "Disconnected").await;
    assert!(seen
        .iter()
        .any(|e| matches!(e, ChannelEvent::Error(ChannelError::Protocol(_)))));
    assert_eq!(server.state().await, ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_handshake_timeout() {
    let config = loopback_config().with_handshake_timeout(Some(Duration::from_secs(1)));
    let (server, mut server_events) = start(Identity::generate(), config);
    let port = server.listen(0).await.unwrap().port();

    // Connect and never send a key.
    let _silent = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    wait_for_status(&mut server_events, "Client connected").await;
    assert_eq!(server.state().await, ConnectionState::Handshaking);

    let seen = wait_for_status(&mut server_events, "Disconnected").await;
    assert!(seen.contains(&ChannelEvent::Error(ChannelError::Transport(
        "Handshake timed out".to_string()
    ))));
    assert_eq!(server.state().await, ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_identity_persists_across_runs() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("identity.key");

    let first = load_or_create(&path);
    assert!(matches!(first.origin, IdentityOrigin::Created));
    assert_eq!(
        std::fs::metadata(&path).unwrap().len() as usize,
        IDENTITY_FILE_SIZE
    );

    let second = load_or_create(&path);
    assert!(matches!(second.origin, IdentityOrigin::Loaded));
    assert_eq!(
        first.identity.public_bytes(),
        second.identity.public_bytes()
    );

    // The same identity reconnects with the same public key.
    let (server, mut server_events) = start(Identity::generate(), loopback_config());
    let port = server.listen(0).await.unwrap().port();
    let (client, mut client_events) = start(second.identity.clone(), loopback_config());
    client.connect("127.0.0.1", port).await.unwrap();
    wait_for_status(&mut client_events, STATUS_SECURE).await;
    wait_for_status(&mut server_events, STATUS_SECURE).await;
    assert_eq!(server.peer_key().await, Some(first.identity.public_bytes()));
}

#[tokio::test]
async fn test_config_file_drives_channel() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("tether.toml");
    std::fs::write(
        &path,
        "bind_addr = \"127.0.0.1\"\nmax_frame_size = 4096\nhandshake_timeout_secs = 5\n",
    )
    .unwrap();

    let config = ChannelConfig::load(&path).unwrap();
    assert_eq!(config.bind_addr, "127.0.0.1");
    assert_eq!(config.max_frame_size, 4096);

    let (server, _events) = start(Identity::generate(), config);
    let addr = server.listen(0).await.unwrap();
    assert!(addr.ip().is_loopback());
}
