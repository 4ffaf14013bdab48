//! End-to-end sessions over loopback TCP.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use table_net::message::{
    Hello, HelloResponse, TableChanged, TableSnapshot, PROTOCOL_VERSION,
    SUPPORTED_PROTOCOL_VERSIONS,
};
use table_net::{
    DisconnectReason, InMemoryTable, Message, MessageBody, MessageError, NetworkRole,
    NetworkSettings, NetworkStatus, RejectionReason, Table, TableChange, TableMemento,
    TableNetwork, TableNetworkConfiguration, TableNetworkController, TableNetworkError,
    TableNetworkEvent, TransportError,
};

const WAIT: Duration = Duration::from_secs(5);

fn fast_settings() -> NetworkSettings {
    NetworkSettings {
        connect_timeout: Duration::from_secs(2),
        handshake_timeout: Duration::from_millis(300),
        join_timeout: Duration::from_secs(3),
        keep_alive_interval: Duration::from_millis(100),
        echo_timeout: Duration::from_millis(300),
        tick_interval: Duration::from_millis(20),
        ..NetworkSettings::default()
    }
}

fn host_config(password: &str, table: Arc<dyn Table>) -> TableNetworkConfiguration {
    TableNetworkConfiguration::builder()
        .host_name("127.0.0.1")
        .port(0)
        .ephemeral_port()
        .password(password)
        .local_player_name("host")
        .local_table(table)
        .build()
        .unwrap()
}

fn join_config(
    addr: SocketAddr,
    player: &str,
    password: &str,
    table: Arc<dyn Table>,
) -> TableNetworkConfiguration {
    TableNetworkConfiguration::builder()
        .host_name("127.0.0.1")
        .port(addr.port())
        .password(password)
        .local_player_name(player)
        .local_table(table)
        .build()
        .unwrap()
}

async fn start_host(password: &str) -> (TableNetwork, SocketAddr, Arc<InMemoryTable>) {
    let table = Arc::new(InMemoryTable::new());
    let host = TableNetwork::new(fast_settings());
    let addr = host.host(host_config(password, table.clone())).await.unwrap();
    (host, addr, table)
}

/// Wait until an event matching `predicate` arrives.
async fn wait_for<F>(events: &mut broadcast::Receiver<TableNetworkEvent>, predicate: F) -> TableNetworkEvent
where
    F: Fn(&TableNetworkEvent) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("Event channel closed"),
            }
        }
    })
    .await
    .expect("Timed out waiting for event")
}

fn put(key: &str, value: Vec<u8>) -> TableChange {
    TableChange::Put {
        key: key.into(),
        value,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_correct_password_joins() {
    let (host, addr, host_table) = start_host("secret").await;
    host_table.apply(&[put("deck", vec![52])]).unwrap();

    let client_table = Arc::new(InMemoryTable::new());
    let client = TableNetwork::new(fast_settings());
    client
        .join(join_config(addr, "alice", "secret", client_table.clone()))
        .await
        .unwrap();

    assert_eq!(client.status(), NetworkStatus::Online);
    assert_eq!(client.role(), Some(NetworkRole::Client));
    assert_eq!(client.players(), vec!["alice".to_string(), "host".to_string()]);
    assert_eq!(host.players(), vec!["alice".to_string(), "host".to_string()]);
    assert_eq!(client_table.memento(), host_table.memento());

    client.disconnect().await;
    host.disconnect().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_wrong_password_rejected() {
    let (host, addr, _) = start_host("secret").await;

    let client = TableNetwork::new(fast_settings());
    let result = client
        .join(join_config(addr, "mallory", "wrong", Arc::new(InMemoryTable::new())))
        .await;

    assert!(matches!(
        result,
        Err(TableNetworkError::Rejected(RejectionReason::AuthenticationFailed))
    ));
    assert_eq!(client.status(), NetworkStatus::Offline);
    assert_eq!(
        client.last_disconnect_reason(),
        Some(DisconnectReason::Rejected(RejectionReason::AuthenticationFailed))
    );
    assert_eq!(host.players(), vec!["host".to_string()]);

    host.disconnect().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_duplicate_name_rejected() {
    let (host, addr, _) = start_host("secret").await;

    let client = TableNetwork::new(fast_settings());
    let result = client
        .join(join_config(addr, "host", "secret", Arc::new(InMemoryTable::new())))
        .await;
    assert!(matches!(
        result,
        Err(TableNetworkError::Rejected(RejectionReason::DuplicatePlayerName))
    ));

    host.disconnect().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_table_changes_propagate_both_ways() {
    let (host, addr, host_table) = start_host("secret").await;
    let mut host_events = host.subscribe();

    let client_table = Arc::new(InMemoryTable::new());
    let client = TableNetwork::new(fast_settings());
    let mut client_events = client.subscribe();
    client
        .join(join_config(addr, "alice", "secret", client_table.clone()))
        .await
        .unwrap();

    let value: Vec<u8> = (0..32).map(|_| rand::thread_rng().gen()).collect();
    host.change_table(vec![put("deck", value.clone())]).unwrap();
    wait_for(&mut client_events, |event| {
        matches!(event, TableNetworkEvent::TableChanged { sequence: 1, .. })
    })
    .await;
    assert_eq!(client_table.memento().get("deck"), Some(&value[..]));

    client.change_table(vec![put("pile", vec![1])]).unwrap();
    let event = wait_for(&mut host_events, |event| {
        matches!(event, TableNetworkEvent::TableChanged { sequence: 2, .. })
    })
    .await;
    assert_eq!(
        event,
        TableNetworkEvent::TableChanged {
            sequence: 2,
            origin: "alice".into()
        }
    );
    wait_for(&mut client_events, |event| {
        matches!(event, TableNetworkEvent::TableChanged { sequence: 2, .. })
    })
    .await;

    assert_eq!(host_table.memento(), client_table.memento());
    assert_eq!(host_table.memento().len(), 2);

    client.disconnect().await;
    host.disconnect().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_client_leaving_does_not_affect_host() {
    let (host, addr, _) = start_host("secret").await;
    let mut host_events = host.subscribe();

    let alice = TableNetwork::new(fast_settings());
    alice
        .join(join_config(addr, "alice", "secret", Arc::new(InMemoryTable::new())))
        .await
        .unwrap();
    let bob = TableNetwork::new(fast_settings());
    let mut bob_events = bob.subscribe();
    bob.join(join_config(addr, "bob", "secret", Arc::new(InMemoryTable::new())))
        .await
        .unwrap();

    alice.disconnect().await;

    let left = wait_for(&mut host_events, |event| {
        matches!(event, TableNetworkEvent::PlayerLeft(_))
    })
    .await;
    assert_eq!(left, TableNetworkEvent::PlayerLeft("alice".into()));
    wait_for(&mut bob_events, |event| {
        event == &TableNetworkEvent::PlayersUpdated(vec!["bob".into(), "host".into()])
    })
    .await;

    assert!(host.is_connected());
    assert!(bob.is_connected());
    assert_eq!(host.players(), vec!["bob".to_string(), "host".to_string()]);

    bob.disconnect().await;
    host.disconnect().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_host_leaving_ends_client_session() {
    let (host, addr, _) = start_host("secret").await;

    let client = TableNetwork::new(fast_settings());
    let mut client_events = client.subscribe();
    client
        .join(join_config(addr, "alice", "secret", Arc::new(InMemoryTable::new())))
        .await
        .unwrap();

    host.disconnect().await;

    let event = wait_for(&mut client_events, |event| {
        matches!(event, TableNetworkEvent::Disconnected(_))
    })
    .await;
    assert_eq!(event, TableNetworkEvent::Disconnected(DisconnectReason::HostClosed));
    assert_eq!(client.status(), NetworkStatus::Offline);
    assert!(client.players().is_empty());

    // The node can start over.
    let (host, addr, _) = start_host("secret").await;
    client
        .join(join_config(addr, "alice", "secret", Arc::new(InMemoryTable::new())))
        .await
        .unwrap();
    client.disconnect().await;
    host.disconnect().await;
}

type RawLink = Framed<TcpStream, LengthDelimitedCodec>;

async fn raw_link(addr: SocketAddr) -> RawLink {
    let stream = TcpStream::connect(addr).await.unwrap();
    Framed::new(stream, LengthDelimitedCodec::new())
}

async fn raw_receive(link: &mut RawLink) -> Option<Message> {
    let frame = tokio::time::timeout(WAIT, link.next())
        .await
        .expect("Timed out waiting for frame")?
        .ok()?;
    Some(Message::decode(&frame).unwrap())
}

fn raw_hello(player: &str, password: &[u8], versions: Vec<u32>) -> Bytes {
    Message::with_id(
        1,
        MessageBody::Hello(Hello {
            supported_protocol_versions: versions,
            player_name: player.into(),
            password: password.to_vec(),
        }),
    )
    .unwrap()
    .encode()
    .unwrap()
}

/// Join the host over a bare socket that only speaks the handshake.
async fn admit_raw(addr: SocketAddr, player: &str) -> RawLink {
    let mut link = raw_link(addr).await;
    link.send(raw_hello(player, b"secret", SUPPORTED_PROTOCOL_VERSIONS.to_vec()))
        .await
        .unwrap();

    let response = raw_receive(&mut link).await.unwrap();
    assert_eq!(response.correlation_id(), 1);
    assert!(matches!(
        response.body(),
        MessageBody::HelloResponse(HelloResponse::Accepted { .. })
    ));
    link
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_silent_peer_removed_once() {
    let (host, addr, _) = start_host("secret").await;
    let mut host_events = host.subscribe();

    let mut link = admit_raw(addr, "ghost").await;
    assert!(host.players().contains(&"ghost".to_string()));

    // Never answer echoes; the host must drop us.
    let mut saw_echo = false;
    while let Some(message) = raw_receive(&mut link).await {
        if matches!(message.body(), MessageBody::Echo { .. }) {
            saw_echo = true;
        }
    }
    assert!(saw_echo);

    let left = wait_for(&mut host_events, |event| {
        matches!(event, TableNetworkEvent::PlayerLeft(_))
    })
    .await;
    assert_eq!(left, TableNetworkEvent::PlayerLeft("ghost".into()));
    assert_eq!(host.players(), vec!["host".to_string()]);

    // No second departure for the same player.
    tokio::time::sleep(Duration::from_millis(200)).await;
    while let Ok(event) = host_events.try_recv() {
        assert!(!matches!(event, TableNetworkEvent::PlayerLeft(_)));
    }

    host.disconnect().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_peer_without_hello_disconnected() {
    let (host, addr, _) = start_host("secret").await;

    let mut link = raw_link(addr).await;
    assert!(raw_receive(&mut link).await.is_none());
    assert_eq!(host.players(), vec!["host".to_string()]);

    host.disconnect().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_echo_answered_by_host() {
    let (host, addr, _) = start_host("secret").await;

    let mut link = raw_link(addr).await;
    let echo = Message::with_id(0x2A, MessageBody::Echo { content: vec![1, 2, 3] }).unwrap();
    link.send(echo.encode().unwrap()).await.unwrap();

    let response = raw_receive(&mut link).await.unwrap();
    assert_eq!(response.correlation_id(), 0x2A);
    assert_eq!(response.body(), &MessageBody::EchoResponse { content: vec![1, 2, 3] });

    host.disconnect().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unsupported_protocol_version_rejected() {
    let (host, addr, _) = start_host("secret").await;

    let mut link = raw_link(addr).await;
    link.send(raw_hello("alice", b"secret", vec![99])).await.unwrap();

    let response = raw_receive(&mut link).await.unwrap();
    assert_eq!(
        response.body(),
        &MessageBody::HelloResponse(HelloResponse::Rejected {
            reason: RejectionReason::UnsupportedProtocolVersion
        })
    );
    assert!(raw_receive(&mut link).await.is_none());
    assert_eq!(host.players(), vec!["host".to_string()]);

    host.disconnect().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dropped_peer_does_not_affect_others() {
    let (host, addr, _) = start_host("secret").await;
    let mut host_events = host.subscribe();

    let ghost = admit_raw(addr, "ghost").await;
    let bob = TableNetwork::new(fast_settings());
    let mut bob_events = bob.subscribe();
    bob.join(join_config(addr, "bob", "secret", Arc::new(InMemoryTable::new())))
        .await
        .unwrap();
    assert_eq!(bob.players(), vec!["bob".to_string(), "ghost".to_string(), "host".to_string()]);

    drop(ghost);

    let left = wait_for(&mut host_events, |event| {
        matches!(event, TableNetworkEvent::PlayerLeft(_))
    })
    .await;
    assert_eq!(left, TableNetworkEvent::PlayerLeft("ghost".into()));
    wait_for(&mut bob_events, |event| {
        event == &TableNetworkEvent::PlayersUpdated(vec!["bob".into(), "host".into()])
    })
    .await;
    assert!(host.is_connected());
    assert!(bob.is_connected());

    bob.disconnect().await;
    host.disconnect().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unread_peer_does_not_stall_host() {
    let (host, addr, _) = start_host("secret").await;
    let mut host_events = host.subscribe();

    // Admitted, then never reads again. Enough data to fill both socket buffers.
    let _ghost = admit_raw(addr, "ghost").await;
    let blob = vec![0x5A; 1024 * 1024];
    for _ in 0..40 {
        host.change_table(vec![put("blob", blob.clone())]).unwrap();
    }

    let left = wait_for(&mut host_events, |event| {
        matches!(event, TableNetworkEvent::PlayerLeft(_))
    })
    .await;
    assert_eq!(left, TableNetworkEvent::PlayerLeft("ghost".into()));
    assert_eq!(host.players(), vec!["host".to_string()]);

    let bob = TableNetwork::new(fast_settings());
    bob.join(join_config(addr, "bob", "secret", Arc::new(InMemoryTable::new())))
        .await
        .unwrap();
    assert_eq!(bob.table_sequence(), 40);

    bob.disconnect().await;
    tokio::time::timeout(WAIT, host.disconnect())
        .await
        .expect("host disconnect stalled");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_oversized_change_refused_without_dropping_links() {
    let settings = NetworkSettings {
        max_frame_length: 64 * 1024,
        ..fast_settings()
    };
    let host_table = Arc::new(InMemoryTable::new());
    let host = TableNetwork::new(settings.clone());
    let addr = host.host(host_config("secret", host_table.clone())).await.unwrap();

    let client_table = Arc::new(InMemoryTable::new());
    let client = TableNetwork::new(settings);
    let mut client_events = client.subscribe();
    client
        .join(join_config(addr, "alice", "secret", client_table.clone()))
        .await
        .unwrap();

    let oversized = vec![put("blob", vec![1; 128 * 1024])];
    assert!(matches!(
        host.change_table(oversized.clone()),
        Err(TableNetworkError::Transport(TransportError::Message(
            MessageError::FrameTooLarge { .. }
        )))
    ));
    assert!(matches!(
        client.change_table(oversized),
        Err(TableNetworkError::Transport(TransportError::Message(
            MessageError::FrameTooLarge { .. }
        )))
    ));
    assert!(host_table.memento().get("blob").is_none());

    client.change_table(vec![put("blob", vec![1; 1024])]).unwrap();
    wait_for(&mut client_events, |event| {
        matches!(event, TableNetworkEvent::TableChanged { sequence: 1, .. })
    })
    .await;
    assert_eq!(host_table.memento(), client_table.memento());
    assert!(client.is_connected());
    assert_eq!(host.players(), vec!["alice".to_string(), "host".to_string()]);

    client.disconnect().await;
    host.disconnect().await;
}

// -----------------------------------------------------------------------------
// Client against a scripted host
// -----------------------------------------------------------------------------

/// Accept one client and read its `Hello`.
async fn accept_hello(listener: &TcpListener) -> (RawLink, Message) {
    let (stream, _) = tokio::time::timeout(WAIT, listener.accept())
        .await
        .expect("Timed out waiting for client")
        .unwrap();
    let mut link = Framed::new(stream, LengthDelimitedCodec::new());
    let hello = raw_receive(&mut link).await.unwrap();
    assert!(matches!(hello.body(), MessageBody::Hello(_)));
    (link, hello)
}

async fn raw_send(link: &mut RawLink, id: i32, correlation_id: u8, body: MessageBody) {
    let mut message = Message::with_id(id, body).unwrap();
    message.set_correlation_id(correlation_id as i32).unwrap();
    link.send(message.encode().unwrap()).await.unwrap();
}

fn accepted(snapshot: TableSnapshot) -> MessageBody {
    MessageBody::HelloResponse(HelloResponse::Accepted {
        protocol_version: PROTOCOL_VERSION,
        players: vec!["alice".into(), "host".into()],
        snapshot,
    })
}

/// Join `listener` as "alice"; the scripted host answers the `Hello` with
/// `response`, or stays silent.
async fn join_scripted_host(
    client: &TableNetwork,
    listener: &TcpListener,
    response: Option<MessageBody>,
) -> (Result<(), TableNetworkError>, RawLink) {
    let addr = listener.local_addr().unwrap();
    let config = join_config(addr, "alice", "secret", Arc::new(InMemoryTable::new()));
    tokio::join!(client.join(config), async {
        let (mut link, hello) = accept_hello(listener).await;
        if let Some(body) = response {
            raw_send(&mut link, 1, hello.id(), body).await;
        }
        link
    })
}

async fn scripted_host() -> TcpListener {
    TcpListener::bind("127.0.0.1:0").await.unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_client_session_ends_when_host_link_drops() {
    let listener = scripted_host().await;
    let client = TableNetwork::new(fast_settings());
    let mut events = client.subscribe();

    let snapshot = TableSnapshot::new(0, TableMemento::new());
    let (joined, link) = join_scripted_host(&client, &listener, Some(accepted(snapshot))).await;
    joined.unwrap();
    assert!(client.is_connected());

    drop(link);

    let event = wait_for(&mut events, |event| {
        matches!(event, TableNetworkEvent::Disconnected(_))
    })
    .await;
    assert!(matches!(
        event,
        TableNetworkEvent::Disconnected(DisconnectReason::ConnectionLost(_))
    ));
    assert_eq!(client.status(), NetworkStatus::Offline);
    assert!(client.players().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_client_drops_host_that_ignores_echoes() {
    let listener = scripted_host().await;
    let client = TableNetwork::new(fast_settings());
    let mut events = client.subscribe();

    let snapshot = TableSnapshot::new(0, TableMemento::new());
    let (joined, _link) = join_scripted_host(&client, &listener, Some(accepted(snapshot))).await;
    joined.unwrap();

    let event = wait_for(&mut events, |event| {
        matches!(event, TableNetworkEvent::Disconnected(_))
    })
    .await;
    assert!(matches!(
        event,
        TableNetworkEvent::Disconnected(DisconnectReason::ConnectionLost(_))
    ));
    assert_eq!(client.status(), NetworkStatus::Offline);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_client_drops_host_on_sequence_gap() {
    let listener = scripted_host().await;
    let client = TableNetwork::new(fast_settings());
    let mut events = client.subscribe();

    let snapshot = TableSnapshot::new(0, TableMemento::new());
    let (joined, mut link) = join_scripted_host(&client, &listener, Some(accepted(snapshot))).await;
    joined.unwrap();

    let skipped = MessageBody::TableChanged(TableChanged {
        sequence: 2,
        origin: "host".into(),
        changes: vec![put("deck", vec![52])],
    });
    raw_send(&mut link, 2, 0, skipped).await;

    let event = wait_for(&mut events, |event| {
        matches!(event, TableNetworkEvent::Disconnected(_))
    })
    .await;
    match event {
        TableNetworkEvent::Disconnected(DisconnectReason::ConnectionLost(cause)) => {
            assert!(cause.contains("out of order"), "{}", cause);
        }
        other => panic!("Unexpected event {:?}", other),
    }
    assert_eq!(client.table_sequence(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_join_times_out_against_silent_host() {
    let listener = scripted_host().await;
    let client = TableNetwork::new(NetworkSettings {
        join_timeout: Duration::from_millis(300),
        ..fast_settings()
    });

    let (joined, _link) = join_scripted_host(&client, &listener, None).await;
    assert!(matches!(joined, Err(TableNetworkError::JoinTimedOut)));
    assert_eq!(client.status(), NetworkStatus::Offline);
    assert!(matches!(
        client.last_disconnect_reason(),
        Some(DisconnectReason::ConnectionLost(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_join_fails_on_tampered_snapshot() {
    let listener = scripted_host().await;
    let client = TableNetwork::new(fast_settings());

    let mut memento = TableMemento::new();
    memento.insert("deck", vec![52]);
    let mut snapshot = TableSnapshot::new(3, memento);
    snapshot.digest = [0; 32];

    let (joined, _link) = join_scripted_host(&client, &listener, Some(accepted(snapshot))).await;
    match joined {
        Err(TableNetworkError::ConnectionLost(cause)) => {
            assert!(cause.contains("digest"), "{}", cause);
        }
        other => panic!("Unexpected join result {:?}", other),
    }
    assert_eq!(client.status(), NetworkStatus::Offline);
}
