use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use handoff_crypto::SessionKey;
use handoff_db::Database;
use handoff_transfer::protocol::{
    decode_command, encode_command, encode_file_slice, encode_message, read_frame, write_frame,
};
use handoff_transfer::{
    BlockedReason, ClientConfig, ClientState, ClosedReason, ServerConfig, ServerState,
    TransferClient, TransferError, TransferServer, file_path,
};
use handoff_types::models::*;
use handoff_types::{Action, Command, ItemKind, RecordStore, StoreError, TransferItem};
use tokio::net::{TcpListener, TcpStream};
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(10);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("handoff_transfer=debug")
        .with_test_writer()
        .try_init();
}

fn scratch(label: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("handoff-{label}-{}", Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn loopback_config(account_id: &str, attachments_dir: Option<PathBuf>) -> ServerConfig {
    ServerConfig {
        account_id: account_id.into(),
        bind_host: Ipv4Addr::LOCALHOST.into(),
        slice_size: 1000,
        attachments_dir,
        stats_interval: Duration::from_millis(50),
        ..Default::default()
    }
}

async fn wait_client(client: &TransferClient, done: impl Fn(&ClientState) -> bool) -> ClientState {
    let mut rx = client.subscribe();
    let state = tokio::time::timeout(WAIT, rx.wait_for(|s| done(s)))
        .await
        .expect("client state timeout")
        .expect("client dropped");
    state.clone()
}

async fn wait_server(server: &TransferServer, done: impl Fn(&ServerState) -> bool) -> ServerState {
    let mut rx = server.subscribe();
    let state = tokio::time::timeout(WAIT, rx.wait_for(|s| done(s)))
        .await
        .expect("server state timeout")
        .expect("server dropped");
    state.clone()
}

async fn wait_blocked(server: &TransferServer) -> BlockedReason {
    let mut rx = server.subscribe_blocked_reason();
    let reason = tokio::time::timeout(WAIT, rx.wait_for(|r| r.is_some()))
        .await
        .expect("blocked reason timeout")
        .expect("server dropped");
    reason.expect("reason present")
}

#[tokio::test]
async fn migrates_database_and_attachments() {
    init_tracing();
    let send_dir = scratch("send");
    let recv_dir = scratch("recv");
    let cache_dir = std::env::temp_dir().join(format!("handoff-cache-{}", Uuid::new_v4()));

    let sender_db = memory_db();
    let media = sender_db.seed("U1", 4).unwrap();
    assert_eq!(media.len(), 1);
    let attachment_id = Uuid::parse_str(&media[0].message_id).unwrap();
    let content: Vec<u8> = (0..2500u32).map(|i| (i % 251) as u8).collect();
    std::fs::write(file_path(&send_dir, &attachment_id), &content).unwrap();

    let server = TransferServer::new(loopback_config("U1", Some(send_dir.clone())), sender_db);
    server.start_listening().await.unwrap();
    let payload = server.pairing_payload().expect("payload once listening");
    assert_eq!(payload.hostname, "127.0.0.1");
    assert!(payload.code <= 999);

    let receiver_db = memory_db();
    let client = TransferClient::from_pairing(
        &payload.to_uri(),
        "U1",
        cache_dir.clone(),
        Some(recv_dir.clone()),
        receiver_db.clone(),
    )
    .unwrap();
    client.start();

    let state = wait_client(&client, ClientState::is_terminal).await;
    assert_eq!(state, ClientState::Finished);
    let state = wait_server(&server, ServerState::is_closed).await;
    assert_eq!(state, ServerState::Closed(ClosedReason::Finished));

    // 1 user, 1 conversation, 2 participants, 4 messages, 1 file.
    assert_eq!(client.processed_count(), 9);
    assert_eq!(receiver_db.count_kind(ItemKind::User).unwrap(), 1);
    assert_eq!(receiver_db.count_kind(ItemKind::Conversation).unwrap(), 1);
    assert_eq!(receiver_db.count_kind(ItemKind::Participant).unwrap(), 2);
    assert_eq!(receiver_db.count_kind(ItemKind::Message).unwrap(), 4);

    let received = std::fs::read(file_path(&recv_dir, &attachment_id)).unwrap();
    assert_eq!(received, content);
    assert!(!cache_dir.exists());

    // Teardown after completion changes nothing.
    client.cancel();
    server.stop_listening();
    assert_eq!(client.state(), ClientState::Finished);
    assert_eq!(server.state(), ServerState::Closed(ClosedReason::Finished));

    std::fs::remove_dir_all(&send_dir).unwrap();
    std::fs::remove_dir_all(&recv_dir).unwrap();
}

fn text_message(id: &str, media: bool) -> Message {
    Message {
        message_id: id.into(),
        conversation_id: "c1".into(),
        user_id: "U1".into(),
        category: if media { "PLAIN_DATA" } else { "PLAIN_TEXT" }.into(),
        content: (!media).then(|| "hi".into()),
        media_url: media.then(|| "photo.jpg".into()),
        media_mime_type: None,
        media_size: None,
        media_status: None,
        status: "READ".into(),
        created_at: "2024-01-01T00:00:00Z".into(),
        quote_message_id: None,
        caption: None,
    }
}

#[tokio::test]
async fn two_messages_and_a_two_slice_file() {
    init_tracing();
    let send_dir = scratch("send");
    let recv_dir = scratch("recv");
    let cache_dir = std::env::temp_dir().join(format!("handoff-cache-{}", Uuid::new_v4()));

    let file_id = Uuid::new_v4();
    let sender_db = memory_db();
    sender_db.upsert(&text_message("m1", false)).unwrap();
    sender_db.upsert(&text_message(&file_id.to_string(), true)).unwrap();
    let content = vec![0x5a; 1500];
    std::fs::write(file_path(&send_dir, &file_id), &content).unwrap();

    let server = TransferServer::with_credentials(
        loopback_config("U1", Some(send_dir.clone())),
        sender_db,
        42,
        SessionKey::generate(),
    );
    server.start_listening().await.unwrap();
    let payload = server.pairing_payload().unwrap();
    assert_eq!(payload.code, 42);

    let receiver_db = memory_db();
    let config = ClientConfig::from_pairing(payload, "U1".into(), cache_dir.clone(), Some(recv_dir.clone()));
    let client = TransferClient::new(config, receiver_db.clone());
    client.start();

    assert_eq!(wait_client(&client, ClientState::is_terminal).await, ClientState::Finished);
    assert_eq!(client.processed_count(), 3);
    assert_eq!(receiver_db.count_kind(ItemKind::Message).unwrap(), 2);
    assert_eq!(std::fs::read(file_path(&recv_dir, &file_id)).unwrap(), content);
    assert!(!cache_dir.exists());
    assert_eq!(
        wait_server(&server, ServerState::is_closed).await,
        ServerState::Closed(ClosedReason::Finished)
    );

    std::fs::remove_dir_all(&send_dir).unwrap();
    std::fs::remove_dir_all(&recv_dir).unwrap();
}

#[tokio::test]
async fn rejected_receivers_leave_server_listening() {
    init_tracing();
    let sender_db = memory_db();
    sender_db.seed("U1", 2).unwrap();
    let server = TransferServer::with_credentials(
        loopback_config("U1", None),
        sender_db,
        42,
        SessionKey::generate(),
    );
    server.start_listening().await.unwrap();
    let payload = server.pairing_payload().unwrap();

    let attempt = |account: &str, code: u16| {
        let mut config = ClientConfig::from_pairing(
            payload.clone(),
            account.into(),
            std::env::temp_dir().join(format!("handoff-cache-{}", Uuid::new_v4())),
            None,
        );
        config.code = code;
        TransferClient::new(config, memory_db())
    };

    let wrong_user = attempt("U2", 42);
    wrong_user.start();
    assert_eq!(wait_blocked(&server).await, BlockedReason::MismatchedUser);
    let state = wait_client(&wrong_user, ClientState::is_terminal).await;
    assert_eq!(state, ClientState::Failed(TransferError::RemoteComplete));
    server.consume_last_connection_blocked_reason();
    assert_eq!(server.last_connection_blocked_reason(), None);

    let wrong_code = attempt("U1", 43);
    wrong_code.start();
    assert_eq!(wait_blocked(&server).await, BlockedReason::MismatchedCode);
    wait_client(&wrong_code, ClientState::is_terminal).await;
    assert!(matches!(server.state(), ServerState::Listening { .. }));

    let receiver_db = memory_db();
    let config = ClientConfig::from_pairing(
        payload.clone(),
        "U1".into(),
        std::env::temp_dir().join(format!("handoff-cache-{}", Uuid::new_v4())),
        None,
    );
    let client = TransferClient::new(config, receiver_db.clone());
    client.start();
    assert_eq!(wait_client(&client, ClientState::is_terminal).await, ClientState::Finished);
    assert_eq!(receiver_db.count_kind(ItemKind::Message).unwrap(), 2);
}

#[tokio::test]
async fn stop_and_cancel_before_any_connection() {
    let server = TransferServer::new(loopback_config("U1", None), memory_db());
    server.stop_listening();
    assert_eq!(server.state(), ServerState::Closed(ClosedReason::Cancelled));
    server.start_listening().await.unwrap();
    assert_eq!(server.state(), ServerState::Closed(ClosedReason::Cancelled));
    assert!(server.pairing_payload().is_none());

    let listening = TransferServer::new(loopback_config("U1", None), memory_db());
    listening.start_listening().await.unwrap();
    listening.stop_listening();
    let state = wait_server(&listening, ServerState::is_closed).await;
    assert_eq!(state, ServerState::Closed(ClosedReason::Cancelled));

    let (client, _, _) = fake_client(memory_db()).await;
    client.cancel();
    assert_eq!(client.state(), ClientState::Cancelled);
    client.start();
    assert_eq!(client.state(), ClientState::Cancelled);
}

// ── Raw peer ──

fn raw_config(listener: &TcpListener, key: &SessionKey) -> ClientConfig {
    ClientConfig {
        hostname: "127.0.0.1".into(),
        port: listener.local_addr().unwrap().port(),
        code: 7,
        key: key.clone(),
        account_id: "U1".into(),
        cache_dir: std::env::temp_dir().join(format!("handoff-cache-{}", Uuid::new_v4())),
        attachments_dir: None,
        stats_interval: Duration::from_millis(50),
    }
}

/// A client pointed at a bare listener the test drives by hand.
async fn fake_client(store: Arc<dyn RecordStore>) -> (TransferClient, TcpListener, SessionKey) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let key = SessionKey::generate();
    let config = raw_config(&listener, &key);
    (TransferClient::new(config, store), listener, key)
}

fn memory_db() -> Arc<Database> {
    Arc::new(Database::open_in_memory().unwrap())
}

async fn accept_connect(listener: &TcpListener, key: &SessionKey) -> TcpStream {
    let (mut stream, _) = listener.accept().await.unwrap();
    let body = read_frame(&mut stream).await.unwrap().unwrap();
    let command = decode_command(&body, key).unwrap();
    assert!(matches!(command.action, Action::Connect { code: 7, ref user_id } if user_id == "U1"));
    stream
}

async fn send_command(stream: &mut TcpStream, command: &Command, key: &SessionKey) {
    write_frame(stream, &encode_command(command, key).unwrap()).await.unwrap();
}

fn pin(id: &str) -> Vec<u8> {
    TransferItem::PinMessage(PinMessage {
        message_id: id.into(),
        conversation_id: "c1".into(),
        created_at: "t".into(),
    })
    .encode()
    .unwrap()
}

#[tokio::test]
async fn unknown_items_are_counted_and_dropped() {
    init_tracing();
    let store = memory_db();
    let (client, listener, key) = fake_client(store.clone()).await;
    client.start();

    let mut stream = accept_connect(&listener, &key).await;
    send_command(&mut stream, &Command::start(2), &key).await;
    let unknown = br#"{"type":"sticker_album","data":{"album_id":"a1"}}"#;
    write_frame(&mut stream, &encode_message(unknown, &key).unwrap()).await.unwrap();
    write_frame(&mut stream, &encode_message(&pin("m1"), &key).unwrap()).await.unwrap();
    send_command(&mut stream, &Command::finish(), &key).await;

    // Progress reports may arrive before the finish echo.
    loop {
        let body = read_frame(&mut stream).await.unwrap().expect("finish echo");
        if matches!(decode_command(&body, &key).unwrap().action, Action::Finish) {
            break;
        }
    }

    assert_eq!(wait_client(&client, ClientState::is_terminal).await, ClientState::Finished);
    assert_eq!(client.processed_count(), 2);
    assert_eq!(store.count_kind(ItemKind::PinMessage).unwrap(), 1);
}

#[tokio::test]
async fn tampered_frame_fails_with_mismatched_hmac() {
    init_tracing();
    let (client, listener, key) = fake_client(memory_db()).await;
    client.start();

    let mut stream = accept_connect(&listener, &key).await;
    send_command(&mut stream, &Command::start(1), &key).await;
    let mut body = encode_message(&pin("m1"), &key).unwrap();
    let last = body.len() - 1;
    body[last] ^= 0x01;
    write_frame(&mut stream, &body).await.unwrap();

    let state = wait_client(&client, ClientState::is_terminal).await;
    assert!(matches!(state, ClientState::Failed(TransferError::MismatchedHmac { .. })));
}

#[tokio::test]
async fn interleaved_files_are_a_protocol_violation() {
    init_tracing();
    let (client, listener, key) = fake_client(memory_db()).await;
    client.start();

    let mut stream = accept_connect(&listener, &key).await;
    send_command(&mut stream, &Command::start(2), &key).await;
    let first = encode_file_slice(Uuid::new_v4(), 5, b"hello", &key).unwrap();
    let second = encode_file_slice(Uuid::new_v4(), 0, b"world", &key).unwrap();
    write_frame(&mut stream, &first).await.unwrap();
    write_frame(&mut stream, &second).await.unwrap();

    let state = wait_client(&client, ClientState::is_terminal).await;
    assert!(matches!(state, ClientState::Failed(TransferError::ProtocolViolation(_))));
}

#[tokio::test]
async fn sender_vanishing_mid_transfer_is_remote_complete() {
    init_tracing();
    let (client, listener, key) = fake_client(memory_db()).await;
    client.start();

    let mut stream = accept_connect(&listener, &key).await;
    send_command(&mut stream, &Command::start(10), &key).await;
    write_frame(&mut stream, &encode_message(&pin("m1"), &key).unwrap()).await.unwrap();
    drop(stream);

    let state = wait_client(&client, ClientState::is_terminal).await;
    assert_eq!(state, ClientState::Failed(TransferError::RemoteComplete));
}

/// Store whose disk is gone: every insert fails for the whole store.
struct FullDisk;

fn disk_full() -> Result<(), StoreError> {
    Err(StoreError::Systemic("disk full".into()))
}

impl RecordStore for FullDisk {
    fn insert_conversation(&self, _: &Conversation) -> Result<(), StoreError> { disk_full() }
    fn insert_participant(&self, _: &Participant) -> Result<(), StoreError> { disk_full() }
    fn insert_user(&self, _: &User) -> Result<(), StoreError> { disk_full() }
    fn insert_app(&self, _: &App) -> Result<(), StoreError> { disk_full() }
    fn insert_asset(&self, _: &Asset) -> Result<(), StoreError> { disk_full() }
    fn insert_snapshot(&self, _: &Snapshot) -> Result<(), StoreError> { disk_full() }
    fn insert_sticker(&self, _: &Sticker) -> Result<(), StoreError> { disk_full() }
    fn insert_pin_message(&self, _: &PinMessage) -> Result<(), StoreError> { disk_full() }
    fn insert_transcript_message(&self, _: &TranscriptMessage) -> Result<(), StoreError> { disk_full() }
    fn insert_message(&self, _: &Message) -> Result<(), StoreError> { disk_full() }
    fn insert_message_mention(&self, _: &MessageMention) -> Result<(), StoreError> { disk_full() }
    fn insert_expired_message(&self, _: &ExpiredMessage) -> Result<(), StoreError> { disk_full() }
}

#[tokio::test]
async fn systemic_store_failure_fails_the_client() {
    init_tracing();
    let (client, listener, key) = fake_client(Arc::new(FullDisk)).await;
    client.start();

    let mut stream = accept_connect(&listener, &key).await;
    send_command(&mut stream, &Command::start(2), &key).await;
    write_frame(&mut stream, &encode_message(&pin("m1"), &key).unwrap()).await.unwrap();

    let state = wait_client(&client, ClientState::is_terminal).await;
    assert!(matches!(state, ClientState::Failed(TransferError::Storage(_))), "{state:?}");
}

#[tokio::test]
async fn cancel_mid_file_removes_the_cache() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let key = SessionKey::generate();
    let config = raw_config(&listener, &key);
    let cache_dir = config.cache_dir.clone();
    let client = TransferClient::new(config, memory_db());
    client.start();

    let mut stream = accept_connect(&listener, &key).await;
    send_command(&mut stream, &Command::start(1), &key).await;
    let id = Uuid::new_v4();
    let slice = encode_file_slice(id, 5, b"hello", &key).unwrap();
    write_frame(&mut stream, &slice).await.unwrap();

    let partial = file_path(&cache_dir, &id);
    tokio::time::timeout(WAIT, async {
        while !partial.exists() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("partial file in cache");

    client.cancel();
    assert_eq!(wait_client(&client, ClientState::is_terminal).await, ClientState::Cancelled);
    assert!(!cache_dir.exists());
}

#[tokio::test]
async fn close_after_finish_still_finishes() {
    init_tracing();
    let store = memory_db();
    let (client, listener, key) = fake_client(store.clone()).await;
    client.start();

    let mut stream = accept_connect(&listener, &key).await;
    send_command(&mut stream, &Command::start(1), &key).await;
    write_frame(&mut stream, &encode_message(&pin("m1"), &key).unwrap()).await.unwrap();
    send_command(&mut stream, &Command::finish(), &key).await;
    loop {
        let body = read_frame(&mut stream).await.unwrap().expect("finish echo");
        if matches!(decode_command(&body, &key).unwrap().action, Action::Finish) {
            break;
        }
    }
    drop(stream);

    assert_eq!(wait_client(&client, ClientState::is_terminal).await, ClientState::Finished);
    assert_eq!(store.count_kind(ItemKind::PinMessage).unwrap(), 1);
}

async fn connect_raw(server: &TransferServer) -> TcpStream {
    let payload = server.pairing_payload().unwrap();
    TcpStream::connect((payload.hostname.as_str(), payload.port)).await.unwrap()
}

fn tampered(command: &Command, key: &SessionKey) -> Vec<u8> {
    let mut body = encode_command(command, key).unwrap();
    let last = body.len() - 1;
    body[last] ^= 0x01;
    body
}

#[tokio::test]
async fn server_rejects_tampered_connect() {
    init_tracing();
    let key = SessionKey::generate();
    let server = TransferServer::with_credentials(loopback_config("U1", None), memory_db(), 42, key.clone());
    server.start_listening().await.unwrap();

    let mut stream = connect_raw(&server).await;
    write_frame(&mut stream, &tampered(&Command::connect(42, "U1"), &key)).await.unwrap();

    let state = wait_server(&server, ServerState::is_closed).await;
    assert!(
        matches!(state, ServerState::Closed(ClosedReason::Exception(TransferError::MismatchedHmac { .. }))),
        "{state:?}"
    );
}

#[tokio::test]
async fn server_rejects_tampered_frame_during_transfer() {
    init_tracing();
    let key = SessionKey::generate();
    let server = TransferServer::with_credentials(loopback_config("U1", None), memory_db(), 42, key.clone());
    server.start_listening().await.unwrap();

    let mut stream = connect_raw(&server).await;
    send_command(&mut stream, &Command::connect(42, "U1"), &key).await;
    let body = read_frame(&mut stream).await.unwrap().expect("start");
    assert!(matches!(decode_command(&body, &key).unwrap().action, Action::Start { .. }));
    write_frame(&mut stream, &tampered(&Command::progress(50.0), &key)).await.unwrap();

    let state = wait_server(&server, ServerState::is_closed).await;
    assert!(
        matches!(state, ServerState::Closed(ClosedReason::Exception(TransferError::MismatchedHmac { .. }))),
        "{state:?}"
    );
}

#[tokio::test]
async fn silent_connection_times_out_and_server_keeps_listening() {
    init_tracing();
    let sender_db = memory_db();
    sender_db.seed("U1", 2).unwrap();
    let config = ServerConfig {
        handshake_timeout: Duration::from_millis(200),
        ..loopback_config("U1", None)
    };
    let server = TransferServer::new(config, sender_db);
    server.start_listening().await.unwrap();

    let _idle = connect_raw(&server).await;
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(matches!(server.state(), ServerState::Listening { .. }));

    let receiver_db = memory_db();
    let client = TransferClient::from_pairing(
        &server.pairing_payload().unwrap().to_uri(),
        "U1",
        std::env::temp_dir().join(format!("handoff-cache-{}", Uuid::new_v4())),
        None,
        receiver_db.clone(),
    )
    .unwrap();
    client.start();
    assert_eq!(wait_client(&client, ClientState::is_terminal).await, ClientState::Finished);
    assert_eq!(receiver_db.count_kind(ItemKind::Message).unwrap(), 2);
}
