//! Line-framed TCP connection handler
//!
//! Handles individual client connections: line framing, message
//! decoding, credential checks, chunk writes, and bidirectional
//! communication with the dispatch hub.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinError;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, error, info, warn};

use crate::auth::CredentialStore;
use crate::codec;
use crate::command::HELP_TEXT;
use crate::config::ServerConfig;
use crate::error::{AppError, ErrorKind};
use crate::hub::HubCommand;
use crate::message::{ClientMessage, ServerMessage};
use crate::session::Session;
use crate::transfer::{Chunk, Reassembler};
use crate::types::{validate_username, SessionId};

/// Minimum secret length accepted at registration
const MIN_SECRET_LEN: usize = 4;

/// Services shared by every connection
#[derive(Clone)]
pub struct Context {
    pub hub: mpsc::Sender<HubCommand>,
    pub credentials: Arc<dyn CredentialStore>,
    pub transfers: Arc<Reassembler>,
    pub config: Arc<ServerConfig>,
}

/// Handle a new TCP connection
pub async fn handle_connection(stream: TcpStream, ctx: Context) -> Result<(), AppError> {
    let peer_addr = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    serve(stream, &peer_addr, ctx).await
}

/// Run one session over any byte stream until the peer goes away
///
/// A reader loop (lines → requests) runs on this task while a writer
/// task drains the session mailbox onto the stream. Either side ending
/// ends the session.
pub async fn serve<S>(stream: S, peer_addr: &str, ctx: Context) -> Result<(), AppError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let framed = Framed::new(
        stream,
        LinesCodec::new_with_max_length(ctx.config.max_line_length),
    );
    let (mut sink, mut lines) = framed.split::<String>();

    // Bounded mailbox: a full mailbox drops messages instead of blocking senders
    let (mailbox_tx, mut mailbox_rx) = mpsc::channel::<ServerMessage>(ctx.config.mailbox_capacity);
    let session = Arc::new(Session::new(SessionId::new(), mailbox_tx));
    let session_id = session.id();
    info!("Session {} connected from {}", session_id, peer_addr);

    session.enqueue(ServerMessage::notice(
        "Welcome! Please /login <username> <password> or /register <username> <password>. Type /help for commands.",
    ));

    // Spawn write task (mailbox -> stream)
    let mut ping = ctx.config.ping_interval.map(|period| {
        let mut interval = time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });
    let mut write_task = tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                msg = mailbox_rx.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
                _ = tick(&mut ping) => ServerMessage::Ping,
            };

            let line = match codec::encode(&msg) {
                Ok(line) => line,
                Err(e) => {
                    error!("Failed to serialize message: {}", e);
                    continue;
                }
            };
            if let Err(e) = sink.send(line).await {
                debug!("Send failed, ending write task: {}", e);
                break;
            }
        }
        debug!("Write task ended for {}", session_id);
    });

    // Read loop (stream -> requests)
    let result = loop {
        tokio::select! {
            line = lines.next() => match line {
                Some(Ok(line)) => {
                    if let Err(e) = dispatch(&session, &ctx, &line).await {
                        break Err(e);
                    }
                }
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    warn!("Oversized line from {}", session_id);
                    session.enqueue(AppError::Invalid("Message too long".to_string()).into());
                }
                Some(Err(e)) => break Err(e.into()),
                None => {
                    debug!("Session {} closed by peer", session_id);
                    break Ok(());
                }
            },
            _ = &mut write_task => {
                debug!("Write side of {} closed", session_id);
                break Ok(());
            }
        }
    };

    // Release memberships and identity before the session goes away
    let (done, done_rx) = oneshot::channel();
    if ctx
        .hub
        .send(HubCommand::Disconnect {
            session: session.clone(),
            done,
        })
        .await
        .is_ok()
    {
        let _ = done_rx.await;
    }
    write_task.abort();

    info!("Session {} disconnected", session_id);
    result
}

/// Resolves on the next keep-alive tick; never when pings are off
async fn tick(ping: &mut Option<Interval>) {
    match ping {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Decode and handle one inbound line
///
/// Business errors go back to the session; only transport errors end it.
async fn dispatch(session: &Arc<Session>, ctx: &Context, line: &str) -> Result<(), AppError> {
    if line.trim().is_empty() {
        return Ok(());
    }

    let result = match codec::decode_line(line) {
        Ok(msg) => handle_message(session, ctx, msg).await,
        Err(e) => Err(e),
    };

    match result {
        Err(e) if e.kind() == ErrorKind::Transport => Err(e),
        Err(e) => {
            debug!("Session {} request failed: {}", session.id(), e);
            session.enqueue(e.into());
            Ok(())
        }
        Ok(()) => Ok(()),
    }
}

async fn handle_message(session: &Arc<Session>, ctx: &Context, msg: ClientMessage) -> Result<(), AppError> {
    match msg {
        ClientMessage::Help => {
            session.enqueue(ServerMessage::notice(HELP_TEXT));
            Ok(())
        }
        ClientMessage::WhoAmI => {
            let content = match session.username() {
                Some(name) => format!("You are logged in as: {}", name),
                None => "You are not logged in".to_string(),
            };
            session.enqueue(ServerMessage::notice(content));
            Ok(())
        }
        ClientMessage::Register { username, secret } => handle_register(session, ctx, username, secret).await,
        ClientMessage::Login { username, secret } => handle_login(session, ctx, username, secret).await,
        _ if !session.is_authenticated() => Err(AppError::LoginRequired),
        ClientMessage::FileTransferChunk {
            recipient,
            filename,
            data,
            offset,
            size,
            last,
        } => handle_chunk(session, ctx, recipient, filename, data, offset, size, last).await,
        ClientMessage::ListTransfers => {
            let me = session.display_name();
            session.enqueue(ServerMessage::TransferList {
                transfers: ctx.transfers.transfers_for(&me),
            });
            Ok(())
        }
        ClientMessage::Logout => forward(ctx, HubCommand::Logout { session: session.clone() }),
        ClientMessage::ListUsers => forward(ctx, HubCommand::ListUsers { session: session.clone() }),
        ClientMessage::ListRooms => forward(ctx, HubCommand::ListRooms { session: session.clone() }),
        ClientMessage::JoinRoom { room } => {
            forward(ctx, HubCommand::JoinRoom { session: session.clone(), room })
        }
        ClientMessage::LeaveRoom { room } => {
            forward(ctx, HubCommand::LeaveRoom { session: session.clone(), room })
        }
        ClientMessage::CreateRoom { room } => {
            forward(ctx, HubCommand::CreateRoom { session: session.clone(), room })
        }
        ClientMessage::DeleteRoom { room } => {
            forward(ctx, HubCommand::DeleteRoom { session: session.clone(), room })
        }
        ClientMessage::Text {
            content,
            recipient: Some(recipient),
            ..
        }
        | ClientMessage::Direct { recipient, content } => {
            forward(
                ctx,
                HubCommand::Direct {
                    session: session.clone(),
                    recipient,
                    content,
                },
            )
        }
        ClientMessage::Text {
            content,
            room,
            recipient: None,
        } => {
            forward(
                ctx,
                HubCommand::Broadcast {
                    session: session.clone(),
                    room,
                    content,
                },
            )
        }
        ClientMessage::FileTransferRequest {
            recipient,
            filename,
            size,
        } => {
            forward(
                ctx,
                HubCommand::OfferFile {
                    session: session.clone(),
                    recipient,
                    filename,
                    size,
                },
            )
        }
    }
}

/// Non-blocking hand-off to the hub; a full queue is reported, not waited on
fn forward(ctx: &Context, cmd: HubCommand) -> Result<(), AppError> {
    ctx.hub.try_send(cmd).map_err(|e| match e {
        TrySendError::Full(_) => {
            warn!("Hub queue full, refusing request");
            AppError::ServerBusy
        }
        TrySendError::Closed(_) => AppError::ChannelSend,
    })
}

async fn handle_register(
    session: &Arc<Session>,
    ctx: &Context,
    username: String,
    secret: String,
) -> Result<(), AppError> {
    validate_username(&username)?;
    if secret.len() < MIN_SECRET_LEN {
        return Err(AppError::Invalid(format!(
            "Password must be at least {} characters long",
            MIN_SECRET_LEN
        )));
    }

    let store = ctx.credentials.clone();
    let name = username.clone();
    tokio::task::spawn_blocking(move || store.register(&name, &secret))
        .await
        .map_err(join_error)??;

    session.enqueue(ServerMessage::notice(format!(
        "Registration successful. You can now login with /login {} <password>",
        username
    )));
    Ok(())
}

async fn handle_login(
    session: &Arc<Session>,
    ctx: &Context,
    username: String,
    secret: String,
) -> Result<(), AppError> {
    if let Some(current) = session.username() {
        return Err(AppError::AlreadyAuthenticated(current));
    }

    let store = ctx.credentials.clone();
    let name = username.clone();
    tokio::task::spawn_blocking(move || store.verify(&name, &secret))
        .await
        .map_err(join_error)??;

    // The hub reports binding failures to the session itself
    let (reply, rx) = oneshot::channel();
    forward(
        ctx,
        HubCommand::Login {
            session: session.clone(),
            username: username.clone(),
            reply,
        },
    )?;
    if let Err(kind) = rx.await.map_err(|_| AppError::ChannelSend)? {
        debug!("Login of {} refused: {:?}", username, kind);
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn handle_chunk(
    session: &Arc<Session>,
    ctx: &Context,
    recipient: String,
    filename: String,
    data: Vec<u8>,
    offset: u64,
    size: u64,
    last: bool,
) -> Result<(), AppError> {
    let sender = session.display_name();
    let transfers = ctx.transfers.clone();
    let (from, name) = (sender.clone(), filename.clone());

    // Storage writes block; keep them off the async workers
    let outcome = tokio::task::spawn_blocking(move || {
        transfers.apply(Chunk {
            sender: &from,
            recipient: &recipient,
            filename: &name,
            data: &data,
            offset,
            size,
            last,
        })
    })
    .await
    .map_err(join_error)??;

    session.enqueue(ServerMessage::FileProgress {
        filename: filename.clone(),
        percent: outcome.percent,
    });

    if outcome.completed_now {
        session.enqueue(ServerMessage::notice(format!(
            "File {} sent to {}",
            filename, outcome.recipient
        )));
        let delivered = forward(
            ctx,
            HubCommand::Deliver {
                recipient: outcome.recipient.clone(),
                message: ServerMessage::notice(format!(
                    "File received: {} from {} ({} bytes)",
                    filename, sender, outcome.bytes_written
                )),
            },
        );
        if let Err(e) = delivered {
            warn!("Completion notice for {} not sent: {}", outcome.recipient, e);
        }
    }
    Ok(())
}

fn join_error(e: JoinError) -> AppError {
    AppError::Task(e.to_string())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde_json::{json, Value};
    use tokio::io::DuplexStream;
    use tokio::time::timeout;

    use super::*;
    use crate::auth::tests::fast_store;
    use crate::directory::RoomDirectory;
    use crate::hub::Hub;
    use crate::storage::{ContentStore, ContentTarget, MemoryStore};
    use crate::types::GENERAL_ROOM;

    type Client = Framed<DuplexStream, LinesCodec>;

    struct Relay {
        ctx: Context,
        store: MemoryStore,
        directory: Arc<RoomDirectory>,
    }

    fn relay() -> Relay {
        let store = MemoryStore::new();
        relay_with(Arc::new(store.clone()), store, None)
    }

    fn relay_with(
        content: Arc<dyn ContentStore>,
        store: MemoryStore,
        ping_interval: Option<Duration>,
    ) -> Relay {
        let config = ServerConfig {
            ping_interval,
            ..ServerConfig::default()
        };
        let transfers = Arc::new(Reassembler::new(content));
        let directory = Arc::new(RoomDirectory::new(config.room_queue_capacity));

        let (hub_tx, hub_rx) = mpsc::channel(config.hub_queue_capacity);
        tokio::spawn(Hub::new(hub_rx, directory.clone(), transfers.clone()).run());

        Relay {
            ctx: Context {
                hub: hub_tx,
                credentials: Arc::new(fast_store()),
                transfers,
                config: Arc::new(config),
            },
            store,
            directory,
        }
    }

    fn connect(relay: &Relay) -> Client {
        let (client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(serve(server, "test", relay.ctx.clone()));
        Framed::new(client, LinesCodec::new())
    }

    async fn send(client: &mut Client, line: &str) {
        client.send(line.to_string()).await.unwrap();
    }

    /// Read until a message satisfies `pred`, returning it
    async fn expect(client: &mut Client, pred: impl Fn(&Value) -> bool) -> Value {
        loop {
            let line = timeout(Duration::from_secs(120), client.next())
                .await
                .expect("timed out waiting for message")
                .expect("connection closed")
                .unwrap();
            let value: Value = serde_json::from_str(&line).unwrap();
            if pred(&value) {
                return value;
            }
        }
    }

    fn notice_containing(text: &'static str) -> impl Fn(&Value) -> bool {
        move |v| v["type"] == "notice" && v["content"].as_str().is_some_and(|c| c.contains(text))
    }

    async fn signed_in(relay: &Relay, name: &str) -> Client {
        let mut client = connect(relay);
        send(&mut client, &format!("/register {} hunter22", name)).await;
        expect(&mut client, notice_containing("Registration successful")).await;
        send(&mut client, &format!("/login {} hunter22", name)).await;
        expect(&mut client, notice_containing("Welcome to the chat server")).await;
        client
    }

    #[tokio::test]
    async fn test_requests_before_login_are_refused() {
        let relay = relay();
        let mut client = connect(&relay);

        send(&mut client, "/join general").await;
        let err = expect(&mut client, |v| v["type"] == "error").await;
        assert_eq!(err["code"], "login_required");

        send(&mut client, "/whoami").await;
        expect(&mut client, notice_containing("You are not logged in")).await;
    }

    #[tokio::test]
    async fn test_bad_credentials() {
        let relay = relay();
        let mut client = connect(&relay);
        send(&mut client, "/register alice hunter22").await;
        expect(&mut client, notice_containing("Registration successful")).await;

        send(&mut client, "/login alice nope").await;
        let err = expect(&mut client, |v| v["type"] == "error").await;
        assert_eq!(err["code"], "invalid_credentials");

        send(&mut client, "/register al hunter22").await;
        let err = expect(&mut client, |v| v["type"] == "error").await;
        assert_eq!(err["code"], "invalid_message");
    }

    #[tokio::test]
    async fn test_chat_between_sessions() {
        let relay = relay();
        let mut alice = signed_in(&relay, "alice").await;
        let mut bob = signed_in(&relay, "bob").await;

        send(&mut alice, "hello everyone").await;
        let msg = expect(&mut bob, |v| v["type"] == "text" && v["sender"] == "alice").await;
        assert_eq!(msg["room"], "general");
        assert_eq!(msg["content"], "hello everyone");

        send(&mut bob, r#"{"type": "direct", "recipient": "alice", "content": "hi"}"#).await;
        let msg = expect(&mut alice, |v| v["type"] == "direct").await;
        assert_eq!(msg["sender"], "bob");
        expect(&mut bob, notice_containing("(To alice): hi")).await;
    }

    #[tokio::test]
    async fn test_unparsable_json_is_chat_text() {
        let relay = relay();
        let mut alice = signed_in(&relay, "alice").await;

        send(&mut alice, r#"{"type": "broken""#).await;
        let msg = expect(&mut alice, |v| v["type"] == "text" && v["sender"] == "alice").await;
        assert_eq!(msg["content"], r#"{"type": "broken""#);
    }

    #[tokio::test]
    async fn test_disconnect_frees_identity() {
        let relay = relay();
        let alice = signed_in(&relay, "alice").await;
        let mut bob = signed_in(&relay, "bob").await;

        drop(alice);
        expect(&mut bob, |v| v["type"] == "text" && v["content"] == "alice has left the room.").await;

        signed_in(&relay, "alice").await;
    }

    #[tokio::test]
    async fn test_file_transfer_end_to_end() {
        let relay = relay();
        let mut alice = signed_in(&relay, "alice").await;
        let mut bob = signed_in(&relay, "bob").await;

        let body: Vec<u8> = (0..6144u32).map(|i| (i % 251) as u8).collect();
        send(
            &mut alice,
            r#"{"type": "file_transfer_request", "recipient": "bob", "filename": "photo.jpg", "size": 6144}"#,
        )
        .await;
        expect(&mut bob, notice_containing("Incoming file photo.jpg")).await;

        // Second half first
        for (offset, last) in [(4096usize, true), (0, false)] {
            let end = (offset + 4096).min(body.len());
            let chunk = json!({
                "type": "file_transfer_chunk",
                "recipient": "bob",
                "filename": "photo.jpg",
                "data": STANDARD.encode(&body[offset..end]),
                "offset": offset,
                "size": 6144,
                "final": last,
            });
            send(&mut alice, &chunk.to_string()).await;
        }

        let first = expect(&mut alice, |v| v["type"] == "file_progress").await;
        assert_eq!(first["percent"], 33);
        let second = expect(&mut alice, |v| v["type"] == "file_progress").await;
        assert_eq!(second["percent"], 100);

        expect(&mut bob, notice_containing("File received: photo.jpg from alice")).await;
        assert_eq!(relay.store.contents("bob", "alice", "photo.jpg"), Some(body));

        send(&mut bob, "/transfers").await;
        let list = expect(&mut bob, |v| v["type"] == "transfer_list").await;
        assert_eq!(list["transfers"][0]["complete"], true);
        assert_eq!(list["transfers"][0]["bytes_written"], 6144);
    }

    fn chunk_line(filename: &str, data: &[u8], offset: u64, size: u64, last: bool) -> String {
        json!({
            "type": "file_transfer_chunk",
            "recipient": "bob",
            "filename": filename,
            "data": STANDARD.encode(data),
            "offset": offset,
            "size": size,
            "final": last,
        })
        .to_string()
    }

    #[derive(Debug)]
    struct FullDisk;

    #[derive(Debug)]
    struct FullDiskTarget;

    impl ContentStore for FullDisk {
        fn open(&self, _: &str, _: &str, _: &str) -> Result<Box<dyn ContentTarget>, AppError> {
            Ok(Box::new(FullDiskTarget))
        }
    }

    impl ContentTarget for FullDiskTarget {
        fn write_at(&mut self, _offset: u64, _data: &[u8]) -> std::io::Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "No space left on device"))
        }

        fn finish(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_storage_failure_keeps_connection() {
        let relay = relay_with(Arc::new(FullDisk), MemoryStore::new(), None);
        let mut alice = signed_in(&relay, "alice").await;

        send(&mut alice, &chunk_line("a.txt", b"abc", 0, 3, true)).await;
        let err = expect(&mut alice, |v| v["type"] == "error").await;
        assert_eq!(err["code"], "storage_failed");
        assert_eq!(err["message"], "Could not store file: No space left on device");

        // Still connected and still logged in
        send(&mut alice, "/whoami").await;
        expect(&mut alice, notice_containing("You are logged in as: alice")).await;
    }

    #[tokio::test]
    async fn test_chunk_past_declared_size_is_refused() {
        let relay = relay();
        let mut alice = signed_in(&relay, "alice").await;

        send(&mut alice, &chunk_line("a.txt", b"z", 1 << 40, 10, false)).await;
        let err = expect(&mut alice, |v| v["type"] == "error").await;
        assert_eq!(err["code"], "invalid_message");
        assert_eq!(relay.store.contents("bob", "alice", "a.txt"), None);

        send(&mut alice, "/whoami").await;
        expect(&mut alice, notice_containing("You are logged in as: alice")).await;
    }

    #[tokio::test]
    async fn test_resent_file_completes_again() {
        let relay = relay();
        let mut alice = signed_in(&relay, "alice").await;
        let mut bob = signed_in(&relay, "bob").await;

        send(&mut alice, &chunk_line("a.txt", b"LONG OLD CONTENT", 0, 16, true)).await;
        expect(&mut bob, notice_containing("File received: a.txt from alice (16 bytes)")).await;

        send(&mut alice, &chunk_line("a.txt", b"new", 0, 3, true)).await;
        expect(&mut bob, notice_containing("File received: a.txt from alice (3 bytes)")).await;
        assert_eq!(relay.store.contents("bob", "alice", "a.txt"), Some(b"new".to_vec()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_ping_and_cleanup() {
        let store = MemoryStore::new();
        let relay = relay_with(
            Arc::new(store.clone()),
            store,
            Some(Duration::from_secs(30)),
        );
        let mut bob = signed_in(&relay, "bob").await;
        let mut alice = signed_in(&relay, "alice").await;

        let before = Instant::now();
        let ping = expect(&mut alice, |v| v["type"] == "ping").await;
        assert_eq!(ping, json!({"type": "ping"}));
        assert!(before.elapsed() <= Duration::from_secs(30));

        // A second period yields another ping
        expect(&mut alice, |v| v["type"] == "ping").await;

        drop(alice);
        expect(&mut bob, |v| v["type"] == "text" && v["content"] == "alice has left the room.").await;

        let general = relay.directory.get(GENERAL_ROOM).unwrap();
        assert_eq!(general.members().await.unwrap().len(), 1);
    }
}
