use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use realm_core::geometry::Vec2;
use realm_core::participant::ParticipantId;
use realm_core::protocol::{ClientMessage, PROTOCOL_VERSION, ServerMessage, encode_client_message};
use realm_core::test_helpers::test_world;

use realm_server::authority::OfflineAuthority;
use realm_server::build_app;
use realm_server::config::{AdminConfig, ServerConfig, TicksConfig};
use realm_server::game_loop::{Clock, GameCommand, spawn_game_loop};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const ADMIN_TOKEN: &str = "test-token";

pub struct TestServer {
    pub addr: SocketAddr,
    pub commands: mpsc::Sender<GameCommand>,
    _server: tokio::task::JoinHandle<()>,
}

impl TestServer {
    /// Start a server with an admin token and fast timers.
    pub async fn new() -> Self {
        Self::from_config(test_config()).await
    }

    pub async fn from_config(config: ServerConfig) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let world = test_world();
        let clock = Clock::new(world.now);
        let (commands, _loop) = spawn_game_loop(
            world,
            clock,
            config.ticks.clone(),
            Arc::new(OfflineAuthority::default()),
            config.limits.command_buffer,
        );
        let (app, _state) = build_app(config, commands.clone());

        let handle = tokio::spawn(async move {
            let service = app.into_make_service_with_connect_info::<SocketAddr>();
            axum::serve(listener, service).await.unwrap();
        });

        // Give the server a moment to start accepting
        tokio::time::sleep(Duration::from_millis(20)).await;

        Self {
            addr,
            commands,
            _server: handle,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }
}

pub fn test_config() -> ServerConfig {
    ServerConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        ticks: TicksConfig {
            fast_ms: 20,
            slow_ms: 200,
            update_ms: 50,
            reward_ms: 60_000,
            connection_ms: 500,
        },
        admin: AdminConfig {
            bearer_token: Some(ADMIN_TOKEN.to_string()),
        },
        ..ServerConfig::default()
    }
}

pub async fn ws_connect(url: &str) -> WsStream {
    let (stream, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    stream
}

pub async fn ws_send(stream: &mut WsStream, msg: &ClientMessage) {
    let encoded = encode_client_message(msg).unwrap();
    stream.send(Message::Text(encoded.into())).await.unwrap();
}

pub async fn ws_send_raw(stream: &mut WsStream, text: &str) {
    stream.send(Message::Text(text.into())).await.unwrap();
}

/// What the next frame turned out to be.
#[derive(Debug)]
pub enum Received {
    Direct(ServerMessage),
    /// A per-tick event batch.
    Batch(Vec<(String, String)>),
    Closed(Option<String>),
}

/// Read the next frame (5s timeout).
pub async fn ws_read(stream: &mut WsStream) -> Received {
    let deadline = Duration::from_secs(5);
    tokio::time::timeout(deadline, async {
        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    if let Ok(msg) = serde_json::from_str::<ServerMessage>(text.as_str()) {
                        return Received::Direct(msg);
                    }
                    let batch: Vec<(String, String)> = serde_json::from_str(text.as_str())
                        .unwrap_or_else(|e| panic!("Unrecognised frame {text}: {e}"));
                    return Received::Batch(batch);
                },
                Some(Ok(Message::Close(frame))) => {
                    return Received::Closed(frame.map(|f| f.reason.to_string()));
                },
                Some(Err(_)) | None => return Received::Closed(None),
                _ => continue,
            }
        }
    })
    .await
    .expect("Timed out waiting for WebSocket message")
}

/// Skip frames until a direct message matching `pred` arrives.
pub async fn ws_expect(
    stream: &mut WsStream,
    pred: impl Fn(&ServerMessage) -> bool,
) -> ServerMessage {
    for _ in 0..500 {
        match ws_read(stream).await {
            Received::Direct(msg) if pred(&msg) => return msg,
            Received::Closed(reason) => panic!("WebSocket closed unexpectedly: {reason:?}"),
            _ => {},
        }
    }
    panic!("Expected message never arrived");
}

/// Skip frames until a batch containing an event called `name` arrives.
pub async fn ws_expect_event(stream: &mut WsStream, name: &str) -> String {
    for _ in 0..500 {
        match ws_read(stream).await {
            Received::Batch(events) => {
                if let Some((_, fields)) = events.into_iter().find(|(n, _)| n == name) {
                    return fields;
                }
            },
            Received::Closed(reason) => panic!("WebSocket closed unexpectedly: {reason:?}"),
            Received::Direct(_) => {},
        }
    }
    panic!("Expected event {name} never arrived");
}

/// Skip frames until the server closes the socket. Returns the close reason.
pub async fn ws_expect_close(stream: &mut WsStream) -> Option<String> {
    for _ in 0..500 {
        if let Received::Closed(reason) = ws_read(stream).await {
            return reason;
        }
    }
    panic!("Socket never closed");
}

/// Connect and read the welcome. Returns the assigned id.
pub async fn ws_welcome(stream: &mut WsStream) -> ParticipantId {
    match ws_expect(stream, |m| matches!(m, ServerMessage::Welcome { .. })).await {
        ServerMessage::Welcome { id, version, .. } => {
            assert_eq!(version, PROTOCOL_VERSION);
            id
        },
        _ => unreachable!(),
    }
}

/// Connect, identify and join. Returns the stream, participant id and spawn
/// position.
pub async fn ws_join(server: &TestServer, address: &str) -> (WsStream, ParticipantId, Vec2) {
    let mut stream = ws_connect(&server.ws_url()).await;
    let id = ws_welcome(&mut stream).await;
    ws_send(
        &mut stream,
        &ClientMessage::Identify {
            address: address.to_string(),
            signature: "sig".to_string(),
            name: Some(address.to_string()),
            version: PROTOCOL_VERSION,
        },
    )
    .await;
    ws_expect(&mut stream, |m| matches!(m, ServerMessage::Identified { .. })).await;
    ws_send(&mut stream, &ClientMessage::JoinRoom).await;
    match ws_expect(&mut stream, |m| matches!(m, ServerMessage::Joined { .. })).await {
        ServerMessage::Joined { position, .. } => (stream, id, position),
        _ => unreachable!(),
    }
}

/// POST a JSON body to an admin route with the test token.
pub async fn admin_post(
    server: &TestServer,
    path: &str,
    body: serde_json::Value,
) -> reqwest::Response {
    reqwest::Client::new()
        .post(format!("{}/admin/{path}", server.base_url()))
        .bearer_auth(ADMIN_TOKEN)
        .json(&body)
        .send()
        .await
        .unwrap()
}
