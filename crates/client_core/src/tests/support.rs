//! In-process fake server shared by the engine tests: one axum router
//! serving both the REST surface and the `/ws` push channel on one port.

use std::{future::Future, sync::Arc, time::Duration};

use axum::{
    extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
    routing::get,
    Router,
};
use serde_json::{json, Value};
use tokio::{
    net::TcpListener,
    sync::{mpsc, Mutex, Notify},
};

use crate::ClientConfig;

/// Inspects each frame the client sent and optionally produces a reply
/// frame the socket writes straight back.
pub type ReplyFn = Arc<dyn Fn(&Value) -> Option<Value> + Send + Sync>;

pub fn no_reply() -> ReplyFn {
    Arc::new(|_| None)
}

#[derive(Clone)]
struct WsState {
    frames: Arc<Mutex<Vec<Value>>>,
    push: Arc<Mutex<Option<mpsc::UnboundedReceiver<String>>>>,
    kick: Arc<Notify>,
    reply: ReplyFn,
}

pub struct TestServer {
    pub url: String,
    frames: Arc<Mutex<Vec<Value>>>,
    push: mpsc::UnboundedSender<String>,
    kick: Arc<Notify>,
}

impl TestServer {
    /// Pushes a server-initiated event frame down the socket.
    pub fn push_event(&self, event: Value) {
        let _ = self.push.send(event.to_string());
    }

    /// Closes the current socket server-side, simulating connection loss.
    pub fn drop_socket(&self) {
        self.kick.notify_one();
    }

    /// Every frame the client has written to the socket, in order.
    pub async fn sent_frames(&self) -> Vec<Value> {
        self.frames.lock().await.clone()
    }
}

/// Binds an ephemeral port serving the given REST routes plus `/ws`.
pub async fn spawn_server(rest: Router, reply: ReplyFn) -> TestServer {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");

    let frames = Arc::new(Mutex::new(Vec::new()));
    let (push_tx, push_rx) = mpsc::unbounded_channel();
    let kick = Arc::new(Notify::new());
    let state = WsState {
        frames: Arc::clone(&frames),
        push: Arc::new(Mutex::new(Some(push_rx))),
        kick: Arc::clone(&kick),
        reply,
    };
    let app = rest.route(
        "/ws",
        get(move |upgrade: WebSocketUpgrade| {
            let state = state.clone();
            async move { upgrade.on_upgrade(move |socket| serve_socket(socket, state)) }
        }),
    );
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    TestServer {
        url: format!("http://{addr}"),
        frames,
        push: push_tx,
        kick,
    }
}

async fn serve_socket(mut socket: WebSocket, state: WsState) {
    // The first connection owns the push stream; a reconnect only records.
    let mut push = state.push.lock().await.take();
    loop {
        tokio::select! {
            _ = state.kick.notified() => return,
            pushed = recv_push(&mut push) => match pushed {
                Some(text) => {
                    if socket.send(WsMessage::Text(text)).await.is_err() {
                        return;
                    }
                }
                None => return,
            },
            inbound = socket.recv() => match inbound {
                Some(Ok(WsMessage::Text(text))) => {
                    let Ok(value) = serde_json::from_str::<Value>(&text) else {
                        continue;
                    };
                    let reply = (state.reply)(&value);
                    state.frames.lock().await.push(value);
                    if let Some(reply) = reply {
                        if socket.send(WsMessage::Text(reply.to_string())).await.is_err() {
                            return;
                        }
                    }
                }
                Some(Ok(_)) => {}
                _ => return,
            },
        }
    }
}

async fn recv_push(push: &mut Option<mpsc::UnboundedReceiver<String>>) -> Option<String> {
    match push {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Client settings tightened for tests: short ack timeout, fast reconnects.
pub fn test_config(url: &str) -> ClientConfig {
    let mut config = ClientConfig::new(url, "test-token", "alice");
    config.ack_timeout = Duration::from_millis(300);
    config.reconnect_base = Duration::from_millis(50);
    config.reconnect_cap = Duration::from_millis(200);
    config
}

/// Polls the condition until it holds or two seconds elapse.
pub async fn wait_until<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..100 {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

pub fn message_json(
    id: &str,
    conversation_id: &str,
    sender: &str,
    text: &str,
    created_at: &str,
) -> Value {
    json!({
        "id": id,
        "conversationId": conversation_id,
        "sender": sender,
        "text": text,
        "createdAt": created_at,
    })
}

pub fn conversation_json(id: &str, participants: &[&str]) -> Value {
    json!({ "id": id, "participants": participants })
}

pub fn message_new_frame(conversation: Value, message: Value) -> Value {
    json!({
        "event": "message:new",
        "data": { "conversation": conversation, "message": message },
    })
}
