use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use rand::Rng;
use shared::{ClientFrame, ClientRequest, SendAck, SendMessageRequest, ServerEvent, ServerFrame};
use tokio::{
    net::TcpStream,
    sync::{broadcast, mpsc, oneshot, watch, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::{error::TransportError, ClientConfig};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const RECONNECT_JITTER_MS: u64 = 250;

/// One push-channel connection per authenticated session. The handle is
/// explicitly multi-consumer: every subscriber gets its own event receiver
/// and demultiplexes by event variant plus embedded ids.
pub struct SignalingChannel {
    shared: Arc<ChannelShared>,
    outbound: mpsc::Sender<ClientFrame>,
    next_ack: AtomicU64,
    ack_timeout: Duration,
    io_task: Mutex<Option<JoinHandle<()>>>,
}

struct ChannelShared {
    events: broadcast::Sender<ServerEvent>,
    connected: watch::Sender<bool>,
    pending: Mutex<HashMap<u64, oneshot::Sender<SendAck>>>,
}

enum PumpExit {
    Socket(String),
    HandleDropped,
}

impl SignalingChannel {
    /// Dials the push channel. The initial dial must succeed; afterwards
    /// reconnects are automatic and surface only through the connected flag.
    pub async fn connect(config: &ClientConfig) -> Result<Arc<Self>, TransportError> {
        let ws_url = ws_endpoint(&config.server_url, &config.auth_token)?;
        let (stream, _) = connect_async(&ws_url).await.map_err(|err| {
            warn!("channel: initial dial failed: {err}");
            TransportError::NotConnected
        })?;
        info!("channel: connected");

        let (events, _) = broadcast::channel(256);
        let (connected, _) = watch::channel(true);
        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        let shared = Arc::new(ChannelShared {
            events,
            connected,
            pending: Mutex::new(HashMap::new()),
        });
        let channel = Arc::new(Self {
            shared: Arc::clone(&shared),
            outbound: outbound_tx,
            next_ack: AtomicU64::new(0),
            ack_timeout: config.ack_timeout,
            io_task: Mutex::new(None),
        });

        let task = tokio::spawn(io_loop(
            shared,
            stream,
            outbound_rx,
            ws_url,
            config.reconnect_base,
            config.reconnect_cap,
        ));
        *channel.io_task.lock().await = Some(task);

        Ok(channel)
    }

    pub fn is_connected(&self) -> bool {
        *self.shared.connected.borrow()
    }

    pub fn watch_connected(&self) -> watch::Receiver<bool> {
        self.shared.connected.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.shared.events.subscribe()
    }

    /// Fire-and-forget emit. Fast-fails while disconnected; socket-level
    /// write failures surface only as the connected flag flipping.
    pub async fn emit(&self, request: ClientRequest) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.outbound
            .send(ClientFrame::event(request))
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Acknowledged send. Resolves to the positive ack payload; a negative
    /// ack becomes `Rejected`, silence becomes `AckTimeout`.
    pub async fn emit_with_ack(
        &self,
        request: SendMessageRequest,
    ) -> Result<SendAck, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }

        let ack = self.next_ack.fetch_add(1, Ordering::Relaxed) + 1;
        let (waiter_tx, waiter_rx) = oneshot::channel();
        self.shared.pending.lock().await.insert(ack, waiter_tx);

        let frame = ClientFrame::with_ack(ack, ClientRequest::Send(request));
        if self.outbound.send(frame).await.is_err() {
            self.shared.pending.lock().await.remove(&ack);
            return Err(TransportError::Closed);
        }

        let reply = match tokio::time::timeout(self.ack_timeout, waiter_rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(TransportError::Closed),
            Err(_) => {
                self.shared.pending.lock().await.remove(&ack);
                return Err(TransportError::AckTimeout);
            }
        };

        if reply.ok {
            Ok(reply)
        } else {
            let message = reply
                .error
                .map(|err| err.message)
                .unwrap_or_else(|| "send rejected".to_owned());
            Err(TransportError::Rejected(message))
        }
    }

    /// Idempotent teardown: stops the io task, flips the connected flag,
    /// and fails every pending ack.
    pub async fn close(&self) {
        if let Some(task) = self.io_task.lock().await.take() {
            task.abort();
            info!("channel: closed");
        }
        // send_replace updates the value even with no receivers around.
        self.shared.connected.send_replace(false);
        fail_pending(&self.shared).await;
    }
}

fn ws_endpoint(server_url: &str, token: &str) -> Result<String, TransportError> {
    let base = if let Some(rest) = server_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = server_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        warn!("channel: server url must start with http:// or https://");
        return Err(TransportError::NotConnected);
    };
    Ok(format!("{}/ws?token={token}", base.trim_end_matches('/')))
}

async fn io_loop(
    shared: Arc<ChannelShared>,
    mut stream: WsStream,
    mut outbound: mpsc::Receiver<ClientFrame>,
    ws_url: String,
    reconnect_base: Duration,
    reconnect_cap: Duration,
) {
    loop {
        let exit = pump_socket(&shared, stream, &mut outbound).await;
        shared.connected.send_replace(false);
        fail_pending(&shared).await;

        match exit {
            PumpExit::HandleDropped => {
                debug!("channel: handle dropped; stopping io task");
                return;
            }
            PumpExit::Socket(reason) => info!("channel: disconnected ({reason}); reconnecting"),
        }

        let mut delay = reconnect_base;
        stream = loop {
            let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=RECONNECT_JITTER_MS));
            tokio::time::sleep(delay + jitter).await;
            match connect_async(&ws_url).await {
                Ok((stream, _)) => break stream,
                Err(err) => {
                    debug!("channel: reconnect attempt failed: {err}");
                    delay = (delay * 2).min(reconnect_cap);
                }
            }
        };
        shared.connected.send_replace(true);
        info!("channel: reconnected");
    }
}

async fn pump_socket(
    shared: &ChannelShared,
    stream: WsStream,
    outbound: &mut mpsc::Receiver<ClientFrame>,
) -> PumpExit {
    let (mut sink, mut reader) = stream.split();
    loop {
        tokio::select! {
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    let text = match serde_json::to_string(&frame) {
                        Ok(text) => text,
                        Err(err) => {
                            warn!("channel: could not encode outbound frame: {err}");
                            continue;
                        }
                    };
                    if let Err(err) = sink.send(Message::Text(text)).await {
                        return PumpExit::Socket(format!("write failed: {err}"));
                    }
                }
                None => return PumpExit::HandleDropped,
            },
            inbound = reader.next() => match inbound {
                Some(Ok(Message::Text(text))) => dispatch(shared, &text).await,
                Some(Ok(Message::Close(_))) => return PumpExit::Socket("server closed".into()),
                Some(Ok(_)) => {}
                Some(Err(err)) => return PumpExit::Socket(format!("read failed: {err}")),
                None => return PumpExit::Socket("stream ended".into()),
            },
        }
    }
}

/// Strict decode step: frames that fail to parse are dropped here and never
/// reach a state machine.
async fn dispatch(shared: &ChannelShared, text: &str) {
    match serde_json::from_str::<ServerFrame>(text) {
        Ok(frame) => {
            if let (Some(ack), ServerEvent::SendAck(reply)) = (frame.ack, &frame.event) {
                if let Some(waiter) = shared.pending.lock().await.remove(&ack) {
                    let _ = waiter.send(reply.clone());
                } else {
                    debug!("channel: ack {ack} arrived with no waiter");
                }
                return;
            }
            let _ = shared.events.send(frame.event);
        }
        Err(err) => warn!("channel: dropping undecodable frame: {err}"),
    }
}

async fn fail_pending(shared: &ChannelShared) {
    // Dropping the senders wakes every waiter with a closed error.
    shared.pending.lock().await.clear();
}

#[cfg(test)]
#[path = "tests/channel_tests.rs"]
mod tests;
