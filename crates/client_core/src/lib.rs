//! Client-side engine for realtime messaging and calls: one push channel,
//! a REST collaborator, per-conversation sync engines, and the call stack.
//! Everything here is UI-free; frontends subscribe to [`ClientEvent`] and
//! query state through the handles this crate hands out.

use std::{sync::Arc, time::Duration};

use media::{MediaError, MediaSource, PeerConfig, PeerConnection, PeerConnector};
use shared::{CallId, Contact, Conversation, ConversationId, UserId};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::info;

pub mod attachments;
pub mod call;
pub mod channel;
pub mod directory;
pub mod error;
pub mod rest;
pub mod sync;
pub mod timeline;

pub use attachments::PendingAttachment;
pub use call::{CallDirection, CallManager, CallPhase, CallSession};
pub use channel::SignalingChannel;
pub use directory::{CallDecision, CallDirectory};
pub use error::{CallError, RestError, SendError, TransportError, UploadError};
pub use rest::ApiClient;
pub use sync::{merge, ConversationSync, Draft};
pub use timeline::TimelineItem;

/// Connection settings for one authenticated session. One `server_url`
/// serves both the REST surface and the push channel.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_url: String,
    pub auth_token: String,
    pub user_id: UserId,
    pub page_size: u32,
    pub ack_timeout: Duration,
    pub reconnect_base: Duration,
    pub reconnect_cap: Duration,
}

impl ClientConfig {
    pub fn new(
        server_url: impl Into<String>,
        auth_token: impl Into<String>,
        user_id: impl Into<UserId>,
    ) -> Self {
        Self {
            server_url: server_url.into(),
            auth_token: auth_token.into(),
            user_id: user_id.into(),
            page_size: 50,
            ack_timeout: Duration::from_secs(10),
            reconnect_base: Duration::from_millis(500),
            reconnect_cap: Duration::from_secs(30),
        }
    }
}

/// Fan-out notifications for frontends. Coarse by design; consumers re-query
/// the relevant handle rather than diffing event payloads.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    ChannelState { connected: bool },
    ConversationChanged { conversation_id: Option<ConversationId> },
    IncomingCall(shared::IncomingCall),
    CallPhaseChanged { call_id: CallId, phase: CallPhase },
    CallPeerAccepted { call_id: CallId },
    CallLogUpdated,
    Error(String),
}

/// The assembled client. Owns the channel, the REST collaborator, the call
/// stack, and every open conversation engine; `close` tears all of it down.
pub struct RealtimeClient {
    config: ClientConfig,
    api: Arc<ApiClient>,
    channel: Arc<SignalingChannel>,
    calls: Arc<CallManager>,
    directory: Arc<CallDirectory>,
    events: broadcast::Sender<ClientEvent>,
    conversations: Mutex<Vec<Arc<ConversationSync>>>,
    state_task: Mutex<Option<JoinHandle<()>>>,
}

impl RealtimeClient {
    /// Connects the push channel (must succeed) and assembles the engine
    /// around it. Media collaborators may be the `Missing*` placeholders on
    /// installs without call support.
    pub async fn connect(
        config: ClientConfig,
        media: Arc<dyn MediaSource>,
        connector: Arc<dyn PeerConnector>,
    ) -> anyhow::Result<Arc<Self>> {
        let api = Arc::new(ApiClient::new(&config.server_url, &config.auth_token)?);
        let channel = SignalingChannel::connect(&config).await?;
        let (events, _) = broadcast::channel(256);

        let calls = CallManager::spawn(
            Arc::clone(&channel),
            Arc::clone(&api),
            media,
            connector,
            config.user_id.clone(),
            events.clone(),
        )
        .await;
        let directory = CallDirectory::spawn(
            Arc::clone(&api),
            Arc::clone(&calls),
            channel.subscribe(),
            events.clone(),
        )
        .await;

        let client = Arc::new(Self {
            config,
            api,
            channel,
            calls,
            directory,
            events,
            conversations: Mutex::new(Vec::new()),
            state_task: Mutex::new(None),
        });
        let task = client.spawn_state_watch();
        *client.state_task.lock().await = Some(task);
        info!("client: connected as {}", client.config.user_id);
        Ok(client)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn api(&self) -> &Arc<ApiClient> {
        &self.api
    }

    pub fn channel(&self) -> &Arc<SignalingChannel> {
        &self.channel
    }

    pub fn calls(&self) -> &Arc<CallManager> {
        &self.calls
    }

    pub fn directory(&self) -> &Arc<CallDirectory> {
        &self.directory
    }

    pub async fn contacts(&self) -> Result<Vec<Contact>, RestError> {
        self.api.contacts().await
    }

    pub async fn conversations(&self) -> Result<Vec<Conversation>, RestError> {
        self.api.conversations().await
    }

    /// Opens (and tracks) a sync engine for a conversation with the given
    /// counterpart. The conversation id may be unknown until the first
    /// exchange.
    pub async fn open_conversation(
        &self,
        counterpart: UserId,
        conversation_id: Option<ConversationId>,
    ) -> Arc<ConversationSync> {
        let sync = ConversationSync::open(
            Arc::clone(&self.api),
            Arc::clone(&self.channel),
            self.events.clone(),
            counterpart,
            conversation_id,
            self.config.page_size,
        )
        .await;
        self.conversations.lock().await.push(Arc::clone(&sync));
        sync
    }

    fn spawn_state_watch(self: &Arc<Self>) -> JoinHandle<()> {
        let events = self.events.clone();
        let mut connected = self.channel.watch_connected();
        tokio::spawn(async move {
            while connected.changed().await.is_ok() {
                let state = *connected.borrow_and_update();
                let _ = events.send(ClientEvent::ChannelState { connected: state });
            }
        })
    }

    /// Full, idempotent teardown: conversations first, then the call stack
    /// (an active call is cancelled), then the channel.
    pub async fn close(&self) {
        let conversations = std::mem::take(&mut *self.conversations.lock().await);
        for sync in conversations {
            sync.close().await;
        }
        self.directory.close().await;
        self.calls.close().await;
        self.channel.close().await;
        if let Some(task) = self.state_task.lock().await.take() {
            task.abort();
        }
        info!("client: closed");
    }
}

/// Placeholder for installs without capture hardware support wired in.
pub struct MissingMediaSource;

#[async_trait::async_trait]
impl MediaSource for MissingMediaSource {
    async fn capture(
        &self,
        _want_video: bool,
    ) -> Result<Vec<Arc<dyn media::LocalTrack>>, MediaError> {
        Err(MediaError::DeviceUnavailable(
            "no media source configured".into(),
        ))
    }
}

/// Placeholder peer connector; any call attempt fails before signaling.
pub struct MissingPeerConnector;

#[async_trait::async_trait]
impl PeerConnector for MissingPeerConnector {
    async fn connect(&self, _config: PeerConfig) -> anyhow::Result<Arc<dyn PeerConnection>> {
        Err(anyhow::anyhow!("no peer connector configured"))
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;
