use std::{collections::HashMap, sync::Arc};

use shared::{
    Attachment, Conversation, ConversationId, Message, MessageId, SendMessageRequest, ServerEvent,
    UserId,
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    attachments::{self, PendingAttachment},
    channel::SignalingChannel,
    error::{SendError, TransportError},
    rest::ApiClient,
    timeline::{self, TimelineItem},
    ClientEvent,
};

/// Composer state owned by the engine. Restored exactly when a send fails.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Draft {
    pub text: String,
    pub attachments: Vec<PendingAttachment>,
}

impl Draft {
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty() && self.attachments.is_empty()
    }
}

struct SyncState {
    conversation_id: Option<ConversationId>,
    messages: Vec<Message>,
    has_more: bool,
    loading_older: bool,
    draft: Draft,
    closed: bool,
}

/// The ordered, id-deduplicated message set for one conversation, kept in
/// step between REST pagination and realtime pushes. A conversation id may
/// be unknown at first; the first successful exchange with the counterpart
/// adopts the server-assigned id as the engine's scope.
pub struct ConversationSync {
    api: Arc<ApiClient>,
    channel: Arc<SignalingChannel>,
    events: broadcast::Sender<ClientEvent>,
    counterpart: UserId,
    page_size: u32,
    state: Mutex<SyncState>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

/// Union by id (last write wins), re-sorted ascending by creation time.
/// Pure and idempotent: merging the same batch twice changes nothing.
pub fn merge(existing: &[Message], incoming: &[Message]) -> Vec<Message> {
    let mut by_id: HashMap<MessageId, Message> = existing
        .iter()
        .cloned()
        .map(|message| (message.id.clone(), message))
        .collect();
    for message in incoming {
        by_id.insert(message.id.clone(), message.clone());
    }
    let mut merged: Vec<Message> = by_id.into_values().collect();
    merged.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
    merged
}

impl ConversationSync {
    pub(crate) async fn open(
        api: Arc<ApiClient>,
        channel: Arc<SignalingChannel>,
        events: broadcast::Sender<ClientEvent>,
        counterpart: UserId,
        conversation_id: Option<ConversationId>,
        page_size: u32,
    ) -> Arc<Self> {
        let sync = Arc::new(Self {
            api,
            channel,
            events,
            counterpart,
            page_size,
            state: Mutex::new(SyncState {
                conversation_id,
                messages: Vec::new(),
                has_more: false,
                loading_older: false,
                draft: Draft::default(),
                closed: false,
            }),
            pump: Mutex::new(None),
        });
        let pump = sync.clone().run_pump();
        *sync.pump.lock().await = Some(pump);
        sync
    }

    pub async fn conversation_id(&self) -> Option<ConversationId> {
        self.state.lock().await.conversation_id.clone()
    }

    pub async fn messages(&self) -> Vec<Message> {
        self.state.lock().await.messages.clone()
    }

    pub async fn timeline(&self) -> Vec<TimelineItem> {
        timeline::project(&self.state.lock().await.messages)
    }

    pub async fn has_more(&self) -> bool {
        self.state.lock().await.has_more
    }

    pub async fn draft(&self) -> Draft {
        self.state.lock().await.draft.clone()
    }

    pub async fn set_draft_text(&self, text: impl Into<String>) {
        let mut state = self.state.lock().await;
        if state.closed {
            return;
        }
        state.draft.text = text.into();
    }

    /// Queues an attachment unless an identical one (same uri, name, size)
    /// is already pending.
    pub async fn add_attachment(&self, pending: PendingAttachment) -> bool {
        let mut state = self.state.lock().await;
        if state.closed || state.draft.attachments.iter().any(|a| a.matches(&pending)) {
            return false;
        }
        state.draft.attachments.push(pending);
        true
    }

    pub async fn remove_attachment(&self, pending: &PendingAttachment) {
        let mut state = self.state.lock().await;
        state.draft.attachments.retain(|a| !a.matches(pending));
    }

    /// Fetches the newest page. No-op until a conversation id is known.
    pub async fn load_initial(&self) -> Result<(), crate::error::RestError> {
        let conversation_id = {
            let state = self.state.lock().await;
            if state.closed {
                return Ok(());
            }
            match &state.conversation_id {
                Some(id) => id.clone(),
                None => return Ok(()),
            }
        };

        let page = self
            .api
            .messages(&conversation_id, self.page_size, None)
            .await?;

        {
            let mut state = self.state.lock().await;
            if state.closed {
                return Ok(());
            }
            state.has_more = page.len() as u32 == self.page_size;
            // Merge, never overwrite: a push that landed mid-fetch survives.
            let merged = merge(&state.messages, &page);
            state.messages = merged;
        }
        self.notify_changed().await;
        Ok(())
    }

    /// Fetches the page strictly before the oldest loaded message. Coalesced:
    /// while one request is in flight, or when history is exhausted or the
    /// list is empty, this is a no-op. A fetch failure leaves state untouched.
    pub async fn load_older(&self) -> Result<(), crate::error::RestError> {
        let (conversation_id, before) = {
            let mut state = self.state.lock().await;
            if state.closed || state.loading_older || !state.has_more || state.messages.is_empty() {
                return Ok(());
            }
            let conversation_id = match &state.conversation_id {
                Some(id) => id.clone(),
                None => return Ok(()),
            };
            state.loading_older = true;
            (conversation_id, state.messages[0].created_at)
        };

        let fetched = self
            .api
            .messages(&conversation_id, self.page_size, Some(before))
            .await;

        let mut state = self.state.lock().await;
        state.loading_older = false;
        if state.closed {
            return Ok(());
        }
        let page = fetched?;
        state.has_more = page.len() as u32 == self.page_size;
        let merged = merge(&state.messages, &page);
        state.messages = merged;
        drop(state);
        self.notify_changed().await;
        Ok(())
    }

    /// Uploads every pending attachment, then dispatches the batch in
    /// submission order: the text (with the first attachment, if any) rides
    /// the first message, each further attachment its own message. Any
    /// failure restores the unsent remainder of the draft.
    pub async fn send_draft(&self) -> Result<(), SendError> {
        let draft = {
            let mut state = self.state.lock().await;
            if state.closed {
                return Ok(());
            }
            if state.draft.is_empty() {
                return Err(SendError::EmptyDraft);
            }
            std::mem::take(&mut state.draft)
        };

        let mut uploaded = Vec::with_capacity(draft.attachments.len());
        for pending in &draft.attachments {
            match attachments::upload(&self.api, pending).await {
                Ok(attachment) => uploaded.push(attachment),
                Err(err) => {
                    warn!("sync: attachment upload failed: {err}");
                    self.restore_draft(draft).await;
                    return Err(SendError::Upload(err));
                }
            }
        }

        let trimmed = draft.text.trim();
        let mut attachments_iter = uploaded.into_iter();
        let mut outgoing: Vec<(Option<String>, Option<Attachment>)> = vec![(
            (!trimmed.is_empty()).then(|| trimmed.to_owned()),
            attachments_iter.next(),
        )];
        outgoing.extend(attachments_iter.map(|attachment| (None, Some(attachment))));

        for (index, (text, attachment)) in outgoing.into_iter().enumerate() {
            if let Err(err) = self.dispatch(text, attachment).await {
                let restored = Draft {
                    text: if index == 0 {
                        draft.text.clone()
                    } else {
                        String::new()
                    },
                    attachments: draft
                        .attachments
                        .get(index..)
                        .map(<[PendingAttachment]>::to_vec)
                        .unwrap_or_default(),
                };
                self.restore_draft(restored).await;
                return Err(err);
            }
        }
        Ok(())
    }

    async fn dispatch(
        &self,
        text: Option<String>,
        attachment: Option<Attachment>,
    ) -> Result<(), SendError> {
        let conversation_id = self.state.lock().await.conversation_id.clone();
        let request = SendMessageRequest {
            conversation_id: conversation_id.clone(),
            recipient_id: conversation_id
                .is_none()
                .then(|| self.counterpart.clone()),
            client_ref: Uuid::new_v4().to_string(),
            text,
            attachment,
        };

        if self.channel.is_connected() {
            match self.channel.emit_with_ack(request.clone()).await {
                Ok(ack) => {
                    // The echoed message lands directly; no refetch needed.
                    self.accept_sent(ack.message, ack.conversation).await;
                    return Ok(());
                }
                Err(err @ TransportError::Rejected(_)) => return Err(SendError::Transport(err)),
                Err(err) => {
                    debug!("sync: realtime send failed ({err}); falling back to rest");
                }
            }
        }

        let sent = self.api.send_message(&request).await?;
        self.accept_sent(Some(sent.message), Some(sent.conversation))
            .await;
        Ok(())
    }

    async fn accept_sent(&self, message: Option<Message>, conversation: Option<Conversation>) {
        {
            let mut state = self.state.lock().await;
            if state.closed {
                return;
            }
            if state.conversation_id.is_none() {
                let adopted = message
                    .as_ref()
                    .map(|m| m.conversation_id.clone())
                    .or_else(|| conversation.map(|c| c.id));
                if let Some(id) = adopted {
                    info!("sync: adopted conversation {id}");
                    state.conversation_id = Some(id);
                }
            }
            if let Some(message) = message {
                let merged = merge(&state.messages, std::slice::from_ref(&message));
                state.messages = merged;
            }
        }
        self.notify_changed().await;
    }

    async fn restore_draft(&self, draft: Draft) {
        let mut state = self.state.lock().await;
        if state.closed {
            return;
        }
        state.draft = draft;
    }

    fn run_pump(self: Arc<Self>) -> JoinHandle<()> {
        let mut events = self.channel.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ServerEvent::MessageNew {
                        conversation,
                        message,
                    }) => self.apply_inbound(conversation, message).await,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("sync: event stream lagged by {skipped}");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    async fn apply_inbound(&self, conversation: Conversation, message: Message) {
        {
            let mut state = self.state.lock().await;
            if state.closed {
                return;
            }
            match &state.conversation_id {
                Some(id) if *id == message.conversation_id => {}
                Some(_) => return,
                None => {
                    let involves_counterpart = message.sender == self.counterpart
                        || conversation.participants.contains(&self.counterpart);
                    if !involves_counterpart {
                        return;
                    }
                    info!(
                        "sync: adopted conversation {} from inbound push",
                        message.conversation_id
                    );
                    state.conversation_id = Some(message.conversation_id.clone());
                }
            }
            let merged = merge(&state.messages, std::slice::from_ref(&message));
            state.messages = merged;
        }
        self.notify_changed().await;
    }

    async fn notify_changed(&self) {
        let conversation_id = self.state.lock().await.conversation_id.clone();
        let _ = self
            .events
            .send(ClientEvent::ConversationChanged { conversation_id });
    }

    /// Idempotent teardown: stops the pump and marks the engine closed so
    /// any late async result is discarded instead of applied.
    pub async fn close(&self) {
        if let Some(task) = self.pump.lock().await.take() {
            task.abort();
        }
        self.state.lock().await.closed = true;
    }
}

#[cfg(test)]
#[path = "tests/sync_tests.rs"]
mod tests;
