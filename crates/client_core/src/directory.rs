use std::sync::Arc;

use shared::{CallRecord, IncomingCall, ServerEvent};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{info, warn};

use crate::{call::CallManager, error::CallError, rest::ApiClient, ClientEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallDecision {
    Accept,
    Reject,
}

struct DirectoryState {
    incoming: Option<IncomingCall>,
    log: Vec<CallRecord>,
}

/// Tracks the single pending incoming-call notification and the call log.
/// Acknowledging the notification forwards the decision to the call manager;
/// terminal updates clear it and refresh the log.
pub struct CallDirectory {
    api: Arc<ApiClient>,
    manager: Arc<CallManager>,
    events: broadcast::Sender<ClientEvent>,
    state: Mutex<DirectoryState>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl CallDirectory {
    pub(crate) async fn spawn(
        api: Arc<ApiClient>,
        manager: Arc<CallManager>,
        channel: broadcast::Receiver<ServerEvent>,
        events: broadcast::Sender<ClientEvent>,
    ) -> Arc<Self> {
        let directory = Arc::new(Self {
            api,
            manager,
            events,
            state: Mutex::new(DirectoryState {
                incoming: None,
                log: Vec::new(),
            }),
            pump: Mutex::new(None),
        });
        let pump = Arc::clone(&directory).run_pump(channel);
        *directory.pump.lock().await = Some(pump);
        directory
    }

    pub async fn incoming(&self) -> Option<IncomingCall> {
        self.state.lock().await.incoming.clone()
    }

    pub async fn call_log(&self) -> Vec<CallRecord> {
        self.state.lock().await.log.clone()
    }

    /// Takes the pending notification and forwards the decision. Errors when
    /// no notification is pending, so double-acknowledging is impossible.
    pub async fn acknowledge(&self, decision: CallDecision) -> Result<(), CallError> {
        let incoming = self
            .state
            .lock()
            .await
            .incoming
            .take()
            .ok_or(CallError::NoIncomingCall)?;
        match decision {
            CallDecision::Accept => self.manager.accept(&incoming).await,
            CallDecision::Reject => self.manager.reject(&incoming).await,
        }
    }

    pub async fn refresh_log(&self) {
        match self.api.call_log(None).await {
            Ok(records) => {
                self.state.lock().await.log = records;
                let _ = self.events.send(ClientEvent::CallLogUpdated);
            }
            Err(err) => warn!("directory: call log refresh failed: {err}"),
        }
    }

    async fn record_incoming(&self, incoming: IncomingCall) {
        {
            let mut state = self.state.lock().await;
            match &state.incoming {
                // Re-announcing the same call is idempotent.
                Some(pending) if pending.call_id == incoming.call_id => return,
                Some(pending) => {
                    info!(
                        "directory: {} supersedes pending notification {}",
                        incoming.call_id, pending.call_id
                    );
                }
                None => {}
            }
            state.incoming = Some(incoming.clone());
        }
        let _ = self.events.send(ClientEvent::IncomingCall(incoming));
    }

    async fn clear_if_matching(&self, call_id: &shared::CallId) {
        let mut state = self.state.lock().await;
        if state
            .incoming
            .as_ref()
            .is_some_and(|pending| pending.call_id == *call_id)
        {
            state.incoming = None;
        }
    }

    fn run_pump(self: Arc<Self>, mut channel: broadcast::Receiver<ServerEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match channel.recv().await {
                    Ok(ServerEvent::CallIncoming(incoming)) => {
                        self.record_incoming(incoming).await;
                    }
                    Ok(ServerEvent::CallUpdate(update)) if update.status.is_terminal() => {
                        self.clear_if_matching(&update.call_id).await;
                        self.refresh_log().await;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("directory: event stream lagged by {skipped}");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    pub(crate) async fn close(&self) {
        if let Some(task) = self.pump.lock().await.take() {
            task.abort();
        }
        self.state.lock().await.incoming = None;
    }
}

#[cfg(test)]
#[path = "tests/directory_tests.rs"]
mod tests;
