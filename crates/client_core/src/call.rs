use std::sync::Arc;

use chrono::{DateTime, Utc};
use media::{
    ConnectivityState, IceCandidate, LocalTrack, MediaSource, PeerConfig, PeerConnection,
    PeerConnector, PeerEvent, SessionDescription,
};
use shared::{
    CallId, CallInitiate, CallKind, CallSignal, CallStatus, CallUpdate, ClientRequest,
    ConversationId, E2eeDescriptor, IncomingCall, ServerEvent, SignalBody, SignalType, UserId,
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    channel::SignalingChannel,
    error::CallError,
    rest::{ApiClient, CreateCallRequest},
    ClientEvent,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    Outgoing,
    Incoming,
    Connected,
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

struct CallState {
    phase: CallPhase,
    connected_at: Option<DateTime<Utc>>,
    ended: bool,
    remote_description_set: bool,
    // Candidates that arrived before the remote description; flushed once
    // it lands.
    pending_candidates: Vec<IceCandidate>,
}

/// One call's lifecycle: media, peer connection, and negotiation state.
/// At most one session is live client-side at a time.
pub struct CallSession {
    pub id: CallId,
    pub kind: CallKind,
    pub peer: UserId,
    pub conversation_id: Option<ConversationId>,
    pub direction: CallDirection,
    pub e2ee: E2eeDescriptor,
    pub started_at: DateTime<Utc>,
    state: Mutex<CallState>,
    tracks: Vec<Arc<dyn LocalTrack>>,
    peer_connection: Arc<dyn PeerConnection>,
    peer_pump: Mutex<Option<JoinHandle<()>>>,
}

// Manual impl: the track and peer-connection fields are trait objects.
impl std::fmt::Debug for CallSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSession")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("peer", &self.peer)
            .field("direction", &self.direction)
            .field("started_at", &self.started_at)
            .finish_non_exhaustive()
    }
}

impl CallSession {
    #[allow(clippy::too_many_arguments)]
    fn new(
        id: CallId,
        kind: CallKind,
        peer: UserId,
        conversation_id: Option<ConversationId>,
        direction: CallDirection,
        e2ee: E2eeDescriptor,
        started_at: DateTime<Utc>,
        tracks: Vec<Arc<dyn LocalTrack>>,
        peer_connection: Arc<dyn PeerConnection>,
    ) -> Self {
        let phase = match direction {
            CallDirection::Outgoing => CallPhase::Outgoing,
            CallDirection::Incoming => CallPhase::Incoming,
        };
        Self {
            id,
            kind,
            peer,
            conversation_id,
            direction,
            e2ee,
            started_at,
            state: Mutex::new(CallState {
                phase,
                connected_at: None,
                ended: false,
                remote_description_set: false,
                pending_candidates: Vec::new(),
            }),
            tracks,
            peer_connection,
            peer_pump: Mutex::new(None),
        }
    }

    pub async fn phase(&self) -> CallPhase {
        self.state.lock().await.phase
    }

    pub async fn connected_at(&self) -> Option<DateTime<Utc>> {
        self.state.lock().await.connected_at
    }

    pub async fn is_ended(&self) -> bool {
        self.state.lock().await.ended
    }

    async fn install_remote(&self, description: SessionDescription) -> anyhow::Result<()> {
        self.peer_connection
            .set_remote_description(description)
            .await?;
        let buffered = {
            let mut state = self.state.lock().await;
            state.remote_description_set = true;
            std::mem::take(&mut state.pending_candidates)
        };
        for candidate in buffered {
            if let Err(err) = self.peer_connection.add_ice_candidate(candidate).await {
                debug!("call: buffered candidate rejected: {err}");
            }
        }
        Ok(())
    }

    async fn add_candidate(&self, candidate: IceCandidate) {
        {
            let mut state = self.state.lock().await;
            if state.ended {
                return;
            }
            if !state.remote_description_set {
                state.pending_candidates.push(candidate);
                return;
            }
        }
        if let Err(err) = self.peer_connection.add_ice_candidate(candidate).await {
            debug!("call: candidate rejected: {err}");
        }
    }

    async fn create_answer(&self) -> anyhow::Result<SessionDescription> {
        let answer = self.peer_connection.create_answer().await?;
        self.peer_connection
            .set_local_description(answer.clone())
            .await?;
        Ok(answer)
    }

    async fn release(&self) {
        if let Some(task) = self.peer_pump.lock().await.take() {
            task.abort();
        }
        for track in &self.tracks {
            track.stop();
        }
        if let Err(err) = self.peer_connection.close().await {
            debug!("call: peer connection close reported {err}");
        }
    }
}

/// Owns the active session and routes inbound `call:signal`/`call:update`
/// events to it. Incoming offers with no active session establish one.
pub struct CallManager {
    channel: Arc<SignalingChannel>,
    api: Arc<ApiClient>,
    media: Arc<dyn MediaSource>,
    connector: Arc<dyn PeerConnector>,
    own_user: UserId,
    events: broadcast::Sender<ClientEvent>,
    active: Mutex<Option<Arc<CallSession>>>,
    // Caller descriptor from the latest call:incoming announcement, claimed
    // by the matching offer.
    announced_e2ee: Mutex<Option<(CallId, E2eeDescriptor)>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl CallManager {
    pub(crate) async fn spawn(
        channel: Arc<SignalingChannel>,
        api: Arc<ApiClient>,
        media: Arc<dyn MediaSource>,
        connector: Arc<dyn PeerConnector>,
        own_user: UserId,
        events: broadcast::Sender<ClientEvent>,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            channel,
            api,
            media,
            connector,
            own_user,
            events,
            active: Mutex::new(None),
            announced_e2ee: Mutex::new(None),
            pump: Mutex::new(None),
        });
        let pump = Arc::clone(&manager).run_pump();
        *manager.pump.lock().await = Some(pump);
        manager
    }

    pub async fn active_session(&self) -> Option<Arc<CallSession>> {
        self.active.lock().await.clone()
    }

    /// Dials the peer: local media first (failure aborts before any
    /// signaling), then the offer, the call record, and the initiate/offer
    /// frames. Rejected while another session is live.
    pub async fn start_outgoing(
        self: &Arc<Self>,
        peer: UserId,
        kind: CallKind,
        conversation_id: Option<ConversationId>,
    ) -> Result<Arc<CallSession>, CallError> {
        {
            let active = self.active.lock().await;
            if let Some(session) = active.as_ref() {
                if !session.is_ended().await {
                    return Err(CallError::AlreadyActive);
                }
            }
        }

        let tracks = self.media.capture(kind == CallKind::Video).await?;
        let peer_connection = match self.connector.connect(PeerConfig::default()).await {
            Ok(connection) => connection,
            Err(err) => {
                stop_tracks(&tracks);
                return Err(CallError::Peer(err));
            }
        };
        let offer = match prepare_offer(&peer_connection, &tracks).await {
            Ok(offer) => offer,
            Err(err) => {
                stop_tracks(&tracks);
                let _ = peer_connection.close().await;
                return Err(CallError::Peer(err));
            }
        };

        let started_at = Utc::now();
        let call_id = match self
            .api
            .create_call(&CreateCallRequest {
                caller: self.own_user.clone(),
                callee: peer.clone(),
                call_type: kind,
                conversation_id: conversation_id.clone(),
                started_at,
            })
            .await
        {
            Ok(record) => record.id,
            Err(err) => {
                warn!("call: record creation failed; proceeding with local id: {err}");
                CallId::local()
            }
        };

        let e2ee = E2eeDescriptor::fresh();
        let session = Arc::new(CallSession::new(
            call_id,
            kind,
            peer,
            conversation_id,
            CallDirection::Outgoing,
            e2ee.clone(),
            started_at,
            tracks,
            peer_connection,
        ));
        *self.active.lock().await = Some(Arc::clone(&session));
        let pump = self.spawn_peer_pump(Arc::clone(&session));
        *session.peer_pump.lock().await = Some(pump);

        let initiate = ClientRequest::CallInitiate(CallInitiate {
            call_id: session.id.clone(),
            conversation_id: session.conversation_id.clone(),
            recipient_id: session.peer.clone(),
            call_type: kind,
            e2ee,
        });
        let offer_signal = ClientRequest::CallSignal(CallSignal {
            call_id: session.id.clone(),
            conversation_id: session.conversation_id.clone(),
            recipient_id: session.peer.clone(),
            sender_id: None,
            signal_type: SignalType::Offer,
            signal: description_body(&offer),
        });
        for request in [initiate, offer_signal] {
            if let Err(err) = self.channel.emit(request).await {
                self.end_session(&session, CallStatus::Failed, false).await;
                return Err(CallError::Transport(err));
            }
        }

        let _ = self.events.send(ClientEvent::CallPhaseChanged {
            call_id: session.id.clone(),
            phase: CallPhase::Outgoing,
        });
        info!("call: outgoing {} to {} started", session.id, session.peer);
        Ok(session)
    }

    /// Tells the caller we picked up and updates the record. The media
    /// session itself was already established by the caller's offer.
    pub async fn accept(&self, incoming: &IncomingCall) -> Result<(), CallError> {
        self.channel
            .emit(ClientRequest::CallUpdate(CallUpdate {
                call_id: incoming.call_id.clone(),
                conversation_id: incoming.conversation_id.clone(),
                recipient_id: incoming.caller.clone(),
                sender_id: None,
                status: CallStatus::Accepted,
                duration_sec: None,
            }))
            .await
            .map_err(CallError::Transport)?;
        self.update_record(&incoming.call_id, CallStatus::Accepted, None)
            .await;
        Ok(())
    }

    pub async fn reject(&self, incoming: &IncomingCall) -> Result<(), CallError> {
        self.channel
            .emit(ClientRequest::CallUpdate(CallUpdate {
                call_id: incoming.call_id.clone(),
                conversation_id: incoming.conversation_id.clone(),
                recipient_id: incoming.caller.clone(),
                sender_id: None,
                status: CallStatus::Rejected,
                duration_sec: None,
            }))
            .await
            .map_err(CallError::Transport)?;
        self.update_record(&incoming.call_id, CallStatus::Rejected, None)
            .await;

        let session = self.active_session().await;
        if let Some(session) = session.filter(|s| s.id == incoming.call_id) {
            self.end_session(&session, CallStatus::Rejected, false).await;
        }
        Ok(())
    }

    pub async fn hang_up(&self) {
        self.end_active(CallStatus::Ended).await;
    }

    pub async fn cancel(&self) {
        self.end_active(CallStatus::Cancelled).await;
    }

    pub async fn end_active(&self, status: CallStatus) {
        let session = self.active_session().await;
        if let Some(session) = session {
            self.end_session(&session, status, true).await;
        }
    }

    /// Idempotent teardown: only the first invocation notifies the peer,
    /// updates the record, and releases media and the peer connection.
    /// Duration is whole seconds since connect, 0 if never connected.
    pub(crate) async fn end_session(
        &self,
        session: &Arc<CallSession>,
        status: CallStatus,
        notify_peer: bool,
    ) {
        let duration_sec = {
            let mut state = session.state.lock().await;
            if state.ended {
                return;
            }
            state.ended = true;
            state.phase = CallPhase::Ended;
            state
                .connected_at
                .map(|at| (Utc::now() - at).num_seconds().max(0) as u64)
                .unwrap_or(0)
        };

        if notify_peer {
            let update = ClientRequest::CallUpdate(CallUpdate {
                call_id: session.id.clone(),
                conversation_id: session.conversation_id.clone(),
                recipient_id: session.peer.clone(),
                sender_id: None,
                status,
                duration_sec: Some(duration_sec),
            });
            if let Err(err) = self.channel.emit(update).await {
                warn!("call: could not notify peer about {status:?}: {err}");
            }
        }

        self.update_record(&session.id, status, Some(duration_sec))
            .await;
        session.release().await;

        {
            let mut active = self.active.lock().await;
            if active.as_ref().is_some_and(|current| current.id == session.id) {
                *active = None;
            }
        }

        let _ = self.events.send(ClientEvent::CallPhaseChanged {
            call_id: session.id.clone(),
            phase: CallPhase::Ended,
        });
        info!(
            "call: {} ended with {status:?} after {duration_sec}s",
            session.id
        );
    }

    pub(crate) async fn close(&self) {
        let session = self.active_session().await;
        if let Some(session) = session {
            self.end_session(&session, CallStatus::Cancelled, true).await;
        }
        if let Some(task) = self.pump.lock().await.take() {
            task.abort();
        }
    }

    /// Best-effort, no-throw: a failed record update never blocks teardown,
    /// and locally synthesized ids never hit the server.
    async fn update_record(&self, call_id: &CallId, status: CallStatus, duration_sec: Option<u64>) {
        if call_id.is_local() {
            debug!("call: skipping record update for local id {call_id}");
            return;
        }
        if let Err(err) = self.api.update_call(call_id, status, duration_sec).await {
            warn!("call: record update failed: {err}");
        }
    }

    fn run_pump(self: Arc<Self>) -> JoinHandle<()> {
        let mut events = self.channel.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ServerEvent::CallSignal(signal)) => self.handle_signal(signal).await,
                    Ok(ServerEvent::CallUpdate(update)) => self.handle_update(update).await,
                    Ok(ServerEvent::CallIncoming(incoming)) => self.note_incoming(incoming).await,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("call: signal stream lagged by {skipped}");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    async fn handle_signal(self: &Arc<Self>, signal: CallSignal) {
        match signal.signal_type {
            SignalType::Offer => self.handle_offer(signal).await,
            SignalType::Answer => self.handle_answer(signal).await,
            SignalType::IceCandidate => self.handle_candidate(signal).await,
        }
    }

    async fn handle_offer(self: &Arc<Self>, signal: CallSignal) {
        let Some(offer) = description_from(&signal.signal) else {
            warn!("call: dropping malformed offer for {}", signal.call_id);
            return;
        };

        if let Some(session) = self.active_session().await {
            if session.id == signal.call_id {
                self.apply_offer(&session, offer).await;
                return;
            }
            if !session.is_ended().await {
                // Busy with a different call.
                info!(
                    "call: rejecting offer for {} while {} is active",
                    signal.call_id, session.id
                );
                if let Some(caller) = signal.sender_id {
                    let busy = ClientRequest::CallUpdate(CallUpdate {
                        call_id: signal.call_id,
                        conversation_id: signal.conversation_id,
                        recipient_id: caller,
                        sender_id: None,
                        status: CallStatus::Rejected,
                        duration_sec: None,
                    });
                    if let Err(err) = self.channel.emit(busy).await {
                        warn!("call: could not send busy rejection: {err}");
                    }
                }
                return;
            }
        }
        self.establish_incoming(signal, offer).await;
    }

    async fn establish_incoming(self: &Arc<Self>, signal: CallSignal, offer: SessionDescription) {
        let Some(caller) = signal.sender_id.clone() else {
            warn!(
                "call: incoming offer for {} carries no sender; dropping",
                signal.call_id
            );
            return;
        };

        let kind = if offer.has_video() {
            CallKind::Video
        } else {
            CallKind::Voice
        };
        let tracks = match self.media.capture(kind == CallKind::Video).await {
            Ok(tracks) => tracks,
            Err(err) => {
                warn!(
                    "call: media acquisition failed for incoming {}: {err}",
                    signal.call_id
                );
                let _ = self
                    .events
                    .send(ClientEvent::Error(format!("call setup failed: {err}")));
                return;
            }
        };
        let peer_connection = match self.connector.connect(PeerConfig::default()).await {
            Ok(connection) => connection,
            Err(err) => {
                stop_tracks(&tracks);
                warn!(
                    "call: peer setup failed for incoming {}: {err}",
                    signal.call_id
                );
                let _ = self
                    .events
                    .send(ClientEvent::Error(format!("call setup failed: {err}")));
                return;
            }
        };
        for track in &tracks {
            if let Err(err) = peer_connection.add_track(Arc::clone(track)).await {
                debug!("call: could not attach local track: {err}");
            }
        }

        // Share the caller's descriptor when it was announced; both ends of
        // one call then carry the same fingerprint.
        let e2ee = {
            let mut announced = self.announced_e2ee.lock().await;
            match announced.take() {
                Some((call_id, descriptor)) if call_id == signal.call_id => descriptor,
                other => {
                    *announced = other;
                    E2eeDescriptor::fresh()
                }
            }
        };

        let session = Arc::new(CallSession::new(
            signal.call_id.clone(),
            kind,
            caller,
            signal.conversation_id.clone(),
            CallDirection::Incoming,
            e2ee,
            Utc::now(),
            tracks,
            peer_connection,
        ));
        *self.active.lock().await = Some(Arc::clone(&session));
        let pump = self.spawn_peer_pump(Arc::clone(&session));
        *session.peer_pump.lock().await = Some(pump);

        let _ = self.events.send(ClientEvent::CallPhaseChanged {
            call_id: session.id.clone(),
            phase: CallPhase::Incoming,
        });
        info!("call: incoming {} from {}", session.id, session.peer);
        self.apply_offer(&session, offer).await;
    }

    async fn apply_offer(&self, session: &Arc<CallSession>, offer: SessionDescription) {
        if let Err(err) = session.install_remote(offer).await {
            warn!("call: could not install remote offer: {err}");
            return;
        }
        let answer = match session.create_answer().await {
            Ok(answer) => answer,
            Err(err) => {
                warn!("call: could not create answer: {err}");
                return;
            }
        };
        let reply = ClientRequest::CallSignal(CallSignal {
            call_id: session.id.clone(),
            conversation_id: session.conversation_id.clone(),
            recipient_id: session.peer.clone(),
            sender_id: None,
            signal_type: SignalType::Answer,
            signal: description_body(&answer),
        });
        if let Err(err) = self.channel.emit(reply).await {
            warn!("call: could not send answer: {err}");
            return;
        }
        self.mark_connected(session).await;
    }

    async fn handle_answer(&self, signal: CallSignal) {
        let session = self.active_session().await;
        let Some(session) = session.filter(|s| s.id == signal.call_id) else {
            debug!("call: answer for unknown call {}", signal.call_id);
            return;
        };
        let Some(answer) = description_from(&signal.signal) else {
            warn!("call: dropping malformed answer for {}", signal.call_id);
            return;
        };
        if let Err(err) = session.install_remote(answer).await {
            warn!("call: could not install remote answer: {err}");
            return;
        }
        self.mark_connected(&session).await;
    }

    /// Malformed or out-of-scope candidates are swallowed, never fatal, and
    /// never change the session phase.
    async fn handle_candidate(&self, signal: CallSignal) {
        let session = self.active_session().await;
        let Some(session) = session.filter(|s| s.id == signal.call_id) else {
            debug!("call: ice candidate for unknown call {}", signal.call_id);
            return;
        };
        let Some(candidate) = candidate_from(&signal.signal) else {
            debug!("call: dropping malformed ice candidate for {}", signal.call_id);
            return;
        };
        session.add_candidate(candidate).await;
    }

    async fn note_incoming(&self, incoming: IncomingCall) {
        if let Some(e2ee) = incoming.e2ee {
            *self.announced_e2ee.lock().await = Some((incoming.call_id, e2ee));
        }
    }

    async fn handle_update(&self, update: CallUpdate) {
        let session = self.active_session().await;
        let Some(session) = session.filter(|s| s.id == update.call_id) else {
            return;
        };
        match update.status {
            CallStatus::Accepted => {
                let _ = self.events.send(ClientEvent::CallPeerAccepted {
                    call_id: session.id.clone(),
                });
            }
            status => {
                info!("call: {} ended remotely ({status:?})", session.id);
                self.end_session(&session, status, false).await;
            }
        }
    }

    /// Sets `connected_at` exactly once; repeated triggers from signaling
    /// and connectivity events never reset the timer.
    async fn mark_connected(&self, session: &Arc<CallSession>) {
        let newly_connected = {
            let mut state = session.state.lock().await;
            if state.ended || state.connected_at.is_some() {
                false
            } else {
                state.connected_at = Some(Utc::now());
                state.phase = CallPhase::Connected;
                true
            }
        };
        if newly_connected {
            info!("call: {} connected", session.id);
            let _ = self.events.send(ClientEvent::CallPhaseChanged {
                call_id: session.id.clone(),
                phase: CallPhase::Connected,
            });
        }
    }

    fn spawn_peer_pump(self: &Arc<Self>, session: Arc<CallSession>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let mut events = session.peer_connection.subscribe_events();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                match event {
                    PeerEvent::Connectivity(
                        ConnectivityState::Connected | ConnectivityState::Completed,
                    ) => manager.mark_connected(&session).await,
                    PeerEvent::Connectivity(
                        ConnectivityState::Failed
                        | ConnectivityState::Disconnected
                        | ConnectivityState::Closed,
                    ) => {
                        if !session.is_ended().await {
                            manager
                                .end_session(&session, CallStatus::Failed, true)
                                .await;
                        }
                    }
                    PeerEvent::Connectivity(_) => {}
                    PeerEvent::IceCandidate(candidate) => {
                        let request = ClientRequest::CallSignal(CallSignal {
                            call_id: session.id.clone(),
                            conversation_id: session.conversation_id.clone(),
                            recipient_id: session.peer.clone(),
                            sender_id: None,
                            signal_type: SignalType::IceCandidate,
                            signal: candidate_body(&candidate),
                        });
                        if let Err(err) = manager.channel.emit(request).await {
                            debug!("call: could not relay local candidate: {err}");
                        }
                    }
                }
            }
        })
    }
}

async fn prepare_offer(
    peer_connection: &Arc<dyn PeerConnection>,
    tracks: &[Arc<dyn LocalTrack>],
) -> anyhow::Result<SessionDescription> {
    for track in tracks {
        peer_connection.add_track(Arc::clone(track)).await?;
    }
    let offer = peer_connection.create_offer().await?;
    peer_connection.set_local_description(offer.clone()).await?;
    Ok(offer)
}

fn stop_tracks(tracks: &[Arc<dyn LocalTrack>]) {
    for track in tracks {
        track.stop();
    }
}

fn description_body(description: &SessionDescription) -> SignalBody {
    SignalBody::Description {
        kind: description.kind,
        sdp: description.sdp.clone(),
    }
}

fn description_from(body: &SignalBody) -> Option<SessionDescription> {
    match body {
        SignalBody::Description { kind, sdp } => Some(SessionDescription {
            kind: *kind,
            sdp: sdp.clone(),
        }),
        _ => None,
    }
}

fn candidate_body(candidate: &IceCandidate) -> SignalBody {
    SignalBody::Candidate {
        candidate: candidate.candidate.clone(),
        sdp_mid: candidate.sdp_mid.clone(),
        sdp_mline_index: candidate.sdp_mline_index,
    }
}

fn candidate_from(body: &SignalBody) -> Option<IceCandidate> {
    match body {
        SignalBody::Candidate {
            candidate,
            sdp_mid,
            sdp_mline_index,
        } => Some(IceCandidate {
            candidate: candidate.clone(),
            sdp_mid: sdp_mid.clone(),
            sdp_mline_index: *sdp_mline_index,
        }),
        _ => None,
    }
}

#[cfg(test)]
#[path = "tests/call_tests.rs"]
mod tests;
