use serde::{Deserialize, Serialize};

use crate::{
    domain::{
        Attachment, CallId, CallKind, CallStatus, Conversation, ConversationId, E2eeDescriptor,
        IncomingCall, Message, UserId,
    },
    error::ApiError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalType {
    Offer,
    Answer,
    IceCandidate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Interior of a `call:signal` frame. Descriptions and candidates get a
/// typed shape; anything else stays opaque so one malformed peer payload
/// cannot poison the whole frame decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SignalBody {
    Description {
        #[serde(rename = "type")]
        kind: SdpKind,
        sdp: String,
    },
    Candidate {
        candidate: String,
        #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
        sdp_mid: Option<String>,
        #[serde(
            rename = "sdpMLineIndex",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        sdp_mline_index: Option<u32>,
    },
    Other(serde_json::Value),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<UserId>,
    /// Client-chosen reference so a retried send can be de-duplicated.
    pub client_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSignal {
    pub call_id: CallId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    pub recipient_id: UserId,
    /// Stamped by the relay on rebroadcast; absent on the sending leg.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<UserId>,
    pub signal_type: SignalType,
    pub signal: SignalBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallInitiate {
    pub call_id: CallId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    pub recipient_id: UserId,
    pub call_type: CallKind,
    pub e2ee: E2eeDescriptor,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallUpdate {
    pub call_id: CallId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    pub recipient_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<UserId>,
    pub status: CallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_sec: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendAck {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation: Option<Conversation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientRequest {
    #[serde(rename = "send")]
    Send(SendMessageRequest),
    #[serde(rename = "call:signal")]
    CallSignal(CallSignal),
    #[serde(rename = "call:initiate")]
    CallInitiate(CallInitiate),
    #[serde(rename = "call:update")]
    CallUpdate(CallUpdate),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "message:new")]
    MessageNew {
        conversation: Conversation,
        message: Message,
    },
    #[serde(rename = "call:signal")]
    CallSignal(CallSignal),
    #[serde(rename = "call:incoming")]
    CallIncoming(IncomingCall),
    #[serde(rename = "call:update")]
    CallUpdate(CallUpdate),
    #[serde(rename = "send:ack")]
    SendAck(SendAck),
}

/// One frame in either direction. `ack` correlates an acknowledged request
/// with the `send:ack` reply that echoes the same number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<u64>,
    #[serde(flatten)]
    pub request: ClientRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<u64>,
    #[serde(flatten)]
    pub event: ServerEvent,
}

impl ClientFrame {
    pub fn event(request: ClientRequest) -> Self {
        Self { ack: None, request }
    }

    pub fn with_ack(ack: u64, request: ClientRequest) -> Self {
        Self {
            ack: Some(ack),
            request,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn call_signal_round_trips_with_wire_names() {
        let frame = ClientFrame::event(ClientRequest::CallSignal(CallSignal {
            call_id: CallId::new("call-1"),
            conversation_id: None,
            recipient_id: UserId::new("bob"),
            sender_id: None,
            signal_type: SignalType::IceCandidate,
            signal: SignalBody::Candidate {
                candidate: "candidate:1 1 UDP 2122252543 10.0.0.2 51337 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
            },
        }));
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["event"], "call:signal");
        assert_eq!(value["data"]["signalType"], "ice-candidate");
        assert_eq!(value["data"]["signal"]["sdpMLineIndex"], 0);
        assert!(value.get("ack").is_none());
    }

    #[test]
    fn inbound_frames_decode_by_event_name() {
        let raw = json!({
            "event": "call:incoming",
            "data": {
                "callId": "call-9",
                "callType": "video",
                "caller": "alice"
            }
        });
        let frame: ServerFrame = serde_json::from_value(raw).unwrap();
        match frame.event {
            ServerEvent::CallIncoming(incoming) => {
                assert_eq!(incoming.call_id, CallId::new("call-9"));
                assert_eq!(incoming.call_type, CallKind::Video);
                assert!(incoming.conversation_id.is_none());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn ack_frames_echo_the_request_number() {
        let raw = json!({
            "ack": 7,
            "event": "send:ack",
            "data": { "ok": false, "error": { "code": "validation", "message": "empty" } }
        });
        let frame: ServerFrame = serde_json::from_value(raw).unwrap();
        assert_eq!(frame.ack, Some(7));
        match frame.event {
            ServerEvent::SendAck(ack) => {
                assert!(!ack.ok);
                assert!(ack.error.is_some());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn unrecognized_signal_interiors_stay_opaque() {
        let raw = json!({
            "event": "call:signal",
            "data": {
                "callId": "call-2",
                "recipientId": "bob",
                "signalType": "ice-candidate",
                "signal": { "weird": true }
            }
        });
        let frame: ServerFrame = serde_json::from_value(raw).unwrap();
        match frame.event {
            ServerEvent::CallSignal(signal) => {
                assert!(matches!(signal.signal, SignalBody::Other(_)))
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
