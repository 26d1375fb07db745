use std::sync::Arc;

use async_trait::async_trait;
use shared::SdpKind;
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    /// Whether the description negotiates a video media section.
    pub fn has_video(&self) -> bool {
        self.sdp.lines().any(|line| line.starts_with("m=video"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    New,
    Checking,
    Connected,
    Completed,
    Failed,
    Disconnected,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    Connectivity(ConnectivityState),
    IceCandidate(IceCandidate),
}

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("media permission denied")]
    PermissionDenied,
    #[error("capture device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("media backend failure: {0}")]
    Backend(String),
}

/// A captured local track. Disabling keeps the track alive but silent
/// (mute, camera-off); stopping releases the device.
pub trait LocalTrack: Send + Sync {
    fn kind(&self) -> TrackKind;
    fn set_enabled(&self, enabled: bool);
    fn stop(&self);
}

#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Captures microphone audio, plus camera video when `want_video`.
    async fn capture(&self, want_video: bool) -> Result<Vec<Arc<dyn LocalTrack>>, MediaError>;
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_track(&self, track: Arc<dyn LocalTrack>) -> anyhow::Result<()>;
    async fn create_offer(&self) -> anyhow::Result<SessionDescription>;
    async fn create_answer(&self) -> anyhow::Result<SessionDescription>;
    async fn set_local_description(&self, description: SessionDescription) -> anyhow::Result<()>;
    async fn set_remote_description(&self, description: SessionDescription) -> anyhow::Result<()>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> anyhow::Result<()>;
    async fn close(&self) -> anyhow::Result<()>;
    fn subscribe_events(&self) -> broadcast::Receiver<PeerEvent>;
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PeerConfig {
    pub ice_servers: Vec<String>,
}

#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(&self, config: PeerConfig) -> anyhow::Result<Arc<dyn PeerConnection>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_sections_are_detected_per_media_line() {
        let audio_only = SessionDescription {
            kind: SdpKind::Offer,
            sdp: "v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n".into(),
        };
        assert!(!audio_only.has_video());

        let with_video = SessionDescription {
            kind: SdpKind::Offer,
            sdp: "v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\n"
                .into(),
        };
        assert!(with_video.has_video());
    }
}
