use thiserror::Error;

/// Failures of the realtime push channel. `emit` never silently succeeds
/// while disconnected; callers that need delivery use the ack variant and
/// treat timeout or loss as failure.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("signaling channel is not connected")]
    NotConnected,
    #[error("acknowledgment timed out")]
    AckTimeout,
    #[error("server rejected the request: {0}")]
    Rejected(String),
    #[error("signaling channel was closed before the acknowledgment arrived")]
    Closed,
}

#[derive(Debug, Error)]
pub enum RestError {
    #[error("invalid server url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server rejected the request ({status}): {message}")]
    Api { status: u16, message: String },
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("could not read attachment {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Request(#[from] RestError),
}

/// Surfaced to the caller of `send_draft`. An `Upload` or dispatch failure
/// leaves the draft restored for retry.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("draft has no text or attachments")]
    EmptyDraft,
    #[error("attachment upload failed: {0}")]
    Upload(#[from] UploadError),
    #[error("realtime send failed: {0}")]
    Transport(#[from] TransportError),
    #[error("send request failed: {0}")]
    Api(#[from] RestError),
}

#[derive(Debug, Error)]
pub enum CallError {
    #[error("another call is already active")]
    AlreadyActive,
    #[error("no incoming call to acknowledge")]
    NoIncomingCall,
    #[error("media acquisition failed: {0}")]
    Media(#[from] media::MediaError),
    #[error("call signaling failed: {0}")]
    Transport(#[from] TransportError),
    #[error("peer connection failed: {0}")]
    Peer(anyhow::Error),
}
