use shared::Attachment;
use tracing::debug;

use crate::{error::UploadError, rest::ApiClient};

/// A local-only, unsent file awaiting upload. Identity is the composite of
/// uri, name, and size so the same pick cannot be queued twice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAttachment {
    pub local_uri: String,
    pub file_name: String,
    pub mime_type: String,
    pub size_bytes: u64,
}

impl PendingAttachment {
    pub fn new(
        local_uri: impl Into<String>,
        file_name: impl Into<String>,
        mime_type: impl Into<String>,
        size_bytes: u64,
    ) -> Self {
        Self {
            local_uri: local_uri.into(),
            file_name: file_name.into(),
            mime_type: mime_type.into(),
            size_bytes,
        }
    }

    /// Voice notes ride the same upload path as picked files.
    pub fn voice_note(local_uri: impl Into<String>, file_name: impl Into<String>, size_bytes: u64) -> Self {
        Self::new(local_uri, file_name, "audio/ogg", size_bytes)
    }

    /// Captured photos likewise.
    pub fn captured_photo(local_uri: impl Into<String>, file_name: impl Into<String>, size_bytes: u64) -> Self {
        Self::new(local_uri, file_name, "image/jpeg", size_bytes)
    }

    pub fn dedup_key(&self) -> String {
        format!("{}|{}|{}", self.local_uri, self.file_name, self.size_bytes)
    }

    pub fn matches(&self, other: &PendingAttachment) -> bool {
        self.dedup_key() == other.dedup_key()
    }
}

/// Uploads a single pending attachment and returns its durable reference.
/// Never mutates the caller's pending list; batch ordering and draft
/// restoration are the sync engine's responsibility.
pub async fn upload(
    api: &ApiClient,
    pending: &PendingAttachment,
) -> Result<Attachment, UploadError> {
    let bytes = tokio::fs::read(&pending.local_uri)
        .await
        .map_err(|source| UploadError::Read {
            path: pending.local_uri.clone(),
            source,
        })?;
    debug!(
        "attachments: uploading {} ({} bytes, {})",
        pending.file_name,
        bytes.len(),
        pending.mime_type
    );
    let attachment = api
        .upload_attachment(&pending.file_name, &pending.mime_type, bytes)
        .await?;
    Ok(attachment)
}
