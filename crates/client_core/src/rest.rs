use chrono::{DateTime, Utc};
use reqwest::multipart;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use shared::{
    ApiError, Attachment, CallId, CallKind, CallRecord, CallStatus, Contact, Conversation,
    ConversationId, Message, SendMessageRequest, UserId,
};
use url::Url;

use crate::error::RestError;

/// REST collaborator for everything that is not a push event: history
/// pagination, the send fallback, attachment upload, and call records.
pub struct ApiClient {
    http: reqwest::Client,
    base_url: Url,
    auth_token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SentMessage {
    pub message: Message,
    pub conversation: Conversation,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCallRequest {
    pub caller: UserId,
    pub callee: UserId,
    pub call_type: CallKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UpdateCallRequest {
    status: CallStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    duration_sec: Option<u64>,
}

impl ApiClient {
    pub fn new(server_url: &str, auth_token: &str) -> Result<Self, RestError> {
        let base_url = Url::parse(server_url)?;
        Ok(Self {
            http: reqwest::Client::new(),
            base_url,
            auth_token: auth_token.to_owned(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.base_url.as_str().trim_end_matches('/'))
    }

    pub async fn contacts(&self) -> Result<Vec<Contact>, RestError> {
        let response = self
            .http
            .get(self.endpoint("/contacts"))
            .bearer_auth(&self.auth_token)
            .send()
            .await?;
        read_json(response).await
    }

    pub async fn conversations(&self) -> Result<Vec<Conversation>, RestError> {
        let response = self
            .http
            .get(self.endpoint("/conversations"))
            .bearer_auth(&self.auth_token)
            .send()
            .await?;
        read_json(response).await
    }

    /// Newest `limit` messages, or the page strictly before the `before`
    /// cursor when paginating backwards.
    pub async fn messages(
        &self,
        conversation_id: &ConversationId,
        limit: u32,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<Message>, RestError> {
        let limit = limit.clamp(1, 100);
        let mut request = self
            .http
            .get(self.endpoint(&format!("/conversations/{conversation_id}/messages")))
            .bearer_auth(&self.auth_token)
            .query(&[("limit", limit.to_string())]);
        if let Some(before) = before {
            request = request.query(&[("before", before.to_rfc3339())]);
        }
        read_json(request.send().await?).await
    }

    /// Send fallback when the push channel cannot acknowledge. Never retried
    /// blindly; the request's `clientRef` exists for server-side dedup.
    pub async fn send_message(
        &self,
        request: &SendMessageRequest,
    ) -> Result<SentMessage, RestError> {
        let response = self
            .http
            .post(self.endpoint("/messages"))
            .bearer_auth(&self.auth_token)
            .json(request)
            .send()
            .await?;
        read_json(response).await
    }

    pub async fn upload_attachment(
        &self,
        file_name: &str,
        mime_type: &str,
        bytes: Vec<u8>,
    ) -> Result<Attachment, RestError> {
        let size_bytes = bytes.len();
        let part = multipart::Part::bytes(bytes)
            .file_name(file_name.to_owned())
            .mime_str(mime_type)?;
        let form = multipart::Form::new()
            .part("file", part)
            .text("fileName", file_name.to_owned())
            .text("mimeType", mime_type.to_owned())
            .text("sizeBytes", size_bytes.to_string());
        let response = self
            .http
            .post(self.endpoint("/attachments"))
            .bearer_auth(&self.auth_token)
            .multipart(form)
            .send()
            .await?;
        read_json(response).await
    }

    pub async fn create_call(&self, request: &CreateCallRequest) -> Result<CallRecord, RestError> {
        let response = self
            .http
            .post(self.endpoint("/calls"))
            .bearer_auth(&self.auth_token)
            .json(request)
            .send()
            .await?;
        read_json(response).await
    }

    pub async fn update_call(
        &self,
        call_id: &CallId,
        status: CallStatus,
        duration_sec: Option<u64>,
    ) -> Result<(), RestError> {
        let response = self
            .http
            .patch(self.endpoint(&format!("/calls/{call_id}")))
            .bearer_auth(&self.auth_token)
            .json(&UpdateCallRequest {
                status,
                duration_sec,
            })
            .send()
            .await?;
        expect_success(response).await
    }

    pub async fn call_log(
        &self,
        conversation_id: Option<&ConversationId>,
    ) -> Result<Vec<CallRecord>, RestError> {
        let mut request = self
            .http
            .get(self.endpoint("/calls"))
            .bearer_auth(&self.auth_token);
        if let Some(conversation_id) = conversation_id {
            request = request.query(&[("conversationId", conversation_id.as_str())]);
        }
        read_json(request.send().await?).await
    }
}

async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, RestError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }
    Err(api_error(status, response).await)
}

async fn expect_success(response: reqwest::Response) -> Result<(), RestError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    Err(api_error(status, response).await)
}

async fn api_error(status: reqwest::StatusCode, response: reqwest::Response) -> RestError {
    let message = match response.json::<ApiError>().await {
        Ok(body) => body.to_string(),
        Err(_) => status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_owned(),
    };
    RestError::Api {
        status: status.as_u16(),
        message,
    }
}
