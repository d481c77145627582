//! Persistence collaborator boundary: the HTTP API the sync core calls for
//! everything durable, behind a trait so stores and beacons can be driven
//! by recording fakes in tests.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};
use url::Url;

use shared::domain::{ConversationId, ConversationKind, MessageId, MessageKind, UserId};
use shared::error::{ApiError, ApiException, ErrorCode};
use shared::protocol::{ConversationSummary, MediaRef, MessageBody, MessagePayload, ReplyPreview};

use crate::error::ClientError;
use crate::upload::{MediaStore, MediaUpload, ProgressReporter, UploadError};

const UPLOAD_CHUNK_BYTES: usize = 64 * 1024;

/// One page of timeline history plus the push topic for live updates on
/// this conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelinePage {
    pub kind: ConversationKind,
    pub messages: Vec<MessagePayload>,
    pub topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_cursor: Option<MessageId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutgoingMessage {
    #[serde(flatten)]
    pub body: MessageBody,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<ReplyPreview>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PostMessageResponse {
    pub message_id: MessageId,
    pub sent_at: DateTime<Utc>,
}

#[async_trait]
pub trait ConversationApi: Send + Sync {
    async fn fetch_timeline(
        &self,
        conversation: ConversationId,
        limit: u32,
        before: Option<MessageId>,
    ) -> Result<TimelinePage, ClientError>;

    async fn post_message(
        &self,
        conversation: ConversationId,
        message: &OutgoingMessage,
    ) -> Result<PostMessageResponse, ClientError>;

    async fn edit_message(
        &self,
        conversation: ConversationId,
        message: MessageId,
        body: &MessageBody,
    ) -> Result<(), ClientError>;

    async fn delete_message(
        &self,
        conversation: ConversationId,
        message: MessageId,
    ) -> Result<(), ClientError>;

    async fn set_pinned(
        &self,
        conversation: ConversationId,
        message: MessageId,
        pinned: bool,
    ) -> Result<(), ClientError>;

    async fn toggle_reaction(
        &self,
        conversation: ConversationId,
        message: MessageId,
        emoji: &str,
    ) -> Result<(), ClientError>;

    async fn mark_read(
        &self,
        conversation: ConversationId,
        up_to: MessageId,
    ) -> Result<(), ClientError>;

    async fn fetch_conversations(&self) -> Result<Vec<ConversationSummary>, ClientError>;

    async fn send_typing(
        &self,
        conversation: ConversationId,
        is_typing: bool,
        is_recording: bool,
    ) -> Result<(), ClientError>;

    async fn presence_ping(&self, conversation: ConversationId) -> Result<(), ClientError>;

    /// Best-effort leave signal. Callers fire this from a detached task so
    /// it outlives screen teardown; failures are logged, never surfaced.
    async fn presence_leave(&self, conversation: ConversationId) -> Result<(), ClientError>;
}

#[derive(Serialize)]
struct TimelineQuery {
    user_id: i64,
    limit: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    before: Option<i64>,
}

#[derive(Serialize)]
struct PinBody {
    pinned: bool,
}

#[derive(Serialize)]
struct ReactionBody<'a> {
    emoji: &'a str,
}

#[derive(Serialize)]
struct ReadBody {
    up_to: MessageId,
}

#[derive(Serialize)]
struct TypingBody {
    is_typing: bool,
    is_recording: bool,
}

pub struct HttpApi {
    http: reqwest::Client,
    base: Url,
    viewer: UserId,
}

impl HttpApi {
    pub fn new(base: Url, viewer: UserId) -> Self {
        Self {
            http: reqwest::Client::new(),
            base,
            viewer,
        }
    }

    fn endpoint(&self, path: &str) -> Url {
        self.base
            .join(path)
            .unwrap_or_else(|_| self.base.clone())
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        match response.json::<ApiError>().await {
            Ok(body) => Err(ClientError::Api(body.into())),
            Err(_) => Err(ClientError::Api(ApiException::new(
                ErrorCode::Internal,
                format!("unexpected status {status}"),
            ))),
        }
    }

    async fn post_empty(&self, url: Url, body: &impl Serialize) -> Result<(), ClientError> {
        let response = self
            .http
            .post(url)
            .query(&[("user_id", self.viewer.0)])
            .json(body)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }
}

#[async_trait]
impl ConversationApi for HttpApi {
    async fn fetch_timeline(
        &self,
        conversation: ConversationId,
        limit: u32,
        before: Option<MessageId>,
    ) -> Result<TimelinePage, ClientError> {
        let response = self
            .http
            .get(self.endpoint(&format!("conversations/{}/messages", conversation.0)))
            .query(&TimelineQuery {
                user_id: self.viewer.0,
                limit,
                before: before.map(|id| id.0),
            })
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn post_message(
        &self,
        conversation: ConversationId,
        message: &OutgoingMessage,
    ) -> Result<PostMessageResponse, ClientError> {
        let response = self
            .http
            .post(self.endpoint(&format!("conversations/{}/messages", conversation.0)))
            .query(&[("user_id", self.viewer.0)])
            .json(message)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn edit_message(
        &self,
        conversation: ConversationId,
        message: MessageId,
        body: &MessageBody,
    ) -> Result<(), ClientError> {
        self.post_empty(
            self.endpoint(&format!(
                "conversations/{}/messages/{}/edit",
                conversation.0, message.0
            )),
            body,
        )
        .await
    }

    async fn delete_message(
        &self,
        conversation: ConversationId,
        message: MessageId,
    ) -> Result<(), ClientError> {
        let response = self
            .http
            .post(self.endpoint(&format!(
                "conversations/{}/messages/{}/delete",
                conversation.0, message.0
            )))
            .query(&[("user_id", self.viewer.0)])
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn set_pinned(
        &self,
        conversation: ConversationId,
        message: MessageId,
        pinned: bool,
    ) -> Result<(), ClientError> {
        self.post_empty(
            self.endpoint(&format!(
                "conversations/{}/messages/{}/pin",
                conversation.0, message.0
            )),
            &PinBody { pinned },
        )
        .await
    }

    async fn toggle_reaction(
        &self,
        conversation: ConversationId,
        message: MessageId,
        emoji: &str,
    ) -> Result<(), ClientError> {
        self.post_empty(
            self.endpoint(&format!(
                "conversations/{}/messages/{}/reactions",
                conversation.0, message.0
            )),
            &ReactionBody { emoji },
        )
        .await
    }

    async fn mark_read(
        &self,
        conversation: ConversationId,
        up_to: MessageId,
    ) -> Result<(), ClientError> {
        self.post_empty(
            self.endpoint(&format!("conversations/{}/read", conversation.0)),
            &ReadBody { up_to },
        )
        .await
    }

    async fn fetch_conversations(&self) -> Result<Vec<ConversationSummary>, ClientError> {
        let response = self
            .http
            .get(self.endpoint("conversations"))
            .query(&[("user_id", self.viewer.0)])
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn send_typing(
        &self,
        conversation: ConversationId,
        is_typing: bool,
        is_recording: bool,
    ) -> Result<(), ClientError> {
        self.post_empty(
            self.endpoint(&format!("conversations/{}/typing", conversation.0)),
            &TypingBody {
                is_typing,
                is_recording,
            },
        )
        .await
    }

    async fn presence_ping(&self, conversation: ConversationId) -> Result<(), ClientError> {
        let response = self
            .http
            .post(self.endpoint(&format!("conversations/{}/presence/ping", conversation.0)))
            .query(&[("user_id", self.viewer.0)])
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn presence_leave(&self, conversation: ConversationId) -> Result<(), ClientError> {
        let response = self
            .http
            .post(self.endpoint(&format!(
                "conversations/{}/presence/leave",
                conversation.0
            )))
            .query(&[("user_id", self.viewer.0)])
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }
}

#[async_trait]
impl MediaStore for HttpApi {
    async fn store_media(
        &self,
        upload: MediaUpload,
        progress: ProgressReporter,
    ) -> Result<MediaRef, UploadError> {
        let total = upload.bytes.len().max(1);
        let mut chunks = Vec::with_capacity(total / UPLOAD_CHUNK_BYTES + 1);
        let mut rest = upload.bytes.clone();
        while rest.len() > UPLOAD_CHUNK_BYTES {
            chunks.push(rest.split_to(UPLOAD_CHUNK_BYTES));
        }
        if !rest.is_empty() {
            chunks.push(rest);
        }

        let reporter = progress.clone();
        let mut sent = 0usize;
        let body_stream = futures::stream::iter(chunks.into_iter().map(move |chunk| {
            sent += chunk.len();
            reporter.report((sent * 100 / total) as u8);
            Ok::<Bytes, std::io::Error>(chunk)
        }));

        let kind = match upload.kind {
            MessageKind::Image => "image",
            MessageKind::Video => "video",
            MessageKind::Audio => "audio",
            MessageKind::Text => return Err(UploadError::NotMedia),
        };

        let response = self
            .http
            .post(self.endpoint("media"))
            .query(&[
                ("user_id", self.viewer.0.to_string()),
                ("filename", upload.filename.clone()),
                ("kind", kind.to_string()),
            ])
            .header(CONTENT_TYPE, upload.mime_type.clone())
            .body(reqwest::Body::wrap_stream(body_stream))
            .send()
            .await
            .map_err(|err| UploadError::Transfer(err.to_string()))?;

        if !response.status().is_success() {
            return Err(UploadError::Transfer(format!(
                "media store returned {}",
                response.status()
            )));
        }
        let media: MediaRef = response
            .json()
            .await
            .map_err(|err| UploadError::Transfer(err.to_string()))?;
        progress.report(100);
        Ok(media)
    }
}
