use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{
    multipart::{Form, Part},
    Client, RequestBuilder, Response, StatusCode,
};
use shared::{
    domain::{
        ConversationId, ConversationSummary, Message, MessageId, Presence, UserProfile,
        UserSearchResult,
    },
    error::{ApiError, ErrorCode},
    protocol::{ConversationPayload, MessagePayload, SendMessageRequest, UploadStreamEvent},
};
use tracing::{debug, warn};
use url::Url;

use crate::{error::ClientError, session::SessionContext};

#[derive(Debug, Clone)]
pub struct AttachmentUpload {
    pub filename: String,
    pub mime_type: Option<String>,
    pub bytes: Vec<u8>,
}

impl AttachmentUpload {
    pub fn size_bytes(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn mime_or_default(&self) -> &str {
        self.mime_type
            .as_deref()
            .unwrap_or("application/octet-stream")
    }
}

pub type ProgressFn = dyn Fn(f64) + Send + Sync;

/// The remote messaging API.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>>;
    async fn fetch_messages(
        &self,
        conversation_id: &ConversationId,
        page: u32,
        limit: u32,
    ) -> Result<Vec<Message>>;
    async fn send_message(&self, recipient_username: &str, content: &str) -> Result<()>;
    async fn delete_message(&self, message_id: &MessageId) -> Result<()>;
    async fn search_users(&self, query: &str) -> Result<Vec<UserSearchResult>>;
    async fn current_user(&self) -> Result<UserProfile>;
    async fn presence(&self, username: &str) -> Result<Presence>;
    /// Uploads a file and returns its public URL.
    async fn upload_file(&self, upload: AttachmentUpload, progress: &ProgressFn) -> Result<String>;
}

pub struct HttpChatApi {
    http: Client,
    base_url: Url,
    session: Arc<SessionContext>,
}

impl HttpChatApi {
    pub fn new(base_url: &str, session: Arc<SessionContext>) -> Result<Self> {
        let base_url =
            Url::parse(base_url).with_context(|| format!("invalid api base url '{base_url}'"))?;
        if base_url.cannot_be_a_base() {
            return Err(anyhow!("api base url '{base_url}' cannot carry a path"));
        }
        Ok(Self {
            http: Client::new(),
            base_url,
            session,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    /// Sends with the current bearer token. A 401 triggers one credential
    /// refresh and one retry; a second 401 is [`ClientError::Unauthorized`].
    async fn send_authorized<F>(&self, build: F) -> Result<Response>
    where
        F: Fn(&Client) -> RequestBuilder + Send + Sync,
    {
        let token = self.session.access_token().await;
        let response = with_bearer(build(&self.http), token.as_deref())
            .send()
            .await
            .map_err(ClientError::from)?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return check_status(response).await;
        }

        warn!("api: access token rejected; refreshing credentials");
        let refreshed = self.session.refresh_credentials(token.as_deref()).await?;
        let retry = build(&self.http)
            .bearer_auth(refreshed)
            .send()
            .await
            .map_err(ClientError::from)?;
        if retry.status() == StatusCode::UNAUTHORIZED {
            return Err(ClientError::Unauthorized.into());
        }
        check_status(retry).await
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>> {
        let url = self.endpoint(&["messaging", "conversations"]);
        let payload: Vec<ConversationPayload> = self
            .send_authorized(|http| http.get(url.clone()))
            .await?
            .json()
            .await
            .map_err(ClientError::from)?;
        Ok(payload.into_iter().map(ConversationSummary::from).collect())
    }

    async fn fetch_messages(
        &self,
        conversation_id: &ConversationId,
        page: u32,
        limit: u32,
    ) -> Result<Vec<Message>> {
        let url = self.endpoint(&["messaging", "messages", conversation_id.as_str()]);
        let page = page.max(1);
        let payload: Vec<MessagePayload> = self
            .send_authorized(|http| {
                http.get(url.clone())
                    .query(&[("page", page), ("limit", limit)])
            })
            .await?
            .json()
            .await
            .map_err(ClientError::from)?;
        debug!(
            conversation_id = %conversation_id,
            page,
            count = payload.len(),
            "api: fetched message page"
        );
        Ok(payload
            .into_iter()
            .map(|message| message.into_message(conversation_id))
            .collect())
    }

    async fn send_message(&self, recipient_username: &str, content: &str) -> Result<()> {
        let url = self.endpoint(&["messaging", "send", recipient_username]);
        let body = SendMessageRequest {
            content: content.to_string(),
        };
        self.send_authorized(|http| http.post(url.clone()).json(&body))
            .await?;
        Ok(())
    }

    async fn delete_message(&self, message_id: &MessageId) -> Result<()> {
        let url = self.endpoint(&["messaging", "delete", message_id.as_str()]);
        self.send_authorized(|http| http.delete(url.clone())).await?;
        Ok(())
    }

    async fn search_users(&self, query: &str) -> Result<Vec<UserSearchResult>> {
        let url = self.endpoint(&["messaging", "searchUsers"]);
        let users = self
            .send_authorized(|http| http.get(url.clone()).query(&[("query", query)]))
            .await?
            .json()
            .await
            .map_err(ClientError::from)?;
        Ok(users)
    }

    async fn current_user(&self) -> Result<UserProfile> {
        let url = self.endpoint(&["v1", "auth", "info"]);
        let user = self
            .send_authorized(|http| http.get(url.clone()))
            .await?
            .json()
            .await
            .map_err(ClientError::from)?;
        Ok(user)
    }

    async fn presence(&self, username: &str) -> Result<Presence> {
        let url = self.endpoint(&["messaging", "presence", username]);
        let presence = self
            .send_authorized(|http| http.get(url.clone()))
            .await?
            .json()
            .await
            .map_err(ClientError::from)?;
        Ok(presence)
    }

    async fn upload_file(&self, upload: AttachmentUpload, progress: &ProgressFn) -> Result<String> {
        let url = self.endpoint(&["storage", "upload"]);
        let response = self
            .send_authorized(|http| {
                http.post(url.clone())
                    .multipart(Form::new().part("file", upload_part(&upload)))
            })
            .await?;

        let mut parser = UploadStreamParser::default();
        let mut uploaded_url = None;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(ClientError::from)?;
            for event in parser.push(&chunk) {
                apply_upload_event(event, progress, &mut uploaded_url)?;
            }
        }
        for event in parser.finish() {
            apply_upload_event(event, progress, &mut uploaded_url)?;
        }

        uploaded_url
            .ok_or_else(|| ClientError::Upload("no URL received from server".into()).into())
    }
}

fn with_bearer(builder: RequestBuilder, token: Option<&str>) -> RequestBuilder {
    match token {
        Some(token) => builder.bearer_auth(token),
        None => builder,
    }
}

async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ApiError>(&body)
        .map(|err| err.message)
        .unwrap_or_else(|_| {
            status
                .canonical_reason()
                .unwrap_or("An error occurred")
                .to_string()
        });
    Err(ClientError::Api {
        status: status.as_u16(),
        code: ErrorCode::from_status(status.as_u16()),
        message,
    }
    .into())
}

fn upload_part(upload: &AttachmentUpload) -> Part {
    let part = || Part::bytes(upload.bytes.clone()).file_name(upload.filename.clone());
    part()
        .mime_str(upload.mime_or_default())
        .unwrap_or_else(|_| part())
}

fn apply_upload_event(
    event: UploadStreamEvent,
    progress: &ProgressFn,
    uploaded_url: &mut Option<String>,
) -> Result<()> {
    if let Some(error) = event.error {
        return Err(ClientError::Upload(error).into());
    }
    if let Some(value) = event.progress {
        progress(value);
    }
    if let Some(url) = event.url {
        *uploaded_url = Some(url);
    }
    Ok(())
}

/// Splits the upload response into `data: {json}` blocks separated by a blank
/// line. Blocks may straddle network chunks.
#[derive(Default)]
pub(crate) struct UploadStreamParser {
    buffer: Vec<u8>,
}

impl UploadStreamParser {
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<UploadStreamEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = find_block_end(&self.buffer) {
            let block: Vec<u8> = self.buffer.drain(..pos + 2).collect();
            if let Some(event) = decode_block(&block[..pos]) {
                events.push(event);
            }
        }
        events
    }

    pub(crate) fn finish(&mut self) -> Vec<UploadStreamEvent> {
        let rest = std::mem::take(&mut self.buffer);
        decode_block(&rest).into_iter().collect()
    }
}

fn find_block_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|pair| pair == b"\n\n")
}

fn decode_block(block: &[u8]) -> Option<UploadStreamEvent> {
    let text = String::from_utf8_lossy(block);
    let data: String = text
        .lines()
        .map(|line| line.strip_prefix("data:").unwrap_or(line).trim())
        .collect::<Vec<_>>()
        .join("");
    if data.is_empty() {
        return None;
    }
    match serde_json::from_str::<UploadStreamEvent>(&data) {
        Ok(event) => Some(event),
        Err(_) => {
            debug!(block = %data, "api: ignoring non-json upload progress block");
            None
        }
    }
}
