//! Collaborators the pipeline talks to but does not own: the message store,
//! the retrieval service and the plan/entitlement checks.

use crate::constants::RETRIEVAL_PATH;
use crate::types::*;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn create_chat(&self, chat: NewChat) -> Result<Chat>;

    /// Inserts the rows as one batch and returns them in the same order.
    async fn create_messages(&self, messages: Vec<NewMessage>) -> Result<Vec<Message>>;

    async fn update_message(&self, id: &MessageId, update: MessageUpdate) -> Result<Message>;

    /// Deletes every message of the chat with `sequence_number >= sequence_number`.
    async fn delete_messages_from(&self, chat_id: &ChatId, sequence_number: i64) -> Result<()>;

    async fn create_message_file_items(&self, items: Vec<MessageFileItem>) -> Result<()>;

    /// Stores the image under `path` and returns the stored path.
    async fn upload_message_image(&self, path: &str, image: ImageUpload) -> Result<String>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RetrievalRequest {
    pub user_input: String,
    pub file_ids: Vec<String>,
    pub embeddings_provider: String,
    pub source_count: usize,
}

#[async_trait]
pub trait Retriever: Send + Sync {
    async fn retrieve(&self, request: RetrievalRequest) -> Result<Vec<FileItem>>;
}

#[async_trait]
pub trait Entitlements: Send + Sync {
    async fn validate_plan_for_model(&self, profile: &Profile, model: &LlmModel) -> Result<bool>;

    async fn validate_plan_for_tools(
        &self,
        profile: &Profile,
        tools: &[Tool],
        model: &LlmModel,
    ) -> Result<bool>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAllEntitlements;

#[async_trait]
impl Entitlements for AllowAllEntitlements {
    async fn validate_plan_for_model(&self, _profile: &Profile, _model: &LlmModel) -> Result<bool> {
        Ok(true)
    }

    async fn validate_plan_for_tools(
        &self,
        _profile: &Profile,
        _tools: &[Tool],
        _model: &LlmModel,
    ) -> Result<bool> {
        Ok(true)
    }
}

/// Retrieval over the app's HTTP API.
#[derive(Debug, Clone)]
pub struct HttpRetriever {
    client: reqwest::Client,
    endpoint: String,
}

#[derive(Deserialize)]
struct RetrievalResponse {
    #[serde(default)]
    results: Vec<FileItem>,
}

impl HttpRetriever {
    pub fn new(client: reqwest::Client, api_base_url: &str) -> Self {
        Self {
            client,
            endpoint: format!("{}{}", api_base_url.trim_end_matches('/'), RETRIEVAL_PATH),
        }
    }
}

#[async_trait]
impl Retriever for HttpRetriever {
    async fn retrieve(&self, request: RetrievalRequest) -> Result<Vec<FileItem>> {
        tracing::info!(
            "[⚙️  -> 📚] Retrieving {} source(s) from {} file(s)",
            request.source_count,
            request.file_ids.len()
        );
        let response = self.client.post(&self.endpoint).json(&request).send().await?;
        if !response.status().is_success() {
            return Err(crate::hardening::error_from_response(response).await.into());
        }
        let body: RetrievalResponse = response.json().await?;
        Ok(body.results)
    }
}

#[derive(Debug, Default)]
struct MemoryInner {
    chats: Vec<Chat>,
    messages: Vec<Message>,
    file_items: Vec<MessageFileItem>,
    images: HashMap<String, bytes::Bytes>,
}

/// In-process store. Used by the CLI when no database is given and by tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryInner>> {
        self.inner
            .lock()
            .map_err(|_| ChatError::Internal("memory store lock poisoned".to_string()).into())
    }

    /// Messages of a chat ordered by sequence number.
    pub fn messages(&self, chat_id: &ChatId) -> Vec<Message> {
        let Ok(inner) = self.lock() else {
            return Vec::new();
        };
        let mut messages: Vec<Message> = inner
            .messages
            .iter()
            .filter(|m| &m.chat_id == chat_id)
            .cloned()
            .collect();
        messages.sort_by_key(|m| m.sequence_number);
        messages
    }

    pub fn chats(&self) -> Vec<Chat> {
        self.lock().map(|i| i.chats.clone()).unwrap_or_default()
    }

    pub fn file_items(&self) -> Vec<MessageFileItem> {
        self.lock().map(|i| i.file_items.clone()).unwrap_or_default()
    }

    pub fn image_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .lock()
            .map(|i| i.images.keys().cloned().collect())
            .unwrap_or_default();
        paths.sort();
        paths
    }
}

#[async_trait]
impl ChatStore for MemoryStore {
    async fn create_chat(&self, chat: NewChat) -> Result<Chat> {
        let created = Chat {
            id: ChatId(uuid::Uuid::new_v4().to_string()),
            user_id: chat.user_id,
            name: chat.name,
            assistant_id: chat.assistant_id,
            settings: chat.settings,
            created_at: Utc::now(),
        };
        self.lock()?.chats.push(created.clone());
        Ok(created)
    }

    async fn create_messages(&self, messages: Vec<NewMessage>) -> Result<Vec<Message>> {
        let now = Utc::now();
        let created: Vec<Message> = messages
            .into_iter()
            .map(|m| Message {
                key: MessageKey::Persisted(MessageId(uuid::Uuid::new_v4().to_string())),
                chat_id: m.chat_id,
                assistant_id: m.assistant_id,
                user_id: m.user_id,
                role: m.role,
                content: m.content,
                model: m.model,
                sequence_number: m.sequence_number,
                image_paths: m.image_paths,
                annotation: m.annotation,
                code_blocks: m.code_blocks,
                created_at: now,
                updated_at: None,
            })
            .collect();
        let mut inner = self.lock()?;
        // Same rule as the unique (chat_id, sequence_number) index in SQLite.
        let mut taken: HashSet<(ChatId, i64)> = inner
            .messages
            .iter()
            .map(|m| (m.chat_id.clone(), m.sequence_number))
            .collect();
        for message in &created {
            if !taken.insert((message.chat_id.clone(), message.sequence_number)) {
                return Err(ChatError::Persistence(format!(
                    "sequence {} already used in chat {}",
                    message.sequence_number, message.chat_id
                ))
                .into());
            }
        }
        inner.messages.extend(created.iter().cloned());
        Ok(created)
    }

    async fn update_message(&self, id: &MessageId, update: MessageUpdate) -> Result<Message> {
        let mut inner = self.lock()?;
        let message = inner
            .messages
            .iter_mut()
            .find(|m| m.key.id() == Some(id))
            .ok_or_else(|| ChatError::Persistence(format!("message {} not found", id)))?;
        if let Some(content) = update.content {
            message.content = content;
        }
        if let Some(code_blocks) = update.code_blocks {
            message.code_blocks = code_blocks;
        }
        if let Some(image_paths) = update.image_paths {
            message.image_paths = image_paths;
        }
        if let Some(annotation) = update.annotation {
            message.annotation = annotation;
        }
        message.updated_at = Some(Utc::now());
        Ok(message.clone())
    }

    async fn delete_messages_from(&self, chat_id: &ChatId, sequence_number: i64) -> Result<()> {
        self.lock()?
            .messages
            .retain(|m| &m.chat_id != chat_id || m.sequence_number < sequence_number);
        Ok(())
    }

    async fn create_message_file_items(&self, items: Vec<MessageFileItem>) -> Result<()> {
        self.lock()?.file_items.extend(items);
        Ok(())
    }

    async fn upload_message_image(&self, path: &str, image: ImageUpload) -> Result<String> {
        self.lock()?.images.insert(path.to_string(), image.bytes);
        Ok(path.to_string())
    }
}
