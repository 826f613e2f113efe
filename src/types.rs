use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing_error::SpanTrace;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ChatId(pub String);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct MessageId(pub String);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct UserId(pub String);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct FileItemId(pub String);

impl From<String> for ChatId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<String> for FileItemId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ChatId {
    pub fn short(&self) -> &str {
        crate::str_utils::prefix_chars(&self.0, 8)
    }
}

/// Identity of an in-memory message row.
///
/// A `Pending` row exists only in optimistic UI state. Anything that needs a
/// real identifier takes a `&MessageId`, which only a `Persisted` key can hand out.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "state", content = "id", rename_all = "snake_case")]
pub enum MessageKey {
    #[default]
    Pending,
    Persisted(MessageId),
}

impl MessageKey {
    pub fn is_pending(&self) -> bool {
        matches!(self, MessageKey::Pending)
    }

    pub fn id(&self) -> Option<&MessageId> {
        match self {
            MessageKey::Pending => None,
            MessageKey::Persisted(id) => Some(id),
        }
    }
}

/// --- CORE ROLES ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = ChatError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => Err(ChatError::Persistence(format!("unknown role: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ModelProvider {
    OpenAi,
    Azure,
    Anthropic,
    Google,
    Mistral,
    Groq,
    Perplexity,
    OpenRouter,
    Ollama,
    Custom,
}

impl ModelProvider {
    pub fn name(&self) -> &'static str {
        match self {
            ModelProvider::OpenAi => "openai",
            ModelProvider::Azure => "azure",
            ModelProvider::Anthropic => "anthropic",
            ModelProvider::Google => "google",
            ModelProvider::Mistral => "mistral",
            ModelProvider::Groq => "groq",
            ModelProvider::Perplexity => "perplexity",
            ModelProvider::OpenRouter => "openrouter",
            ModelProvider::Ollama => "ollama",
            ModelProvider::Custom => "custom",
        }
    }
}

impl fmt::Display for ModelProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for ModelProvider {
    type Err = ChatError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let provider = match s.to_ascii_lowercase().as_str() {
            "openai" => ModelProvider::OpenAi,
            "azure" => ModelProvider::Azure,
            "anthropic" => ModelProvider::Anthropic,
            "google" => ModelProvider::Google,
            "mistral" => ModelProvider::Mistral,
            "groq" => ModelProvider::Groq,
            "perplexity" => ModelProvider::Perplexity,
            "openrouter" => ModelProvider::OpenRouter,
            "ollama" => ModelProvider::Ollama,
            "custom" => ModelProvider::Custom,
            other => {
                return Err(ChatError::Validation(format!(
                    "unknown model provider: {}",
                    other
                )))
            }
        };
        Ok(provider)
    }
}

/// Resolved model descriptor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LlmModel {
    pub model_id: String,
    pub model_name: String,
    pub provider: ModelProvider,
    #[serde(default)]
    pub hosted_id: Option<String>,
    #[serde(default)]
    pub image_input: bool,
    /// Model can call tools.
    #[serde(default)]
    pub tools: bool,
    /// Provider streams tokens for this model.
    #[serde(default = "default_true")]
    pub streaming: bool,
}

fn default_true() -> bool {
    true
}

impl LlmModel {
    /// Identifier forwarded to hosted endpoints.
    pub fn upstream_id(&self) -> &str {
        match self.hosted_id.as_deref() {
            Some(id) if !id.is_empty() => id,
            _ => &self.model_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatSettings {
    pub model: String,
    pub prompt: String,
    pub temperature: f32,
    pub context_length: usize,
    pub include_profile_context: bool,
    pub include_workspace_instructions: bool,
    pub embeddings_provider: String,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            model: String::new(),
            prompt: "You are a friendly, helpful AI assistant.".to_string(),
            temperature: 0.5,
            context_length: 4096,
            include_profile_context: true,
            include_workspace_instructions: true,
            embeddings_provider: "openai".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Profile {
    pub user_id: UserId,
    #[serde(default)]
    pub profile_context: String,
    #[serde(default)]
    pub plan: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Assistant {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tool {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub schema: serde_json::Value,
    #[serde(default)]
    pub custom_headers: HashMap<String, String>,
}

/// A retrieved knowledge-base fragment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileItem {
    pub id: FileItemId,
    pub file_id: String,
    pub content: String,
    #[serde(default)]
    pub tokens: usize,
}

/// Page element the user pinned as extra context for the turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PageAnnotation {
    pub label: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CodeBlock {
    pub language: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
    #[serde(default)]
    pub sequence_no: usize,
    /// Fence info string as written (`rust:main.rs`, `python main.py`).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub info: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    #[serde(default)]
    pub key: MessageKey,
    pub chat_id: ChatId,
    #[serde(default)]
    pub assistant_id: Option<String>,
    pub user_id: UserId,
    pub role: Role,
    /// Placeholder form; code lives in `code_blocks`.
    pub content: String,
    pub model: String,
    pub sequence_number: i64,
    #[serde(default)]
    pub image_paths: Vec<String>,
    #[serde(default)]
    pub annotation: serde_json::Value,
    #[serde(default)]
    pub code_blocks: Vec<CodeBlock>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Message {
    /// Full text with every code block placeholder substituted back.
    pub fn display_text(&self) -> String {
        crate::code_blocks::decode(&self.content, &self.code_blocks)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub message: Message,
    #[serde(default)]
    pub file_items: Vec<FileItemId>,
}

impl ChatMessage {
    pub fn new(message: Message) -> Self {
        Self {
            message,
            file_items: Vec::new(),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.message.key.is_pending()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chat {
    pub id: ChatId,
    pub user_id: UserId,
    pub name: String,
    #[serde(default)]
    pub assistant_id: Option<String>,
    pub settings: ChatSettings,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewChat {
    pub user_id: UserId,
    pub name: String,
    pub assistant_id: Option<String>,
    pub settings: ChatSettings,
}

/// Row shape for `create_messages`. Carries no id on purpose.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewMessage {
    pub chat_id: ChatId,
    pub assistant_id: Option<String>,
    pub user_id: UserId,
    pub role: Role,
    pub content: String,
    pub model: String,
    pub sequence_number: i64,
    pub image_paths: Vec<String>,
    pub annotation: serde_json::Value,
    pub code_blocks: Vec<CodeBlock>,
}

impl NewMessage {
    pub fn from_message(message: &Message) -> Self {
        Self {
            chat_id: message.chat_id.clone(),
            assistant_id: message.assistant_id.clone(),
            user_id: message.user_id.clone(),
            role: message.role,
            content: message.content.clone(),
            model: message.model.clone(),
            sequence_number: message.sequence_number,
            image_paths: message.image_paths.clone(),
            annotation: message.annotation.clone(),
            code_blocks: message.code_blocks.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct MessageUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_blocks: Option<Vec<CodeBlock>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_paths: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotation: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageFileItem {
    pub user_id: UserId,
    pub message_id: MessageId,
    pub file_item_id: FileItemId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageUpload {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: bytes::Bytes,
    /// URL the model can fetch before the upload exists (data URL or remote).
    pub preview_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UploadedImage {
    pub url: String,
}

/// Transient request envelope, rebuilt for every send.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ChatPayload {
    pub chat_settings: ChatSettings,
    #[serde(default)]
    pub workspace_instructions: String,
    pub chat_messages: Vec<ChatMessage>,
    #[serde(default)]
    pub assistant: Option<Assistant>,
    #[serde(default)]
    pub message_file_items: Vec<FileItem>,
    #[serde(default)]
    pub chat_file_items: Vec<FileItem>,
    #[serde(default)]
    pub page_annotations: Vec<PageAnnotation>,
    /// Resolved URLs for image paths referenced by messages in this payload.
    #[serde(default)]
    pub image_urls: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

/// What the user sees for a terminal failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailureNotice {
    pub message: String,
    pub severity: Severity,
    pub upgrade_prompt: bool,
}

impl FailureNotice {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            severity: Severity::Error,
            upgrade_prompt: false,
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            severity: Severity::Warning,
            upgrade_prompt: false,
        }
    }

    pub fn with_upgrade_prompt(mut self) -> Self {
        self.upgrade_prompt = true;
        self
    }

    pub fn from_error(err: &ChatError) -> Self {
        match err {
            ChatError::Validation(m) => Self::error(m.clone()),
            ChatError::UpgradeRequired(m) => Self::warning(m.clone()).with_upgrade_prompt(),
            ChatError::Http { notice, .. } => notice.clone(),
            ChatError::Network(e) => Self::error(format!(
                "{} ({})",
                crate::constants::GENERIC_FAILURE_MESSAGE,
                e
            )),
            ChatError::Stream(m) => Self::error(m.clone()),
            ChatError::Persistence(m) => Self::error(m.clone()),
            ChatError::Cancelled => Self::warning("Generation cancelled."),
            other => Self::error(other.to_string()),
        }
    }
}

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("{0}")]
    Validation(String),

    #[error("Upgrade required: {0}")]
    UpgradeRequired(String),

    #[error("Upstream error (status {status}): {}", .notice.message)]
    Http { status: u16, notice: FailureNotice },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ChatError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ChatError::Http { status, .. } => Some(*status),
            ChatError::Network(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct ObservedError {
    pub inner: ChatError,
    pub span_trace: SpanTrace,
}

impl std::fmt::Display for ObservedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl std::error::Error for ObservedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.inner)
    }
}

impl<E> From<E> for ObservedError
where
    E: Into<ChatError>,
{
    fn from(error: E) -> Self {
        Self {
            inner: error.into(),
            span_trace: SpanTrace::capture(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ObservedError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_key_serializes_tagged() {
        let pending = serde_json::to_value(MessageKey::Pending).unwrap();
        assert_eq!(pending["state"], "pending");

        let persisted =
            serde_json::to_value(MessageKey::Persisted(MessageId("m1".into()))).unwrap();
        assert_eq!(persisted["state"], "persisted");
        assert_eq!(persisted["id"], "m1");
    }

    #[test]
    fn test_upstream_id_prefers_hosted_id() {
        let mut model = LlmModel {
            model_id: "gpt-4o".into(),
            model_name: "GPT-4o".into(),
            provider: ModelProvider::OpenAi,
            hosted_id: Some("gpt-4o-2024-08-06".into()),
            image_input: true,
            tools: true,
            streaming: true,
        };
        assert_eq!(model.upstream_id(), "gpt-4o-2024-08-06");

        model.hosted_id = Some(String::new());
        assert_eq!(model.upstream_id(), "gpt-4o");
    }

    #[test]
    fn test_provider_parsing_is_case_insensitive() {
        assert_eq!(
            "OpenRouter".parse::<ModelProvider>().unwrap(),
            ModelProvider::OpenRouter
        );
        assert!("bogus".parse::<ModelProvider>().is_err());
    }

    #[test]
    fn test_upgrade_required_maps_to_upgrade_notice() {
        let notice = FailureNotice::from_error(&ChatError::UpgradeRequired("pro only".into()));
        assert_eq!(notice.severity, Severity::Warning);
        assert!(notice.upgrade_prompt);
    }
}
