//! One chat's send/regenerate/edit/stop handler.
//!
//! The session owns the optimistic message list and the generating flags. Every
//! change replaces the whole list under the state lock and is announced on the
//! event channel, so observers never see a half-applied update.

use crate::config::PipelineConfig;
use crate::constants::*;
use crate::code_blocks;
use crate::dispatch::{DispatchInput, DispatchPlan, Dispatcher, RequestStrategy};
use crate::hardening::{fetch_chat_response, RetryPolicy};
use crate::logging;
use crate::persistence::{ChatStore, Entitlements, RetrievalRequest, Retriever};
use crate::reconcile::{reconcile, ReconcileError, ReconcileInput};
use crate::streaming::{StreamConsumer, StreamOutcome};
use crate::token_counting::Tokenizer;
use crate::types::*;
use chrono::Utc;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    MessagesReplaced(Vec<ChatMessage>),
    GeneratingChanged(bool),
    FirstTokenReceived,
    ToolInUse(String),
    TokenEstimate(usize),
    TokenCount(usize),
    Notice(FailureNotice),
    UpgradePromptRequested,
    InputRestored(String),
    ChatCreated(Chat),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionState {
    pub chat: Option<Chat>,
    pub messages: Vec<ChatMessage>,
    pub is_generating: bool,
    pub first_token_received: bool,
    pub tool_in_use: String,
    pub user_input: String,
    pub chat_file_items: Vec<FileItem>,
}

/// Everything one send needs besides the session's own state.
#[derive(Debug, Clone)]
pub struct SendRequest {
    pub content: String,
    pub settings: Option<ChatSettings>,
    pub model: Option<LlmModel>,
    pub profile: Profile,
    pub assistant: Option<Assistant>,
    pub workspace_instructions: String,
    pub selected_tools: Vec<Tool>,
    pub images: Vec<ImageUpload>,
    pub page_annotations: Vec<PageAnnotation>,
    pub use_retrieval: bool,
    /// Files attached to this message, searched along with the chat's files.
    pub file_ids: Vec<String>,
    pub source_count: Option<usize>,
}

impl SendRequest {
    pub fn new(content: impl Into<String>, settings: ChatSettings, model: LlmModel, profile: Profile) -> Self {
        Self {
            content: content.into(),
            settings: Some(settings),
            model: Some(model),
            profile,
            assistant: None,
            workspace_instructions: String::new(),
            selected_tools: Vec::new(),
            images: Vec::new(),
            page_annotations: Vec::new(),
            use_retrieval: false,
            file_ids: Vec::new(),
            source_count: None,
        }
    }
}

/// How a send left the optimistic list when it did not reach reconciliation.
enum Interrupted {
    /// Stopped before any response byte arrived.
    BeforeStream,
    Failed(ObservedError),
    /// Failed after the turn's rows were written; the list to keep.
    SavedThenFailed(ObservedError, Vec<ChatMessage>),
}

pub struct ChatSession {
    state: RwLock<SessionState>,
    events: broadcast::Sender<SessionEvent>,
    cancel: Mutex<Option<CancellationToken>>,
    store: Arc<dyn ChatStore>,
    retriever: Option<Arc<dyn Retriever>>,
    dispatcher: Dispatcher,
    client: reqwest::Client,
    retry: RetryPolicy,
    tokenizer: Arc<dyn Tokenizer>,
    stream_channel_capacity: usize,
    default_source_count: usize,
}

impl ChatSession {
    pub fn new(
        config: &PipelineConfig,
        client: reqwest::Client,
        store: Arc<dyn ChatStore>,
        entitlements: Arc<dyn Entitlements>,
        tokenizer: Arc<dyn Tokenizer>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            state: RwLock::new(SessionState {
                tool_in_use: TOOL_IN_USE_NONE.to_string(),
                ..Default::default()
            }),
            events,
            cancel: Mutex::new(None),
            store,
            retriever: None,
            dispatcher: Dispatcher::new(
                config.api_base_url.clone(),
                config.local_base_url.clone(),
                entitlements,
                tokenizer.clone(),
            ),
            client,
            retry: config.retry_policy(),
            tokenizer,
            stream_channel_capacity: config.stream_channel_capacity,
            default_source_count: config.default_source_count,
        }
    }

    pub fn with_retriever(mut self, retriever: Arc<dyn Retriever>) -> Self {
        self.retriever = Some(retriever);
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub async fn state(&self) -> SessionState {
        self.state.read().await.clone()
    }

    pub async fn messages(&self) -> Vec<ChatMessage> {
        self.state.read().await.messages.clone()
    }

    /// Loads an existing chat and its history.
    pub async fn set_messages(&self, chat: Option<Chat>, messages: Vec<ChatMessage>) {
        let mut state = self.state.write().await;
        state.chat = chat;
        state.messages = messages.clone();
        drop(state);
        self.emit(SessionEvent::MessagesReplaced(messages));
    }

    pub async fn set_chat_file_items(&self, items: Vec<FileItem>) {
        self.state.write().await.chat_file_items = items;
    }

    /// Cancels the send in flight. Returns `false` when nothing was running.
    pub async fn stop(&self) -> bool {
        match self.cancel.lock().await.as_ref() {
            Some(token) => {
                tracing::info!("[⚙️ ] Stop requested");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Resends the last user message and overwrites the last assistant reply.
    pub async fn regenerate(&self, mut request: SendRequest) -> Result<Vec<ChatMessage>> {
        let messages = self.messages().await;
        let last_is_assistant = messages
            .last()
            .map(|m| m.message.role == Role::Assistant)
            .unwrap_or(false);
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.message.role == Role::User);
        let (true, Some(last_user)) = (last_is_assistant, last_user) else {
            return Err(ChatError::Validation("Nothing to regenerate".to_string()).into());
        };
        request.content = last_user.message.display_text();
        request.images.clear();
        self.send_message(request, true).await
    }

    /// Drops every message from `sequence_number` on, then sends `request` in
    /// their place.
    pub async fn send_edit(
        &self,
        request: SendRequest,
        sequence_number: i64,
    ) -> Result<Vec<ChatMessage>> {
        let chat = {
            let state = self.state.read().await;
            if state.is_generating {
                return Err(busy());
            }
            state.chat.clone()
        };
        if let Some(chat) = &chat {
            self.store
                .delete_messages_from(&chat.id, sequence_number)
                .await?;
        }
        let truncated = {
            let mut state = self.state.write().await;
            let kept: Vec<ChatMessage> = state
                .messages
                .iter()
                .filter(|m| m.message.sequence_number < sequence_number)
                .cloned()
                .collect();
            state.messages = kept.clone();
            kept
        };
        tracing::info!(
            "[⚙️ ] Editing from sequence {} ({} message(s) kept)",
            sequence_number,
            truncated.len()
        );
        self.emit(SessionEvent::MessagesReplaced(truncated));
        self.send_message(request, false).await
    }

    pub async fn send_message(
        &self,
        request: SendRequest,
        is_regeneration: bool,
    ) -> Result<Vec<ChatMessage>> {
        let cancel = CancellationToken::new();
        let snapshot = {
            let mut state = self.state.write().await;
            if state.is_generating {
                return Err(busy());
            }
            state.is_generating = true;
            state.first_token_received = false;
            state.tool_in_use = TOOL_IN_USE_NONE.to_string();
            state.user_input.clear();
            state.clone()
        };
        *self.cancel.lock().await = Some(cancel.clone());
        self.emit(SessionEvent::GeneratingChanged(true));

        let chat_label = snapshot
            .chat
            .as_ref()
            .map(|c| c.id.short().to_string())
            .unwrap_or_else(|| "new".to_string());
        let result = self
            .run_send(&request, is_regeneration, &snapshot, &cancel)
            .instrument(logging::turn_span(&chat_label))
            .await;
        *self.cancel.lock().await = None;

        match result {
            Ok(messages) => Ok(messages),
            Err(Interrupted::BeforeStream) => {
                let messages = self
                    .finish_without_response(&snapshot, is_regeneration)
                    .await;
                Ok(messages)
            }
            Err(Interrupted::Failed(e)) => {
                self.fail(e, &request, snapshot.messages, is_regeneration)
                    .await
            }
            Err(Interrupted::SavedThenFailed(e, saved)) => {
                self.fail(e, &request, saved, is_regeneration).await
            }
        }
    }

    async fn run_send(
        &self,
        request: &SendRequest,
        is_regeneration: bool,
        snapshot: &SessionState,
        cancel: &CancellationToken,
    ) -> std::result::Result<Vec<ChatMessage>, Interrupted> {
        let (settings, model) = self
            .dispatcher
            .authorize(
                request.settings.as_ref(),
                request.model.as_ref(),
                &request.profile,
                &request.content,
                &request.selected_tools,
            )
            .await
            .map_err(Interrupted::Failed)?;

        let (optimistic, history) = self.optimistic_messages(request, snapshot, is_regeneration, model)?;
        self.replace_messages(optimistic.clone()).await;

        let message_file_items = self
            .retrieve_sources(request, snapshot, settings, cancel)
            .await
            .map_err(Interrupted::Failed)?;
        if cancel.is_cancelled() {
            return Err(Interrupted::BeforeStream);
        }

        let payload = ChatPayload {
            chat_settings: settings.clone(),
            workspace_instructions: request.workspace_instructions.clone(),
            chat_messages: history,
            assistant: request.assistant.clone(),
            message_file_items: message_file_items.clone(),
            chat_file_items: snapshot.chat_file_items.clone(),
            page_annotations: request.page_annotations.clone(),
            image_urls: image_urls(&request.images),
        };

        let plan = self.dispatcher.build_plan(
            settings,
            model,
            &DispatchInput {
                settings: Some(settings),
                model: Some(model),
                profile: &request.profile,
                payload: &payload,
                message_content: &request.content,
                selected_tools: &request.selected_tools,
                today: Utc::now().date_naive(),
            },
        );
        logging::log_request_summary(&plan);
        self.emit(SessionEvent::TokenEstimate(plan.token_estimate));
        if plan.strategy == RequestStrategy::ToolAugmented {
            let names: Vec<&str> = request.selected_tools.iter().map(|t| t.name.as_str()).collect();
            self.set_tool_in_use(&names.join(", ")).await;
        }

        let outcome = self.stream_response(&plan, cancel).await?;
        logging::log_stream_summary(&outcome);
        if let Some(count) = outcome.token_count {
            self.emit(SessionEvent::TokenCount(count));
        }

        let chat = self
            .ensure_chat(request, settings)
            .await
            .map_err(Interrupted::Failed)?;

        // Regeneration reconciles against the pre-send list so an empty reply
        // leaves the previous answer in place.
        let current = if is_regeneration {
            snapshot.messages.clone()
        } else {
            self.messages().await
        };
        let reconciled = reconcile(
            self.store.as_ref(),
            ReconcileInput {
                is_regeneration,
                chat,
                user_id: request.profile.user_id.clone(),
                model: model.model_id.clone(),
                user_input: request.content.clone(),
                generated_text: outcome.text,
                annotation: outcome.annotation,
                messages: current,
                images: request.images.clone(),
                retrieved_file_items: message_file_items,
            },
        )
        .await
        .map_err(|ReconcileError { error, saved }| match saved {
            Some(saved) => Interrupted::SavedThenFailed(error, saved),
            None => Interrupted::Failed(error),
        })?;

        {
            let mut state = self.state.write().await;
            state.messages = reconciled.clone();
            state.is_generating = false;
            state.first_token_received = false;
            state.tool_in_use = TOOL_IN_USE_NONE.to_string();
        }
        self.emit(SessionEvent::MessagesReplaced(reconciled.clone()));
        self.emit(SessionEvent::GeneratingChanged(false));
        Ok(reconciled)
    }

    /// Builds the list shown while the response streams, and the history that
    /// goes into the prompt.
    fn optimistic_messages(
        &self,
        request: &SendRequest,
        snapshot: &SessionState,
        is_regeneration: bool,
        model: &LlmModel,
    ) -> std::result::Result<(Vec<ChatMessage>, Vec<ChatMessage>), Interrupted> {
        let mut messages = snapshot.messages.clone();

        if is_regeneration {
            let Some(last) = messages.last_mut() else {
                return Err(Interrupted::Failed(
                    ChatError::Validation("Nothing to regenerate".to_string()).into(),
                ));
            };
            last.message.content.clear();
            last.message.code_blocks.clear();
            let history = messages[..messages.len() - 1].to_vec();
            return Ok((messages, history));
        }

        let chat_id = snapshot
            .chat
            .as_ref()
            .map(|c| c.id.clone())
            .unwrap_or_else(|| ChatId(String::new()));
        let next_seq = messages
            .last()
            .map(|m| m.message.sequence_number + 1)
            .unwrap_or(0);
        let now = Utc::now();
        let temp = |role: Role, content: String, sequence_number: i64, image_paths: Vec<String>| {
            ChatMessage::new(code_blocks::apply_to_message(Message {
                key: MessageKey::Pending,
                chat_id: chat_id.clone(),
                assistant_id: request.assistant.as_ref().map(|a| a.id.clone()),
                user_id: request.profile.user_id.clone(),
                role,
                content,
                model: model.model_id.clone(),
                sequence_number,
                image_paths,
                annotation: serde_json::Value::Null,
                code_blocks: Vec::new(),
                created_at: now,
                updated_at: None,
            }))
        };

        let image_paths = request.images.iter().map(|i| i.file_name.clone()).collect();
        messages.push(temp(Role::User, request.content.clone(), next_seq, image_paths));
        let history = messages.clone();
        messages.push(temp(Role::Assistant, String::new(), next_seq + 1, Vec::new()));
        Ok((messages, history))
    }

    async fn retrieve_sources(
        &self,
        request: &SendRequest,
        snapshot: &SessionState,
        settings: &ChatSettings,
        cancel: &CancellationToken,
    ) -> Result<Vec<FileItem>> {
        let mut file_ids = request.file_ids.clone();
        for item in &snapshot.chat_file_items {
            if !file_ids.contains(&item.file_id) {
                file_ids.push(item.file_id.clone());
            }
        }
        if !request.use_retrieval || file_ids.is_empty() {
            return Ok(Vec::new());
        }
        let Some(retriever) = self.retriever.as_ref() else {
            tracing::warn!("[⚙️ ] Retrieval requested but no retriever is configured");
            return Ok(Vec::new());
        };

        self.set_tool_in_use(TOOL_IN_USE_RETRIEVAL).await;
        let retrieval = retriever.retrieve(RetrievalRequest {
            user_input: request.content.clone(),
            file_ids,
            embeddings_provider: settings.embeddings_provider.clone(),
            source_count: request.source_count.unwrap_or(self.default_source_count),
        });
        let items = tokio::select! {
            biased;
            _ = cancel.cancelled() => Vec::new(),
            items = retrieval => items?,
        };
        self.set_tool_in_use(TOOL_IN_USE_NONE).await;
        Ok(items)
    }

    async fn stream_response(
        &self,
        plan: &DispatchPlan,
        cancel: &CancellationToken,
    ) -> std::result::Result<StreamOutcome, Interrupted> {
        let response = match fetch_chat_response(&self.client, plan, &self.retry, cancel).await {
            Ok(response) => response,
            Err(e) if matches!(e.inner, ChatError::Cancelled) => {
                return Err(Interrupted::BeforeStream)
            }
            Err(e) => return Err(Interrupted::Failed(e)),
        };

        let consumer = StreamConsumer::new(plan.framing, cancel.clone(), self.tokenizer.clone())
            .with_channel_capacity(self.stream_channel_capacity);
        let (mut updates, handle) = consumer.spawn(Box::pin(response.bytes_stream()));

        while let Some(update) = updates.next().await {
            let (messages, first) = {
                let mut state = self.state.write().await;
                let mut messages = state.messages.clone();
                if let Some(last) = messages.last_mut() {
                    let (content, blocks) = code_blocks::encode(&update.text);
                    last.message.content = content;
                    last.message.code_blocks = blocks;
                    if let Some(annotation) = update.annotation {
                        last.message.annotation = annotation;
                    }
                }
                state.messages = messages.clone();
                let first = !state.first_token_received;
                state.first_token_received = true;
                state.tool_in_use = TOOL_IN_USE_NONE.to_string();
                (messages, first)
            };
            if first {
                self.emit(SessionEvent::FirstTokenReceived);
                self.emit(SessionEvent::ToolInUse(TOOL_IN_USE_NONE.to_string()));
            }
            self.emit(SessionEvent::MessagesReplaced(messages));
        }

        match handle.await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(e)) => Err(Interrupted::Failed(e)),
            Err(e) => Err(Interrupted::Failed(
                ChatError::Internal(format!("stream task failed: {}", e)).into(),
            )),
        }
    }

    async fn ensure_chat(&self, request: &SendRequest, settings: &ChatSettings) -> Result<Chat> {
        if let Some(chat) = self.state.read().await.chat.clone() {
            return Ok(chat);
        }
        let chat = self
            .store
            .create_chat(NewChat {
                user_id: request.profile.user_id.clone(),
                name: crate::str_utils::chat_name(&request.content, CHAT_NAME_MAX_CHARS),
                assistant_id: request.assistant.as_ref().map(|a| a.id.clone()),
                settings: settings.clone(),
            })
            .await?;
        tracing::info!("[⚙️  -> 💾] Created chat {} ({:?})", chat.id.short(), chat.name);
        self.state.write().await.chat = Some(chat.clone());
        self.emit(SessionEvent::ChatCreated(chat.clone()));
        Ok(chat)
    }

    /// Stop before any response: a new turn keeps its pending user message
    /// and drops the empty reply, a regeneration puts the previous answer back.
    async fn finish_without_response(
        &self,
        snapshot: &SessionState,
        is_regeneration: bool,
    ) -> Vec<ChatMessage> {
        let messages = {
            let mut state = self.state.write().await;
            if is_regeneration {
                state.messages = snapshot.messages.clone();
            } else if state.messages.last().is_some_and(is_empty_pending_reply) {
                state.messages.pop();
            }
            state.is_generating = false;
            state.first_token_received = false;
            state.tool_in_use = TOOL_IN_USE_NONE.to_string();
            state.messages.clone()
        };
        tracing::info!("[⚙️ ] Send stopped before the response started");
        self.emit(SessionEvent::MessagesReplaced(messages.clone()));
        self.emit(SessionEvent::GeneratingChanged(false));
        messages
    }

    async fn fail(
        &self,
        error: ObservedError,
        request: &SendRequest,
        restore: Vec<ChatMessage>,
        is_regeneration: bool,
    ) -> Result<Vec<ChatMessage>> {
        let notice = FailureNotice::from_error(&error.inner);
        tracing::error!(
            "[⚙️ ] Send failed ({}): {}",
            if is_regeneration { "regeneration" } else { "new turn" },
            error
        );

        let messages = {
            let mut state = self.state.write().await;
            // A chat created along the way stays; only the list is rolled back,
            // and never past rows the store already holds.
            state.messages = restore;
            state.is_generating = false;
            state.first_token_received = false;
            state.tool_in_use = TOOL_IN_USE_NONE.to_string();
            state.user_input = request.content.clone();
            state.messages.clone()
        };

        self.emit(SessionEvent::MessagesReplaced(messages));
        self.emit(SessionEvent::GeneratingChanged(false));
        self.emit(SessionEvent::InputRestored(request.content.clone()));
        if notice.upgrade_prompt {
            self.emit(SessionEvent::UpgradePromptRequested);
        }
        self.emit(SessionEvent::Notice(notice));
        Err(error)
    }

    async fn replace_messages(&self, messages: Vec<ChatMessage>) {
        self.state.write().await.messages = messages.clone();
        self.emit(SessionEvent::MessagesReplaced(messages));
    }

    async fn set_tool_in_use(&self, tool: &str) {
        self.state.write().await.tool_in_use = tool.to_string();
        self.emit(SessionEvent::ToolInUse(tool.to_string()));
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

fn busy() -> ObservedError {
    ChatError::Validation("a response is already being generated".to_string()).into()
}

fn is_empty_pending_reply(entry: &ChatMessage) -> bool {
    entry.is_pending()
        && entry.message.role == Role::Assistant
        && entry.message.content.trim().is_empty()
        && entry.message.code_blocks.is_empty()
}

fn image_urls(images: &[ImageUpload]) -> HashMap<String, String> {
    images
        .iter()
        .filter_map(|i| {
            i.preview_url
                .as_ref()
                .map(|url| (i.file_name.clone(), url.clone()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{AllowAllEntitlements, MemoryStore};
    use crate::token_counting::HeuristicTokenizer;

    fn session(store: Arc<MemoryStore>) -> ChatSession {
        let config = PipelineConfig {
            api_base_url: "http://127.0.0.1:9".to_string(),
            max_retries: 0,
            retry_delay_ms: 1,
            ..Default::default()
        };
        ChatSession::new(
            &config,
            reqwest::Client::new(),
            store,
            Arc::new(AllowAllEntitlements),
            Arc::new(HeuristicTokenizer),
        )
    }

    fn request(content: &str) -> SendRequest {
        SendRequest::new(
            content,
            ChatSettings::default(),
            LlmModel {
                model_id: "gpt-4o".into(),
                model_name: "GPT-4o".into(),
                provider: ModelProvider::OpenAi,
                hosted_id: None,
                image_input: false,
                tools: false,
                streaming: true,
            },
            Profile {
                user_id: UserId("u1".into()),
                profile_context: String::new(),
                plan: "free".into(),
            },
        )
    }

    #[tokio::test]
    async fn test_validation_failure_restores_input() {
        let session = session(Arc::new(MemoryStore::new()));
        let mut events = session.subscribe();

        let err = session.send_message(request("   "), false).await.unwrap_err();
        assert!(matches!(err.inner, ChatError::Validation(_)));

        let state = session.state().await;
        assert!(!state.is_generating);
        assert!(state.messages.is_empty());
        assert_eq!(state.user_input, "   ");

        let mut notices = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, SessionEvent::Notice(_)) {
                notices += 1;
            }
        }
        assert_eq!(notices, 1);
    }

    #[tokio::test]
    async fn test_regenerate_needs_an_assistant_reply() {
        let session = session(Arc::new(MemoryStore::new()));
        let err = session.regenerate(request("x")).await.unwrap_err();
        assert!(matches!(err.inner, ChatError::Validation(_)));
    }

    #[tokio::test]
    async fn test_stop_without_send_is_noop() {
        let session = session(Arc::new(MemoryStore::new()));
        assert!(!session.stop().await);
    }
}
