#![allow(dead_code)]

use async_trait::async_trait;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{StatusCode, Uri};
use axum::response::Response;
use axum::Router;
use chatpipe::config::PipelineConfig;
use chatpipe::persistence::{AllowAllEntitlements, ChatStore, Entitlements, MemoryStore};
use chatpipe::session::{ChatSession, SendRequest, SessionEvent};
use chatpipe::token_counting::HeuristicTokenizer;
use chatpipe::*;
use futures_util::StreamExt;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

/// What the mock answers to one request.
#[derive(Clone)]
pub enum Reply {
    Status(u16, &'static str),
    Chunks(Vec<&'static str>),
    /// Sends the chunks, then keeps the body open forever.
    ChunksThenHang(Vec<&'static str>),
    /// Waits before sending response headers.
    Delayed(Duration, &'static str),
}

struct MockState {
    replies: Mutex<VecDeque<Reply>>,
    last: Mutex<Option<Reply>>,
    hits: AtomicUsize,
    requests: Mutex<Vec<(String, serde_json::Value)>>,
}

pub struct MockServer {
    pub base_url: String,
    state: Arc<MockState>,
}

impl MockServer {
    pub fn hits(&self) -> usize {
        self.state.hits.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<(String, serde_json::Value)> {
        self.state.requests.lock().unwrap().clone()
    }
}

/// Serves `replies` in order; the last one repeats.
pub async fn spawn_mock(replies: Vec<Reply>) -> MockServer {
    let state = Arc::new(MockState {
        replies: Mutex::new(replies.into_iter().collect()),
        last: Mutex::new(None),
        hits: AtomicUsize::new(0),
        requests: Mutex::new(Vec::new()),
    });

    let app = Router::new().fallback(handle).with_state(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    MockServer {
        base_url: format!("http://{}", addr),
        state,
    }
}

async fn handle(State(state): State<Arc<MockState>>, uri: Uri, body: Bytes) -> Response {
    state.hits.fetch_add(1, Ordering::SeqCst);
    let json = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
    state
        .requests
        .lock()
        .unwrap()
        .push((uri.path().to_string(), json));

    let reply = {
        let next = state.replies.lock().unwrap().pop_front();
        let mut last = state.last.lock().unwrap();
        match next {
            Some(reply) => {
                *last = Some(reply.clone());
                reply
            }
            None => last.clone().unwrap_or(Reply::Status(500, "")),
        }
    };

    match reply {
        Reply::Status(code, text) => Response::builder()
            .status(StatusCode::from_u16(code).unwrap())
            .body(Body::from(text))
            .unwrap(),
        Reply::Chunks(chunks) => {
            let stream = futures_util::stream::iter(
                chunks
                    .into_iter()
                    .map(|c| Ok::<_, std::io::Error>(Bytes::from_static(c.as_bytes()))),
            );
            Response::new(Body::from_stream(stream))
        }
        Reply::ChunksThenHang(chunks) => {
            let stream = futures_util::stream::iter(
                chunks
                    .into_iter()
                    .map(|c| Ok::<_, std::io::Error>(Bytes::from_static(c.as_bytes()))),
            )
            .chain(futures_util::stream::pending());
            Response::new(Body::from_stream(stream))
        }
        Reply::Delayed(delay, text) => {
            tokio::time::sleep(delay).await;
            Response::new(Body::from(text))
        }
    }
}

pub fn config(base_url: &str, max_retries: u32) -> PipelineConfig {
    PipelineConfig {
        api_base_url: base_url.to_string(),
        local_base_url: base_url.to_string(),
        max_retries,
        retry_delay_ms: 1,
        ..Default::default()
    }
}

pub fn session(base_url: &str, max_retries: u32, store: Arc<dyn ChatStore>) -> ChatSession {
    session_with(base_url, max_retries, store, Arc::new(AllowAllEntitlements))
}

pub fn session_with(
    base_url: &str,
    max_retries: u32,
    store: Arc<dyn ChatStore>,
    entitlements: Arc<dyn Entitlements>,
) -> ChatSession {
    ChatSession::new(
        &config(base_url, max_retries),
        reqwest::Client::new(),
        store,
        entitlements,
        Arc::new(HeuristicTokenizer),
    )
}

pub fn memory_store() -> Arc<MemoryStore> {
    Arc::new(MemoryStore::new())
}

pub fn model(provider: ModelProvider) -> LlmModel {
    LlmModel {
        model_id: "test-model".into(),
        model_name: "Test Model".into(),
        provider,
        hosted_id: None,
        image_input: false,
        tools: false,
        streaming: true,
    }
}

pub fn request(content: &str, provider: ModelProvider) -> SendRequest {
    SendRequest::new(
        content,
        ChatSettings::default(),
        model(provider),
        Profile {
            user_id: UserId("user-1".into()),
            profile_context: String::new(),
            plan: "pro".into(),
        },
    )
}

pub fn drain(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub fn image(name: &str) -> ImageUpload {
    ImageUpload {
        file_name: name.to_string(),
        mime_type: "image/png".to_string(),
        bytes: bytes::Bytes::from_static(b"\x89PNG"),
        preview_url: None,
    }
}

/// Store whose image uploads fail for file names containing `fail`.
pub struct FlakyUploads {
    pub inner: MemoryStore,
}

#[async_trait]
impl ChatStore for FlakyUploads {
    async fn create_chat(&self, chat: NewChat) -> Result<Chat> {
        self.inner.create_chat(chat).await
    }

    async fn create_messages(&self, messages: Vec<NewMessage>) -> Result<Vec<Message>> {
        self.inner.create_messages(messages).await
    }

    async fn update_message(&self, id: &MessageId, update: MessageUpdate) -> Result<Message> {
        self.inner.update_message(id, update).await
    }

    async fn delete_messages_from(&self, chat_id: &ChatId, sequence_number: i64) -> Result<()> {
        self.inner.delete_messages_from(chat_id, sequence_number).await
    }

    async fn create_message_file_items(&self, items: Vec<MessageFileItem>) -> Result<()> {
        self.inner.create_message_file_items(items).await
    }

    async fn upload_message_image(&self, path: &str, image: ImageUpload) -> Result<String> {
        if image.file_name.contains("fail") {
            return Err(ChatError::Persistence("bucket unavailable".to_string()).into());
        }
        self.inner.upload_message_image(path, image).await
    }
}

/// Store that fails the first `create_messages` or `update_message` call, then
/// behaves like the memory store.
pub struct FaultyStore {
    pub inner: MemoryStore,
    fail_create: AtomicBool,
    fail_update: AtomicBool,
}

impl FaultyStore {
    pub fn failing_create() -> Self {
        Self {
            inner: MemoryStore::new(),
            fail_create: AtomicBool::new(true),
            fail_update: AtomicBool::new(false),
        }
    }

    pub fn failing_update() -> Self {
        Self {
            inner: MemoryStore::new(),
            fail_create: AtomicBool::new(false),
            fail_update: AtomicBool::new(true),
        }
    }
}

#[async_trait]
impl ChatStore for FaultyStore {
    async fn create_chat(&self, chat: NewChat) -> Result<Chat> {
        self.inner.create_chat(chat).await
    }

    async fn create_messages(&self, messages: Vec<NewMessage>) -> Result<Vec<Message>> {
        if self.fail_create.swap(false, Ordering::SeqCst) {
            return Err(ChatError::Persistence("database is locked".to_string()).into());
        }
        self.inner.create_messages(messages).await
    }

    async fn update_message(&self, id: &MessageId, update: MessageUpdate) -> Result<Message> {
        if self.fail_update.swap(false, Ordering::SeqCst) {
            return Err(ChatError::Persistence("database is locked".to_string()).into());
        }
        self.inner.update_message(id, update).await
    }

    async fn delete_messages_from(&self, chat_id: &ChatId, sequence_number: i64) -> Result<()> {
        self.inner.delete_messages_from(chat_id, sequence_number).await
    }

    async fn create_message_file_items(&self, items: Vec<MessageFileItem>) -> Result<()> {
        self.inner.create_message_file_items(items).await
    }

    async fn upload_message_image(&self, path: &str, image: ImageUpload) -> Result<String> {
        self.inner.upload_message_image(path, image).await
    }
}

/// Entitlements for a plan that covers no model.
pub struct DenyAllModels;

#[async_trait]
impl Entitlements for DenyAllModels {
    async fn validate_plan_for_model(&self, _: &Profile, _: &LlmModel) -> Result<bool> {
        Ok(false)
    }

    async fn validate_plan_for_tools(&self, _: &Profile, _: &[Tool], _: &LlmModel) -> Result<bool> {
        Ok(false)
    }
}
