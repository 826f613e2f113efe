/// Status codes the retry controller treats as transient.
pub const RETRYABLE_STATUS_CODES: &[u16] = &[504];

/// Retry defaults
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1000;

/// Chat completion endpoints (relative to the app API base URL)
pub const HOSTED_CHAT_PREFIX: &str = "/api/chat";
pub const CUSTOM_CHAT_PATH: &str = "/api/chat/custom";
pub const TOOLS_CHAT_PATH: &str = "/api/chat/tools";
pub const TOOLS_STREAM_CHAT_PATH: &str = "/api/chat/tools-stream";
pub const RETRIEVAL_PATH: &str = "/api/retrieval/retrieve";

/// Local runtime (Ollama) chat path, relative to the local base URL
pub const LOCAL_CHAT_PATH: &str = "/api/chat";

pub const DEFAULT_API_BASE_URL: &str = "http://localhost:3000";
pub const DEFAULT_LOCAL_BASE_URL: &str = "http://localhost:11434";

/// User-facing failure strings
pub const MODEL_NOT_FOUND_MESSAGE: &str =
    "Model not found. Make sure the model is available for this provider.";
pub const RATE_LIMITED_MESSAGE: &str = "You are being rate limited. Please try again later.";
pub const PLAN_LIMIT_MESSAGE: &str =
    "You have reached the limit of your current plan. Upgrade to keep chatting.";
pub const PAYLOAD_TOO_LARGE_MESSAGE: &str =
    "The message is too large. Shorten it or remove some attachments.";
pub const GENERIC_FAILURE_MESSAGE: &str = "Failed to get a response from the model.";

/// Code block placeholder shape: `[CODE_BLOCK_<index>]`
pub const CODE_BLOCK_PLACEHOLDER_PREFIX: &str = "[CODE_BLOCK_";

/// Annotation key that suppresses the terminal token count
pub const SKIP_TOKEN_COUNT_KEY: &str = "skipTokenCount";

/// Chat names are cut from the first message
pub const CHAT_NAME_MAX_CHARS: usize = 100;

/// Tool-in-use marker when no tool is running
pub const TOOL_IN_USE_NONE: &str = "none";
pub const TOOL_IN_USE_RETRIEVAL: &str = "retrieval";

/// Stream limits
pub const MAX_STREAM_CHUNKS: usize = 1_000_000;
pub const DEFAULT_STREAM_CHANNEL_CAPACITY: usize = 64;

pub const DEFAULT_SOURCE_COUNT: usize = 4;

/// Context header for retrieved sources appended to the last user message
pub const RETRIEVAL_PREAMBLE: &str = "You may use the following sources if needed to answer the user's question. If you don't know the answer, say \"I don't know.\"";
