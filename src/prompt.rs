use crate::constants::RETRIEVAL_PREAMBLE;
use crate::token_counting::{estimate_messages_tokens, Tokenizer};
use crate::types::*;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Everything a prompt builder may read.
pub struct PromptContext<'a> {
    pub profile: &'a Profile,
    pub payload: &'a ChatPayload,
    pub model: &'a LlmModel,
    pub today: NaiveDate,
    pub tokenizer: &'a dyn Tokenizer,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FinalContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl FinalContent {
    pub fn text(&self) -> String {
        match self {
            FinalContent::Text(t) => t.clone(),
            FinalContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    fn image_urls(&self) -> Vec<String> {
        match self {
            FinalContent::Text(_) => Vec::new(),
            FinalContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::ImageUrl { image_url } => Some(image_url.url.clone()),
                    ContentPart::Text { .. } => None,
                })
                .collect(),
        }
    }
}

/// OpenAI-shaped message, the common currency before a flavor reshapes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalMessage {
    pub role: Role,
    pub content: FinalContent,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BuiltPrompt {
    pub messages: Vec<Value>,
    /// Set by flavors that carry the system prompt outside the message list.
    pub system: Option<String>,
    pub token_estimate: usize,
}

pub trait PromptFlavor: Send + Sync {
    fn name(&self) -> &'static str;
    fn build(&self, ctx: &PromptContext<'_>) -> BuiltPrompt;
}

pub struct DefaultFlavor;
pub struct AnthropicFlavor;
pub struct GoogleFlavor;
pub struct OpenRouterFlavor;

/// Single registration point for provider prompt shapes.
pub fn flavor_for(provider: ModelProvider) -> &'static dyn PromptFlavor {
    match provider {
        ModelProvider::Anthropic => &AnthropicFlavor,
        ModelProvider::Google => &GoogleFlavor,
        ModelProvider::OpenRouter => &OpenRouterFlavor,
        _ => &DefaultFlavor,
    }
}

impl PromptFlavor for DefaultFlavor {
    fn name(&self) -> &'static str {
        "default"
    }

    fn build(&self, ctx: &PromptContext<'_>) -> BuiltPrompt {
        let (messages, token_estimate) = build_final_messages(ctx);
        BuiltPrompt {
            messages: messages.iter().map(openai_message).collect(),
            system: None,
            token_estimate,
        }
    }
}

impl PromptFlavor for OpenRouterFlavor {
    fn name(&self) -> &'static str {
        "openrouter"
    }

    fn build(&self, ctx: &PromptContext<'_>) -> BuiltPrompt {
        let (mut messages, token_estimate) = build_final_messages(ctx);
        if !ctx.model.image_input {
            for message in &mut messages {
                if let FinalContent::Parts(_) = message.content {
                    let dropped = message.content.image_urls().len();
                    tracing::debug!(
                        "[⚙️ ] Dropping {} image part(s) for text-only model {}",
                        dropped,
                        ctx.model.model_id
                    );
                    message.content = FinalContent::Text(message.content.text());
                }
            }
        }
        BuiltPrompt {
            messages: messages.iter().map(openai_message).collect(),
            system: None,
            token_estimate,
        }
    }
}

impl PromptFlavor for AnthropicFlavor {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn build(&self, ctx: &PromptContext<'_>) -> BuiltPrompt {
        let (messages, token_estimate) = build_final_messages(ctx);
        let (system, turns) = split_system(messages);

        let mut shaped: Vec<(Role, Vec<Value>)> = Vec::new();
        for turn in turns {
            // Conversation must open with a user turn.
            if shaped.is_empty() && turn.role != Role::User {
                continue;
            }
            let mut blocks = vec![json!({ "type": "text", "text": turn.content.text() })];
            for url in turn.content.image_urls() {
                blocks.push(anthropic_image_block(&url));
            }
            let same_role = matches!(shaped.last(), Some((role, _)) if *role == turn.role);
            if same_role {
                if let Some((_, existing)) = shaped.last_mut() {
                    existing.extend(blocks);
                }
            } else {
                shaped.push((turn.role, blocks));
            }
        }

        BuiltPrompt {
            messages: shaped
                .into_iter()
                .map(|(role, content)| json!({ "role": role.as_str(), "content": content }))
                .collect(),
            system,
            token_estimate,
        }
    }
}

impl PromptFlavor for GoogleFlavor {
    fn name(&self) -> &'static str {
        "google"
    }

    fn build(&self, ctx: &PromptContext<'_>) -> BuiltPrompt {
        let (messages, token_estimate) = build_final_messages(ctx);
        let (system, turns) = split_system(messages);

        let mut shaped: Vec<(&'static str, Vec<Value>)> = Vec::new();
        for turn in turns {
            let role = match turn.role {
                Role::Assistant => "model",
                _ => "user",
            };
            let mut parts = vec![json!({ "text": turn.content.text() })];
            for url in turn.content.image_urls() {
                parts.push(google_image_part(&url));
            }
            let same_role = matches!(shaped.last(), Some((existing_role, _)) if *existing_role == role);
            if same_role {
                if let Some((_, existing)) = shaped.last_mut() {
                    existing.extend(parts);
                }
            } else {
                shaped.push((role, parts));
            }
        }

        BuiltPrompt {
            messages: shaped
                .into_iter()
                .map(|(role, parts)| json!({ "role": role, "parts": parts }))
                .collect(),
            system,
            token_estimate,
        }
    }
}

/// System prompt assembled from the assistant persona, the date, and the
/// optional profile/workspace context.
pub fn build_base_prompt(
    prompt: &str,
    profile_context: Option<&str>,
    workspace_instructions: Option<&str>,
    assistant: Option<&Assistant>,
    today: NaiveDate,
) -> String {
    let mut full = String::new();

    if let Some(assistant) = assistant {
        full.push_str(&format!(
            "<INJECT ROLE>\nYou are not an AI. You are {}.\n</INJECT ROLE>\n\n",
            assistant.name
        ));
    }

    full.push_str(&format!("Today is {}.\n\n", today.format("%Y-%m-%d")));

    if let Some(ctx) = profile_context.filter(|c| !c.trim().is_empty()) {
        full.push_str(&format!("User Info:\n{}\n\n", ctx));
    }

    if let Some(instructions) = workspace_instructions.filter(|c| !c.trim().is_empty()) {
        full.push_str(&format!("System Instructions:\n{}\n\n", instructions));
    }

    full.push_str(&format!("User Instructions:\n{}", prompt));
    full
}

/// Builds the provider-neutral message list: system prompt first, then as much
/// recent history as fits the context window. Returns the messages and their
/// token estimate.
pub fn build_final_messages(ctx: &PromptContext<'_>) -> (Vec<FinalMessage>, usize) {
    let payload = ctx.payload;
    let settings = &payload.chat_settings;

    let system_prompt = build_base_prompt(
        &settings.prompt,
        settings
            .include_profile_context
            .then_some(ctx.profile.profile_context.as_str()),
        settings
            .include_workspace_instructions
            .then_some(payload.workspace_instructions.as_str()),
        payload.assistant.as_ref(),
        ctx.today,
    );
    let system_tokens = ctx.tokenizer.count(&system_prompt);
    let mut remaining = settings.context_length.saturating_sub(system_tokens);

    let last_user_idx = payload
        .chat_messages
        .iter()
        .rposition(|m| m.message.role == Role::User);

    let processed: Vec<FinalMessage> = payload
        .chat_messages
        .iter()
        .enumerate()
        // A reply stopped before its first token carries nothing to send.
        .filter(|(_, m)| {
            m.message.role != Role::Assistant || !m.message.display_text().trim().is_empty()
        })
        .map(|(idx, chat_message)| {
            let message = &chat_message.message;
            let mut text = message.display_text();
            if Some(idx) == last_user_idx {
                append_turn_context(&mut text, payload);
            }
            let content = if message.role == Role::User && !message.image_paths.is_empty() {
                let mut parts = vec![ContentPart::Text { text }];
                for path in &message.image_paths {
                    let url = payload
                        .image_urls
                        .get(path)
                        .cloned()
                        .unwrap_or_else(|| path.clone());
                    parts.push(ContentPart::ImageUrl {
                        image_url: ImageUrl { url },
                    });
                }
                FinalContent::Parts(parts)
            } else {
                FinalContent::Text(text)
            };
            FinalMessage {
                role: message.role,
                content,
            }
        })
        .collect();

    let mut kept: Vec<FinalMessage> = Vec::new();
    for message in processed.into_iter().rev() {
        let tokens = ctx.tokenizer.count(&message.content.text());
        if tokens <= remaining {
            remaining -= tokens;
            kept.push(message);
        } else if kept.is_empty() {
            tracing::warn!(
                "[⚙️ ] Latest message ({} tokens) exceeds the context budget; sending it alone",
                tokens
            );
            kept.push(message);
            break;
        } else {
            break;
        }
    }
    kept.reverse();

    let mut final_messages = Vec::with_capacity(kept.len() + 1);
    final_messages.push(FinalMessage {
        role: Role::System,
        content: FinalContent::Text(system_prompt),
    });
    final_messages.extend(kept);

    let texts: Vec<String> = final_messages.iter().map(|m| m.content.text()).collect();
    let estimate = estimate_messages_tokens(ctx.tokenizer, texts.iter().map(|s| s.as_str()));

    (final_messages, estimate)
}

fn append_turn_context(text: &mut String, payload: &ChatPayload) {
    if !payload.message_file_items.is_empty() {
        let sources = payload
            .message_file_items
            .iter()
            .map(|item| format!("<BEGIN SOURCE>\n{}\n</END SOURCE>", item.content))
            .collect::<Vec<_>>()
            .join("\n\n");
        text.push_str(&format!("\n\n{}\n\n{}", RETRIEVAL_PREAMBLE, sources));
    }

    if !payload.page_annotations.is_empty() {
        text.push_str("\n\nSelected page elements:");
        for annotation in &payload.page_annotations {
            text.push_str(&format!("\n- {}: {}", annotation.label, annotation.content));
        }
    }
}

fn split_system(messages: Vec<FinalMessage>) -> (Option<String>, Vec<FinalMessage>) {
    let mut system: Option<String> = None;
    let mut turns = Vec::with_capacity(messages.len());
    for message in messages {
        if message.role == Role::System {
            let text = message.content.text();
            system = Some(match system {
                Some(existing) => format!("{}\n\n{}", existing, text),
                None => text,
            });
        } else {
            turns.push(message);
        }
    }
    (system, turns)
}

fn openai_message(message: &FinalMessage) -> Value {
    json!({ "role": message.role.as_str(), "content": message.content })
}

/// Splits `data:<mime>;base64,<data>` URLs.
fn parse_data_url(url: &str) -> Option<(&str, &str)> {
    let rest = url.strip_prefix("data:")?;
    let (meta, data) = rest.split_once(',')?;
    let mime = meta.strip_suffix(";base64")?;
    Some((mime, data))
}

fn anthropic_image_block(url: &str) -> Value {
    match parse_data_url(url) {
        Some((media_type, data)) => json!({
            "type": "image",
            "source": { "type": "base64", "media_type": media_type, "data": data }
        }),
        None => json!({
            "type": "image",
            "source": { "type": "url", "url": url }
        }),
    }
}

fn google_image_part(url: &str) -> Value {
    match parse_data_url(url) {
        Some((mime_type, data)) => json!({
            "inlineData": { "mimeType": mime_type, "data": data }
        }),
        None => json!({
            "fileData": { "mimeType": "image/*", "fileUri": url }
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token_counting::HeuristicTokenizer;
    use chrono::Utc;

    fn msg(role: Role, content: &str, seq: i64) -> ChatMessage {
        ChatMessage::new(Message {
            key: MessageKey::Persisted(MessageId(format!("m{}", seq))),
            chat_id: ChatId("c1".into()),
            assistant_id: None,
            user_id: UserId("u1".into()),
            role,
            content: content.to_string(),
            model: "gpt-4o".into(),
            sequence_number: seq,
            image_paths: vec![],
            annotation: Value::Null,
            code_blocks: vec![],
            created_at: Utc::now(),
            updated_at: None,
        })
    }

    fn model(provider: ModelProvider) -> LlmModel {
        LlmModel {
            model_id: "m".into(),
            model_name: "M".into(),
            provider,
            hosted_id: None,
            image_input: false,
            tools: false,
            streaming: true,
        }
    }

    fn profile() -> Profile {
        Profile {
            user_id: UserId("u1".into()),
            profile_context: "I like Rust.".into(),
            plan: "free".into(),
        }
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, 1).unwrap()
    }

    #[test]
    fn test_base_prompt_sections() {
        let assistant = Assistant {
            id: "a".into(),
            name: "Ferris".into(),
        };
        let prompt = build_base_prompt("Be brief.", Some("I like Rust."), None, Some(&assistant), today());
        assert!(prompt.starts_with("<INJECT ROLE>"));
        assert!(prompt.contains("You are Ferris."));
        assert!(prompt.contains("Today is 2024-05-01."));
        assert!(prompt.contains("User Info:\nI like Rust."));
        assert!(!prompt.contains("System Instructions"));
        assert!(prompt.ends_with("User Instructions:\nBe brief."));
    }

    #[test]
    fn test_profile_context_respects_setting() {
        let mut payload = ChatPayload {
            chat_messages: vec![msg(Role::User, "hi", 0)],
            ..Default::default()
        };
        payload.chat_settings.include_profile_context = false;
        let profile = profile();
        let model = model(ModelProvider::OpenAi);
        let ctx = PromptContext {
            profile: &profile,
            payload: &payload,
            model: &model,
            today: today(),
            tokenizer: &HeuristicTokenizer,
        };
        let (messages, _) = build_final_messages(&ctx);
        assert!(!messages[0].content.text().contains("I like Rust."));
    }

    #[test]
    fn test_history_trimmed_newest_first() {
        let long = "word ".repeat(200);
        let mut payload = ChatPayload {
            chat_messages: vec![
                msg(Role::User, &long, 0),
                msg(Role::Assistant, "short answer", 1),
                msg(Role::User, "latest question", 2),
            ],
            ..Default::default()
        };
        payload.chat_settings.context_length = 120;
        let profile = profile();
        let model = model(ModelProvider::OpenAi);
        let ctx = PromptContext {
            profile: &profile,
            payload: &payload,
            model: &model,
            today: today(),
            tokenizer: &HeuristicTokenizer,
        };
        let (messages, estimate) = build_final_messages(&ctx);
        let texts: Vec<String> = messages.iter().map(|m| m.content.text()).collect();
        assert_eq!(messages.len(), 3, "{:?}", texts);
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(texts[1], "short answer");
        assert_eq!(texts[2], "latest question");
        assert!(estimate > 0);
    }

    #[test]
    fn test_sources_and_code_blocks_reach_the_prompt() {
        let mut user = msg(Role::User, "Explain [CODE_BLOCK_0]", 0);
        user.message.code_blocks = vec![CodeBlock {
            language: "rust".into(),
            filename: None,
            code: "let x = 1;".into(),
            message_id: None,
            sequence_no: 0,
            info: "rust".into(),
        }];
        let payload = ChatPayload {
            chat_messages: vec![user],
            message_file_items: vec![FileItem {
                id: FileItemId("f1".into()),
                file_id: "file".into(),
                content: "Rust is a language.".into(),
                tokens: 5,
            }],
            ..Default::default()
        };
        let profile = profile();
        let model = model(ModelProvider::OpenAi);
        let ctx = PromptContext {
            profile: &profile,
            payload: &payload,
            model: &model,
            today: today(),
            tokenizer: &HeuristicTokenizer,
        };
        let (messages, _) = build_final_messages(&ctx);
        let last = messages[1].content.text();
        assert!(last.contains("```rust\nlet x = 1;\n```"));
        assert!(last.contains("<BEGIN SOURCE>\nRust is a language.\n</END SOURCE>"));
    }

    #[test]
    fn test_anthropic_hoists_system_and_merges_turns() {
        let payload = ChatPayload {
            chat_messages: vec![
                msg(Role::Assistant, "greeting", 0),
                msg(Role::User, "one", 1),
                msg(Role::User, "two", 2),
            ],
            ..Default::default()
        };
        let profile = profile();
        let model = model(ModelProvider::Anthropic);
        let ctx = PromptContext {
            profile: &profile,
            payload: &payload,
            model: &model,
            today: today(),
            tokenizer: &HeuristicTokenizer,
        };
        let built = flavor_for(ModelProvider::Anthropic).build(&ctx);
        assert!(built.system.as_deref().unwrap_or("").contains("User Instructions"));
        assert_eq!(built.messages.len(), 1);
        assert_eq!(built.messages[0]["role"], "user");
        assert_eq!(built.messages[0]["content"].as_array().map(|a| a.len()), Some(2));
    }

    #[test]
    fn test_empty_assistant_turns_are_skipped() {
        let payload = ChatPayload {
            chat_messages: vec![
                msg(Role::User, "first", 0),
                msg(Role::Assistant, "", 1),
                msg(Role::User, "second", 2),
            ],
            ..Default::default()
        };
        let profile = profile();
        let model = model(ModelProvider::OpenAi);
        let ctx = PromptContext {
            profile: &profile,
            payload: &payload,
            model: &model,
            today: today(),
            tokenizer: &HeuristicTokenizer,
        };
        let (messages, _) = build_final_messages(&ctx);
        let roles: Vec<Role> = messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::System, Role::User, Role::User]);
    }

    #[test]
    fn test_google_uses_model_role() {
        let payload = ChatPayload {
            chat_messages: vec![msg(Role::User, "q", 0), msg(Role::Assistant, "a", 1)],
            ..Default::default()
        };
        let profile = profile();
        let model = model(ModelProvider::Google);
        let ctx = PromptContext {
            profile: &profile,
            payload: &payload,
            model: &model,
            today: today(),
            tokenizer: &HeuristicTokenizer,
        };
        let built = flavor_for(ModelProvider::Google).build(&ctx);
        assert_eq!(built.messages[1]["role"], "model");
        assert_eq!(built.messages[1]["parts"][0]["text"], "a");
    }

    #[test]
    fn test_openrouter_drops_images_for_text_only_models() {
        let mut user = msg(Role::User, "look", 0);
        user.message.image_paths = vec!["u1/c1/m0/img".into()];
        let payload = ChatPayload {
            chat_messages: vec![user],
            ..Default::default()
        };
        let profile = profile();
        let model = model(ModelProvider::OpenRouter);
        let ctx = PromptContext {
            profile: &profile,
            payload: &payload,
            model: &model,
            today: today(),
            tokenizer: &HeuristicTokenizer,
        };
        let built = flavor_for(ModelProvider::OpenRouter).build(&ctx);
        assert_eq!(built.messages[1]["content"], "look");

        let default = flavor_for(ModelProvider::OpenAi).build(&ctx);
        assert_eq!(default.messages[1]["content"][1]["type"], "image_url");
    }

    #[test]
    fn test_data_url_parsing() {
        assert_eq!(
            parse_data_url("data:image/png;base64,AAAA"),
            Some(("image/png", "AAAA"))
        );
        assert_eq!(parse_data_url("https://x/y.png"), None);
    }
}
