//! Request dispatcher: validates a send, checks entitlements and picks the
//! provider path. Nothing here touches the network except the entitlement
//! collaborator.

use crate::constants::*;
use crate::persistence::Entitlements;
use crate::prompt::{flavor_for, BuiltPrompt, DefaultFlavor, PromptContext, PromptFlavor};
use crate::streaming::Framing;
use crate::token_counting::Tokenizer;
use crate::types::*;
use chrono::NaiveDate;
use serde_json::{json, Value};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStrategy {
    /// Tool-calling endpoint of the app API.
    ToolAugmented,
    /// Local model runtime (Ollama).
    Local,
    /// Provider route of the app API.
    Hosted,
}

pub struct DispatchInput<'a> {
    pub settings: Option<&'a ChatSettings>,
    pub model: Option<&'a LlmModel>,
    pub profile: &'a Profile,
    /// History plus the new user message, without the assistant placeholder.
    pub payload: &'a ChatPayload,
    pub message_content: &'a str,
    pub selected_tools: &'a [Tool],
    pub today: NaiveDate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchPlan {
    pub strategy: RequestStrategy,
    pub endpoint: String,
    pub body: Value,
    pub is_hosted: bool,
    pub framing: Framing,
    pub token_estimate: usize,
}

/// Local checks that must pass before anything leaves the process.
pub fn validate_request<'a>(
    settings: Option<&'a ChatSettings>,
    model: Option<&'a LlmModel>,
    message_content: &str,
) -> Result<(&'a ChatSettings, &'a LlmModel)> {
    let settings =
        settings.ok_or_else(|| ChatError::Validation("Chat settings not found".to_string()))?;
    let model = model.ok_or_else(|| ChatError::Validation("Model not found".to_string()))?;
    if message_content.trim().is_empty() {
        return Err(ChatError::Validation("Message is empty".to_string()).into());
    }
    Ok((settings, model))
}

pub struct Dispatcher {
    api_base_url: String,
    local_base_url: String,
    entitlements: Arc<dyn Entitlements>,
    tokenizer: Arc<dyn Tokenizer>,
}

impl Dispatcher {
    pub fn new(
        api_base_url: impl Into<String>,
        local_base_url: impl Into<String>,
        entitlements: Arc<dyn Entitlements>,
        tokenizer: Arc<dyn Tokenizer>,
    ) -> Self {
        Self {
            api_base_url: api_base_url.into().trim_end_matches('/').to_string(),
            local_base_url: local_base_url.into().trim_end_matches('/').to_string(),
            entitlements,
            tokenizer,
        }
    }

    pub async fn plan(&self, input: &DispatchInput<'_>) -> Result<DispatchPlan> {
        let (settings, model) = self
            .authorize(
                input.settings,
                input.model,
                input.profile,
                input.message_content,
                input.selected_tools,
            )
            .await?;
        Ok(self.build_plan(settings, model, input))
    }

    /// Local validation followed by the plan checks for the model and, when the
    /// model can call them, the selected tools. Runs before any other request
    /// leaves the process.
    pub async fn authorize<'a>(
        &self,
        settings: Option<&'a ChatSettings>,
        model: Option<&'a LlmModel>,
        profile: &Profile,
        message_content: &str,
        selected_tools: &[Tool],
    ) -> Result<(&'a ChatSettings, &'a LlmModel)> {
        let (settings, model) = validate_request(settings, model, message_content)?;

        if !self
            .entitlements
            .validate_plan_for_model(profile, model)
            .await?
        {
            return Err(ChatError::UpgradeRequired(format!(
                "{} is not available on your plan",
                model.model_name
            ))
            .into());
        }

        let wants_tools = !selected_tools.is_empty();
        if wants_tools && !model.tools {
            tracing::warn!(
                "[⚙️ ] {} does not support tools; ignoring {} selected tool(s)",
                model.model_id,
                selected_tools.len()
            );
        }

        if wants_tools
            && model.tools
            && !self
                .entitlements
                .validate_plan_for_tools(profile, selected_tools, model)
                .await?
        {
            return Err(ChatError::UpgradeRequired(
                "Tools are not available on your plan".to_string(),
            )
            .into());
        }
        Ok((settings, model))
    }

    /// Picks the path and builds the body for an already authorized send.
    pub fn build_plan(
        &self,
        settings: &ChatSettings,
        model: &LlmModel,
        input: &DispatchInput<'_>,
    ) -> DispatchPlan {
        let ctx = PromptContext {
            profile: input.profile,
            payload: input.payload,
            model,
            today: input.today,
            tokenizer: self.tokenizer.as_ref(),
        };

        let plan = if !input.selected_tools.is_empty() && model.tools {
            self.tool_plan(&ctx, settings, input.selected_tools)
        } else if model.provider == ModelProvider::Ollama {
            self.local_plan(&ctx, settings)
        } else {
            self.hosted_plan(&ctx, settings)
        };

        tracing::info!(
            "[⚙️ ] Dispatch {:?} -> {} (~{} prompt tokens)",
            plan.strategy,
            plan.endpoint,
            plan.token_estimate
        );
        plan
    }

    fn tool_plan(
        &self,
        ctx: &PromptContext<'_>,
        settings: &ChatSettings,
        tools: &[Tool],
    ) -> DispatchPlan {
        let built = DefaultFlavor.build(ctx);
        let (path, framing) = if ctx.model.streaming {
            (TOOLS_STREAM_CHAT_PATH, Framing::DataStream)
        } else {
            (TOOLS_CHAT_PATH, Framing::PlainText)
        };
        DispatchPlan {
            strategy: RequestStrategy::ToolAugmented,
            endpoint: format!("{}{}", self.api_base_url, path),
            body: json!({
                "chatSettings": settings,
                "messages": built.messages,
                "selectedTools": tools,
            }),
            is_hosted: true,
            framing,
            token_estimate: built.token_estimate,
        }
    }

    fn local_plan(&self, ctx: &PromptContext<'_>, settings: &ChatSettings) -> DispatchPlan {
        let built = flavor_for(ctx.model.provider).build(ctx);
        DispatchPlan {
            strategy: RequestStrategy::Local,
            endpoint: format!("{}{}", self.local_base_url, LOCAL_CHAT_PATH),
            body: json!({
                "model": ctx.model.model_id,
                "messages": built.messages,
                "options": { "temperature": settings.temperature },
            }),
            is_hosted: false,
            framing: Framing::Ndjson,
            token_estimate: built.token_estimate,
        }
    }

    fn hosted_plan(&self, ctx: &PromptContext<'_>, settings: &ChatSettings) -> DispatchPlan {
        let flavor = flavor_for(ctx.model.provider);
        let BuiltPrompt {
            messages,
            system,
            token_estimate,
        } = flavor.build(ctx);

        let path = match ctx.model.provider {
            ModelProvider::Custom => CUSTOM_CHAT_PATH.to_string(),
            provider => format!("{}/{}", HOSTED_CHAT_PREFIX, provider.name()),
        };

        let mut forwarded = settings.clone();
        forwarded.model = ctx.model.upstream_id().to_string();
        let custom_model_id = match ctx.model.provider {
            ModelProvider::Custom => ctx.model.model_id.as_str(),
            _ => "",
        };

        let mut body = json!({
            "chatSettings": forwarded,
            "messages": messages,
            "customModelId": custom_model_id,
        });
        if let Some(system) = system {
            body["system"] = Value::String(system);
        }
        tracing::debug!("[⚙️ ] Built {} prompt", flavor.name());

        DispatchPlan {
            strategy: RequestStrategy::Hosted,
            endpoint: format!("{}{}", self.api_base_url, path),
            body,
            is_hosted: true,
            framing: Framing::PlainText,
            token_estimate,
        }
    }
}
