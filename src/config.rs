use crate::constants::*;
use crate::hardening::RetryPolicy;
use crate::types::*;
use clap::Parser;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Message to send. Read from stdin when omitted.
    #[arg(long)]
    pub message: Option<String>,
    #[arg(long, default_value = "gpt-4o")]
    pub model: String,
    #[arg(long, default_value = "openai")]
    pub provider: String,
    /// Upstream model id when it differs from `--model`.
    #[arg(long)]
    pub hosted_id: Option<String>,
    #[arg(long, default_value_t = false)]
    pub tools: bool,
    #[arg(long, default_value_t = false)]
    pub no_streaming: bool,
    #[arg(long, default_value = "You are a friendly, helpful AI assistant.")]
    pub prompt: String,
    #[arg(long, default_value_t = 0.5)]
    pub temperature: f32,
    #[arg(long, default_value_t = 4096)]
    pub context_length: usize,
    /// SQLite database file. In-memory store when omitted.
    #[arg(long)]
    pub database: Option<String>,
    #[arg(long, default_value = "chatpipe-images")]
    pub image_dir: String,
    #[arg(long, default_value = "local-user")]
    pub user: String,
    #[arg(long)]
    pub api_base_url: Option<String>,
    #[arg(long)]
    pub local_base_url: Option<String>,
    #[arg(long)]
    pub max_retries: Option<u32>,
    #[arg(long)]
    pub retry_delay_ms: Option<u64>,
    #[arg(long)]
    pub request_timeout_secs: Option<u64>,
    #[arg(long)]
    pub connect_timeout_secs: Option<u64>,
    /// Also write JSON logs to daily files in this directory.
    #[arg(long)]
    pub log_dir: Option<String>,
}

impl Args {
    pub fn provider(&self) -> Result<ModelProvider> {
        Ok(self.provider.parse::<ModelProvider>()?)
    }

    pub fn llm_model(&self) -> Result<LlmModel> {
        Ok(LlmModel {
            model_id: self.model.clone(),
            model_name: self.model.clone(),
            provider: self.provider()?,
            hosted_id: self.hosted_id.clone(),
            image_input: false,
            tools: self.tools,
            streaming: !self.no_streaming,
        })
    }

    pub fn chat_settings(&self) -> ChatSettings {
        ChatSettings {
            model: self.model.clone(),
            prompt: self.prompt.clone(),
            temperature: self.temperature,
            context_length: self.context_length,
            ..Default::default()
        }
    }

    /// Environment first, then any flag given on the command line.
    pub fn pipeline_config(&self) -> PipelineConfig {
        let mut config = PipelineConfig::from_env();
        if let Some(url) = &self.api_base_url {
            config.api_base_url = url.clone();
        }
        if let Some(url) = &self.local_base_url {
            config.local_base_url = url.clone();
        }
        if let Some(n) = self.max_retries {
            config.max_retries = n;
        }
        if let Some(ms) = self.retry_delay_ms {
            config.retry_delay_ms = ms;
        }
        if let Some(secs) = self.request_timeout_secs {
            config.request_timeout_secs = secs;
        }
        if let Some(secs) = self.connect_timeout_secs {
            config.connect_timeout_secs = secs;
        }
        config
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub api_base_url: String,
    pub local_base_url: String,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub stream_channel_capacity: usize,
    pub default_source_count: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            local_base_url: DEFAULT_LOCAL_BASE_URL.to_string(),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            request_timeout_secs: 120,
            connect_timeout_secs: 10,
            stream_channel_capacity: DEFAULT_STREAM_CHANNEL_CAPACITY,
            default_source_count: DEFAULT_SOURCE_COUNT,
        }
    }
}

impl PipelineConfig {
    /// Reads `CHATPIPE_*` variables (after loading `.env`). Unset or unparsable
    /// values keep their defaults.
    pub fn from_env() -> Self {
        if let Err(e) = dotenvy::dotenv() {
            tracing::debug!("No .env loaded: {}", e);
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Self {
            api_base_url: lookup("CHATPIPE_API_BASE_URL").unwrap_or(defaults.api_base_url),
            local_base_url: lookup("CHATPIPE_LOCAL_BASE_URL").unwrap_or(defaults.local_base_url),
            max_retries: parse_var(&lookup, "CHATPIPE_MAX_RETRIES", defaults.max_retries),
            retry_delay_ms: parse_var(&lookup, "CHATPIPE_RETRY_DELAY_MS", defaults.retry_delay_ms),
            request_timeout_secs: parse_var(
                &lookup,
                "CHATPIPE_REQUEST_TIMEOUT_SECS",
                defaults.request_timeout_secs,
            ),
            connect_timeout_secs: parse_var(
                &lookup,
                "CHATPIPE_CONNECT_TIMEOUT_SECS",
                defaults.connect_timeout_secs,
            ),
            stream_channel_capacity: parse_var(
                &lookup,
                "CHATPIPE_STREAM_CHANNEL_CAPACITY",
                defaults.stream_channel_capacity,
            ),
            default_source_count: parse_var(
                &lookup,
                "CHATPIPE_SOURCE_COUNT",
                defaults.default_source_count,
            ),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.retry_delay_ms)
    }

    pub fn http_client(&self) -> Result<reqwest::Client> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.request_timeout_secs))
            .connect_timeout(Duration::from_secs(self.connect_timeout_secs))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .build()?;
        Ok(client)
    }
}

fn parse_var<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        Some(raw) => match raw.trim().parse::<T>() {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!("Ignoring invalid {}={:?}", key, raw);
                default
            }
        },
        None => default,
    }
}
