use crate::dispatch::DispatchPlan;
use crate::streaming::StreamOutcome;
use colored::*;
use std::panic;
use std::path::Path;
use tracing::{error, info, info_span, warn, Span};
use tracing_appender::non_blocking::WorkerGuard;
use uuid::Uuid;

pub const DEFAULT_LOG_FILTER: &str = "chatpipe=info";

/// Installs the global subscriber: env filter, human-readable stderr output,
/// and, when `log_dir` is given, daily JSON files. Keep the returned guard alive
/// for as long as file logging should flush.
pub fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    use tracing_subscriber::prelude::*;

    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => DEFAULT_LOG_FILTER.into(),
    };

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            if let Err(e) = std::fs::create_dir_all(dir) {
                eprintln!("Could not create log directory {}: {}", dir.display(), e);
            }
            let appender = tracing_appender::rolling::daily(dir, "chatpipe.json");
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let result = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .with(tracing_error::ErrorLayer::default())
        .try_init();
    if let Err(e) = result {
        eprintln!("Tracing already initialized: {}", e);
    }

    guard
}

/// Sets up a global panic hook that logs panics using tracing.
pub fn setup_panic_hook() {
    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();

        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "Unknown panic payload"
        };

        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown location".to_string());

        error!(
            target: "panic",
            message = %message,
            location = %location,
            backtrace = %backtrace,
            "FATAL: Application panicked"
        );

        original_hook(panic_info);
    }));
}

/// Span covering one send; every log line inside carries its `turn_id`.
pub fn turn_span(chat: &str) -> Span {
    let turn_id = Uuid::new_v4().to_string();
    info_span!("turn", turn_id = %turn_id, chat = %chat)
}

pub fn get_turn_id() -> String {
    match Span::current().field("turn_id").map(|v| v.to_string()) {
        Some(id) => id,
        None => "unknown".to_string(),
    }
}

pub fn log_request_summary(plan: &DispatchPlan) {
    let msg_count = plan
        .body
        .get("messages")
        .and_then(|m| m.as_array())
        .map(|m| m.len())
        .unwrap_or_default();
    let tool_count = plan
        .body
        .get("selectedTools")
        .and_then(|t| t.as_array())
        .map(|t| t.len())
        .unwrap_or_default();

    info!(
        target: "flight_recorder",
        "[REQ] Strategy: {:?} | Messages: {} | Tools: {} | Est. tokens: {}",
        plan.strategy, msg_count, tool_count, plan.token_estimate
    );
}

pub fn log_stream_summary(outcome: &StreamOutcome) {
    let tokens = match outcome.token_count {
        Some(n) => n.to_string(),
        None => "skipped".to_string(),
    };
    if outcome.cancelled {
        warn!(
            target: "flight_recorder",
            "{}", format!("[STREAM STOPPED] Kept {} chars", outcome.text.len()).yellow()
        );
    }
    info!(
        target: "flight_recorder",
        "[STREAM END] TurnID: {} | Text: {} chars | Tokens: {} | Annotation: {}",
        get_turn_id(),
        outcome.text.len(),
        tokens,
        outcome.annotation.is_some()
    );
}
