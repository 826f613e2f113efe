#![allow(clippy::manual_unwrap_or_default)]
#![allow(clippy::manual_unwrap_or)]

pub mod code_blocks;
pub mod config;
pub mod constants;
pub mod data_stream;
pub mod db;
pub mod dispatch;
pub mod hardening;
pub mod logging;
pub mod persistence;
pub mod prompt;
pub mod reconcile;
pub mod session;
pub mod str_utils;
pub mod streaming;
pub mod token_counting;
pub mod types;

pub use types::*;

pub use config::{Args, PipelineConfig};
pub use session::{ChatSession, SendRequest, SessionEvent, SessionState};
