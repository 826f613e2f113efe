//! Parser for the multiplexed tool-stream framing.
//!
//! Every line is `<code>:<json>`. Code `0` carries a text delta (JSON string),
//! `2` a data payload (JSON array), `3` an error string, `8` message annotations.
//! The remaining codes (tool calls, step markers, finish) are recognised and
//! carried through as [`DataStreamPart::Control`].

use crate::types::{ChatError, Result};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum DataStreamPart {
    Text(String),
    Data(Value),
    Error(String),
    MessageAnnotations(Value),
    Control { code: char, value: Value },
}

/// `{ text, data }` view of one parsed line.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamRecord {
    pub text: String,
    pub data: Option<Value>,
}

const CONTROL_CODES: &[char] = &['9', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k'];

pub fn parse_line(line: &str) -> Result<DataStreamPart> {
    let line = line.trim_end_matches('\r');
    let (code, payload) = match line.split_once(':') {
        Some((code, payload)) if code.chars().count() == 1 => (code, payload),
        _ => {
            return Err(ChatError::Stream(format!(
                "Failed to parse stream line: missing type prefix in {:?}",
                crate::str_utils::prefix_chars(line, 80)
            ))
            .into())
        }
    };

    let value: Value = serde_json::from_str(payload).map_err(|e| {
        ChatError::Stream(format!(
            "Failed to parse stream line payload ({}): {:?}",
            e,
            crate::str_utils::prefix_chars(payload, 80)
        ))
    })?;

    let code = code.chars().next().unwrap_or_default();
    let part = match code {
        '0' => DataStreamPart::Text(expect_string(code, value)?),
        '2' => DataStreamPart::Data(value),
        '3' => DataStreamPart::Error(expect_string(code, value)?),
        '8' => DataStreamPart::MessageAnnotations(value),
        c if CONTROL_CODES.contains(&c) => DataStreamPart::Control { code: c, value },
        other => {
            return Err(ChatError::Stream(format!("Unknown stream part type '{}'", other)).into())
        }
    };
    Ok(part)
}

/// Parses a line into its `{ text, data }` record. Error parts become an `Err`.
pub fn parse_record(line: &str) -> Result<StreamRecord> {
    match parse_line(line)? {
        DataStreamPart::Text(text) => Ok(StreamRecord { text, data: None }),
        DataStreamPart::Data(data) | DataStreamPart::MessageAnnotations(data) => {
            Ok(StreamRecord {
                text: String::new(),
                data: Some(data),
            })
        }
        DataStreamPart::Error(message) => Err(ChatError::Stream(message).into()),
        DataStreamPart::Control { code, .. } => {
            tracing::trace!("Ignoring control stream part '{}'", code);
            Ok(StreamRecord::default())
        }
    }
}

fn expect_string(code: char, value: Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s),
        other => Err(ChatError::Stream(format!(
            "Stream part '{}' expected a string, got {}",
            code, other
        ))
        .into()),
    }
}
