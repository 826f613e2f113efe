//! Two-way codec between raw assistant text and its structured form.
//!
//! Fenced segments are lifted out of the prose and replaced by positional
//! `[CODE_BLOCK_<index>]` tokens; [`decode`] puts them back in fenced form.

use crate::types::{CodeBlock, Message, MessageId};
use lazy_static::lazy_static;
use regex::{Captures, Regex};

lazy_static! {
    // Opening and closing fences must start at column 0. Anything else stays prose.
    static ref FENCE_RE: Regex =
        Regex::new(r"(?ms)^```([^\n`]*)\n(.*?)^```[ \t]*$").expect("valid fence regex");
    static ref PLACEHOLDER_RE: Regex =
        Regex::new(r"\[CODE_BLOCK_(\d+)\]").expect("valid placeholder regex");
}

pub fn placeholder(index: usize) -> String {
    format!("{}{}]", crate::constants::CODE_BLOCK_PLACEHOLDER_PREFIX, index)
}

/// Splits `text` into placeholder prose plus the ordered list of fenced blocks.
pub fn encode(text: &str) -> (String, Vec<CodeBlock>) {
    encode_from(text, 0)
}

/// Like [`encode`], numbering placeholders from `start_index` so the result can be
/// appended to blocks a message already carries.
pub fn encode_from(text: &str, start_index: usize) -> (String, Vec<CodeBlock>) {
    let mut blocks = Vec::new();
    let stripped = FENCE_RE.replace_all(text, |caps: &Captures| {
        let info = caps.get(1).map(|m| m.as_str()).unwrap_or("");
        let body = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        let (language, filename) = parse_info_string(info);
        let index = start_index + blocks.len();
        blocks.push(CodeBlock {
            language,
            filename,
            code: body.strip_suffix('\n').unwrap_or(body).to_string(),
            message_id: None,
            sequence_no: index,
            info: info.to_string(),
        });
        placeholder(index)
    });
    (stripped.into_owned(), blocks)
}

/// Substitutes every placeholder with its fenced block. Unknown indices are left alone.
pub fn decode(stripped: &str, blocks: &[CodeBlock]) -> String {
    if blocks.is_empty() {
        return stripped.to_string();
    }
    PLACEHOLDER_RE
        .replace_all(stripped, |caps: &Captures| {
            let found = caps[1]
                .parse::<usize>()
                .ok()
                .and_then(|idx| blocks.iter().find(|b| b.sequence_no == idx));
            match found {
                Some(block) => render_fenced(block),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Re-runs extraction over `message.content` and stamps block ownership.
///
/// Content that is already in placeholder form is returned unchanged apart from
/// the ownership stamp.
pub fn apply_to_message(mut message: Message) -> Message {
    let start = message.code_blocks.len();
    let (content, fresh) = encode_from(&message.content, start);
    message.content = content;
    message.code_blocks.extend(fresh);
    let owner: Option<MessageId> = message.key.id().cloned();
    for block in &mut message.code_blocks {
        block.message_id = owner.clone();
    }
    message
}

fn parse_info_string(info: &str) -> (String, Option<String>) {
    let info = info.trim();
    match info.split_once(':') {
        Some((lang, file)) if !file.trim().is_empty() => {
            (lang.trim().to_string(), Some(file.trim().to_string()))
        }
        Some((lang, _)) => (lang.trim().to_string(), None),
        None => match info.split_once(char::is_whitespace) {
            Some((lang, file)) if !file.trim().is_empty() => {
                (lang.to_string(), Some(file.trim().to_string()))
            }
            _ => (info.to_string(), None),
        },
    }
}

fn render_fenced(block: &CodeBlock) -> String {
    let info = match (&block.filename, block.info.is_empty()) {
        (_, false) => block.info.clone(),
        (Some(file), true) => format!("{}:{}", block.language, file),
        (None, true) => block.language.clone(),
    };
    if block.code.is_empty() {
        format!("```{}\n```", info)
    } else {
        format!("```{}\n{}\n```", info, block.code)
    }
}
