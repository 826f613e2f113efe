use crate::constants::{MAX_STREAM_CHUNKS, SKIP_TOKEN_COUNT_KEY};
use crate::data_stream;
use crate::token_counting::Tokenizer;
use crate::types::{ChatError, Result};
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

/// Body framing of a chat completion response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Raw UTF-8 text deltas (hosted endpoints, non-streaming tool endpoint).
    PlainText,
    /// Newline separated JSON objects with `message.content` (local runtime).
    Ndjson,
    /// `<code>:<json>` lines carrying text and annotation data (tool stream).
    DataStream,
}

/// Cumulative view of the response after one chunk was applied.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamUpdate {
    pub text: String,
    pub annotation: Option<Value>,
    pub chunk_index: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamOutcome {
    pub text: String,
    pub annotation: Option<Value>,
    pub cancelled: bool,
    /// `None` when the annotation asked to skip counting.
    pub token_count: Option<usize>,
}

/// Incremental decoder for one response body.
#[derive(Debug)]
pub struct FrameDecoder {
    framing: Framing,
    text: String,
    annotation: Option<Value>,
    pending: Vec<u8>,
}

impl FrameDecoder {
    pub fn new(framing: Framing) -> Self {
        Self {
            framing,
            text: String::new(),
            annotation: None,
            pending: Vec::new(),
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn annotation(&self) -> Option<&Value> {
        self.annotation.as_ref()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Result<()> {
        self.pending.extend_from_slice(chunk);
        match self.framing {
            Framing::PlainText => {
                let decoded = drain_utf8(&mut self.pending);
                self.text.push_str(&decoded);
                Ok(())
            }
            Framing::Ndjson => {
                self.push_ndjson();
                Ok(())
            }
            Framing::DataStream => {
                if self.pending.last() == Some(&b'\n') {
                    self.flush_data_stream()
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Flushes whatever is still buffered once the body has ended.
    pub fn finish(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        match self.framing {
            Framing::PlainText => {
                let rest = String::from_utf8_lossy(&self.pending).into_owned();
                self.text.push_str(&rest);
                self.pending.clear();
                Ok(())
            }
            Framing::Ndjson => {
                let rest = String::from_utf8_lossy(&self.pending).into_owned();
                self.pending.clear();
                if !rest.trim().is_empty() && !self.apply_ndjson_line(&rest) {
                    tracing::warn!(
                        "[🤖 -> ⚙️ ] Skipping malformed trailing line: {:?}",
                        crate::str_utils::prefix_chars(&rest, 80)
                    );
                }
                Ok(())
            }
            Framing::DataStream => self.flush_data_stream(),
        }
    }

    fn push_ndjson(&mut self) {
        let split_at = self
            .pending
            .iter()
            .rposition(|b| *b == b'\n')
            .map(|pos| pos + 1)
            .unwrap_or(0);
        let tail = self.pending.split_off(split_at);
        let complete = String::from_utf8_lossy(&self.pending).into_owned();

        for line in complete.split('\n') {
            if line.trim().is_empty() {
                continue;
            }
            if !self.apply_ndjson_line(line) {
                tracing::warn!(
                    "[🤖 -> ⚙️ ] Skipping malformed stream line: {:?}",
                    crate::str_utils::prefix_chars(line, 80)
                );
            }
        }

        // The unterminated tail is applied if it already parses, held otherwise.
        let consumed = match std::str::from_utf8(&tail) {
            Ok(text) => text.trim().is_empty() || self.apply_ndjson_line(text),
            Err(_) => false,
        };
        self.pending = if consumed { Vec::new() } else { tail };
    }

    /// Returns false when the line is not valid JSON.
    fn apply_ndjson_line(&mut self, line: &str) -> bool {
        match serde_json::from_str::<Value>(line.trim()) {
            Ok(value) => {
                if let Some(content) = value
                    .get("message")
                    .and_then(|m| m.get("content"))
                    .and_then(|c| c.as_str())
                {
                    self.text.push_str(content);
                }
                true
            }
            Err(_) => false,
        }
    }

    fn flush_data_stream(&mut self) -> Result<()> {
        let buffered = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        for line in buffered.split('\n') {
            if line.trim().is_empty() {
                continue;
            }
            let record = data_stream::parse_record(line)?;
            self.text.push_str(&record.text);
            if let Some(data) = record.data {
                self.annotation = Some(data);
            }
        }
        Ok(())
    }
}

/// Decodes the valid UTF-8 prefix of `buf`, leaving an incomplete trailing
/// sequence in place for the next chunk.
fn drain_utf8(buf: &mut Vec<u8>) -> String {
    match std::str::from_utf8(buf) {
        Ok(s) => {
            let out = s.to_string();
            buf.clear();
            out
        }
        Err(e) => {
            let valid = e.valid_up_to();
            let cut = match e.error_len() {
                // Incomplete sequence at the end: keep it.
                None => valid,
                // Invalid bytes in the middle: decode lossily through them.
                Some(len) => valid + len,
            };
            let out = String::from_utf8_lossy(&buf[..cut]).into_owned();
            buf.drain(..cut);
            out
        }
    }
}

/// True when the annotation carries `skipTokenCount: true`, either on a record
/// itself or on a record nested under a tool name.
pub fn skips_token_count(annotation: &Value) -> bool {
    fn record_skips(record: &Value) -> bool {
        let Some(obj) = record.as_object() else {
            return false;
        };
        if obj.get(SKIP_TOKEN_COUNT_KEY).and_then(|v| v.as_bool()) == Some(true) {
            return true;
        }
        obj.values()
            .any(|inner| inner.get(SKIP_TOKEN_COUNT_KEY).and_then(|v| v.as_bool()) == Some(true))
    }

    match annotation {
        Value::Array(items) => items.iter().any(record_skips),
        Value::Object(_) => record_skips(annotation),
        _ => false,
    }
}

pub struct StreamConsumer {
    framing: Framing,
    cancel: CancellationToken,
    tokenizer: Arc<dyn Tokenizer>,
    channel_capacity: usize,
}

impl StreamConsumer {
    pub fn new(framing: Framing, cancel: CancellationToken, tokenizer: Arc<dyn Tokenizer>) -> Self {
        Self {
            framing,
            cancel,
            tokenizer,
            channel_capacity: crate::constants::DEFAULT_STREAM_CHANNEL_CAPACITY,
        }
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    /// Reads `body` to the end (or until cancelled), sending one [`StreamUpdate`]
    /// per chunk in arrival order.
    pub async fn consume<S, E>(&self, mut body: S, tx: &mpsc::Sender<StreamUpdate>) -> Result<StreamOutcome>
    where
        S: Stream<Item = std::result::Result<Bytes, E>> + Unpin,
        E: Into<ChatError>,
    {
        let mut decoder = FrameDecoder::new(self.framing);
        let mut chunk_index = 0usize;
        let mut cancelled = false;

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    cancelled = true;
                    None
                }
                next = body.next() => next,
            };
            let Some(chunk) = next else {
                break;
            };
            let chunk = chunk?;

            chunk_index += 1;
            if chunk_index > MAX_STREAM_CHUNKS {
                tracing::error!(
                    "[🤖 -> ⚙️ ] Stream exceeded max chunk limit ({})",
                    MAX_STREAM_CHUNKS
                );
                return Err(ChatError::Stream("Stream exceeded max chunk limit".into()).into());
            }

            decoder.push(&chunk)?;
            Self::emit(tx, &decoder, chunk_index).await;
        }

        if cancelled {
            tracing::info!(
                "[⚙️ ] Stream reading was aborted after {} chunks ({} chars kept)",
                chunk_index,
                decoder.text.len()
            );
        } else {
            let before = decoder.text.len();
            decoder.finish()?;
            if decoder.text.len() != before {
                Self::emit(tx, &decoder, chunk_index + 1).await;
            }
        }

        let token_count = match decoder.annotation.as_ref() {
            Some(annotation) if skips_token_count(annotation) => None,
            _ => Some(self.tokenizer.count(&decoder.text)),
        };

        tracing::debug!(
            "[⚙️ ] Stream finished: {} chunks, {} chars, tokens={:?}",
            chunk_index,
            decoder.text.len(),
            token_count
        );

        Ok(StreamOutcome {
            text: decoder.text,
            annotation: decoder.annotation,
            cancelled,
            token_count,
        })
    }

    /// Runs [`Self::consume`] on its own task and hands back the ordered update stream.
    pub fn spawn<S, E>(self, body: S) -> (ReceiverStream<StreamUpdate>, JoinHandle<Result<StreamOutcome>>)
    where
        S: Stream<Item = std::result::Result<Bytes, E>> + Unpin + Send + 'static,
        E: Into<ChatError> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let handle = tokio::spawn(async move { self.consume(body, &tx).await });
        (ReceiverStream::new(rx), handle)
    }

    async fn emit(tx: &mpsc::Sender<StreamUpdate>, decoder: &FrameDecoder, chunk_index: usize) {
        let update = StreamUpdate {
            text: decoder.text.clone(),
            annotation: decoder.annotation.clone(),
            chunk_index,
        };
        if tx.send(update).await.is_err() {
            tracing::debug!("[⚙️ ] Stream update receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token_counting::HeuristicTokenizer;
    use serde_json::json;

    fn decode_all(framing: Framing, chunks: &[&[u8]]) -> FrameDecoder {
        let mut decoder = FrameDecoder::new(framing);
        for chunk in chunks {
            decoder.push(chunk).unwrap();
        }
        decoder.finish().unwrap();
        decoder
    }

    #[test]
    fn test_ndjson_concatenates_message_content() {
        let body = b"{\"message\":{\"content\":\"Hel\"}}\n{\"message\":{\"content\":\"lo\"}}\n";
        let decoder = decode_all(Framing::Ndjson, &[body]);
        assert_eq!(decoder.text(), "Hello");
    }

    #[test]
    fn test_ndjson_skips_malformed_lines() {
        let body = b"{\"message\":{\"content\":\"a\"}}\nnot json\n{\"message\":{\"content\":\"b\"}}\n";
        let decoder = decode_all(Framing::Ndjson, &[body]);
        assert_eq!(decoder.text(), "ab");
    }

    #[test]
    fn test_ndjson_holds_incomplete_tail() {
        let decoder = decode_all(
            Framing::Ndjson,
            &[b"{\"message\":{\"con", b"tent\":\"split\"}}\n"],
        );
        assert_eq!(decoder.text(), "split");
    }

    #[test]
    fn test_data_stream_holds_until_newline() {
        let mut decoder = FrameDecoder::new(Framing::DataStream);
        decoder.push(b"0:\"Hel").unwrap();
        assert_eq!(decoder.text(), "");
        decoder.push(b"lo\"\n0:\" there\"\n").unwrap();
        assert_eq!(decoder.text(), "Hello there");
    }

    #[test]
    fn test_data_stream_annotation_is_last_write_wins() {
        let decoder = decode_all(
            Framing::DataStream,
            &[b"2:[{\"a\":1}]\n0:\"x\"\n\n2:[{\"b\":2}]\n"],
        );
        assert_eq!(decoder.annotation(), Some(&json!([{"b": 2}])));
        assert_eq!(decoder.text(), "x");
    }

    #[test]
    fn test_data_stream_parse_error_is_terminal() {
        let mut decoder = FrameDecoder::new(Framing::DataStream);
        assert!(decoder.push(b"garbage\n").is_err());
    }

    #[test]
    fn test_plain_text_carries_split_utf8() {
        let bytes = "héllo ✓".as_bytes();
        // split inside the multi-byte check mark
        let (a, b) = bytes.split_at(bytes.len() - 1);
        let decoder = decode_all(Framing::PlainText, &[a, b]);
        assert_eq!(decoder.text(), "héllo ✓");
    }

    #[test]
    fn test_skip_token_count_shapes() {
        assert!(skips_token_count(&json!([{"web_search": {"skipTokenCount": true}}])));
        assert!(skips_token_count(&json!({"skipTokenCount": true})));
        assert!(!skips_token_count(&json!([{"web_search": {"skipTokenCount": false}}])));
        assert!(!skips_token_count(&json!("skipTokenCount")));
    }

    #[tokio::test]
    async fn test_consume_emits_update_per_chunk() {
        let chunks: Vec<std::result::Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from_static(b"Hello")),
            Ok(Bytes::from_static(b", world")),
        ];
        let consumer = StreamConsumer::new(
            Framing::PlainText,
            CancellationToken::new(),
            Arc::new(HeuristicTokenizer),
        );
        let (tx, mut rx) = mpsc::channel(8);
        let outcome = consumer
            .consume(futures_util::stream::iter(chunks), &tx)
            .await
            .unwrap();
        drop(tx);

        let mut texts = Vec::new();
        while let Some(update) = rx.recv().await {
            texts.push(update.text);
        }
        assert_eq!(texts, vec!["Hello".to_string(), "Hello, world".to_string()]);
        assert_eq!(outcome.text, "Hello, world");
        assert!(!outcome.cancelled);
        assert!(outcome.token_count.unwrap_or(0) > 0);
    }

    #[tokio::test]
    async fn test_consume_skips_token_count_when_flagged() {
        let chunks: Vec<std::result::Result<Bytes, std::io::Error>> = vec![Ok(Bytes::from_static(
            b"0:\"done\"\n2:[{\"image_gen\":{\"skipTokenCount\":true}}]\n",
        ))];
        let consumer = StreamConsumer::new(
            Framing::DataStream,
            CancellationToken::new(),
            Arc::new(HeuristicTokenizer),
        );
        let (tx, _rx) = mpsc::channel(8);
        let outcome = consumer
            .consume(futures_util::stream::iter(chunks), &tx)
            .await
            .unwrap();
        assert_eq!(outcome.text, "done");
        assert_eq!(outcome.token_count, None);
    }

    #[tokio::test]
    async fn test_cancel_keeps_partial_text() {
        let cancel = CancellationToken::new();
        let (body_tx, body_rx) = mpsc::channel::<std::result::Result<Bytes, std::io::Error>>(4);
        let consumer = StreamConsumer::new(
            Framing::PlainText,
            cancel.clone(),
            Arc::new(HeuristicTokenizer),
        );
        let (tx, mut rx) = mpsc::channel(8);

        body_tx.send(Ok(Bytes::from_static(b"partial"))).await.unwrap();
        let task = tokio::spawn(async move {
            consumer.consume(ReceiverStream::new(body_rx), &tx).await
        });

        let first = rx.recv().await.unwrap();
        assert_eq!(first.text, "partial");
        cancel.cancel();

        let outcome = task.await.unwrap().unwrap();
        assert!(outcome.cancelled);
        assert_eq!(outcome.text, "partial");
        drop(body_tx);
    }
}
