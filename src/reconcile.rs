//! Folds a finished response back into persisted rows and the in-memory list.

use crate::code_blocks;
use crate::persistence::ChatStore;
use crate::types::*;
use futures_util::future::join_all;
use serde_json::Value;

pub struct ReconcileInput {
    pub is_regeneration: bool,
    pub chat: Chat,
    pub user_id: UserId,
    pub model: String,
    pub user_input: String,
    pub generated_text: String,
    pub annotation: Option<Value>,
    /// Current list. For a new turn it ends with this send's optimistic
    /// user/assistant pair; for a regeneration it ends with the assistant
    /// entry being replaced.
    pub messages: Vec<ChatMessage>,
    pub images: Vec<ImageUpload>,
    pub retrieved_file_items: Vec<FileItem>,
}

/// A reconcile that stopped part way.
#[derive(Debug)]
pub struct ReconcileError {
    pub error: ObservedError,
    /// The rebuilt list when rows were already written before the failure.
    /// Callers must keep it, or the next send reuses taken sequence numbers.
    pub saved: Option<Vec<ChatMessage>>,
}

impl ReconcileError {
    fn unsaved(error: impl Into<ObservedError>) -> Self {
        Self {
            error: error.into(),
            saved: None,
        }
    }
}

impl std::fmt::Display for ReconcileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.error)
    }
}

pub async fn reconcile(
    store: &dyn ChatStore,
    input: ReconcileInput,
) -> std::result::Result<Vec<ChatMessage>, ReconcileError> {
    if input.is_regeneration {
        reconcile_regeneration(store, input)
            .await
            .map_err(ReconcileError::unsaved)
    } else {
        reconcile_new_turn(store, input).await
    }
}

async fn reconcile_regeneration(
    store: &dyn ChatStore,
    input: ReconcileInput,
) -> Result<Vec<ChatMessage>> {
    let text = input.generated_text.trim();
    if text.is_empty() {
        tracing::debug!("[⚙️ ] Regeneration produced no text; keeping messages as they are");
        return Ok(input.messages);
    }

    let mut messages = input.messages;
    let Some(last) = messages.last() else {
        return Err(ChatError::Persistence("no message to regenerate".to_string()).into());
    };
    if last.message.role != Role::Assistant {
        return Err(ChatError::Persistence(
            "last message is not an assistant message".to_string(),
        )
        .into());
    }
    let Some(id) = last.message.key.id().cloned() else {
        return Err(ChatError::Persistence(
            "assistant message being regenerated was never saved".to_string(),
        )
        .into());
    };

    let (content, blocks) = code_blocks::encode(text);
    let update = MessageUpdate {
        content: Some(content),
        code_blocks: Some(blocks),
        image_paths: None,
        annotation: input.annotation,
    };
    let updated = store.update_message(&id, update).await?;
    tracing::info!("[⚙️  -> 💾] Regenerated message {} ({} chars)", id, text.len());

    let file_items = messages
        .last()
        .map(|m| m.file_items.clone())
        .unwrap_or_default();
    if let Some(slot) = messages.last_mut() {
        *slot = ChatMessage {
            message: code_blocks::apply_to_message(updated),
            file_items,
        };
    }
    Ok(messages)
}

async fn reconcile_new_turn(
    store: &dyn ChatStore,
    input: ReconcileInput,
) -> std::result::Result<Vec<ChatMessage>, ReconcileError> {
    let ReconcileInput {
        chat,
        user_id,
        model,
        user_input,
        generated_text,
        annotation,
        mut messages,
        images,
        retrieved_file_items,
        ..
    } = input;

    let Some(pair_start) = messages.len().checked_sub(2) else {
        return Err(ReconcileError::unsaved(ChatError::Internal(
            "new turn without its optimistic messages".to_string(),
        )));
    };
    let optimistic = messages.split_off(pair_start);
    if optimistic.iter().any(|m| !m.is_pending()) {
        return Err(ReconcileError::unsaved(ChatError::Internal(
            "optimistic messages were already persisted".to_string(),
        )));
    }
    let history = messages;

    let mut batch: Vec<NewMessage> = Vec::new();
    let mut batch_file_items: Vec<Vec<FileItemId>> = Vec::new();
    let mut prev: Option<i64> = None;
    for (position, entry) in history.iter().enumerate() {
        if entry.is_pending() {
            let seq = next_sequence(position, prev);
            let mut row = NewMessage::from_message(&entry.message);
            row.chat_id = chat.id.clone();
            row.sequence_number = seq;
            batch.push(row);
            batch_file_items.push(entry.file_items.clone());
            prev = Some(seq);
        } else {
            prev = Some(entry.message.sequence_number);
        }
    }

    let user_seq = next_sequence(history.len(), prev);
    let assistant_seq = user_seq + 1;

    let (user_content, user_blocks) = code_blocks::encode(&user_input);
    batch.push(NewMessage {
        chat_id: chat.id.clone(),
        assistant_id: chat.assistant_id.clone(),
        user_id: user_id.clone(),
        role: Role::User,
        content: user_content,
        model: model.clone(),
        sequence_number: user_seq,
        image_paths: Vec::new(),
        annotation: Value::Null,
        code_blocks: user_blocks,
    });
    batch_file_items.push(Vec::new());

    let (assistant_content, assistant_blocks) = code_blocks::encode(&generated_text);
    batch.push(NewMessage {
        chat_id: chat.id.clone(),
        assistant_id: chat.assistant_id.clone(),
        user_id: user_id.clone(),
        role: Role::Assistant,
        content: assistant_content,
        model,
        sequence_number: assistant_seq,
        image_paths: Vec::new(),
        annotation: annotation.unwrap_or(Value::Null),
        code_blocks: assistant_blocks,
    });
    let retrieved_ids: Vec<FileItemId> =
        retrieved_file_items.iter().map(|f| f.id.clone()).collect();
    batch_file_items.push(retrieved_ids.clone());

    let batch_len = batch.len();
    let created = store
        .create_messages(batch)
        .await
        .map_err(ReconcileError::unsaved)?;
    if created.len() != batch_len {
        return Err(ReconcileError::unsaved(ChatError::Persistence(format!(
            "store returned {} rows for a batch of {}",
            created.len(),
            batch_len
        ))));
    }
    tracing::info!(
        "[⚙️  -> 💾] Saved {} message(s) for chat {}",
        batch_len,
        chat.id.short()
    );

    let mut saved = SavedTurn {
        history,
        created,
        file_items: batch_file_items,
    };
    let user_idx = batch_len - 2;
    let assistant_idx = batch_len - 1;
    let (Some(user_id_saved), Some(assistant_id_saved)) = (
        saved.created[user_idx].key.id().cloned(),
        saved.created[assistant_idx].key.id().cloned(),
    ) else {
        let error = ChatError::Persistence("store returned rows without ids".to_string());
        return Err(saved.fail(error));
    };

    if !images.is_empty() {
        let paths = upload_images(store, &user_id, &chat.id, &user_id_saved, images).await;
        if !paths.is_empty() {
            let update = MessageUpdate {
                image_paths: Some(paths),
                ..Default::default()
            };
            match store.update_message(&user_id_saved, update).await {
                Ok(updated) => saved.created[user_idx] = updated,
                Err(e) => return Err(saved.fail(e)),
            }
        }
    }

    if !retrieved_ids.is_empty() {
        let links = retrieved_ids
            .iter()
            .map(|file_item_id| MessageFileItem {
                user_id: user_id.clone(),
                message_id: assistant_id_saved.clone(),
                file_item_id: file_item_id.clone(),
            })
            .collect();
        if let Err(e) = store.create_message_file_items(links).await {
            return Err(saved.fail(e));
        }
    }

    Ok(saved.rebuild())
}

/// Rows written by `create_messages` plus what is needed to rebuild the list.
struct SavedTurn {
    history: Vec<ChatMessage>,
    created: Vec<Message>,
    file_items: Vec<Vec<FileItemId>>,
}

impl SavedTurn {
    fn rebuild(self) -> Vec<ChatMessage> {
        let mut rebuilt: Vec<ChatMessage> =
            self.history.into_iter().filter(|m| !m.is_pending()).collect();
        rebuilt.extend(
            self.created
                .into_iter()
                .zip(self.file_items)
                .map(|(message, file_items)| ChatMessage {
                    message: code_blocks::apply_to_message(message),
                    file_items,
                }),
        );
        rebuilt
    }

    fn fail(self, error: impl Into<ObservedError>) -> ReconcileError {
        let error = error.into();
        tracing::error!(
            "[⚙️  -> 💾] Turn saved but follow-up write failed: {}",
            error
        );
        ReconcileError {
            error,
            saved: Some(self.rebuild()),
        }
    }
}

/// Sequence number for the entry at `position`, never below its predecessor + 1.
fn next_sequence(position: usize, prev: Option<i64>) -> i64 {
    let position = position as i64;
    match prev {
        Some(prev) => position.max(prev + 1),
        None => position,
    }
}

/// Uploads every image concurrently. Failed uploads are logged and left out;
/// the surviving paths keep selection order.
async fn upload_images(
    store: &dyn ChatStore,
    user_id: &UserId,
    chat_id: &ChatId,
    message_id: &MessageId,
    images: Vec<ImageUpload>,
) -> Vec<String> {
    let uploads = images.into_iter().map(|image| {
        let path = format!(
            "{}/{}/{}/{}",
            user_id,
            chat_id,
            message_id,
            uuid::Uuid::new_v4()
        );
        let file_name = image.file_name.clone();
        async move {
            match store.upload_message_image(&path, image).await {
                Ok(stored) => Some(stored),
                Err(e) => {
                    tracing::warn!("[⚙️  -> 💾] Failed to upload image {}: {}", file_name, e);
                    None
                }
            }
        }
    });
    join_all(uploads).await.into_iter().flatten().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_sequence_is_monotonic() {
        assert_eq!(next_sequence(0, None), 0);
        assert_eq!(next_sequence(3, Some(1)), 3);
        // A gap left by deleted rows never sends numbers backwards.
        assert_eq!(next_sequence(2, Some(7)), 8);
    }
}
