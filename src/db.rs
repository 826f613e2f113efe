use crate::persistence::ChatStore;
use crate::types::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::path::{Path, PathBuf};

pub type DbPool = SqlitePool;

pub async fn init_db<P: AsRef<Path>>(path: P) -> Result<DbPool> {
    let path_str = match path.as_ref().to_str() {
        Some(s) => s,
        None => {
            return Err(ChatError::Internal(
                "Invalid database path: Path contains non-UTF8 characters".to_string(),
            )
            .into())
        }
    };
    let url = format!("sqlite:{}?mode=rwc", path_str);
    let pool = SqlitePool::connect(&url).await?;
    prepare(&pool).await?;
    Ok(pool)
}

/// Private in-memory database. One connection, since every SQLite memory
/// connection is its own database.
pub async fn init_memory_db() -> Result<DbPool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    prepare(&pool).await?;
    Ok(pool)
}

async fn prepare(pool: &DbPool) -> Result<()> {
    configure_db(pool).await?;

    if let Err(e) = sqlx::migrate!("./migrations").run(pool).await {
        return Err(ChatError::Internal(format!("Migration failed: {}", e)).into());
    }

    verify_schema_version(pool).await;
    Ok(())
}

async fn configure_db(pool: &DbPool) -> Result<()> {
    let pragmas = [
        "PRAGMA journal_mode = WAL",
        "PRAGMA synchronous = NORMAL",
        "PRAGMA busy_timeout = 5000",
        "PRAGMA foreign_keys = ON",
    ];

    for pragma in pragmas {
        sqlx::query(pragma).execute(pool).await?;
    }
    Ok(())
}

async fn verify_schema_version(pool: &DbPool) {
    let version_row: std::result::Result<(String,), sqlx::Error> =
        sqlx::query_as("SELECT value FROM schema_metadata WHERE key = 'schema_version'")
            .fetch_one(pool)
            .await;

    match version_row {
        Ok((version,)) => {
            tracing::info!("Database initialized. Schema version: {}", version);
        }
        Err(e) => {
            tracing::warn!("Could not verify schema version: {}", e);
        }
    }
}

/// [`ChatStore`] over SQLite. Image bytes live on disk under `image_dir`.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: DbPool,
    image_dir: PathBuf,
}

impl SqliteStore {
    pub fn new(pool: DbPool, image_dir: impl Into<PathBuf>) -> Self {
        Self {
            pool,
            image_dir: image_dir.into(),
        }
    }

    pub async fn open<P: AsRef<Path>>(path: P, image_dir: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self::new(init_db(path).await?, image_dir))
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub async fn get_chat(&self, chat_id: &ChatId) -> Result<Option<Chat>> {
        let row = sqlx::query(
            "SELECT id, user_id, name, assistant_id, settings_json, created_at FROM chats WHERE id = ?",
        )
        .bind(&chat_id.0)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => Ok(Some(chat_from_row(&r)?)),
            None => Ok(None),
        }
    }

    /// The chat's history in display order, with file-item links attached.
    pub async fn load_messages(&self, chat_id: &ChatId) -> Result<Vec<ChatMessage>> {
        let rows = sqlx::query(
            "SELECT * FROM messages WHERE chat_id = ? ORDER BY sequence_number ASC",
        )
        .bind(&chat_id.0)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let message = message_from_row(row)?;
            let file_items = match message.key.id() {
                Some(id) => {
                    let links: Vec<(String,)> = sqlx::query_as(
                        "SELECT file_item_id FROM message_file_items WHERE message_id = ? ORDER BY rowid",
                    )
                    .bind(&id.0)
                    .fetch_all(&self.pool)
                    .await?;
                    links.into_iter().map(|(id,)| FileItemId(id)).collect()
                }
                None => Vec::new(),
            };
            out.push(ChatMessage {
                message: crate::code_blocks::apply_to_message(message),
                file_items,
            });
        }
        Ok(out)
    }

    async fn fetch_message(&self, id: &MessageId) -> Result<Message> {
        let row = sqlx::query("SELECT * FROM messages WHERE id = ?")
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(r) => message_from_row(&r),
            None => Err(ChatError::Persistence(format!("message {} not found", id)).into()),
        }
    }
}

#[async_trait]
impl ChatStore for SqliteStore {
    async fn create_chat(&self, chat: NewChat) -> Result<Chat> {
        let created = Chat {
            id: ChatId(uuid::Uuid::new_v4().to_string()),
            user_id: chat.user_id,
            name: chat.name,
            assistant_id: chat.assistant_id,
            settings: chat.settings,
            created_at: Utc::now(),
        };
        sqlx::query(
            "INSERT INTO chats (id, user_id, name, assistant_id, settings_json, created_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&created.id.0)
        .bind(&created.user_id.0)
        .bind(&created.name)
        .bind(&created.assistant_id)
        .bind(serde_json::to_string(&created.settings)?)
        .bind(created.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(created)
    }

    async fn create_messages(&self, messages: Vec<NewMessage>) -> Result<Vec<Message>> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let mut created = Vec::with_capacity(messages.len());

        for m in messages {
            let id = MessageId(uuid::Uuid::new_v4().to_string());
            sqlx::query(
                "INSERT INTO messages (id, chat_id, assistant_id, user_id, role, content, model, sequence_number, image_paths_json, annotation_json, code_blocks_json, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&id.0)
            .bind(&m.chat_id.0)
            .bind(&m.assistant_id)
            .bind(&m.user_id.0)
            .bind(m.role.as_str())
            .bind(&m.content)
            .bind(&m.model)
            .bind(m.sequence_number)
            .bind(serde_json::to_string(&m.image_paths)?)
            .bind(serde_json::to_string(&m.annotation)?)
            .bind(serde_json::to_string(&m.code_blocks)?)
            .bind(now.to_rfc3339())
            .execute(&mut *tx)
            .await?;

            created.push(Message {
                key: MessageKey::Persisted(id),
                chat_id: m.chat_id,
                assistant_id: m.assistant_id,
                user_id: m.user_id,
                role: m.role,
                content: m.content,
                model: m.model,
                sequence_number: m.sequence_number,
                image_paths: m.image_paths,
                annotation: m.annotation,
                code_blocks: m.code_blocks,
                created_at: now,
                updated_at: None,
            });
        }

        tx.commit().await?;
        Ok(created)
    }

    async fn update_message(&self, id: &MessageId, update: MessageUpdate) -> Result<Message> {
        let mut message = self.fetch_message(id).await?;
        if let Some(content) = update.content {
            message.content = content;
        }
        if let Some(code_blocks) = update.code_blocks {
            message.code_blocks = code_blocks;
        }
        if let Some(image_paths) = update.image_paths {
            message.image_paths = image_paths;
        }
        if let Some(annotation) = update.annotation {
            message.annotation = annotation;
        }
        let now = Utc::now();
        message.updated_at = Some(now);

        sqlx::query(
            "UPDATE messages SET content = ?, code_blocks_json = ?, image_paths_json = ?, annotation_json = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&message.content)
        .bind(serde_json::to_string(&message.code_blocks)?)
        .bind(serde_json::to_string(&message.image_paths)?)
        .bind(serde_json::to_string(&message.annotation)?)
        .bind(now.to_rfc3339())
        .bind(&id.0)
        .execute(&self.pool)
        .await?;

        Ok(message)
    }

    async fn delete_messages_from(&self, chat_id: &ChatId, sequence_number: i64) -> Result<()> {
        let deleted = sqlx::query("DELETE FROM messages WHERE chat_id = ? AND sequence_number >= ?")
            .bind(&chat_id.0)
            .bind(sequence_number)
            .execute(&self.pool)
            .await?;
        tracing::info!(
            "Deleted {} message(s) from chat {} starting at sequence {}",
            deleted.rows_affected(),
            chat_id.short(),
            sequence_number
        );
        Ok(())
    }

    async fn create_message_file_items(&self, items: Vec<MessageFileItem>) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;
        for item in items {
            sqlx::query(
                "INSERT OR IGNORE INTO message_file_items (message_id, file_item_id, user_id, created_at) VALUES (?, ?, ?, ?)",
            )
            .bind(&item.message_id.0)
            .bind(&item.file_item_id.0)
            .bind(&item.user_id.0)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn upload_message_image(&self, path: &str, image: ImageUpload) -> Result<String> {
        if path.split('/').any(|segment| segment == ".." || segment.is_empty()) {
            return Err(ChatError::Persistence(format!("invalid image path: {}", path)).into());
        }
        let target = self.image_dir.join(path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, &image.bytes).await?;

        sqlx::query(
            "INSERT OR REPLACE INTO message_images (path, file_name, mime_type, size_bytes, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(path)
        .bind(&image.file_name)
        .bind(&image.mime_type)
        .bind(image.bytes.len() as i64)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(path.to_string())
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| ChatError::Persistence(format!("bad timestamp {:?}: {}", raw, e)).into())
}

fn chat_from_row(row: &SqliteRow) -> Result<Chat> {
    let settings_json: String = row.try_get("settings_json")?;
    let created_at: String = row.try_get("created_at")?;
    Ok(Chat {
        id: ChatId(row.try_get("id")?),
        user_id: UserId(row.try_get("user_id")?),
        name: row.try_get("name")?,
        assistant_id: row.try_get("assistant_id")?,
        settings: serde_json::from_str(&settings_json)?,
        created_at: parse_timestamp(&created_at)?,
    })
}

fn message_from_row(row: &SqliteRow) -> Result<Message> {
    let role: String = row.try_get("role")?;
    let image_paths: String = row.try_get("image_paths_json")?;
    let annotation: String = row.try_get("annotation_json")?;
    let code_blocks: String = row.try_get("code_blocks_json")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: Option<String> = row.try_get("updated_at")?;

    Ok(Message {
        key: MessageKey::Persisted(MessageId(row.try_get("id")?)),
        chat_id: ChatId(row.try_get("chat_id")?),
        assistant_id: row.try_get("assistant_id")?,
        user_id: UserId(row.try_get("user_id")?),
        role: role.parse::<Role>()?,
        content: row.try_get("content")?,
        model: row.try_get("model")?,
        sequence_number: row.try_get("sequence_number")?,
        image_paths: serde_json::from_str(&image_paths)?,
        annotation: serde_json::from_str(&annotation)?,
        code_blocks: serde_json::from_str(&code_blocks)?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: match updated_at {
            Some(raw) => Some(parse_timestamp(&raw)?),
            None => None,
        },
    })
}
