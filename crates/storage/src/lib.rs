use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, QueryBuilder, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::domain::{ChatId, ChatKind, MessageId, PublicUser, UserId};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone)]
pub struct StoredUser {
    pub user_id: UserId,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub public_key: Option<String>,
    pub failed_attempts: i64,
    pub locked_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StoredChat {
    pub chat_id: ChatId,
    pub kind: ChatKind,
    pub name: Option<String>,
    pub created_by: UserId,
    pub raw_aes_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StoredChatSummary {
    pub chat: StoredChat,
    /// Counterpart username for direct chats, the stored name otherwise.
    pub display_name: String,
    pub last_message: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub unread_count: i64,
}

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub message_id: MessageId,
    pub chat_id: ChatId,
    pub sender_id: UserId,
    pub sender_name: String,
    pub content: String,
    pub sent_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadReceipt {
    pub message_ids: Vec<MessageId>,
    pub sender_ids: Vec<UserId>,
}

/// New chat row plus the membership rows that go with it.
#[derive(Debug, Clone)]
pub struct NewChat<'a> {
    pub kind: ChatKind,
    pub name: Option<&'a str>,
    pub created_by: UserId,
    pub raw_aes_key: Option<&'a str>,
    pub members: &'a [(UserId, String)],
}

const USER_COLUMNS: &str =
    "id, username, email, password_hash, public_key, failed_attempts, locked_until, created_at";
const CHAT_COLUMNS: &str = "id, kind, name, created_by, raw_aes_key, created_at";
const MESSAGE_COLUMNS: &str = "id, chat_id, sender_id, sender_name, content, sent_at, read_at";

pub fn direct_pair_key(a: UserId, b: UserId) -> String {
    let (low, high) = if a <= b { (a, b) } else { (b, a) };
    format!("{}:{}", low.0, high.0)
}

/// True when `err` came from a UNIQUE or PRIMARY KEY constraint.
pub fn is_unique_violation(err: &anyhow::Error) -> bool {
    err.downcast_ref::<sqlx::Error>()
        .and_then(sqlx::Error::as_database_error)
        .is_some_and(|db| db.is_unique_violation())
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn user_exists(&self, username: &str, email: &str) -> Result<bool> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE username = ? OR email = ?")
                .bind(username)
                .bind(email)
                .fetch_one(&self.pool)
                .await?;
        Ok(count > 0)
    }

    pub async fn create_user(
        &self,
        username: &str,
        email: &str,
        password_hash: &str,
    ) -> Result<UserId> {
        let rec = sqlx::query(
            "INSERT INTO users (username, email, password_hash, created_at) VALUES (?, ?, ?, ?) RETURNING id",
        )
        .bind(username)
        .bind(email)
        .bind(password_hash)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("failed to insert user '{username}'"))?;
        Ok(UserId(rec.get::<i64, _>(0)))
    }

    pub async fn user_by_email(&self, email: &str) -> Result<Option<StoredUser>> {
        let row = sqlx::query(&format!("SELECT {USER_COLUMNS} FROM users WHERE email = ?"))
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| user_from_row(&r)))
    }

    pub async fn user_by_id(&self, user_id: UserId) -> Result<Option<StoredUser>> {
        let row = sqlx::query(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?"))
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| user_from_row(&r)))
    }

    /// Resolves emails to user ids. Unknown emails are simply absent from the result.
    pub async fn user_ids_by_emails(&self, emails: &[String]) -> Result<Vec<(String, UserId)>> {
        if emails.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder = QueryBuilder::<Sqlite>::new("SELECT email, id FROM users WHERE email IN (");
        let mut separated = builder.separated(", ");
        for email in emails {
            separated.push_bind(email);
        }
        separated.push_unseparated(") ORDER BY id ASC");

        let rows = builder.build().fetch_all(&self.pool).await?;
        Ok(rows
            .into_iter()
            .map(|r| (r.get::<String, _>(0), UserId(r.get::<i64, _>(1))))
            .collect())
    }

    pub async fn search_users(&self, term: &str) -> Result<Vec<PublicUser>> {
        let pattern = format!("%{term}%");
        let rows = sqlx::query(
            "SELECT id, username, public_key FROM users
             WHERE username LIKE ? OR email LIKE ?
             ORDER BY id DESC",
        )
        .bind(&pattern)
        .bind(&pattern)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| public_user_from_row(&r)).collect())
    }

    pub async fn save_public_key(&self, user_id: UserId, public_key: &str) -> Result<bool> {
        let updated = sqlx::query("UPDATE users SET public_key = ? WHERE id = ?")
            .bind(public_key)
            .bind(user_id.0)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(updated > 0)
    }

    /// Bumps the failed-login counter and sets `locked_until` once the new
    /// counter reaches `max_attempts`. Returns the updated row.
    pub async fn record_failed_login(
        &self,
        user_id: UserId,
        max_attempts: i64,
        lock_until: DateTime<Utc>,
    ) -> Result<Option<StoredUser>> {
        let row = sqlx::query(&format!(
            "UPDATE users
             SET failed_attempts = failed_attempts + 1,
                 locked_until = CASE
                     WHEN failed_attempts + 1 >= ? THEN ?
                     ELSE locked_until
                 END
             WHERE id = ?
             RETURNING {USER_COLUMNS}"
        ))
        .bind(max_attempts)
        .bind(lock_until)
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| user_from_row(&r)))
    }

    pub async fn reset_failed_logins(&self, user_id: UserId) -> Result<()> {
        sqlx::query("UPDATE users SET failed_attempts = 0, locked_until = NULL WHERE id = ?")
            .bind(user_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Inserts the chat row and every membership row in a single transaction.
    pub async fn create_chat(&self, chat: NewChat<'_>) -> Result<ChatId> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        let rec = sqlx::query(
            "INSERT INTO chats (kind, name, created_by, raw_aes_key, created_at)
             VALUES (?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(chat.kind.as_str())
        .bind(chat.name)
        .bind(chat.created_by.0)
        .bind(chat.raw_aes_key)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;
        let chat_id = ChatId(rec.get::<i64, _>(0));

        for (user_id, envelope) in chat.members {
            sqlx::query(
                "INSERT INTO chat_participants (chat_id, user_id, encrypted_chat_key, joined_at)
                 VALUES (?, ?, ?, ?)
                 ON CONFLICT(chat_id, user_id) DO NOTHING",
            )
            .bind(chat_id.0)
            .bind(user_id.0)
            .bind(envelope)
            .bind(now)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to add user {user_id} to chat {chat_id}"))?;
        }

        tx.commit().await?;
        Ok(chat_id)
    }

    /// Creates the direct chat for an unordered pair unless one already exists.
    /// The UNIQUE `direct_pair` column makes concurrent callers converge on one row.
    /// Returns the chat id and whether this call created it.
    pub async fn create_direct_chat(
        &self,
        creator: UserId,
        recipient: UserId,
        creator_envelope: &str,
        recipient_envelope: &str,
    ) -> Result<(ChatId, bool)> {
        let pair = direct_pair_key(creator, recipient);
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        let inserted = sqlx::query(
            "INSERT INTO chats (kind, name, created_by, direct_pair, created_at)
             VALUES ('direct', NULL, ?, ?, ?)
             ON CONFLICT(direct_pair) DO NOTHING
             RETURNING id",
        )
        .bind(creator.0)
        .bind(&pair)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = inserted else {
            tx.rollback().await?;
            let existing = self
                .find_direct_chat(creator, recipient)
                .await?
                .context("direct chat vanished after conflict")?;
            return Ok((existing, false));
        };
        let chat_id = ChatId(row.get::<i64, _>(0));

        for (user_id, envelope) in [(creator, creator_envelope), (recipient, recipient_envelope)] {
            sqlx::query(
                "INSERT INTO chat_participants (chat_id, user_id, encrypted_chat_key, joined_at)
                 VALUES (?, ?, ?, ?)
                 ON CONFLICT(chat_id, user_id) DO NOTHING",
            )
            .bind(chat_id.0)
            .bind(user_id.0)
            .bind(envelope)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok((chat_id, true))
    }

    pub async fn find_direct_chat(&self, a: UserId, b: UserId) -> Result<Option<ChatId>> {
        let row = sqlx::query("SELECT id FROM chats WHERE kind = 'direct' AND direct_pair = ?")
            .bind(direct_pair_key(a, b))
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| ChatId(r.get::<i64, _>(0))))
    }

    pub async fn chat_by_id(&self, chat_id: ChatId) -> Result<Option<StoredChat>> {
        let row = sqlx::query(&format!("SELECT {CHAT_COLUMNS} FROM chats WHERE id = ?"))
            .bind(chat_id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| chat_from_row(&r)).transpose()
    }

    pub async fn chat_creator(&self, chat_id: ChatId) -> Result<Option<UserId>> {
        let row = sqlx::query("SELECT created_by FROM chats WHERE id = ?")
            .bind(chat_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| UserId(r.get::<i64, _>(0))))
    }

    /// Returns `false` when the user was already a member.
    pub async fn add_participant(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        envelope: &str,
    ) -> Result<bool> {
        let inserted = sqlx::query(
            "INSERT INTO chat_participants (chat_id, user_id, encrypted_chat_key, joined_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(chat_id, user_id) DO NOTHING",
        )
        .bind(chat_id.0)
        .bind(user_id.0)
        .bind(envelope)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(inserted > 0)
    }

    pub async fn remove_participant(&self, chat_id: ChatId, user_id: UserId) -> Result<bool> {
        let removed = sqlx::query("DELETE FROM chat_participants WHERE chat_id = ? AND user_id = ?")
            .bind(chat_id.0)
            .bind(user_id.0)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(removed > 0)
    }

    /// Fills an envelope that was left empty when the membership row was created.
    pub async fn fill_empty_envelope(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        envelope: &str,
    ) -> Result<bool> {
        let updated = sqlx::query(
            "UPDATE chat_participants SET encrypted_chat_key = ?
             WHERE chat_id = ? AND user_id = ? AND encrypted_chat_key = ''",
        )
        .bind(envelope)
        .bind(chat_id.0)
        .bind(user_id.0)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated > 0)
    }

    pub async fn envelope_for(&self, chat_id: ChatId, user_id: UserId) -> Result<Option<String>> {
        let row = sqlx::query(
            "SELECT encrypted_chat_key FROM chat_participants WHERE chat_id = ? AND user_id = ?",
        )
        .bind(chat_id.0)
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get::<String, _>(0)))
    }

    pub async fn is_member(&self, chat_id: ChatId, user_id: UserId) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM chat_participants WHERE chat_id = ? AND user_id = ?)",
        )
        .bind(chat_id.0)
        .bind(user_id.0)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    pub async fn list_members(&self, chat_id: ChatId) -> Result<Vec<PublicUser>> {
        let rows = sqlx::query(
            "SELECT u.id, u.username, u.public_key
             FROM chat_participants p
             INNER JOIN users u ON u.id = p.user_id
             WHERE p.chat_id = ?
             ORDER BY p.joined_at ASC, u.id ASC",
        )
        .bind(chat_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| public_user_from_row(&r)).collect())
    }

    /// Chats the user belongs to, most recent activity first, silent chats last.
    pub async fn list_chats_for_user(&self, user_id: UserId) -> Result<Vec<StoredChatSummary>> {
        let rows = sqlx::query(
            "SELECT c.id, c.kind, c.name, c.created_by, c.raw_aes_key, c.created_at,
                    (SELECT u.username
                       FROM chat_participants other
                       INNER JOIN users u ON u.id = other.user_id
                      WHERE other.chat_id = c.id AND other.user_id != ?1
                      LIMIT 1) AS counterpart,
                    (SELECT m.content FROM messages m
                      WHERE m.chat_id = c.id
                      ORDER BY m.sent_at DESC, m.id DESC LIMIT 1) AS last_message,
                    (SELECT m.sent_at FROM messages m
                      WHERE m.chat_id = c.id
                      ORDER BY m.sent_at DESC, m.id DESC LIMIT 1) AS last_message_at,
                    (SELECT COUNT(*) FROM messages m
                      WHERE m.chat_id = c.id AND m.sender_id != ?1 AND m.read_at IS NULL) AS unread
             FROM chats c
             INNER JOIN chat_participants p ON p.chat_id = c.id
             WHERE p.user_id = ?1
             ORDER BY last_message_at IS NULL, last_message_at DESC, c.id DESC",
        )
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|r| {
                let chat = chat_from_row(&r)?;
                let counterpart: Option<String> = r.try_get("counterpart")?;
                let display_name = match chat.kind {
                    ChatKind::Direct => counterpart.unwrap_or_default(),
                    _ => chat.name.clone().unwrap_or_default(),
                };
                Ok(StoredChatSummary {
                    chat,
                    display_name,
                    last_message: r.try_get("last_message")?,
                    last_message_at: r.try_get("last_message_at")?,
                    unread_count: r.try_get("unread")?,
                })
            })
            .collect()
    }

    pub async fn insert_message(
        &self,
        chat_id: ChatId,
        sender_id: UserId,
        sender_name: &str,
        content: &str,
    ) -> Result<(MessageId, DateTime<Utc>)> {
        let sent_at = Utc::now();
        let rec = sqlx::query(
            "INSERT INTO messages (chat_id, sender_id, sender_name, content, sent_at)
             VALUES (?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(chat_id.0)
        .bind(sender_id.0)
        .bind(sender_name)
        .bind(content)
        .bind(sent_at)
        .fetch_one(&self.pool)
        .await?;
        Ok((MessageId(rec.get::<i64, _>(0)), sent_at))
    }

    /// Newest first.
    pub async fn list_messages(
        &self,
        chat_id: ChatId,
        offset: u32,
        limit: u32,
    ) -> Result<Vec<StoredMessage>> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM messages
             WHERE chat_id = ?
             ORDER BY sent_at DESC, id DESC
             LIMIT ? OFFSET ?"
        ))
        .bind(chat_id.0)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| message_from_row(&r)).collect())
    }

    /// Marks every unread message up to `upto` not authored by `reader` as read.
    /// One `UPDATE .. RETURNING`, so the returned ids are exactly the rows this call flipped.
    pub async fn mark_messages_read(
        &self,
        chat_id: ChatId,
        reader: UserId,
        upto: MessageId,
        read_at: DateTime<Utc>,
    ) -> Result<ReadReceipt> {
        let rows = sqlx::query(
            "UPDATE messages SET read_at = ?
             WHERE chat_id = ? AND id <= ? AND sender_id != ? AND read_at IS NULL
             RETURNING id, sender_id",
        )
        .bind(read_at)
        .bind(chat_id.0)
        .bind(upto.0)
        .bind(reader.0)
        .fetch_all(&self.pool)
        .await?;

        let mut receipt = ReadReceipt::default();
        for row in rows {
            receipt.message_ids.push(MessageId(row.get::<i64, _>(0)));
            let sender = UserId(row.get::<i64, _>(1));
            if !receipt.sender_ids.contains(&sender) {
                receipt.sender_ids.push(sender);
            }
        }
        receipt.message_ids.sort();
        receipt.sender_ids.sort();
        Ok(receipt)
    }

    pub async fn unread_count(&self, chat_id: ChatId, user_id: UserId) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM messages WHERE chat_id = ? AND sender_id != ? AND read_at IS NULL",
        )
        .bind(chat_id.0)
        .bind(user_id.0)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

fn user_from_row(r: &SqliteRow) -> StoredUser {
    StoredUser {
        user_id: UserId(r.get::<i64, _>(0)),
        username: r.get::<String, _>(1),
        email: r.get::<String, _>(2),
        password_hash: r.get::<String, _>(3),
        public_key: r.get::<Option<String>, _>(4),
        failed_attempts: r.get::<i64, _>(5),
        locked_until: r.get::<Option<DateTime<Utc>>, _>(6),
        created_at: r.get::<DateTime<Utc>, _>(7),
    }
}

fn public_user_from_row(r: &SqliteRow) -> PublicUser {
    PublicUser {
        id: UserId(r.get::<i64, _>(0)),
        username: r.get::<String, _>(1),
        public_key: r.get::<Option<String>, _>(2),
    }
}

fn chat_from_row(r: &SqliteRow) -> Result<StoredChat> {
    let raw_kind = r.get::<String, _>(1);
    let kind = ChatKind::parse(&raw_kind)
        .with_context(|| format!("unknown chat kind '{raw_kind}' in chats table"))?;
    Ok(StoredChat {
        chat_id: ChatId(r.get::<i64, _>(0)),
        kind,
        name: r.get::<Option<String>, _>(2),
        created_by: UserId(r.get::<i64, _>(3)),
        raw_aes_key: r.get::<Option<String>, _>(4),
        created_at: r.get::<DateTime<Utc>, _>(5),
    })
}

fn message_from_row(r: &SqliteRow) -> StoredMessage {
    StoredMessage {
        message_id: MessageId(r.get::<i64, _>(0)),
        chat_id: ChatId(r.get::<i64, _>(1)),
        sender_id: UserId(r.get::<i64, _>(2)),
        sender_name: r.get::<String, _>(3),
        content: r.get::<String, _>(4),
        sent_at: r.get::<DateTime<Utc>, _>(5),
        read_at: r.get::<Option<DateTime<Utc>>, _>(6),
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
