//! Message Ledger: append-only message storage, paging and read receipts.

use chrono::{DateTime, Utc};
use shared::{
    domain::{ChatId, MessageId, UserId},
    protocol::{MessagePayload, ServerEvent},
};
use storage::{ReadReceipt, Storage, StoredMessage};
use tracing::{debug, info, warn};

use crate::{ApiContext, ChatError, Identity};

pub const DEFAULT_PAGE_LIMIT: u32 = 20;
pub const MAX_PAGE_LIMIT: u32 = 100;

/// 1-based page of messages, newest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub limit: u32,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            limit: DEFAULT_PAGE_LIMIT,
        }
    }
}

impl PageRequest {
    /// Missing or non-positive values fall back to page 1 and the default
    /// limit; the limit is capped at [`MAX_PAGE_LIMIT`].
    pub fn from_query(page: Option<i64>, limit: Option<i64>) -> Self {
        let page = page
            .filter(|p| *p >= 1)
            .and_then(|p| u32::try_from(p).ok())
            .unwrap_or(1);
        let limit = limit
            .filter(|l| *l >= 1)
            .map(|l| l.min(i64::from(MAX_PAGE_LIMIT)) as u32)
            .unwrap_or(DEFAULT_PAGE_LIMIT);
        Self { page, limit }
    }

    pub fn offset(&self) -> u32 {
        (self.page - 1).saturating_mul(self.limit)
    }
}

pub async fn append(
    storage: &Storage,
    chat_id: ChatId,
    sender: &Identity,
    content: &str,
) -> Result<(MessageId, DateTime<Utc>), ChatError> {
    let (message_id, sent_at) = storage
        .insert_message(chat_id, sender.user_id, &sender.username, content)
        .await?;
    debug!(%chat_id, %message_id, sender_id = %sender.user_id, "message appended");
    Ok((message_id, sent_at))
}

pub async fn page(
    storage: &Storage,
    chat_id: ChatId,
    request: PageRequest,
) -> Result<Vec<MessagePayload>, ChatError> {
    let messages = storage
        .list_messages(chat_id, request.offset(), request.limit)
        .await?;
    Ok(messages.into_iter().map(to_payload).collect())
}

pub async fn mark_read(
    storage: &Storage,
    chat_id: ChatId,
    reader: UserId,
    upto: MessageId,
) -> Result<(ReadReceipt, DateTime<Utc>), ChatError> {
    let read_at = Utc::now();
    let receipt = storage
        .mark_messages_read(chat_id, reader, upto, read_at)
        .await?;
    Ok((receipt, read_at))
}

pub async fn unread_count(
    storage: &Storage,
    chat_id: ChatId,
    user_id: UserId,
) -> Result<i64, ChatError> {
    Ok(storage.unread_count(chat_id, user_id).await?)
}

/// Stores a message from a member and fans `new_message` out to the chat.
pub async fn send_message(
    ctx: &ApiContext,
    sender: &Identity,
    chat_id: ChatId,
    content: &str,
) -> Result<ServerEvent, ChatError> {
    if !ctx.storage.is_member(chat_id, sender.user_id).await? {
        warn!(%chat_id, user_id = %sender.user_id, "send to chat without membership");
        return Err(ChatError::NotAuthorized("user is not a participant of this chat"));
    }

    let (message_id, sent_at) = append(&ctx.storage, chat_id, sender, content).await?;
    let event = ServerEvent::NewMessage {
        message_id,
        sender_id: sender.user_id,
        username: sender.username.clone(),
        content: content.to_string(),
        chat_id,
        sent_at,
    };
    if let Err(error) = ctx.dispatcher.broadcast(chat_id, &event).await {
        warn!(%chat_id, %message_id, %error, "new_message broadcast failed");
    }
    Ok(event)
}

/// Marks everything up to `upto` as read for `reader` and tells each
/// distinct author. Returns `None` when nothing was newly read.
pub async fn acknowledge_read(
    ctx: &ApiContext,
    reader: UserId,
    chat_id: ChatId,
    upto: MessageId,
) -> Result<Option<ServerEvent>, ChatError> {
    if !ctx.storage.is_member(chat_id, reader).await? {
        return Err(ChatError::NotAuthorized("user is not a participant of this chat"));
    }

    let (receipt, read_at) = mark_read(&ctx.storage, chat_id, reader, upto).await?;
    if receipt.message_ids.is_empty() {
        debug!(%chat_id, %reader, "no unread messages");
        return Ok(None);
    }

    let event = ServerEvent::MessageRead {
        chat_id,
        message_ids: receipt.message_ids.clone(),
        last_read_message_id: upto,
        read_at,
    };
    let authors: Vec<UserId> = receipt
        .sender_ids
        .iter()
        .copied()
        .filter(|sender| *sender != reader)
        .collect();
    let delivered = ctx.dispatcher.notify_users(&authors, &event).await;
    info!(
        %chat_id,
        %reader,
        read = receipt.message_ids.len(),
        delivered,
        "messages marked read"
    );
    Ok(Some(event))
}

fn to_payload(message: StoredMessage) -> MessagePayload {
    MessagePayload {
        message_id: message.message_id,
        chat_id: message.chat_id,
        sender_id: message.sender_id,
        username: message.sender_name,
        content: message.content,
        sent_at: message.sent_at,
        read_at: message.read_at,
    }
}

#[cfg(test)]
#[path = "tests/ledger_tests.rs"]
mod tests;
