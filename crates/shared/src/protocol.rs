use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{ChatId, ChatKind, MessageId, PublicUser, UserId};

pub const EVENT_SEND_MESSAGE: &str = "send_message";
pub const EVENT_CREATE_CHAT: &str = "create_chat";
pub const EVENT_MESSAGE_READ: &str = "message_read";

/// Inbound frame on the duplex channel. `content` is itself JSON for every
/// event except `send_message`, where it is the ciphertext.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientFrame {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<ChatId>,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedKey {
    pub email: String,
    pub encrypted_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateChatRequest {
    #[serde(rename = "type")]
    pub kind: ChatKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_email: Option<String>,
    #[serde(default)]
    pub emails: Vec<String>,
    #[serde(default)]
    pub encrypted_keys: Vec<EncryptedKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_aes_key: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ReadReceiptRequest {
    pub chat_id: ChatId,
    pub last_read_message_id: MessageId,
}

/// `message_read` content wraps the receipt in a `data` envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadReceiptEnvelope {
    #[serde(default)]
    pub event: Option<String>,
    pub data: ReadReceiptRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePayload {
    pub message_id: MessageId,
    pub chat_id: ChatId,
    pub sender_id: UserId,
    pub username: String,
    pub content: String,
    pub sent_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSummary {
    pub chat_id: ChatId,
    pub kind: ChatKind,
    pub name: String,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<DateTime<Utc>>,
    pub unread_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatDetail {
    pub chat_id: ChatId,
    pub kind: ChatKind,
    pub name: String,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_chat_key: Option<String>,
    pub participants: Vec<PublicUser>,
    pub messages: Vec<MessagePayload>,
    pub page: u32,
    pub limit: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateChatResponse {
    pub chat_id: ChatId,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skipped_emails: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantKey {
    pub user_id: UserId,
    pub encrypted_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddParticipantsRequest {
    pub participants: Vec<ParticipantKey>,
}

/// The caller's own account. Unlike [`PublicUser`] it includes the email.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: UserId,
    pub username: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicKeyResponse {
    pub user_id: UserId,
    pub public_key: String,
}

/// Outbound events, framed as `{"event": <name>, "data": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    NewMessage {
        message_id: MessageId,
        sender_id: UserId,
        username: String,
        content: String,
        chat_id: ChatId,
        sent_at: DateTime<Utc>,
    },
    NewChat {
        chat_id: ChatId,
    },
    ParticipantAdded {
        chat_id: ChatId,
        user_id: UserId,
        username: String,
        participants: Vec<PublicUser>,
    },
    ParticipantRemoved {
        chat_id: ChatId,
        user_id: UserId,
        username: String,
        participants: Vec<PublicUser>,
    },
    MessageRead {
        chat_id: ChatId,
        message_ids: Vec<MessageId>,
        last_read_message_id: MessageId,
        read_at: DateTime<Utc>,
    },
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::NewMessage { .. } => "new_message",
            ServerEvent::NewChat { .. } => "new_chat",
            ServerEvent::ParticipantAdded { .. } => "participant_added",
            ServerEvent::ParticipantRemoved { .. } => "participant_removed",
            ServerEvent::MessageRead { .. } => "message_read",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_event_is_framed_with_event_and_data() {
        let event = ServerEvent::NewChat { chat_id: ChatId(7) };
        let value = serde_json::to_value(&event).expect("json");
        assert_eq!(value["event"], "new_chat");
        assert_eq!(value["data"]["chat_id"], 7);
        assert_eq!(event.name(), "new_chat");
    }

    #[test]
    fn create_chat_request_reads_type_field() {
        let raw = r#"{"type":"group","name":"ops","emails":["b@x.com"],
            "encrypted_keys":[{"email":"b@x.com","encrypted_key":"k"}]}"#;
        let req: CreateChatRequest = serde_json::from_str(raw).expect("parse");
        assert_eq!(req.kind, ChatKind::Group);
        assert_eq!(req.encrypted_keys.len(), 1);
        assert!(req.raw_aes_key.is_none());
    }

    #[test]
    fn read_receipt_content_uses_data_envelope() {
        let raw = r#"{"event":"message_read","data":{"chat_id":3,"last_read_message_id":11}}"#;
        let envelope: ReadReceiptEnvelope = serde_json::from_str(raw).expect("parse");
        assert_eq!(envelope.data.chat_id, ChatId(3));
        assert_eq!(envelope.data.last_read_message_id, MessageId(11));
    }

    #[test]
    fn unknown_chat_type_is_rejected() {
        let raw = r#"{"type":"broadcast"}"#;
        assert!(serde_json::from_str::<CreateChatRequest>(raw).is_err());
    }
}
