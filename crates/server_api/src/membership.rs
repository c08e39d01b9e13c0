//! Membership Store: who belongs to which chat and with which key envelope.

use std::collections::{HashMap, HashSet};

use shared::{
    domain::{ChatId, ChatKind, PublicUser, UserId},
    protocol::{
        ChatDetail, ChatSummary, CreateChatRequest, CreateChatResponse, ParticipantKey,
        ServerEvent,
    },
};
use storage::{NewChat, StoredChat, StoredUser};
use tracing::{info, warn};

use crate::{
    ledger::{self, PageRequest},
    ApiContext, ChatError, Identity,
};

/// Input for a group or channel. `members` may repeat ids or include the creator.
#[derive(Debug, Clone)]
pub struct NewGroup<'a> {
    pub kind: ChatKind,
    pub name: &'a str,
    pub raw_aes_key: Option<&'a str>,
    pub members: &'a [UserId],
    pub envelopes: &'a HashMap<UserId, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupCreated {
    pub chat_id: ChatId,
    /// Members left out because no envelope was supplied for them.
    pub skipped: Vec<UserId>,
}

/// Opens the direct chat between two users, or returns the existing one.
/// A new chat needs the creator's envelope; the recipient's may be filled later.
/// For an existing chat, a side that left is added back and supplied envelopes
/// only replace empty placeholders.
pub async fn create_direct(
    ctx: &ApiContext,
    creator: UserId,
    recipient: UserId,
    creator_envelope: Option<&str>,
    recipient_envelope: Option<&str>,
) -> Result<(ChatId, bool), ChatError> {
    if creator == recipient {
        return Err(ChatError::invalid("cannot open a direct chat with yourself"));
    }
    if ctx.storage.user_by_id(recipient).await?.is_none() {
        return Err(ChatError::UserNotFound);
    }

    let (chat_id, created) = match ctx.storage.find_direct_chat(creator, recipient).await? {
        Some(existing) => (existing, false),
        None => {
            let creator_envelope = creator_envelope
                .filter(|e| !e.is_empty())
                .ok_or_else(|| ChatError::invalid("encrypted key is missing for the chat creator"))?;
            ctx.storage
                .create_direct_chat(
                    creator,
                    recipient,
                    creator_envelope,
                    recipient_envelope.unwrap_or_default(),
                )
                .await?
        }
    };

    if !created {
        for (user_id, envelope) in [(creator, creator_envelope), (recipient, recipient_envelope)] {
            let envelope = envelope.filter(|e| !e.is_empty());
            if ctx
                .storage
                .add_participant(chat_id, user_id, envelope.unwrap_or_default())
                .await?
            {
                info!(%chat_id, %user_id, "rejoined direct chat");
            } else if let Some(envelope) = envelope {
                ctx.storage.fill_empty_envelope(chat_id, user_id, envelope).await?;
            }
        }
    }

    info!(%chat_id, %creator, %recipient, created, "direct chat resolved");
    Ok((chat_id, created))
}

/// Creates a group or channel. Anyone without an envelope, the creator
/// included, is skipped and reported rather than failing the request.
pub async fn create_group(
    ctx: &ApiContext,
    creator: UserId,
    group: NewGroup<'_>,
) -> Result<GroupCreated, ChatError> {
    if group.kind == ChatKind::Direct {
        return Err(ChatError::invalid("direct chats are created with a recipient"));
    }
    let name = group.name.trim();
    if name.is_empty() {
        return Err(ChatError::invalid("name is required"));
    }
    let raw_aes_key = group.raw_aes_key.filter(|k| !k.is_empty());
    if group.kind == ChatKind::Channel && raw_aes_key.is_none() {
        return Err(ChatError::invalid("raw_aes_key is required for channels"));
    }

    let mut seen = HashSet::from([creator]);
    let others: Vec<UserId> = group
        .members
        .iter()
        .copied()
        .filter(|user_id| seen.insert(*user_id))
        .collect();
    if others.is_empty() {
        return Err(ChatError::invalid("at least one other member is required"));
    }

    let mut rows = Vec::new();
    let mut skipped = Vec::new();
    for user_id in std::iter::once(creator).chain(others) {
        match group.envelopes.get(&user_id).filter(|e| !e.is_empty()) {
            Some(envelope) => rows.push((user_id, envelope.clone())),
            None => {
                warn!(%user_id, kind = group.kind.as_str(), "no encrypted key for member, skipping");
                skipped.push(user_id);
            }
        }
    }

    let chat_id = ctx
        .storage
        .create_chat(NewChat {
            kind: group.kind,
            name: Some(name),
            created_by: creator,
            raw_aes_key,
            members: &rows,
        })
        .await?;

    info!(
        %chat_id,
        %creator,
        kind = group.kind.as_str(),
        members = rows.len(),
        skipped = skipped.len(),
        "chat created"
    );
    Ok(GroupCreated { chat_id, skipped })
}

/// Handles a `create_chat` request from either the REST surface or a duplex
/// session and announces the chat to its members.
pub async fn create_chat(
    ctx: &ApiContext,
    creator: &Identity,
    request: CreateChatRequest,
) -> Result<CreateChatResponse, ChatError> {
    let key_emails: Vec<String> = request
        .encrypted_keys
        .iter()
        .map(|k| k.email.clone())
        .collect();
    let key_owners: HashMap<String, UserId> = ctx
        .storage
        .user_ids_by_emails(&key_emails)
        .await?
        .into_iter()
        .collect();
    let mut envelopes = HashMap::new();
    for key in &request.encrypted_keys {
        match key_owners.get(&key.email) {
            Some(user_id) => {
                envelopes.insert(*user_id, key.encrypted_key.clone());
            }
            None => warn!(email = %key.email, "encrypted key for unknown user ignored"),
        }
    }

    let response = match request.kind {
        ChatKind::Direct => {
            let recipient_email = request
                .recipient_email
                .as_deref()
                .map(str::trim)
                .filter(|e| !e.is_empty())
                .ok_or_else(|| ChatError::invalid("recipient_email is required for direct chats"))?;
            let recipient = ctx
                .storage
                .user_by_email(recipient_email)
                .await?
                .ok_or(ChatError::UserNotFound)?;
            let (chat_id, _) = create_direct(
                ctx,
                creator.user_id,
                recipient.user_id,
                envelopes.get(&creator.user_id).map(String::as_str),
                envelopes.get(&recipient.user_id).map(String::as_str),
            )
            .await?;
            CreateChatResponse {
                chat_id,
                skipped_emails: Vec::new(),
            }
        }
        ChatKind::Group | ChatKind::Channel => {
            if request.emails.is_empty() || request.encrypted_keys.is_empty() {
                return Err(ChatError::invalid("emails and encrypted_keys are required"));
            }
            let member_ids: HashMap<String, UserId> = ctx
                .storage
                .user_ids_by_emails(&request.emails)
                .await?
                .into_iter()
                .collect();
            let members: Vec<UserId> = request
                .emails
                .iter()
                .filter_map(|email| member_ids.get(email).copied())
                .collect();

            let created = create_group(
                ctx,
                creator.user_id,
                NewGroup {
                    kind: request.kind,
                    name: request.name.as_deref().unwrap_or_default(),
                    raw_aes_key: request.raw_aes_key.as_deref(),
                    members: &members,
                    envelopes: &envelopes,
                },
            )
            .await?;

            let mut skipped_emails = Vec::new();
            if created.skipped.contains(&creator.user_id) {
                if let Some(me) = ctx.storage.user_by_id(creator.user_id).await? {
                    skipped_emails.push(me.email);
                }
            }
            for email in &request.emails {
                let left_out = match member_ids.get(email) {
                    Some(user_id) => created.skipped.contains(user_id),
                    None => true,
                };
                if left_out && !skipped_emails.contains(email) {
                    skipped_emails.push(email.clone());
                }
            }
            CreateChatResponse {
                chat_id: created.chat_id,
                skipped_emails,
            }
        }
    };

    announce(
        ctx,
        response.chat_id,
        &ServerEvent::NewChat {
            chat_id: response.chat_id,
        },
    )
    .await;
    Ok(response)
}

/// Adds one member and tells the chat. Re-adding an existing member is a
/// successful no-op and returns `false`.
pub async fn add_participant(
    ctx: &ApiContext,
    chat_id: ChatId,
    user_id: UserId,
    envelope: &str,
) -> Result<bool, ChatError> {
    let chat = load_chat(ctx, chat_id).await?;
    let user = check_new_participant(ctx, &chat, user_id, envelope).await?;
    insert_participant(ctx, chat_id, user, envelope).await
}

/// Creator-only bulk add. Every entry is checked before anyone is inserted,
/// so a bad entry leaves the chat untouched. Returns the ids that were not
/// already members.
pub async fn add_participants(
    ctx: &ApiContext,
    actor: UserId,
    chat_id: ChatId,
    participants: &[ParticipantKey],
) -> Result<Vec<UserId>, ChatError> {
    let chat = load_chat(ctx, chat_id).await?;
    if chat.created_by != actor {
        return Err(ChatError::NotAuthorized("only the chat creator can add participants"));
    }
    if participants.is_empty() {
        return Err(ChatError::invalid("participants are required"));
    }

    let mut checked = Vec::with_capacity(participants.len());
    for participant in participants {
        let user =
            check_new_participant(ctx, &chat, participant.user_id, &participant.encrypted_key)
                .await?;
        checked.push((user, participant.encrypted_key.as_str()));
    }

    let mut added = Vec::new();
    for (user, envelope) in checked {
        let user_id = user.user_id;
        if insert_participant(ctx, chat_id, user, envelope).await? {
            added.push(user_id);
        }
    }
    Ok(added)
}

async fn check_new_participant(
    ctx: &ApiContext,
    chat: &StoredChat,
    user_id: UserId,
    envelope: &str,
) -> Result<StoredUser, ChatError> {
    if chat.kind == ChatKind::Direct {
        return Err(ChatError::invalid("direct chats have exactly two participants"));
    }
    if envelope.is_empty() {
        return Err(ChatError::invalid("encrypted_key is required"));
    }
    ctx.storage
        .user_by_id(user_id)
        .await?
        .ok_or(ChatError::UserNotFound)
}

async fn insert_participant(
    ctx: &ApiContext,
    chat_id: ChatId,
    user: StoredUser,
    envelope: &str,
) -> Result<bool, ChatError> {
    let user_id = user.user_id;
    if !ctx.storage.add_participant(chat_id, user_id, envelope).await? {
        return Ok(false);
    }

    let participants = ctx.storage.list_members(chat_id).await?;
    info!(%chat_id, %user_id, "participant added");
    announce(
        ctx,
        chat_id,
        &ServerEvent::ParticipantAdded {
            chat_id,
            user_id,
            username: user.username,
            participants,
        },
    )
    .await;
    Ok(true)
}

/// Removes `user_id` from the chat. Allowed for the creator or the member
/// themself. The removed user is told as well as the remaining members.
pub async fn remove_participant(
    ctx: &ApiContext,
    actor: UserId,
    chat_id: ChatId,
    user_id: UserId,
) -> Result<bool, ChatError> {
    let chat = load_chat(ctx, chat_id).await?;
    if actor != user_id && actor != chat.created_by {
        return Err(ChatError::NotAuthorized(
            "only the chat creator can remove other participants",
        ));
    }

    let username = ctx
        .storage
        .user_by_id(user_id)
        .await?
        .map(|u| u.username)
        .ok_or(ChatError::UserNotFound)?;
    if !ctx.storage.remove_participant(chat_id, user_id).await? {
        return Ok(false);
    }

    let participants = ctx.storage.list_members(chat_id).await?;
    info!(%chat_id, %user_id, removed_by = %actor, "participant removed");
    let event = ServerEvent::ParticipantRemoved {
        chat_id,
        user_id,
        username,
        participants,
    };
    announce(ctx, chat_id, &event).await;
    ctx.dispatcher.notify_users(&[user_id], &event).await;
    Ok(true)
}

pub async fn is_member(
    ctx: &ApiContext,
    chat_id: ChatId,
    user_id: UserId,
) -> Result<bool, ChatError> {
    Ok(ctx.storage.is_member(chat_id, user_id).await?)
}

pub async fn is_creator(
    ctx: &ApiContext,
    chat_id: ChatId,
    user_id: UserId,
) -> Result<bool, ChatError> {
    let creator = ctx
        .storage
        .chat_creator(chat_id)
        .await?
        .ok_or(ChatError::ChatNotFound)?;
    Ok(creator == user_id)
}

pub async fn list_members(
    ctx: &ApiContext,
    chat_id: ChatId,
) -> Result<Vec<PublicUser>, ChatError> {
    Ok(ctx.storage.list_members(chat_id).await?)
}

pub async fn list_chats_for(
    ctx: &ApiContext,
    user_id: UserId,
) -> Result<Vec<ChatSummary>, ChatError> {
    let chats = ctx.storage.list_chats_for_user(user_id).await?;
    Ok(chats
        .into_iter()
        .map(|summary| ChatSummary {
            chat_id: summary.chat.chat_id,
            kind: summary.chat.kind,
            name: summary.display_name,
            created_by: summary.chat.created_by,
            created_at: summary.chat.created_at,
            last_message: summary.last_message,
            last_message_at: summary.last_message_at,
            unread_count: summary.unread_count,
        })
        .collect())
}

/// Chat metadata, the viewer's own envelope, participants and one page of history.
pub async fn get_chat(
    ctx: &ApiContext,
    viewer: UserId,
    chat_id: ChatId,
    page: PageRequest,
) -> Result<ChatDetail, ChatError> {
    let chat = load_chat(ctx, chat_id).await?;
    if !ctx.storage.is_member(chat_id, viewer).await? {
        return Err(ChatError::NotAuthorized("user is not a participant of this chat"));
    }

    let encrypted_chat_key = ctx
        .storage
        .envelope_for(chat_id, viewer)
        .await?
        .filter(|e| !e.is_empty());
    let participants = ctx.storage.list_members(chat_id).await?;
    let messages = ledger::page(&ctx.storage, chat_id, page).await?;

    let name = match chat.kind {
        ChatKind::Direct => participants
            .iter()
            .find(|p| p.id != viewer)
            .map(|p| p.username.clone())
            .unwrap_or_default(),
        _ => chat.name.clone().unwrap_or_default(),
    };

    Ok(ChatDetail {
        chat_id,
        kind: chat.kind,
        name,
        created_by: chat.created_by,
        created_at: chat.created_at,
        encrypted_chat_key,
        participants,
        messages,
        page: page.page,
        limit: page.limit,
    })
}

async fn load_chat(ctx: &ApiContext, chat_id: ChatId) -> Result<StoredChat, ChatError> {
    ctx.storage
        .chat_by_id(chat_id)
        .await?
        .ok_or(ChatError::ChatNotFound)
}

/// Broadcast after a committed change. Delivery problems never undo the change.
async fn announce(ctx: &ApiContext, chat_id: ChatId, event: &ServerEvent) {
    if let Err(error) = ctx.dispatcher.broadcast(chat_id, event).await {
        warn!(%chat_id, event = event.name(), %error, "broadcast failed");
    }
}

#[cfg(test)]
#[path = "tests/membership_tests.rs"]
mod tests;
