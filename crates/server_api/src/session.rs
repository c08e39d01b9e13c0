//! One authenticated duplex connection: binds on open, routes inbound frames,
//! unbinds on close.

use shared::protocol::{
    ClientFrame, CreateChatRequest, ReadReceiptEnvelope, EVENT_CREATE_CHAT, EVENT_MESSAGE_READ,
    EVENT_SEND_MESSAGE,
};
use tracing::{debug, error, info, warn};

use crate::{
    ledger, membership,
    registry::{ConnectionHandle, ConnectionId, SharedHandle},
    ApiContext, ChatError, Identity,
};

pub struct Session {
    ctx: ApiContext,
    identity: Identity,
    handle: SharedHandle,
}

impl Session {
    /// Binds the connection for `identity`, superseding any earlier one.
    pub fn open(ctx: ApiContext, identity: Identity, handle: SharedHandle) -> Self {
        let superseded = ctx.registry.bind(identity.user_id, handle.clone());
        if let Some(previous) = superseded {
            debug!(
                user_id = %identity.user_id,
                previous = %previous.connection_id(),
                "earlier connection superseded"
            );
        }
        info!(user_id = %identity.user_id, username = %identity.username, "session connected");
        Self {
            ctx,
            identity,
            handle,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.handle.connection_id()
    }

    /// Routes one inbound text frame.
    pub async fn handle_frame(&self, raw: &str) -> Result<(), ChatError> {
        let frame: ClientFrame = serde_json::from_str(raw)
            .map_err(|e| ChatError::invalid(format!("malformed frame: {e}")))?;
        let user_id = self.identity.user_id;
        debug!(%user_id, event = %frame.event, chat_id = ?frame.chat_id, "frame received");

        match frame.event.as_str() {
            EVENT_SEND_MESSAGE => {
                let chat_id = frame
                    .chat_id
                    .ok_or_else(|| ChatError::invalid("chat_id is required"))?;
                ledger::send_message(&self.ctx, &self.identity, chat_id, &frame.content).await?;
            }
            EVENT_CREATE_CHAT => {
                let request: CreateChatRequest = serde_json::from_str(&frame.content)
                    .map_err(|e| ChatError::invalid(format!("invalid create_chat request: {e}")))?;
                membership::create_chat(&self.ctx, &self.identity, request).await?;
            }
            EVENT_MESSAGE_READ => {
                let envelope: ReadReceiptEnvelope = serde_json::from_str(&frame.content)
                    .map_err(|e| ChatError::invalid(format!("invalid message_read request: {e}")))?;
                let receipt = envelope.data;
                if receipt.chat_id.0 <= 0 || receipt.last_read_message_id.0 <= 0 {
                    return Err(ChatError::invalid(
                        "chat_id and last_read_message_id must be positive",
                    ));
                }
                ledger::acknowledge_read(
                    &self.ctx,
                    user_id,
                    receipt.chat_id,
                    receipt.last_read_message_id,
                )
                .await?;
            }
            other => return Err(ChatError::invalid(format!("unknown event '{other}'"))),
        }
        Ok(())
    }

    /// Like [`Session::handle_frame`], but a failing frame is logged and the
    /// session carries on.
    pub async fn dispatch(&self, raw: &str) {
        let Err(err) = self.handle_frame(raw).await else {
            return;
        };
        let user_id = self.identity.user_id;
        match err {
            ChatError::Storage(source) => {
                error!(%user_id, error = %format!("{source:#}"), "frame failed");
            }
            other => warn!(%user_id, error = %other, "frame rejected"),
        }
    }

    /// Drops the binding if it is still ours and closes the connection.
    pub async fn close(self) {
        let user_id = self.identity.user_id;
        self.ctx.registry.unbind_if(user_id, self.handle.connection_id());
        self.handle.close().await;
        info!(%user_id, connection_id = %self.handle.connection_id(), "session disconnected");
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
