use std::collections::HashMap;

use chrono::{DateTime, Utc};
use shared::{
    domain::{
        ChatId, InvitationDecision, InvitationId, InvitationStatus, MessageId, MessageStatus,
        UserId, UserProfile,
    },
    error::{ApiError, ErrorCode},
    protocol::{ChatSummary, InvitationPayload, ListChatsResponse, MessagePayload},
};
use storage::{Storage, StoredInvitation, StoredMessage};

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
}

/// Creates a chat in one of two modes: `members` adds everyone up front
/// (group chats), `invite` adds only the creator and records a pending
/// invitation for the counterpart. Exactly one mode must be supplied.
pub async fn create_chat(
    ctx: &ApiContext,
    creator: &UserId,
    members: Option<Vec<UserId>>,
    invite: Option<UserId>,
    is_private: bool,
    pub_key: Option<&str>,
) -> Result<ChatId, ApiError> {
    match (members, invite) {
        (Some(members), None) => {
            let others: Vec<UserId> = members.into_iter().filter(|m| m != creator).collect();
            if others.is_empty() {
                return Err(ApiError::new(
                    ErrorCode::Validation,
                    "chat requires at least one participant besides the creator",
                ));
            }
            ctx.storage
                .create_chat(creator, &others, is_private, pub_key)
                .await
                .map_err(internal)
        }
        (None, Some(invitee)) => {
            if &invitee == creator {
                return Err(ApiError::new(
                    ErrorCode::Validation,
                    "cannot invite oneself",
                ));
            }
            // The chat must be durable before the id is handed out; the
            // invitation row lands afterwards in its own collection.
            let chat_id = ctx
                .storage
                .create_chat(creator, &[], is_private, pub_key)
                .await
                .map_err(internal)?;
            ctx.storage
                .create_invitation(chat_id, creator, &invitee)
                .await
                .map_err(internal)?;
            Ok(chat_id)
        }
        _ => Err(ApiError::new(
            ErrorCode::Validation,
            "exactly one of members or invite is required",
        )),
    }
}

/// Re-joining an existing member is a no-op success, not an error.
pub async fn join_chat(
    ctx: &ApiContext,
    user_id: &UserId,
    chat_id: ChatId,
    pub_key: Option<&str>,
) -> Result<(), ApiError> {
    if !ctx.storage.chat_exists(chat_id).await.map_err(internal)? {
        return Err(ApiError::new(ErrorCode::NotFound, "chat not found"));
    }
    ctx.storage
        .add_participant(chat_id, user_id, pub_key)
        .await
        .map_err(internal)?;
    Ok(())
}

pub async fn list_chats(ctx: &ApiContext, user_id: &UserId) -> Result<ListChatsResponse, ApiError> {
    let chats = ctx
        .storage
        .list_chats_for_user(user_id)
        .await
        .map_err(internal)?;

    let mut summaries = Vec::with_capacity(chats.len());
    let mut other_ids: Vec<UserId> = Vec::new();
    for chat in chats {
        let participants = ctx
            .storage
            .participants(chat.chat_id)
            .await
            .map_err(internal)?;
        for participant in &participants {
            if &participant.user_id != user_id && !other_ids.contains(&participant.user_id) {
                other_ids.push(participant.user_id.clone());
            }
        }
        summaries.push(ChatSummary {
            chat_id: chat.chat_id,
            is_private: chat.is_private,
            created_at: chat.created_at,
            participants,
        });
    }

    let profiles = ctx
        .storage
        .find_profiles_by_ids(&other_ids)
        .await
        .map_err(internal)?;
    let users: HashMap<UserId, UserProfile> = profiles
        .into_iter()
        .map(|profile| (profile.user_id.clone(), profile))
        .collect();

    Ok(ListChatsResponse {
        chats: summaries,
        users,
    })
}

pub async fn send_invite(
    ctx: &ApiContext,
    sender_id: &UserId,
    receiver_id: &UserId,
    chat_id: ChatId,
) -> Result<InvitationPayload, ApiError> {
    if sender_id == receiver_id {
        return Err(ApiError::new(ErrorCode::Validation, "cannot invite oneself"));
    }
    if !ctx.storage.chat_exists(chat_id).await.map_err(internal)? {
        return Err(ApiError::new(ErrorCode::NotFound, "chat not found"));
    }
    ensure_participant(ctx, sender_id, chat_id).await?;

    let invitation = ctx
        .storage
        .create_invitation(chat_id, sender_id, receiver_id)
        .await
        .map_err(internal)?;
    Ok(invitation_payload(invitation))
}

/// Terminal invitations never transition again; the single conditional update
/// in storage decides the winner under concurrent responses. On accept the
/// membership append is idempotent, so a partial failure after the transition
/// is retried via `join_chat` without duplicating the participant.
pub async fn respond_invitation(
    ctx: &ApiContext,
    receiver_id: &UserId,
    invitation_id: InvitationId,
    decision: InvitationDecision,
) -> Result<InvitationPayload, ApiError> {
    let invitation = ctx
        .storage
        .invitation(invitation_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "invitation not found"))?;
    if &invitation.receiver_id != receiver_id {
        return Err(ApiError::new(
            ErrorCode::Forbidden,
            "invitation belongs to another receiver",
        ));
    }

    let target = match decision {
        InvitationDecision::Accept => InvitationStatus::Accepted,
        InvitationDecision::Reject => InvitationStatus::Rejected,
    };
    let settled = ctx
        .storage
        .settle_invitation(invitation_id, target)
        .await
        .map_err(internal)?
        .ok_or_else(|| {
            ApiError::new(
                ErrorCode::InvalidTransition,
                "invitation has already been responded to",
            )
        })?;

    if settled.status == InvitationStatus::Accepted {
        ctx.storage
            .add_participant(settled.chat_id, receiver_id, None)
            .await
            .map_err(|e| {
                ApiError::new(
                    ErrorCode::StoreUnavailable,
                    format!("invitation accepted but membership write failed, retry join: {e}"),
                )
            })?;
    }

    Ok(invitation_payload(settled))
}

pub async fn list_pending_invitations(
    ctx: &ApiContext,
    receiver_id: &UserId,
) -> Result<Vec<InvitationPayload>, ApiError> {
    let pending = ctx
        .storage
        .list_pending_invitations(receiver_id)
        .await
        .map_err(internal)?;
    Ok(pending.into_iter().map(invitation_payload).collect())
}

/// Durable append stamped at the call site. Membership is the caller's
/// responsibility; failures surface as `StoreUnavailable`.
pub async fn append_message(
    ctx: &ApiContext,
    chat_id: ChatId,
    sender_id: &UserId,
    text: &str,
    iv: Option<&str>,
) -> Result<MessagePayload, ApiError> {
    record_message(
        ctx,
        chat_id,
        sender_id,
        MessageId::generate(),
        text,
        iv,
        Utc::now(),
    )
    .await
}

/// Persists a message under the id and timestamp the relay already broadcast,
/// so history agrees with live delivery no matter when the write lands.
pub async fn record_message(
    ctx: &ApiContext,
    chat_id: ChatId,
    sender_id: &UserId,
    message_id: MessageId,
    text: &str,
    iv: Option<&str>,
    sent_at: DateTime<Utc>,
) -> Result<MessagePayload, ApiError> {
    let stored = ctx
        .storage
        .append_message_at(chat_id, sender_id, text, iv, message_id, sent_at)
        .await
        .map_err(|e| ApiError::new(ErrorCode::StoreUnavailable, e.to_string()))?;
    Ok(message_payload(stored))
}

pub async fn message_history(
    ctx: &ApiContext,
    requester_id: &UserId,
    chat_id: ChatId,
    skip: i64,
    limit: i64,
) -> Result<Vec<MessagePayload>, ApiError> {
    if skip < 0 || limit < 0 {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "skip and limit must be non-negative",
        ));
    }
    if !ctx.storage.chat_exists(chat_id).await.map_err(internal)? {
        return Err(ApiError::new(ErrorCode::NotFound, "chat not found"));
    }
    ensure_participant(ctx, requester_id, chat_id).await?;

    let messages = ctx
        .storage
        .list_messages(chat_id, skip, limit)
        .await
        .map_err(internal)?;
    Ok(messages.into_iter().map(message_payload).collect())
}

/// The access gate: the one membership check every read/write path goes
/// through instead of comparing participant lists ad hoc.
pub async fn ensure_participant(
    ctx: &ApiContext,
    user_id: &UserId,
    chat_id: ChatId,
) -> Result<(), ApiError> {
    let member = ctx
        .storage
        .is_participant(chat_id, user_id)
        .await
        .map_err(internal)?;
    if !member {
        return Err(ApiError::new(
            ErrorCode::Forbidden,
            "user is not a chat participant",
        ));
    }
    Ok(())
}

fn message_payload(stored: StoredMessage) -> MessagePayload {
    MessagePayload {
        message_id: stored.message_id,
        chat_id: stored.chat_id,
        sender_id: stored.sender_id,
        text: stored.text,
        iv: stored.iv,
        status: MessageStatus::Sent,
        created_at: stored.created_at,
    }
}

fn invitation_payload(stored: StoredInvitation) -> InvitationPayload {
    InvitationPayload {
        id: stored.id,
        chat_id: stored.chat_id,
        sender_id: stored.sender_id,
        receiver_id: stored.receiver_id,
        kind: stored.kind,
        status: stored.status,
        sent_at: stored.sent_at,
        responded_at: stored.responded_at,
    }
}

fn internal(err: anyhow::Error) -> ApiError {
    ApiError::new(ErrorCode::Internal, err.to_string())
}
