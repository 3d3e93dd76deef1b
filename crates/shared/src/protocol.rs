use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{
        ChatId, InvitationDecision, InvitationId, InvitationStatus, MessageId, MessageStatus,
        Participant, UserId, UserProfile,
    },
    error::ApiError,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateChatRequest {
    #[serde(default)]
    pub members: Option<Vec<UserId>>,
    #[serde(default)]
    pub invite: Option<UserId>,
    pub is_private: bool,
    #[serde(default)]
    pub pub_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateChatResponse {
    pub chat_id: ChatId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinChatRequest {
    pub chat_id: ChatId,
    #[serde(default)]
    pub pub_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinChatResponse {
    pub success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSummary {
    pub chat_id: ChatId,
    pub is_private: bool,
    pub created_at: DateTime<Utc>,
    pub participants: Vec<Participant>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListChatsResponse {
    pub chats: Vec<ChatSummary>,
    /// Profiles of every *other* participant across the caller's chats,
    /// deduplicated and keyed by user id.
    pub users: HashMap<UserId, UserProfile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    pub message_id: MessageId,
    pub chat_id: ChatId,
    pub sender_id: UserId,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iv: Option<String>,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub messages: Vec<MessagePayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendInviteRequest {
    pub receiver_id: UserId,
    pub chat_id: ChatId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RespondInviteRequest {
    pub invitation_id: InvitationId,
    pub decision: InvitationDecision,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvitationPayload {
    pub id: InvitationId,
    pub chat_id: ChatId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub kind: String,
    pub status: InvitationStatus,
    pub sent_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responded_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingInvitationsResponse {
    pub notifications: Vec<InvitationPayload>,
}

/// Events a connected session may send over the live channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ClientEvent {
    #[serde(rename = "join-room")]
    JoinRoom {
        #[serde(rename = "chatId")]
        chat_id: ChatId,
    },
    #[serde(rename = "send-message")]
    SendMessage {
        #[serde(rename = "chatId")]
        chat_id: ChatId,
        #[serde(default)]
        text: String,
        #[serde(default)]
        iv: Option<String>,
    },
}

/// Events broadcast to subscribed sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ServerEvent {
    #[serde(rename = "message-delivered")]
    #[serde(rename_all = "camelCase")]
    MessageDelivered {
        message_id: MessageId,
        chat_id: ChatId,
        sender_id: UserId,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        iv: Option<String>,
        sent_at: DateTime<Utc>,
    },
    #[serde(rename = "error")]
    Error(ApiError),
}
