use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Member,
    Moderator,
    Admin,
    #[serde(other)]
    Unspecified,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FriendRequestStatus {
    Pending,
    Accepted,
    Rejected,
    Cancelled,
    #[serde(other)]
    Unspecified,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: String,
    pub room_id: String,
    pub author_id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Member {
    pub room_id: String,
    pub user_id: String,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FriendRequest {
    pub id: String,
    pub from_user_id: String,
    pub to_user_id: String,
    pub status: FriendRequestStatus,
}

/// Payload carried by a [`ServerEvent`].
///
/// Tags the harness does not know about decode as [`EventPayload::Unrecognized`]
/// instead of failing the whole stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    MessageCreated {
        message: ChatMessage,
    },
    MessageEdited {
        message: ChatMessage,
    },
    MessageDeleted {
        room_id: String,
        message_id: String,
    },
    MemberJoined {
        member: Member,
    },
    MemberRemoved {
        room_id: String,
        user_id: String,
    },
    RoleChanged {
        room_id: String,
        user_id: String,
        new_role: Role,
    },
    MemberNicknameChanged {
        room_id: String,
        user_id: String,
        nickname: String,
    },
    FriendRequestCreated {
        request: FriendRequest,
    },
    FriendRequestUpdated {
        request: FriendRequest,
    },
    #[serde(other)]
    Unrecognized,
}

impl EventPayload {
    /// Returns the variant tag, or `None` for unrecognized payloads.
    pub fn kind(&self) -> Option<EventKind> {
        let kind = match self {
            Self::MessageCreated { .. } => EventKind::MessageCreated,
            Self::MessageEdited { .. } => EventKind::MessageEdited,
            Self::MessageDeleted { .. } => EventKind::MessageDeleted,
            Self::MemberJoined { .. } => EventKind::MemberJoined,
            Self::MemberRemoved { .. } => EventKind::MemberRemoved,
            Self::RoleChanged { .. } => EventKind::RoleChanged,
            Self::MemberNicknameChanged { .. } => EventKind::MemberNicknameChanged,
            Self::FriendRequestCreated { .. } => EventKind::FriendRequestCreated,
            Self::FriendRequestUpdated { .. } => EventKind::FriendRequestUpdated,
            Self::Unrecognized => return None,
        };
        Some(kind)
    }

    /// Room the event is scoped to, when it has one.
    pub fn room_id(&self) -> Option<&str> {
        match self {
            Self::MessageCreated { message } | Self::MessageEdited { message } => {
                Some(&message.room_id)
            }
            Self::MemberJoined { member } => Some(&member.room_id),
            Self::MessageDeleted { room_id, .. }
            | Self::MemberRemoved { room_id, .. }
            | Self::RoleChanged { room_id, .. }
            | Self::MemberNicknameChanged { room_id, .. } => Some(room_id),
            Self::FriendRequestCreated { .. }
            | Self::FriendRequestUpdated { .. }
            | Self::Unrecognized => None,
        }
    }
}

/// One-line summary used in stream logs.
impl fmt::Display for EventPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MessageCreated { message } => write!(
                f,
                "message_created room={} id={}",
                message.room_id, message.id
            ),
            Self::MessageEdited { message } => write!(
                f,
                "message_edited room={} id={}",
                message.room_id, message.id
            ),
            Self::MessageDeleted {
                room_id,
                message_id,
            } => write!(f, "message_deleted room={room_id} id={message_id}"),
            Self::MemberJoined { member } => write!(
                f,
                "member_joined room={} user={}",
                member.room_id, member.user_id
            ),
            Self::MemberRemoved { room_id, user_id } => {
                write!(f, "member_removed room={room_id} user={user_id}")
            }
            Self::RoleChanged {
                room_id,
                user_id,
                new_role,
            } => write!(
                f,
                "role_changed room={room_id} user={user_id} role={new_role:?}"
            ),
            Self::MemberNicknameChanged {
                room_id, user_id, ..
            } => write!(f, "member_nickname_changed room={room_id} user={user_id}"),
            Self::FriendRequestCreated { request } => write!(
                f,
                "friend_request_created id={} from={} to={} status={:?}",
                request.id, request.from_user_id, request.to_user_id, request.status
            ),
            Self::FriendRequestUpdated { request } => write!(
                f,
                "friend_request_updated id={} status={:?}",
                request.id, request.status
            ),
            Self::Unrecognized => f.write_str("unrecognized"),
        }
    }
}

/// Variant tag of a server event payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    MessageCreated,
    MessageEdited,
    MessageDeleted,
    MemberJoined,
    MemberRemoved,
    RoleChanged,
    MemberNicknameChanged,
    FriendRequestCreated,
    FriendRequestUpdated,
}

impl EventKind {
    pub const ALL: [Self; 9] = [
        Self::MessageCreated,
        Self::MessageEdited,
        Self::MessageDeleted,
        Self::MemberJoined,
        Self::MemberRemoved,
        Self::RoleChanged,
        Self::MemberNicknameChanged,
        Self::FriendRequestCreated,
        Self::FriendRequestUpdated,
    ];

    /// Wire name of the tag.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MessageCreated => "message_created",
            Self::MessageEdited => "message_edited",
            Self::MessageDeleted => "message_deleted",
            Self::MemberJoined => "member_joined",
            Self::MemberRemoved => "member_removed",
            Self::RoleChanged => "role_changed",
            Self::MemberNicknameChanged => "member_nickname_changed",
            Self::FriendRequestCreated => "friend_request_created",
            Self::FriendRequestUpdated => "friend_request_updated",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown event kind: {0}")]
pub struct UnknownEventKind(pub String);

impl FromStr for EventKind {
    type Err = UnknownEventKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownEventKind(s.to_string()))
    }
}

/// Server-pushed event as received on the stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerEvent {
    #[serde(default)]
    pub event_id: String,
    #[serde(default)]
    pub created_at_ms: u64,
    pub payload: EventPayload,
}

impl ServerEvent {
    pub fn new(payload: EventPayload) -> Self {
        Self {
            event_id: String::new(),
            created_at_ms: 0,
            payload,
        }
    }

    pub fn kind(&self) -> Option<EventKind> {
        self.payload.kind()
    }

    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Client-to-server marker. The server only uses these to keep the
/// subscription alive.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    Handshake { client_time_ms: u64 },
    Keepalive { client_time_ms: u64 },
}

impl ClientEvent {
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
