//! Envelope types for the Huddle protocol.
//!
//! An envelope is the unit of room traffic. Clients send a reduced form
//! (type, room, content or payload); the relay stamps sender, id and time
//! before fanning it out, and never mutates it afterwards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Envelope type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnvelopeType {
    /// A user joined the room.
    #[serde(rename = "join")]
    Join,
    /// A user left the room.
    #[serde(rename = "leave")]
    Leave,
    /// A chat message.
    #[serde(rename = "message-create", alias = "MESSAGE_CREATE")]
    MessageCreate,
    /// Full presence snapshot of a voice room.
    #[serde(rename = "user-list")]
    UserList,
    /// Generic voice signalling message.
    #[serde(rename = "signal")]
    Signal,
    /// WebRTC session offer.
    #[serde(rename = "offer")]
    Offer,
    /// WebRTC session answer.
    #[serde(rename = "answer")]
    Answer,
    /// WebRTC ICE candidate.
    #[serde(rename = "candidate")]
    Candidate,
    /// Voice activity indicator.
    #[serde(rename = "user-speaking")]
    UserSpeaking,
}

impl EnvelopeType {
    /// Parse a wire tag.
    ///
    /// Returns `None` for tags the relay does not recognize.
    #[must_use]
    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "join" => Some(Self::Join),
            "leave" => Some(Self::Leave),
            "message-create" | "MESSAGE_CREATE" => Some(Self::MessageCreate),
            "user-list" => Some(Self::UserList),
            "signal" => Some(Self::Signal),
            "offer" => Some(Self::Offer),
            "answer" => Some(Self::Answer),
            "candidate" => Some(Self::Candidate),
            "user-speaking" => Some(Self::UserSpeaking),
            _ => None,
        }
    }

    /// The canonical wire tag.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Join => "join",
            Self::Leave => "leave",
            Self::MessageCreate => "message-create",
            Self::UserList => "user-list",
            Self::Signal => "signal",
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::Candidate => "candidate",
            Self::UserSpeaking => "user-speaking",
        }
    }

    /// Whether this tag belongs to the voice signalling family.
    #[must_use]
    pub fn is_signal(&self) -> bool {
        matches!(
            self,
            Self::Signal | Self::Offer | Self::Answer | Self::Candidate | Self::UserSpeaking
        )
    }

    /// Whether only the relay may originate envelopes of this type.
    #[must_use]
    pub fn is_server_only(&self) -> bool {
        matches!(self, Self::Join | Self::Leave | Self::UserList)
    }
}

impl std::fmt::Display for EnvelopeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A room-scoped message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Type tag.
    #[serde(rename = "type")]
    pub kind: EnvelopeType,

    /// Target room. Clients may omit it; the relay fills in the
    /// connection's room.
    #[serde(rename = "channelId", alias = "room", default)]
    pub room: String,

    /// Authenticated sender, set by the relay.
    #[serde(alias = "senderId", default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,

    /// Intended recipient of a directed signal. Delivery is still room-wide;
    /// clients filter on it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    /// Text body of a chat message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    /// Opaque structured body (signal data, user lists).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,

    /// Relay-assigned identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<Uuid>,

    /// Relay-assigned creation time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl Envelope {
    /// Create a bare envelope of the given type.
    #[must_use]
    pub fn new(kind: EnvelopeType, room: impl Into<String>) -> Self {
        Self {
            kind,
            room: room.into(),
            sender: None,
            target: None,
            content: None,
            payload: None,
            message_id: None,
            created_at: None,
        }
    }

    /// Create a stamped chat message.
    #[must_use]
    pub fn message(
        room: impl Into<String>,
        sender: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let mut envelope = Self::new(EnvelopeType::MessageCreate, room);
        envelope.content = Some(content.into());
        envelope.stamp(sender)
    }

    /// Create a `join` notice for a user.
    #[must_use]
    pub fn join(room: impl Into<String>, user: impl Into<String>) -> Self {
        Self::new(EnvelopeType::Join, room).stamp(user)
    }

    /// Create a `leave` notice for a user.
    #[must_use]
    pub fn leave(room: impl Into<String>, user: impl Into<String>) -> Self {
        Self::new(EnvelopeType::Leave, room).stamp(user)
    }

    /// Create a full `user-list` snapshot.
    #[must_use]
    pub fn user_list(room: impl Into<String>, users: Vec<String>) -> Self {
        let mut envelope = Self::new(EnvelopeType::UserList, room);
        envelope.payload = serde_json::to_value(UserList { users }).ok();
        envelope.created_at = Some(Utc::now());
        envelope
    }

    /// Set sender, id and creation time, overwriting anything the client
    /// supplied.
    #[must_use]
    pub fn stamp(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self.message_id = Some(Uuid::now_v7());
        self.created_at = Some(Utc::now());
        self
    }

    /// Decode the payload of a `user-list` envelope.
    #[must_use]
    pub fn users(&self) -> Option<Vec<String>> {
        if self.kind != EnvelopeType::UserList {
            return None;
        }
        let payload = self.payload.clone()?;
        serde_json::from_value::<UserList>(payload)
            .ok()
            .map(|list| list.users)
    }
}

/// Payload of a `user-list` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserList {
    pub users: Vec<String>,
}

/// First-frame authentication request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRequest {
    pub token: String,
}

/// Per-connection control frames. These are written to a single client and
/// never cross the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlFrame {
    /// Outcome of authentication.
    #[serde(rename = "auth-response", rename_all = "camelCase")]
    AuthResponse {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// A rejected frame or a fatal connection error.
    #[serde(rename = "error")]
    Error {
        /// Machine-readable code.
        code: String,
        /// Human-readable message.
        message: String,
    },
}

impl ControlFrame {
    /// Successful authentication.
    #[must_use]
    pub fn authenticated(user_id: impl Into<String>) -> Self {
        Self::AuthResponse {
            success: true,
            user_id: Some(user_id.into()),
            error: None,
        }
    }

    /// Failed authentication.
    #[must_use]
    pub fn auth_failed(error: impl Into<String>) -> Self {
        Self::AuthResponse {
            success: false,
            user_id: None,
            error: Some(error.into()),
        }
    }

    /// An error notice.
    #[must_use]
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
        }
    }
}
