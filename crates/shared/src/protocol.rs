use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{
    ConversationId, ConversationKind, MemberRole, MessageId, MessageKind, UserId,
};

/// Durable reference to an uploaded media object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    pub url: String,
    pub mime_type: String,
    pub size_bytes: u64,
}

/// Message body on the wire. Exactly one content shape per kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageBody {
    Text { text: String },
    Image { media: MediaRef },
    Video { media: MediaRef },
    Audio { media: MediaRef },
}

impl MessageBody {
    /// Wrap an uploaded media reference in the body shape for its kind.
    /// Returns `None` for `Text`, which carries no media.
    pub fn media(kind: MessageKind, media: MediaRef) -> Option<Self> {
        match kind {
            MessageKind::Text => None,
            MessageKind::Image => Some(MessageBody::Image { media }),
            MessageKind::Video => Some(MessageBody::Video { media }),
            MessageKind::Audio => Some(MessageBody::Audio { media }),
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            MessageBody::Text { .. } => MessageKind::Text,
            MessageBody::Image { .. } => MessageKind::Image,
            MessageBody::Video { .. } => MessageKind::Video,
            MessageBody::Audio { .. } => MessageKind::Audio,
        }
    }

    /// Short human-readable excerpt used for previews and reply snapshots.
    pub fn excerpt(&self, max_chars: usize) -> String {
        match self {
            MessageBody::Text { text } => text.chars().take(max_chars).collect(),
            MessageBody::Image { .. } => "📷 Photo".to_string(),
            MessageBody::Video { .. } => "🎬 Video".to_string(),
            MessageBody::Audio { .. } => "🎙 Audio".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorSummary {
    pub user_id: UserId,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<MemberRole>,
}

/// Denormalized snapshot of a replied-to message, captured when the reply
/// is composed. Never re-derived; must render after the target is deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyPreview {
    pub target_id: MessageId,
    pub kind: MessageKind,
    pub excerpt: String,
    pub sender_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub sender: ActorSummary,
    #[serde(flatten)]
    pub body: MessageBody,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<ReplyPreview>,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub edited: bool,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberSummary {
    pub user_id: UserId,
    pub display_name: String,
    pub role: MemberRole,
}

/// Preview line shown in the conversation list without a timeline fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviewSnippet {
    pub kind: MessageKind,
    pub excerpt: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub conversation_id: ConversationId,
    pub kind: ConversationKind,
    pub title: String,
    pub unread_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<PreviewSnippet>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub members: Vec<MemberSummary>,
}

/// Push events, dispatched by the `type` discriminator. The union is closed:
/// new event kinds are added here, and every consumer matches exhaustively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum RealtimeEvent {
    NewMessage {
        message: MessagePayload,
    },
    MessageEdited {
        conversation_id: ConversationId,
        message_id: MessageId,
        body: MessageBody,
        edited_at: DateTime<Utc>,
    },
    MessageDeleted {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    PostPinned {
        conversation_id: ConversationId,
        message_id: MessageId,
        pinned: bool,
    },
    ReactionUpdated {
        conversation_id: ConversationId,
        message_id: MessageId,
        reactions: BTreeMap<String, u32>,
    },
    Typing {
        conversation_id: ConversationId,
        actor: ActorSummary,
        is_typing: bool,
        is_recording: bool,
    },
    MessagesRead {
        conversation_id: ConversationId,
        reader_id: UserId,
        up_to_message_id: MessageId,
    },
    PresenceChanged {
        conversation_id: ConversationId,
        user_id: UserId,
        online: bool,
    },
    ConversationCreated {
        conversation: ConversationSummary,
    },
    NewNotification {
        title: String,
        body: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conversation_id: Option<ConversationId>,
    },
    ViewerCount {
        conversation_id: ConversationId,
        count: u32,
    },
    LiveEnded {
        conversation_id: ConversationId,
    },
}

impl RealtimeEvent {
    /// Conversation the event is scoped to, if any. Broadcast-scope events
    /// (`conversation-created`, some notifications) return `None`.
    pub fn conversation_id(&self) -> Option<ConversationId> {
        use RealtimeEvent::*;
        match self {
            NewMessage { message } => Some(message.conversation_id),
            MessageEdited {
                conversation_id, ..
            }
            | MessageDeleted {
                conversation_id, ..
            }
            | PostPinned {
                conversation_id, ..
            }
            | ReactionUpdated {
                conversation_id, ..
            }
            | Typing {
                conversation_id, ..
            }
            | MessagesRead {
                conversation_id, ..
            }
            | PresenceChanged {
                conversation_id, ..
            }
            | ViewerCount {
                conversation_id, ..
            }
            | LiveEnded { conversation_id } => Some(*conversation_id),
            ConversationCreated { .. } => None,
            NewNotification {
                conversation_id, ..
            } => *conversation_id,
        }
    }
}

/// Frames the client sends to the push provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum TransportCommand {
    Subscribe { topic: String },
    Unsubscribe { topic: String },
}

/// Frames the push provider delivers: an event scoped to a topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportFrame {
    pub topic: String,
    #[serde(flatten)]
    pub event: RealtimeEvent,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_round_trips_with_kebab_case_tag() {
        let event = RealtimeEvent::MessageDeleted {
            conversation_id: ConversationId(7),
            message_id: MessageId(42),
        };
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["type"], "message-deleted");
        let back: RealtimeEvent = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, event);
    }

    #[test]
    fn message_payload_flattens_body_kind() {
        let payload = MessagePayload {
            message_id: MessageId(1),
            conversation_id: ConversationId(2),
            sender: ActorSummary {
                user_id: UserId(3),
                display_name: "ana".into(),
                role: None,
            },
            body: MessageBody::Text { text: "hi".into() },
            reply_to: None,
            pinned: false,
            edited: false,
            sent_at: Utc::now(),
        };
        let json = serde_json::to_value(&payload).expect("serialize");
        assert_eq!(json["kind"], "text");
        assert_eq!(json["text"], "hi");
    }

    #[test]
    fn unknown_event_type_is_a_decode_error() {
        let raw = r#"{"type":"totally-new-thing","payload":{}}"#;
        assert!(serde_json::from_str::<RealtimeEvent>(raw).is_err());
    }

    #[test]
    fn media_excerpt_is_a_glyph_not_content() {
        let body = MessageBody::Image {
            media: MediaRef {
                url: "https://cdn.example/a.jpg".into(),
                mime_type: "image/jpeg".into(),
                size_bytes: 1024,
            },
        };
        assert_eq!(body.excerpt(40), "📷 Photo");
    }
}
