use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub i64);
    };
}

id_newtype!(UserId);
id_newtype!(ConversationId);
id_newtype!(MessageId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    Support,
    TeamDirect,
    TeamGroup,
    Channel,
    LiveRoom,
}

impl ConversationKind {
    /// Pinning is a broadcast-channel affordance only.
    pub fn supports_pinning(self) -> bool {
        matches!(self, ConversationKind::Channel)
    }

    pub fn has_members(self) -> bool {
        matches!(
            self,
            ConversationKind::TeamDirect | ConversationKind::TeamGroup
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Image,
    Video,
    Audio,
}

impl MessageKind {
    pub fn is_media(self) -> bool {
        !matches!(self, MessageKind::Text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberRole {
    Owner,
    Agent,
    Member,
}

/// Sender identity resolved relative to the viewing user, not absolute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderRole {
    Own,
    Counterpart,
    Teammate,
}

/// Delivery state machine for viewer-authored messages. Inbound messages
/// enter at `Delivered`; `Failed` is terminal and reachable only from
/// `Sending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Sending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    pub fn can_advance_to(self, next: MessageStatus) -> bool {
        use MessageStatus::*;
        match (self, next) {
            (Sending, Sent) | (Sending, Failed) => true,
            (Sending, Delivered) | (Sending, Read) => true,
            (Sent, Delivered) | (Sent, Read) => true,
            (Delivered, Read) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, MessageStatus::Read | MessageStatus::Failed)
    }
}
