use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{ChannelId, ContentRef, IdRef, LogicalMessageId, PersonId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRef {
    pub blob: ContentRef,
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageContent {
    pub text: String,
    #[serde(default)]
    pub subjects: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub attachments: Vec<AttachmentRef>,
}

impl MessageContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }
}

/// One immutable snapshot of a chat message. Records of the same
/// `logical_id` form a chain linked through `previous_version`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub logical_id: LogicalMessageId,
    pub version_number: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_version: Option<ContentRef>,
    pub content: MessageContent,
    pub author: PersonId,
    pub original_timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edit_reason: Option<String>,
    #[serde(default)]
    pub is_retracted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retracted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retract_reason: Option<String>,
}

/// A message as it sits in a channel's entry list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMessage {
    pub sender: PersonId,
    pub posted_at: DateTime<Utc>,
    pub record: VersionRecord,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRecord {
    pub id: ChannelId,
    /// `None` marks a shared peer-pair channel without a single owner.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<PersonId>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoomHandle {
    pub channel_id: ChannelId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<PersonId>,
    pub channel_info: IdRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelUpdate {
    pub channel_info: IdRef,
    pub channel_id: ChannelId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<PersonId>,
    pub change_time: DateTime<Utc>,
    pub changed_entries: Vec<ContentRef>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelFilter {
    pub id_prefix: Option<String>,
    pub owner: Option<PersonId>,
    pub p2p_only: bool,
}

impl ChannelFilter {
    pub fn matches(&self, record: &ChannelRecord) -> bool {
        if let Some(prefix) = &self.id_prefix {
            if !record.id.as_str().starts_with(prefix.as_str()) {
                return false;
            }
        }
        if let Some(owner) = &self.owner {
            if record.owner.as_ref() != Some(owner) {
                return false;
            }
        }
        !self.p2p_only || record.id.is_p2p()
    }
}
