use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::{
    domain::{ContentRef, LogicalMessageId, PersonId},
    error::{CoreError, CoreResult},
    protocol::{MessageContent, VersionRecord},
};

/// Type tag under which version records are stored.
pub const VERSIONED_MESSAGE_TYPE: &str = "VersionedMessage";
pub const RETRACTED_PLACEHOLDER: &str = "[Message retracted]";

/// Head of a chain: the newest record and the reference it is stored under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatestVersion {
    pub reference: ContentRef,
    pub record: VersionRecord,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetractionOutcome {
    Retracted(VersionRecord),
    /// The chain already ends in a retraction; nothing was built.
    AlreadyRetracted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageEvent {
    Created,
    Edited,
    Retracted,
}

impl MessageEvent {
    pub fn of(record: &VersionRecord) -> Self {
        if record.is_retracted {
            Self::Retracted
        } else if record.version_number <= 1 {
            Self::Created
        } else {
            Self::Edited
        }
    }
}

/// What UI-facing code gets to see of a message. Retracted messages never
/// carry their original content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayRecord {
    pub logical_id: LogicalMessageId,
    pub version_number: u32,
    pub author: PersonId,
    pub content: MessageContent,
    pub original_timestamp: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
    pub is_edited: bool,
    pub is_retracted: bool,
    pub retracted_at: Option<DateTime<Utc>>,
}

impl From<&VersionRecord> for DisplayRecord {
    fn from(record: &VersionRecord) -> Self {
        let content = if record.is_retracted {
            retracted_content()
        } else {
            record.content.clone()
        };
        Self {
            logical_id: record.logical_id.clone(),
            version_number: record.version_number,
            author: record.author.clone(),
            content,
            original_timestamp: record.original_timestamp,
            edited_at: record.edited_at,
            is_edited: record.version_number > 1 && !record.is_retracted,
            is_retracted: record.is_retracted,
            retracted_at: record.retracted_at,
        }
    }
}

fn retracted_content() -> MessageContent {
    MessageContent::text(RETRACTED_PLACEHOLDER)
}

/// Builds the first version of a new message, or the successor of
/// `previous` when one is given. A successor inherits the logical id,
/// author and original timestamp of the chain; `author` only applies to a
/// first version.
pub fn create_version(
    content: MessageContent,
    author: PersonId,
    previous: Option<&LatestVersion>,
) -> VersionRecord {
    let logical_id = previous
        .map(|latest| latest.record.logical_id.clone())
        .unwrap_or_else(LogicalMessageId::generate);
    create_version_with_id(logical_id, content, author, previous)
}

pub fn create_version_with_id(
    logical_id: LogicalMessageId,
    content: MessageContent,
    author: PersonId,
    previous: Option<&LatestVersion>,
) -> VersionRecord {
    let now = Utc::now();
    match previous {
        None => VersionRecord {
            logical_id,
            version_number: 1,
            previous_version: None,
            content,
            author,
            original_timestamp: now,
            edited_at: None,
            edit_reason: None,
            is_retracted: false,
            retracted_at: None,
            retract_reason: None,
        },
        Some(latest) => VersionRecord {
            logical_id: latest.record.logical_id.clone(),
            version_number: latest.record.version_number + 1,
            previous_version: Some(latest.reference.clone()),
            content,
            author: latest.record.author.clone(),
            original_timestamp: latest.record.original_timestamp,
            edited_at: Some(now),
            edit_reason: None,
            is_retracted: false,
            retracted_at: None,
            retract_reason: None,
        },
    }
}

pub fn create_edited_version(
    latest: &LatestVersion,
    new_content: MessageContent,
    reason: Option<String>,
) -> CoreResult<VersionRecord> {
    if latest.record.is_retracted {
        return Err(CoreError::invalid_state(format!(
            "cannot edit a retracted message ({})",
            latest.record.logical_id
        )));
    }
    let mut record = create_version(new_content, latest.record.author.clone(), Some(latest));
    record.edit_reason = reason;
    Ok(record)
}

pub fn create_retraction(latest: &LatestVersion, reason: Option<String>) -> RetractionOutcome {
    if latest.record.is_retracted {
        return RetractionOutcome::AlreadyRetracted;
    }
    let mut record = create_version(retracted_content(), latest.record.author.clone(), Some(latest));
    record.edited_at = None;
    record.is_retracted = true;
    record.retracted_at = Some(Utc::now());
    record.retract_reason = reason;
    RetractionOutcome::Retracted(record)
}

#[cfg(test)]
#[path = "tests/record_tests.rs"]
mod tests;
