use std::{collections::HashMap, sync::Arc};

use chrono::Utc;
use shared::{
    domain::{LogicalMessageId, PersonId},
    error::CoreResult,
    protocol::{ChannelMessage, MessageContent, RoomHandle, VersionRecord},
};
use tracing::info;
use versioning::{create_version, DisplayRecord, MessageVersioning};

use crate::channel_manager::ChannelManager;

/// Sends, edits and retracts messages in a room on behalf of the local
/// person. Every operation appends a new version; nothing is overwritten.
pub struct Conversation {
    local_id: PersonId,
    channels: Arc<dyn ChannelManager>,
    versioning: Arc<MessageVersioning>,
}

impl Conversation {
    pub fn new(
        local_id: PersonId,
        channels: Arc<dyn ChannelManager>,
        versioning: Arc<MessageVersioning>,
    ) -> Self {
        Self {
            local_id,
            channels,
            versioning,
        }
    }

    pub async fn send(&self, room: &RoomHandle, content: MessageContent) -> CoreResult<VersionRecord> {
        let record = create_version(content, self.local_id.clone(), None);
        self.versioning.store_message(&record).await?;
        self.post(room, &record).await?;
        info!(channel_id = %room.channel_id, logical_id = %record.logical_id, "conversation: sent");
        Ok(record)
    }

    pub async fn edit(
        &self,
        room: &RoomHandle,
        logical_id: &LogicalMessageId,
        content: MessageContent,
        reason: Option<String>,
    ) -> CoreResult<VersionRecord> {
        let (record, _) = self
            .versioning
            .edit_message(logical_id, content, reason)
            .await?;
        self.post(room, &record).await?;
        info!(
            channel_id = %room.channel_id,
            logical_id = %logical_id,
            version = record.version_number,
            "conversation: edited"
        );
        Ok(record)
    }

    /// `Ok(None)` when the message was already retracted; nothing is posted.
    pub async fn retract(
        &self,
        room: &RoomHandle,
        logical_id: &LogicalMessageId,
        reason: Option<String>,
    ) -> CoreResult<Option<VersionRecord>> {
        let Some((record, _)) = self.versioning.retract_message(logical_id, reason).await? else {
            return Ok(None);
        };
        self.post(room, &record).await?;
        info!(channel_id = %room.channel_id, logical_id = %logical_id, "conversation: retracted");
        Ok(Some(record))
    }

    /// Current state of every message in the room, in order of first
    /// appearance, with retractions sanitised.
    pub async fn display_messages(&self, room: &RoomHandle) -> CoreResult<Vec<DisplayRecord>> {
        let messages = self.channels.all_messages(room).await?;
        let mut order: Vec<LogicalMessageId> = Vec::new();
        let mut heads: HashMap<LogicalMessageId, VersionRecord> = HashMap::new();
        for message in messages {
            let record = message.record;
            match heads.get(&record.logical_id) {
                Some(current) if current.version_number > record.version_number => {}
                Some(_) => {
                    heads.insert(record.logical_id.clone(), record);
                }
                None => {
                    order.push(record.logical_id.clone());
                    heads.insert(record.logical_id.clone(), record);
                }
            }
        }
        Ok(order
            .iter()
            .filter_map(|logical_id| heads.get(logical_id))
            .map(DisplayRecord::from)
            .collect())
    }

    async fn post(&self, room: &RoomHandle, record: &VersionRecord) -> CoreResult<()> {
        self.channels
            .post_message(
                room,
                ChannelMessage {
                    sender: self.local_id.clone(),
                    posted_at: Utc::now(),
                    record: record.clone(),
                },
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/conversation_tests.rs"]
mod tests;
