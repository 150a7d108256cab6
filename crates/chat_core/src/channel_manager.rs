use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::{
    domain::{ChannelId, ContentRef, IdRef, PersonId},
    error::{CoreError, CoreResult},
    protocol::{ChannelFilter, ChannelMessage, ChannelRecord, ChannelUpdate, RoomHandle},
};
use storage::{
    get_typed, get_typed_by_identity, identity_ref, put_typed, update_typed, ObjectStore,
};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};
use versioning::ChannelHistory;

pub const CHANNEL_INFO_TYPE: &str = "ChannelInfo";
pub const CHANNEL_REGISTRY_TYPE: &str = "ChannelRegistry";
pub const CHANNEL_ENTRY_TYPE: &str = "ChannelEntry";
const REGISTRY_IDENTITY: &str = "local";
const EVENT_CAPACITY: usize = 1024;

#[async_trait]
pub trait ChannelManager: Send + Sync {
    /// Fails with `AlreadyExists` when the channel is already present.
    async fn create_channel(
        &self,
        channel_id: &ChannelId,
        owner: Option<&PersonId>,
    ) -> CoreResult<ChannelRecord>;
    /// Fails with `NotFound` when no such channel exists.
    async fn enter_room(&self, channel_id: &ChannelId) -> CoreResult<RoomHandle>;
    async fn matching_channels(&self, filter: &ChannelFilter) -> CoreResult<Vec<ChannelRecord>>;
    /// Messages in insertion order.
    async fn all_messages(&self, room: &RoomHandle) -> CoreResult<Vec<ChannelMessage>>;
    async fn post_message(&self, room: &RoomHandle, message: ChannelMessage)
        -> CoreResult<ContentRef>;
    fn subscribe_updates(&self) -> broadcast::Receiver<ChannelUpdate>;
    fn subscribe_created(&self) -> broadcast::Receiver<ChannelRecord>;
}

pub fn channel_info_ref(channel_id: &ChannelId) -> IdRef {
    identity_ref(CHANNEL_INFO_TYPE, channel_id.as_str())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChannelInfo {
    id: ChannelId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    owner: Option<PersonId>,
    created_at: DateTime<Utc>,
    entries: Vec<ContentRef>,
}

impl ChannelInfo {
    fn record(&self) -> ChannelRecord {
        ChannelRecord {
            id: self.id.clone(),
            owner: self.owner.clone(),
            created_at: self.created_at,
        }
    }

    fn room(&self) -> RoomHandle {
        RoomHandle {
            channel_id: self.id.clone(),
            owner: self.owner.clone(),
            channel_info: channel_info_ref(&self.id),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ChannelRegistry {
    channels: BTreeSet<ChannelId>,
}

/// Channel manager keeping channels as versioned objects in an
/// [`ObjectStore`]: one identity object per channel listing its entries,
/// plus a registry of all channel ids.
pub struct StoreChannelManager {
    store: Arc<dyn ObjectStore>,
    write_lock: Mutex<()>,
    updates: broadcast::Sender<ChannelUpdate>,
    created: broadcast::Sender<ChannelRecord>,
    // Entry counts already announced, per channel. `None` until the first
    // external sync takes a baseline.
    observed: Mutex<Option<HashMap<ChannelId, usize>>>,
}

impl StoreChannelManager {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        let (updates, _) = broadcast::channel(EVENT_CAPACITY);
        let (created, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            store,
            write_lock: Mutex::new(()),
            updates,
            created,
            observed: Mutex::new(None),
        }
    }

    /// Announces channels and entries that other processes sharing the
    /// store wrote since the previous call. The first call only records a
    /// baseline. Returns the number of channels announced as changed.
    pub async fn sync_external_changes(&self) -> CoreResult<usize> {
        let _guard = self.write_lock.lock().await;
        let registry = self.load_registry().await?;
        let mut observed = self.observed.lock().await;

        if observed.is_none() {
            let mut baseline = HashMap::with_capacity(registry.channels.len());
            for channel_id in &registry.channels {
                baseline.insert(channel_id.clone(), self.load_info(channel_id).await?.entries.len());
            }
            debug!(channels = baseline.len(), "channels: external sync baseline taken");
            *observed = Some(baseline);
            return Ok(0);
        }
        let Some(seen_counts) = observed.as_mut() else {
            return Ok(0);
        };

        let mut changed = 0;
        for channel_id in &registry.channels {
            let info = match self.load_info(channel_id).await {
                Ok(info) => info,
                Err(err) => {
                    warn!(channel_id = %channel_id, "channels: skipping unreadable channel: {err}");
                    continue;
                }
            };
            let current = info.entries.len();
            let previous = match seen_counts.insert(channel_id.clone(), current) {
                Some(previous) => previous,
                None => {
                    let _ = self.created.send(info.record());
                    0
                }
            };
            if previous == current {
                continue;
            }
            // A shorter list means history was rewritten elsewhere.
            let start = if previous < current { previous } else { 0 };
            let _ = self.updates.send(ChannelUpdate {
                channel_info: channel_info_ref(channel_id),
                channel_id: channel_id.clone(),
                owner: info.owner.clone(),
                change_time: Utc::now(),
                changed_entries: info.entries[start..].to_vec(),
            });
            changed += 1;
        }
        if changed > 0 {
            info!(channels = changed, "channels: external changes announced");
        }
        Ok(changed)
    }

    async fn note_entry_count(&self, channel_id: &ChannelId, count: usize) {
        if let Some(seen_counts) = self.observed.lock().await.as_mut() {
            seen_counts.insert(channel_id.clone(), count);
        }
    }

    async fn load_info(&self, channel_id: &ChannelId) -> CoreResult<ChannelInfo> {
        get_typed_by_identity::<ChannelInfo>(&*self.store, CHANNEL_INFO_TYPE, channel_id.as_str())
            .await
            .map(|(info, _)| info)
            .map_err(|err| match err {
                CoreError::NotFound(_) => CoreError::not_found(format!("channel {channel_id}")),
                other => other,
            })
    }

    async fn register(&self, channel_id: &ChannelId) -> CoreResult<()> {
        update_typed::<ChannelRegistry, _>(
            &*self.store,
            CHANNEL_REGISTRY_TYPE,
            REGISTRY_IDENTITY,
            |current| {
                let mut registry = current.unwrap_or_default();
                Ok(registry
                    .channels
                    .insert(channel_id.clone())
                    .then_some(registry))
            },
        )
        .await?;
        Ok(())
    }

    async fn load_registry(&self) -> CoreResult<ChannelRegistry> {
        match get_typed_by_identity::<ChannelRegistry>(
            &*self.store,
            CHANNEL_REGISTRY_TYPE,
            REGISTRY_IDENTITY,
        )
        .await
        {
            Ok((registry, _)) => Ok(registry),
            Err(CoreError::NotFound(_)) => Ok(ChannelRegistry::default()),
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl ChannelManager for StoreChannelManager {
    async fn create_channel(
        &self,
        channel_id: &ChannelId,
        owner: Option<&PersonId>,
    ) -> CoreResult<ChannelRecord> {
        let record = {
            let _guard = self.write_lock.lock().await;
            let info = ChannelInfo {
                id: channel_id.clone(),
                owner: owner.cloned(),
                created_at: Utc::now(),
                entries: Vec::new(),
            };
            // Creation is conditional on the identity being absent, so of
            // two nodes sharing the store exactly one succeeds.
            update_typed::<ChannelInfo, _>(
                &*self.store,
                CHANNEL_INFO_TYPE,
                channel_id.as_str(),
                |current| match current {
                    Some(_) => Err(CoreError::already_exists(format!("channel {channel_id}"))),
                    None => Ok(Some(info.clone())),
                },
            )
            .await?;
            self.register(channel_id).await?;
            self.note_entry_count(channel_id, 0).await;
            info.record()
        };

        info!(channel_id = %channel_id, owner = ?record.owner, "channels: channel created");
        let _ = self.created.send(record.clone());
        Ok(record)
    }

    async fn enter_room(&self, channel_id: &ChannelId) -> CoreResult<RoomHandle> {
        Ok(self.load_info(channel_id).await?.room())
    }

    async fn matching_channels(&self, filter: &ChannelFilter) -> CoreResult<Vec<ChannelRecord>> {
        let registry = self.load_registry().await?;
        let mut records = Vec::new();
        for channel_id in &registry.channels {
            let record = self.load_info(channel_id).await?.record();
            if filter.matches(&record) {
                records.push(record);
            }
        }
        Ok(records)
    }

    async fn all_messages(&self, room: &RoomHandle) -> CoreResult<Vec<ChannelMessage>> {
        let info = self.load_info(&room.channel_id).await?;
        let mut messages = Vec::with_capacity(info.entries.len());
        for entry in &info.entries {
            messages.push(get_typed(&*self.store, CHANNEL_ENTRY_TYPE, entry).await?);
        }
        Ok(messages)
    }

    async fn post_message(
        &self,
        room: &RoomHandle,
        message: ChannelMessage,
    ) -> CoreResult<ContentRef> {
        let (entry, owner) = {
            let _guard = self.write_lock.lock().await;
            let entry = put_typed(&*self.store, CHANNEL_ENTRY_TYPE, None, &message).await?;
            let appended = update_typed::<ChannelInfo, _>(
                &*self.store,
                CHANNEL_INFO_TYPE,
                room.channel_id.as_str(),
                |current| match current {
                    Some(mut info) => {
                        info.entries.push(entry.clone());
                        Ok(Some(info))
                    }
                    None => Err(CoreError::not_found(format!("channel {}", room.channel_id))),
                },
            )
            .await?;
            let Some(info) = appended else {
                return Err(CoreError::invalid_state(format!(
                    "append to {} wrote nothing",
                    room.channel_id
                )));
            };
            self.note_entry_count(&room.channel_id, info.entries.len()).await;
            (entry, info.owner)
        };

        debug!(
            channel_id = %room.channel_id,
            entry = %entry,
            logical_id = %message.record.logical_id,
            "channels: message posted"
        );
        let _ = self.updates.send(ChannelUpdate {
            channel_info: channel_info_ref(&room.channel_id),
            channel_id: room.channel_id.clone(),
            owner,
            change_time: Utc::now(),
            changed_entries: vec![entry.clone()],
        });
        Ok(entry)
    }

    fn subscribe_updates(&self) -> broadcast::Receiver<ChannelUpdate> {
        self.updates.subscribe()
    }

    fn subscribe_created(&self) -> broadcast::Receiver<ChannelRecord> {
        self.created.subscribe()
    }
}

/// Exposes a [`ChannelManager`] as the history source used to rebuild
/// version chains.
pub struct ChannelManagerHistory {
    channels: Arc<dyn ChannelManager>,
}

impl ChannelManagerHistory {
    pub fn new(channels: Arc<dyn ChannelManager>) -> Self {
        Self { channels }
    }
}

#[async_trait]
impl ChannelHistory for ChannelManagerHistory {
    async fn channel_messages(&self, channel_id: &ChannelId) -> CoreResult<Vec<ChannelMessage>> {
        let room = self.channels.enter_room(channel_id).await?;
        self.channels.all_messages(&room).await
    }
}

#[cfg(test)]
#[path = "tests/channel_manager_tests.rs"]
mod tests;
