//! Materialising peer-pair conversations.
//!
//! Both peers derive the same channel id independently and may try to
//! create it at the same time. Creation is optimistic: try to enter the
//! room, create it when absent, and if creation loses a race wait once and
//! enter the room the other peer created.

use std::{collections::HashSet, sync::Arc, time::Duration};

use chrono::Utc;
use shared::{
    domain::{ChannelId, PersonId, P2P_SEPARATOR},
    error::{CoreError, CoreResult},
    protocol::{ChannelMessage, MessageContent, RoomHandle},
};
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use versioning::{create_version, MessageVersioning};

use crate::{access::FederationAccess, channel_manager::ChannelManager};

pub const DEFAULT_RACE_BACKOFF: Duration = Duration::from_millis(500);

/// Order-independent id of the conversation between `a` and `b`.
pub fn compute_channel_id(a: &PersonId, b: &PersonId) -> ChannelId {
    let (first, second) = if a <= b { (a, b) } else { (b, a) };
    ChannelId(format!("{first}{P2P_SEPARATOR}{second}"))
}

/// How failures of the enter and create steps feed back into the protocol.
///
/// `Permissive` treats transient I/O failures like "not found" (when
/// entering) or "lost the race" (when creating) so the messaging path keeps
/// moving. `Strict` only accepts the exact signals and surfaces the rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FallbackPolicy {
    #[default]
    Permissive,
    Strict,
}

impl FallbackPolicy {
    pub fn proceeds_after_enter_failure(self, err: &CoreError) -> bool {
        match (self, err) {
            (_, CoreError::NotFound(_)) => true,
            (Self::Permissive, CoreError::TransientIo(_)) => true,
            _ => false,
        }
    }

    pub fn proceeds_after_create_failure(self, err: &CoreError) -> bool {
        match (self, err) {
            (_, CoreError::AlreadyExists(_)) => true,
            (Self::Permissive, CoreError::TransientIo(_)) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicResolution {
    /// The room already existed.
    Entered,
    /// This side created the channel.
    Created,
    /// Creation lost a race; the peer's channel was entered after backoff.
    JoinedAfterRace,
}

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub local_id: PersonId,
    pub race_backoff: Duration,
    pub policy: FallbackPolicy,
    pub welcome_message: Option<String>,
}

impl ReconcilerConfig {
    pub fn new(local_id: PersonId) -> Self {
        Self {
            local_id,
            race_backoff: DEFAULT_RACE_BACKOFF,
            policy: FallbackPolicy::default(),
            welcome_message: None,
        }
    }
}

pub struct TopicReconciler {
    config: ReconcilerConfig,
    channels: Arc<dyn ChannelManager>,
    access: Arc<FederationAccess>,
    versioning: Arc<MessageVersioning>,
    known_topics: RwLock<HashSet<ChannelId>>,
}

impl TopicReconciler {
    pub fn new(
        config: ReconcilerConfig,
        channels: Arc<dyn ChannelManager>,
        access: Arc<FederationAccess>,
        versioning: Arc<MessageVersioning>,
    ) -> Self {
        Self {
            config,
            channels,
            access,
            versioning,
            known_topics: RwLock::new(HashSet::new()),
        }
    }

    pub fn local_id(&self) -> &PersonId {
        &self.config.local_id
    }

    pub async fn is_known(&self, channel_id: &ChannelId) -> bool {
        self.known_topics.read().await.contains(channel_id)
    }

    /// Opens the conversation between `local` and `remote`, creating it if
    /// neither side has yet.
    pub async fn ensure_topic(&self, local: &PersonId, remote: &PersonId) -> CoreResult<RoomHandle> {
        self.resolve_topic(local, remote, true)
            .await
            .map(|(room, _)| room)
    }

    /// Opens the conversation a message arrived on. The remote participant
    /// is whatever remains of the composite id once the local id is removed.
    pub async fn ensure_channel_for_incoming_message(
        &self,
        channel_id: &ChannelId,
        message: &ChannelMessage,
    ) -> CoreResult<RoomHandle> {
        let local = &self.config.local_id;
        let (first, second) = channel_id.p2p_participants().ok_or_else(|| {
            CoreError::configuration(format!("{channel_id} is not a peer-pair channel id"))
        })?;
        let remote = if first == *local {
            second
        } else if second == *local {
            first
        } else {
            return Err(CoreError::configuration(format!(
                "local id {local} is not a participant of {channel_id}"
            )));
        };
        info!(
            channel_id = %channel_id,
            remote = %remote,
            sender = %message.sender,
            "reconcile: message on unknown peer channel"
        );
        self.resolve_topic(local, &remote, false)
            .await
            .map(|(room, _)| room)
    }

    pub async fn resolve_topic(
        &self,
        local: &PersonId,
        remote: &PersonId,
        initiated: bool,
    ) -> CoreResult<(RoomHandle, TopicResolution)> {
        // Such an id would make the channel name ambiguous to split.
        for person in [local, remote] {
            if person.as_str().contains(P2P_SEPARATOR) {
                return Err(CoreError::configuration(format!(
                    "participant id '{person}' contains '{P2P_SEPARATOR}'"
                )));
            }
        }
        let channel_id = compute_channel_id(local, remote);
        let policy = self.config.policy;

        match self.channels.enter_room(&channel_id).await {
            Ok(room) => {
                self.on_materialised(&room).await;
                return Ok((room, TopicResolution::Entered));
            }
            Err(err) if policy.proceeds_after_enter_failure(&err) => {
                if !err.is_not_found() {
                    warn!(channel_id = %channel_id, "reconcile: enter failed, treating as absent: {err}");
                }
            }
            Err(err) => return Err(err),
        }

        match self.channels.create_channel(&channel_id, None).await {
            Ok(_) => {
                let room = self.channels.enter_room(&channel_id).await?;
                self.on_materialised(&room).await;
                if initiated {
                    self.send_welcome(local, &room).await;
                }
                info!(channel_id = %channel_id, "reconcile: topic created");
                return Ok((room, TopicResolution::Created));
            }
            Err(err) if policy.proceeds_after_create_failure(&err) => {
                info!(
                    channel_id = %channel_id,
                    backoff_ms = self.config.race_backoff.as_millis() as u64,
                    "reconcile: creation lost, retrying enter after backoff: {err}"
                );
            }
            Err(err) => return Err(err),
        }

        tokio::time::sleep(self.config.race_backoff).await;

        match self.channels.enter_room(&channel_id).await {
            Ok(room) => {
                self.on_materialised(&room).await;
                info!(channel_id = %channel_id, "reconcile: joined topic created by peer");
                Ok((room, TopicResolution::JoinedAfterRace))
            }
            Err(err) => {
                error!(channel_id = %channel_id, "reconcile: topic still unavailable after retry: {err}");
                Err(err)
            }
        }
    }

    async fn on_materialised(&self, room: &RoomHandle) {
        self.access
            .grant_federation_access_to_channel(&room.channel_id, room.owner.as_ref())
            .await;
        self.known_topics
            .write()
            .await
            .insert(room.channel_id.clone());
    }

    async fn send_welcome(&self, local: &PersonId, room: &RoomHandle) {
        let Some(text) = &self.config.welcome_message else {
            return;
        };
        let record = create_version(MessageContent::text(text.clone()), local.clone(), None);
        if let Err(err) = self.versioning.store_message(&record).await {
            warn!(channel_id = %room.channel_id, "reconcile: failed to store welcome: {err}");
            return;
        }
        let message = ChannelMessage {
            sender: local.clone(),
            posted_at: Utc::now(),
            record,
        };
        if let Err(err) = self.channels.post_message(room, message).await {
            warn!(channel_id = %room.channel_id, "reconcile: failed to post welcome: {err}");
        }
    }
}

#[cfg(test)]
#[path = "tests/reconcile_tests.rs"]
mod tests;
