//! Debounced reaction to channel updates.
//!
//! Raw update events only say "something changed in channel X". Each event
//! (re)arms a per-channel timer; when a channel has been quiet for the
//! configured window the listener re-reads the whole channel and makes at
//! most one downstream call for it.

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use shared::{
    domain::ChannelId,
    error::{CoreError, CoreResult},
    protocol::{ChannelMessage, RoomHandle},
};
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_stream::{
    wrappers::{errors::BroadcastStreamRecvError, BroadcastStream},
    StreamExt,
};
use tracing::{debug, info, warn};
use versioning::{DisplayRecord, MessageEvent, MessageVersioning};

use crate::{channel_manager::ChannelManager, identity::IdentityOracle, reconcile::TopicReconciler};

pub const PEER_NOTIFICATION_QUIESCENCE: Duration = Duration::from_millis(100);
pub const AI_RESPONDER_QUIESCENCE: Duration = Duration::from_millis(800);
pub const DEFAULT_MAX_MESSAGE_AGE: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub name: String,
    pub quiescence: Duration,
    /// Messages posted longer ago than this are not acted on.
    pub max_message_age: Option<Duration>,
    pub skip_automated_senders: bool,
}

impl ListenerConfig {
    pub fn peer_notifications() -> Self {
        Self {
            name: "peer-notifications".to_string(),
            quiescence: PEER_NOTIFICATION_QUIESCENCE,
            max_message_age: Some(DEFAULT_MAX_MESSAGE_AGE),
            skip_automated_senders: false,
        }
    }

    pub fn ai_responder() -> Self {
        Self {
            name: "ai-responder".to_string(),
            quiescence: AI_RESPONDER_QUIESCENCE,
            max_message_age: Some(DEFAULT_MAX_MESSAGE_AGE),
            skip_automated_senders: true,
        }
    }

    pub fn with_quiescence(mut self, quiescence: Duration) -> Self {
        self.quiescence = quiescence;
        self
    }
}

#[derive(Debug, Clone)]
pub struct ChannelChange {
    pub room: RoomHandle,
    pub message: ChannelMessage,
    pub event: MessageEvent,
    pub display: DisplayRecord,
    pub message_count: usize,
}

#[async_trait]
pub trait ChannelChangeHandler: Send + Sync {
    async fn on_channel_changed(&self, change: ChannelChange) -> anyhow::Result<()>;
}

pub struct UpdateListener {
    inner: Arc<ListenerInner>,
}

struct ListenerInner {
    config: ListenerConfig,
    channels: Arc<dyn ChannelManager>,
    reconciler: Arc<TopicReconciler>,
    versioning: Arc<MessageVersioning>,
    identities: Arc<dyn IdentityOracle>,
    handler: Arc<dyn ChannelChangeHandler>,
    state: Mutex<ListenerState>,
}

#[derive(Default)]
struct ListenerState {
    subscription: Option<JoinHandle<()>>,
    pending: HashMap<ChannelId, DebounceEntry>,
    last_seen_message_count: HashMap<ChannelId, usize>,
    // Held while a channel's handler runs so windows never overlap.
    in_flight: HashMap<ChannelId, Arc<Mutex<()>>>,
    next_generation: u64,
}

struct DebounceEntry {
    timer: JoinHandle<()>,
    generation: u64,
}

impl UpdateListener {
    pub fn new(
        config: ListenerConfig,
        channels: Arc<dyn ChannelManager>,
        reconciler: Arc<TopicReconciler>,
        versioning: Arc<MessageVersioning>,
        identities: Arc<dyn IdentityOracle>,
        handler: Arc<dyn ChannelChangeHandler>,
    ) -> Self {
        Self {
            inner: Arc::new(ListenerInner {
                config,
                channels,
                reconciler,
                versioning,
                identities,
                handler,
                state: Mutex::new(ListenerState::default()),
            }),
        }
    }

    /// Subscribes to channel updates. Returns `false` if already started.
    pub async fn start(&self) -> bool {
        let mut state = self.inner.state.lock().await;
        if state.subscription.is_some() {
            debug!(listener = %self.inner.config.name, "listener: already started");
            return false;
        }

        let mut updates = BroadcastStream::new(self.inner.channels.subscribe_updates());
        let inner = Arc::clone(&self.inner);
        state.subscription = Some(tokio::spawn(async move {
            while let Some(item) = updates.next().await {
                match item {
                    Ok(update) => inner.schedule(update.channel_id).await,
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        warn!(listener = %inner.config.name, skipped, "listener: update events dropped");
                    }
                }
            }
        }));
        info!(
            listener = %self.inner.config.name,
            quiescence_ms = self.inner.config.quiescence.as_millis() as u64,
            "listener: started"
        );
        true
    }

    /// Unsubscribes and drops all pending timers. Processing that already
    /// began runs to completion.
    pub async fn stop(&self) {
        let mut state = self.inner.state.lock().await;
        let was_running = state.subscription.is_some();
        if let Some(subscription) = state.subscription.take() {
            subscription.abort();
        }
        for (_, entry) in state.pending.drain() {
            entry.timer.abort();
        }
        state.last_seen_message_count.clear();
        state.in_flight.clear();
        if was_running {
            info!(listener = %self.inner.config.name, "listener: stopped");
        }
    }

    pub async fn is_running(&self) -> bool {
        self.inner.state.lock().await.subscription.is_some()
    }

    pub async fn pending_channels(&self) -> usize {
        self.inner.state.lock().await.pending.len()
    }
}

impl ListenerInner {
    async fn schedule(self: &Arc<Self>, channel_id: ChannelId) {
        let mut state = self.state.lock().await;
        state.next_generation += 1;
        let generation = state.next_generation;
        if let Some(previous) = state.pending.remove(&channel_id) {
            previous.timer.abort();
        }

        let inner = Arc::clone(self);
        let channel = channel_id.clone();
        let delay = self.config.quiescence;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.fire(channel, generation).await;
        });
        state
            .pending
            .insert(channel_id, DebounceEntry { timer, generation });
    }

    async fn fire(self: &Arc<Self>, channel_id: ChannelId, generation: u64) {
        let gate = {
            let mut state = self.state.lock().await;
            match state.pending.get(&channel_id) {
                Some(entry) if entry.generation == generation => {
                    state.pending.remove(&channel_id);
                }
                _ => return,
            }
            Arc::clone(state.in_flight.entry(channel_id.clone()).or_default())
        };

        let _serial = gate.lock().await;
        if let Err(err) = self.process(&channel_id).await {
            warn!(
                listener = %self.config.name,
                channel_id = %channel_id,
                "listener: processing failed: {err}"
            );
        }
    }

    async fn process(&self, channel_id: &ChannelId) -> CoreResult<()> {
        let room = self.channels.enter_room(channel_id).await?;
        let messages = self.channels.all_messages(&room).await?;
        let message_count = messages.len();
        if messages.is_empty() {
            debug!(listener = %self.config.name, channel_id = %channel_id, "listener: channel empty");
            return Ok(());
        }

        let previous_count = {
            let state = self.state.lock().await;
            let previous = state.last_seen_message_count.get(channel_id).copied();
            if previous == Some(message_count) {
                debug!(listener = %self.config.name, channel_id = %channel_id, "listener: no new messages");
                return Ok(());
            }
            previous.unwrap_or(0)
        };

        // The count only advances once the window's work succeeded, so a
        // failed window is replayed by the next update.
        self.react(room, messages, previous_count).await?;
        self.state
            .lock()
            .await
            .last_seen_message_count
            .insert(channel_id.clone(), message_count);
        Ok(())
    }

    async fn react(
        &self,
        room: RoomHandle,
        messages: Vec<ChannelMessage>,
        previous_count: usize,
    ) -> CoreResult<()> {
        let channel_id = &room.channel_id;
        let message_count = messages.len();
        let Some(last) = messages.last().cloned() else {
            return Ok(());
        };

        if channel_id.is_p2p() && !self.reconciler.is_known(channel_id).await {
            match self
                .reconciler
                .ensure_channel_for_incoming_message(channel_id, &last)
                .await
            {
                Ok(_) => {}
                Err(CoreError::Configuration(reason)) => {
                    warn!(listener = %self.config.name, channel_id = %channel_id, "listener: ignoring misrouted channel: {reason}");
                    return Ok(());
                }
                Err(err) => return Err(err),
            }
        }

        // A shrunken channel means history was rewritten; index it all again.
        let start = if previous_count <= message_count {
            previous_count
        } else {
            0
        };
        for message in &messages[start..] {
            self.versioning.store_message(&message.record).await?;
        }

        if !self.is_relevant(&last) {
            return Ok(());
        }

        let display = self
            .versioning
            .get_display_version(&last.record.logical_id)
            .await?
            .unwrap_or_else(|| DisplayRecord::from(&last.record));
        let change = ChannelChange {
            event: MessageEvent::of(&last.record),
            message: last,
            display,
            message_count,
            room,
        };
        debug!(
            listener = %self.config.name,
            channel_id = %change.room.channel_id,
            event = ?change.event,
            "listener: dispatching change"
        );
        self.handler
            .on_channel_changed(change)
            .await
            .map_err(|err| CoreError::transient(format!("handler failed: {err:#}")))
    }

    fn is_relevant(&self, message: &ChannelMessage) -> bool {
        if self.identities.is_self(&message.sender) {
            return false;
        }
        if self.config.skip_automated_senders
            && self.identities.is_known_automated_agent(&message.sender)
        {
            return false;
        }
        if let Some(max_age) = self.config.max_message_age {
            let age = Utc::now().signed_duration_since(message.posted_at);
            if age.to_std().map(|age| age > max_age).unwrap_or(false) {
                debug!(listener = %self.config.name, sender = %message.sender, "listener: message too old");
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
#[path = "tests/listener_tests.rs"]
mod tests;
