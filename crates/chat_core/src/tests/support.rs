use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use shared::{
    domain::{GroupId, PersonId},
    protocol::RoomHandle,
};
use storage::{MemoryObjectStore, ObjectStore};
use tokio::sync::Mutex;
use versioning::MessageVersioning;

use crate::{
    access::{FederationAccess, StoreAccessControl},
    channel_manager::{ChannelManager, ChannelManagerHistory, StoreChannelManager},
    listener::{ChannelChange, ChannelChangeHandler},
    reconcile::{ReconcilerConfig, TopicReconciler},
};

pub const FEDERATION_GROUP: &str = "federation";

/// One shared store and channel manager standing in for a synced federation.
pub struct Fixture {
    pub store: Arc<MemoryObjectStore>,
    pub channels: Arc<StoreChannelManager>,
    pub access: Arc<StoreAccessControl>,
    pub federation: Arc<FederationAccess>,
    pub versioning: Arc<MessageVersioning>,
}

impl Fixture {
    pub fn new() -> Self {
        let store = Arc::new(MemoryObjectStore::new());
        let dyn_store: Arc<dyn ObjectStore> = store.clone();
        let channels = Arc::new(StoreChannelManager::new(dyn_store.clone()));
        let access = Arc::new(StoreAccessControl::new(dyn_store.clone()));
        let federation = Arc::new(FederationAccess::new(
            access.clone(),
            vec![GroupId::new(FEDERATION_GROUP)],
        ));
        let versioning = Arc::new(MessageVersioning::new(
            dyn_store,
            Arc::new(ChannelManagerHistory::new(channels.clone())),
        ));
        Self {
            store,
            channels,
            access,
            federation,
            versioning,
        }
    }

    pub fn reconciler(&self, local: &str) -> Arc<TopicReconciler> {
        self.reconciler_with(config(local), self.channels.clone())
    }

    pub fn reconciler_with(
        &self,
        config: ReconcilerConfig,
        channels: Arc<dyn ChannelManager>,
    ) -> Arc<TopicReconciler> {
        Arc::new(TopicReconciler::new(
            config,
            channels,
            self.federation.clone(),
            self.versioning.clone(),
        ))
    }

    pub async fn p2p_room(&self, a: &str, b: &str) -> RoomHandle {
        self.reconciler(a)
            .ensure_topic(&PersonId::new(a), &PersonId::new(b))
            .await
            .expect("p2p room")
    }
}

pub fn config(local: &str) -> ReconcilerConfig {
    let mut config = ReconcilerConfig::new(PersonId::new(local));
    config.race_backoff = Duration::from_millis(50);
    config
}

#[derive(Default)]
pub struct RecordingHandler {
    pub changes: Mutex<Vec<ChannelChange>>,
    /// Calls to reject before recording starts.
    pub failures: Mutex<usize>,
}

impl RecordingHandler {
    pub async fn count(&self) -> usize {
        self.changes.lock().await.len()
    }
}

#[async_trait]
impl ChannelChangeHandler for RecordingHandler {
    async fn on_channel_changed(&self, change: ChannelChange) -> anyhow::Result<()> {
        let mut failures = self.failures.lock().await;
        if *failures > 0 {
            *failures -= 1;
            anyhow::bail!("downstream unavailable");
        }
        self.changes.lock().await.push(change);
        Ok(())
    }
}
