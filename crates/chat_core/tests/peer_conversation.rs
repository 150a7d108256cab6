use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chat_core::{
    ChannelChange, ChannelChangeHandler, ChannelManager, ChannelManagerHistory, Conversation,
    FederationAccess, ListenerConfig, ReconcilerConfig, StaticIdentities, StoreAccessControl,
    StoreChannelManager, TopicReconciler, UpdateListener,
};
use shared::{
    domain::{GroupId, PersonId},
    protocol::MessageContent,
};
use storage::{ObjectStore, SqliteObjectStore};
use tokio::sync::Mutex;
use versioning::MessageVersioning;

#[derive(Default)]
struct Inbox {
    texts: Mutex<Vec<String>>,
}

#[async_trait]
impl ChannelChangeHandler for Inbox {
    async fn on_channel_changed(&self, change: ChannelChange) -> anyhow::Result<()> {
        self.texts.lock().await.push(change.display.content.text);
        Ok(())
    }
}

struct Peer {
    id: PersonId,
    reconciler: Arc<TopicReconciler>,
    conversation: Conversation,
}

fn peer(
    id: &str,
    channels: &Arc<StoreChannelManager>,
    federation: &Arc<FederationAccess>,
    versioning: &Arc<MessageVersioning>,
) -> Peer {
    let id = PersonId::new(id);
    let mut config = ReconcilerConfig::new(id.clone());
    config.race_backoff = Duration::from_millis(20);
    Peer {
        reconciler: Arc::new(TopicReconciler::new(
            config,
            channels.clone(),
            federation.clone(),
            versioning.clone(),
        )),
        conversation: Conversation::new(id.clone(), channels.clone(), versioning.clone()),
        id,
    }
}

#[tokio::test]
async fn peers_exchange_messages_over_sqlite_store() {
    let store: Arc<dyn ObjectStore> = Arc::new(
        SqliteObjectStore::new("sqlite::memory:")
            .await
            .expect("open store"),
    );
    let channels = Arc::new(StoreChannelManager::new(store.clone()));
    let federation = Arc::new(FederationAccess::new(
        Arc::new(StoreAccessControl::new(store.clone())),
        vec![GroupId::new("everyone")],
    ));
    let versioning = Arc::new(MessageVersioning::new(
        store,
        Arc::new(ChannelManagerHistory::new(channels.clone())),
    ));

    let alice = peer("alice", &channels, &federation, &versioning);
    let bob = peer("bob", &channels, &federation, &versioning);

    let inbox = Arc::new(Inbox::default());
    let listener = UpdateListener::new(
        ListenerConfig::peer_notifications().with_quiescence(Duration::from_millis(20)),
        channels.clone(),
        bob.reconciler.clone(),
        versioning.clone(),
        Arc::new(StaticIdentities::new(bob.id.clone(), [])),
        inbox.clone(),
    );
    assert!(listener.start().await);

    let room = alice
        .reconciler
        .ensure_topic(&alice.id, &bob.id)
        .await
        .expect("alice opens topic");
    let sent = alice
        .conversation
        .send(&room, MessageContent::text("hi bob"))
        .await
        .expect("send");

    let mut delivered = Vec::new();
    for _ in 0..100 {
        delivered = inbox.texts.lock().await.clone();
        if !delivered.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(delivered, vec!["hi bob".to_string()]);
    assert!(bob.reconciler.is_known(&room.channel_id).await);

    // A restarted process only has the channel to go on.
    let fresh = MessageVersioning::new(
        Arc::new(
            SqliteObjectStore::new("sqlite::memory:")
                .await
                .expect("fresh store"),
        ),
        Arc::new(ChannelManagerHistory::new(channels.clone())),
    );
    assert_eq!(fresh.rebuild_chain(&room.channel_id).await.expect("rebuild"), 1);
    let latest = fresh
        .get_latest_version(&sent.logical_id)
        .await
        .expect("latest")
        .expect("present after rebuild");
    assert_eq!(latest.record.content.text, "hi bob");

    let (room_again, _) = bob
        .reconciler
        .resolve_topic(&bob.id, &alice.id, true)
        .await
        .expect("bob enters");
    assert_eq!(room_again.channel_id, room.channel_id);
    assert_eq!(channels.all_messages(&room).await.expect("messages").len(), 1);

    listener.stop().await;
}
