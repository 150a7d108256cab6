use std::{
    collections::VecDeque,
    sync::atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;
use shared::{
    domain::{ContentRef, GroupId},
    protocol::{ChannelFilter, ChannelRecord, ChannelUpdate},
};
use tokio::sync::{broadcast, Barrier, Mutex};

use super::*;
use crate::{
    channel_manager::{channel_info_ref, StoreChannelManager},
    test_support::{config, Fixture, FEDERATION_GROUP},
};

/// Delegates to a real manager after replaying scripted failures. With
/// `racing` set, the first two `enter_room` calls rendezvous and report
/// "not found" so two peers both decide to create.
struct ScriptedChannels {
    inner: Arc<StoreChannelManager>,
    enter_failures: Mutex<VecDeque<CoreError>>,
    create_failures: Mutex<VecDeque<CoreError>>,
    racing: Option<Barrier>,
    enters: AtomicUsize,
}

impl ScriptedChannels {
    fn failing(
        inner: Arc<StoreChannelManager>,
        enter_failures: Vec<CoreError>,
        create_failures: Vec<CoreError>,
    ) -> Self {
        Self {
            inner,
            enter_failures: Mutex::new(enter_failures.into()),
            create_failures: Mutex::new(create_failures.into()),
            racing: None,
            enters: AtomicUsize::new(0),
        }
    }

    fn racing(inner: Arc<StoreChannelManager>) -> Self {
        Self {
            racing: Some(Barrier::new(2)),
            ..Self::failing(inner, Vec::new(), Vec::new())
        }
    }
}

#[async_trait]
impl ChannelManager for ScriptedChannels {
    async fn create_channel(
        &self,
        channel_id: &ChannelId,
        owner: Option<&PersonId>,
    ) -> CoreResult<ChannelRecord> {
        if let Some(err) = self.create_failures.lock().await.pop_front() {
            return Err(err);
        }
        self.inner.create_channel(channel_id, owner).await
    }

    async fn enter_room(&self, channel_id: &ChannelId) -> CoreResult<RoomHandle> {
        let seen = self.enters.fetch_add(1, Ordering::SeqCst);
        if let Some(barrier) = &self.racing {
            if seen < 2 {
                barrier.wait().await;
                return Err(CoreError::not_found(format!("channel {channel_id}")));
            }
        }
        if let Some(err) = self.enter_failures.lock().await.pop_front() {
            return Err(err);
        }
        self.inner.enter_room(channel_id).await
    }

    async fn matching_channels(&self, filter: &ChannelFilter) -> CoreResult<Vec<ChannelRecord>> {
        self.inner.matching_channels(filter).await
    }

    async fn all_messages(&self, room: &RoomHandle) -> CoreResult<Vec<ChannelMessage>> {
        self.inner.all_messages(room).await
    }

    async fn post_message(
        &self,
        room: &RoomHandle,
        message: ChannelMessage,
    ) -> CoreResult<ContentRef> {
        self.inner.post_message(room, message).await
    }

    fn subscribe_updates(&self) -> broadcast::Receiver<ChannelUpdate> {
        self.inner.subscribe_updates()
    }

    fn subscribe_created(&self) -> broadcast::Receiver<ChannelRecord> {
        self.inner.subscribe_created()
    }
}

fn person(id: &str) -> PersonId {
    PersonId::new(id)
}

fn incoming(sender: &str) -> ChannelMessage {
    ChannelMessage {
        sender: person(sender),
        posted_at: Utc::now(),
        record: create_version(MessageContent::text("hello"), person(sender), None),
    }
}

#[test]
fn channel_id_is_symmetric() {
    let ab = compute_channel_id(&person("alice"), &person("bob"));
    let ba = compute_channel_id(&person("bob"), &person("alice"));
    assert_eq!(ab, ba);
    assert_eq!(ab.as_str(), "alice<->bob");
    assert_eq!(
        ab.p2p_participants(),
        Some((person("alice"), person("bob")))
    );
}

#[test]
fn fallback_policies_differ_only_on_transient_failures() {
    let missing = CoreError::not_found("x");
    let exists = CoreError::already_exists("x");
    let transient = CoreError::transient("x");
    let broken = CoreError::invalid_state("x");

    for policy in [FallbackPolicy::Permissive, FallbackPolicy::Strict] {
        assert!(policy.proceeds_after_enter_failure(&missing));
        assert!(policy.proceeds_after_create_failure(&exists));
        assert!(!policy.proceeds_after_enter_failure(&broken));
        assert!(!policy.proceeds_after_create_failure(&broken));
    }
    assert!(FallbackPolicy::Permissive.proceeds_after_enter_failure(&transient));
    assert!(FallbackPolicy::Permissive.proceeds_after_create_failure(&transient));
    assert!(!FallbackPolicy::Strict.proceeds_after_enter_failure(&transient));
    assert!(!FallbackPolicy::Strict.proceeds_after_create_failure(&transient));
    assert_eq!(FallbackPolicy::default(), FallbackPolicy::Permissive);
}

#[tokio::test]
async fn creates_then_enters_existing_topic() {
    let fixture = Fixture::new();
    let alice = fixture.reconciler("alice");
    let bob = fixture.reconciler("bob");

    let (room, resolution) = alice
        .resolve_topic(&person("alice"), &person("bob"), true)
        .await
        .expect("alice opens");
    assert_eq!(resolution, TopicResolution::Created);
    assert_eq!(room.channel_id.as_str(), "alice<->bob");
    assert!(alice.is_known(&room.channel_id).await);

    let (joined, resolution) = bob
        .resolve_topic(&person("bob"), &person("alice"), true)
        .await
        .expect("bob opens");
    assert_eq!(resolution, TopicResolution::Entered);
    assert_eq!(joined.channel_id, room.channel_id);

    let grant = fixture
        .access
        .grant_for(&channel_info_ref(&room.channel_id))
        .await
        .expect("grant lookup")
        .expect("grant present");
    assert!(grant.groups.contains(&GroupId::new(FEDERATION_GROUP)));
}

#[tokio::test]
async fn welcome_is_posted_only_by_initiating_creator() {
    let fixture = Fixture::new();
    let mut with_welcome = config("alice");
    with_welcome.welcome_message = Some("hi bob".to_string());
    let alice = fixture.reconciler_with(with_welcome, fixture.channels.clone());

    let room = alice
        .ensure_topic(&person("alice"), &person("bob"))
        .await
        .expect("topic");
    let messages = fixture.channels.all_messages(&room).await.expect("messages");
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].sender, person("alice"));
    assert_eq!(messages[0].record.content.text, "hi bob");
    assert!(fixture
        .versioning
        .get_latest_version(&messages[0].record.logical_id)
        .await
        .expect("latest")
        .is_some());

    // Entering an existing topic never re-sends.
    alice
        .ensure_topic(&person("alice"), &person("bob"))
        .await
        .expect("again");
    assert_eq!(
        fixture.channels.all_messages(&room).await.expect("messages").len(),
        1
    );

    let mut quiet = config("carol");
    quiet.welcome_message = Some("hi".to_string());
    let carol = fixture.reconciler_with(quiet, fixture.channels.clone());
    let channel_id = compute_channel_id(&person("carol"), &person("dave"));
    let room = carol
        .ensure_channel_for_incoming_message(&channel_id, &incoming("dave"))
        .await
        .expect("incoming topic");
    assert!(fixture
        .channels
        .all_messages(&room)
        .await
        .expect("messages")
        .is_empty());
}

#[tokio::test]
async fn incoming_message_derives_remote_participant() {
    let fixture = Fixture::new();
    let bob = fixture.reconciler("bob");
    let channel_id = ChannelId::new("alice<->bob");

    let room = bob
        .ensure_channel_for_incoming_message(&channel_id, &incoming("alice"))
        .await
        .expect("topic");
    assert_eq!(room.channel_id, channel_id);
    assert!(bob.is_known(&channel_id).await);
}

#[tokio::test]
async fn incoming_on_foreign_or_non_p2p_channel_is_configuration_error() {
    let fixture = Fixture::new();
    let bob = fixture.reconciler("bob");

    let err = bob
        .ensure_channel_for_incoming_message(&ChannelId::new("alice<->carol"), &incoming("alice"))
        .await
        .expect_err("bob is not a participant");
    assert!(matches!(err, CoreError::Configuration(_)));

    let err = bob
        .ensure_channel_for_incoming_message(&ChannelId::new("general"), &incoming("alice"))
        .await
        .expect_err("not a peer channel");
    assert!(matches!(err, CoreError::Configuration(_)));

    assert!(fixture
        .channels
        .matching_channels(&ChannelFilter::default())
        .await
        .expect("channels")
        .is_empty());
}

#[tokio::test(start_paused = true)]
async fn concurrent_creation_converges_on_one_channel() {
    let fixture = Fixture::new();
    let racing: Arc<dyn ChannelManager> =
        Arc::new(ScriptedChannels::racing(fixture.channels.clone()));
    let mut alice_config = config("alice");
    alice_config.welcome_message = Some("from alice".to_string());
    let mut bob_config = config("bob");
    bob_config.welcome_message = Some("from bob".to_string());
    let alice = fixture.reconciler_with(alice_config, racing.clone());
    let bob = fixture.reconciler_with(bob_config, racing);

    let alice_id = person("alice");
    let bob_id = person("bob");
    let (from_alice, from_bob) = tokio::join!(
        alice.resolve_topic(&alice_id, &bob_id, true),
        bob.resolve_topic(&bob_id, &alice_id, true),
    );
    let (alice_room, alice_resolution) = from_alice.expect("alice resolves");
    let (bob_room, bob_resolution) = from_bob.expect("bob resolves");

    assert_eq!(alice_room.channel_id, bob_room.channel_id);
    let resolutions = [alice_resolution, bob_resolution];
    assert!(resolutions.contains(&TopicResolution::Created));
    assert!(resolutions.contains(&TopicResolution::JoinedAfterRace));

    let channels = fixture
        .channels
        .matching_channels(&ChannelFilter::default())
        .await
        .expect("channels");
    assert_eq!(channels.len(), 1);
    // Only the winner greets.
    assert_eq!(
        fixture
            .channels
            .all_messages(&alice_room)
            .await
            .expect("messages")
            .len(),
        1
    );
    assert!(alice.is_known(&alice_room.channel_id).await);
    assert!(bob.is_known(&bob_room.channel_id).await);
}

#[tokio::test(start_paused = true)]
async fn retry_failure_after_backoff_is_reported() {
    let fixture = Fixture::new();
    let faulty: Arc<dyn ChannelManager> = Arc::new(ScriptedChannels::failing(
        fixture.channels.clone(),
        vec![CoreError::not_found("first"), CoreError::not_found("retry")],
        vec![CoreError::already_exists("peer won")],
    ));
    let alice = fixture.reconciler_with(config("alice"), faulty);

    let started = tokio::time::Instant::now();
    let err = alice
        .resolve_topic(&person("alice"), &person("bob"), true)
        .await
        .expect_err("channel never appears");
    assert!(err.is_not_found());
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert!(!alice.is_known(&ChannelId::new("alice<->bob")).await);
}

#[tokio::test]
async fn transient_enter_failure_depends_on_policy() {
    let fixture = Fixture::new();

    let mut strict = config("alice");
    strict.policy = FallbackPolicy::Strict;
    let faulty: Arc<dyn ChannelManager> = Arc::new(ScriptedChannels::failing(
        fixture.channels.clone(),
        vec![CoreError::transient("disk busy")],
        Vec::new(),
    ));
    let err = fixture
        .reconciler_with(strict, faulty)
        .resolve_topic(&person("alice"), &person("bob"), true)
        .await
        .expect_err("strict surfaces transient failures");
    assert!(matches!(err, CoreError::TransientIo(_)));

    let faulty: Arc<dyn ChannelManager> = Arc::new(ScriptedChannels::failing(
        fixture.channels.clone(),
        vec![CoreError::transient("disk busy")],
        Vec::new(),
    ));
    let (_, resolution) = fixture
        .reconciler_with(config("alice"), faulty)
        .resolve_topic(&person("alice"), &person("bob"), true)
        .await
        .expect("permissive proceeds to create");
    assert_eq!(resolution, TopicResolution::Created);
}

#[tokio::test]
async fn unexpected_create_failure_propagates() {
    let fixture = Fixture::new();
    let faulty: Arc<dyn ChannelManager> = Arc::new(ScriptedChannels::failing(
        fixture.channels.clone(),
        Vec::new(),
        vec![CoreError::invalid_state("corrupt registry")],
    ));
    let err = fixture
        .reconciler_with(config("alice"), faulty)
        .resolve_topic(&person("alice"), &person("bob"), true)
        .await
        .expect_err("create failure");
    assert!(matches!(err, CoreError::InvalidState(_)));
}

#[tokio::test]
async fn participant_ids_with_separator_are_rejected_before_any_lookup() {
    let fixture = Fixture::new();
    let scripted = Arc::new(ScriptedChannels::failing(
        fixture.channels.clone(),
        Vec::new(),
        Vec::new(),
    ));
    let alice = fixture.reconciler_with(config("al<->ice"), scripted.clone());

    let err = alice
        .ensure_topic(&person("al<->ice"), &person("bob"))
        .await
        .expect_err("ambiguous local id");
    assert!(matches!(err, CoreError::Configuration(_)));
    let err = alice
        .resolve_topic(&person("bob"), &person("c<->d"), true)
        .await
        .expect_err("ambiguous remote id");
    assert!(matches!(err, CoreError::Configuration(_)));

    assert_eq!(scripted.enters.load(Ordering::SeqCst), 0);
    let channels = fixture
        .channels
        .matching_channels(&ChannelFilter::default())
        .await
        .expect("channels");
    assert!(channels.is_empty());
}
