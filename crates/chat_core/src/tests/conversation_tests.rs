use shared::error::CoreError;
use versioning::RETRACTED_PLACEHOLDER;

use super::*;
use crate::test_support::Fixture;

fn conversation(fixture: &Fixture, person: &str) -> Conversation {
    Conversation::new(
        PersonId::new(person),
        fixture.channels.clone(),
        fixture.versioning.clone(),
    )
}

#[tokio::test]
async fn send_edit_retract_appends_versions() {
    let fixture = Fixture::new();
    let room = fixture.p2p_room("alice", "bob").await;
    let alice = conversation(&fixture, "alice");

    let sent = alice
        .send(&room, MessageContent::text("hello"))
        .await
        .expect("send");
    assert_eq!(sent.version_number, 1);

    let edited = alice
        .edit(
            &room,
            &sent.logical_id,
            MessageContent::text("hello there"),
            Some("typo".to_string()),
        )
        .await
        .expect("edit");
    assert_eq!(edited.version_number, 2);
    assert_eq!(edited.logical_id, sent.logical_id);
    assert_eq!(edited.edit_reason.as_deref(), Some("typo"));

    let retracted = alice
        .retract(&room, &sent.logical_id, None)
        .await
        .expect("retract")
        .expect("first retraction");
    assert_eq!(retracted.version_number, 3);
    assert!(retracted.is_retracted);

    let posted = fixture.channels.all_messages(&room).await.expect("messages");
    assert_eq!(posted.len(), 3);
    let history = fixture
        .versioning
        .get_version_history(&sent.logical_id)
        .await
        .expect("history");
    assert_eq!(
        history.iter().map(|record| record.version_number).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
}

#[tokio::test]
async fn retracting_twice_posts_nothing() {
    let fixture = Fixture::new();
    let room = fixture.p2p_room("alice", "bob").await;
    let alice = conversation(&fixture, "alice");
    let sent = alice
        .send(&room, MessageContent::text("oops"))
        .await
        .expect("send");
    alice
        .retract(&room, &sent.logical_id, None)
        .await
        .expect("retract")
        .expect("retracted");

    let again = alice
        .retract(&room, &sent.logical_id, None)
        .await
        .expect("second retract");
    assert!(again.is_none());
    assert_eq!(
        fixture.channels.all_messages(&room).await.expect("messages").len(),
        2
    );

    let err = alice
        .edit(&room, &sent.logical_id, MessageContent::text("revive"), None)
        .await
        .expect_err("retracted messages cannot be edited");
    assert!(matches!(err, CoreError::InvalidState(_)));
}

#[tokio::test]
async fn editing_unknown_message_is_not_found() {
    let fixture = Fixture::new();
    let room = fixture.p2p_room("alice", "bob").await;
    let err = conversation(&fixture, "alice")
        .edit(&room, &LogicalMessageId::generate(), MessageContent::text("x"), None)
        .await
        .expect_err("unknown id");
    assert!(err.is_not_found());
}

#[tokio::test]
async fn display_shows_latest_state_in_first_appearance_order() {
    let fixture = Fixture::new();
    let room = fixture.p2p_room("alice", "bob").await;
    let alice = conversation(&fixture, "alice");
    let bob = conversation(&fixture, "bob");

    let first = alice
        .send(&room, MessageContent::text("first"))
        .await
        .expect("send");
    let second = bob
        .send(&room, MessageContent::text("second"))
        .await
        .expect("send");
    alice
        .edit(&room, &first.logical_id, MessageContent::text("first, edited"), None)
        .await
        .expect("edit");
    bob.retract(&room, &second.logical_id, Some("nevermind".to_string()))
        .await
        .expect("retract");

    let display = alice.display_messages(&room).await.expect("display");
    assert_eq!(display.len(), 2);
    assert_eq!(display[0].logical_id, first.logical_id);
    assert_eq!(display[0].content.text, "first, edited");
    assert!(display[0].is_edited);
    assert_eq!(display[1].logical_id, second.logical_id);
    assert_eq!(display[1].content.text, RETRACTED_PLACEHOLDER);
    assert!(display[1].is_retracted);
}
