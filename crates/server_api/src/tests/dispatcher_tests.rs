use super::*;
use crate::{registry::ConnectionHandle, test_support::RecordingHandle};
use shared::domain::ChatKind;
use storage::NewChat;

async fn group_of_three() -> (Storage, ChatId, [UserId; 3]) {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let alice = storage.create_user("alice", "a@x.com", "h").await.expect("alice");
    let bob = storage.create_user("bob", "b@x.com", "h").await.expect("bob");
    let carol = storage.create_user("carol", "c@x.com", "h").await.expect("carol");
    let members = vec![(alice, "ka".to_string()), (bob, "kb".to_string())];
    let chat = storage
        .create_chat(NewChat {
            kind: ChatKind::Group,
            name: Some("pair"),
            created_by: alice,
            raw_aes_key: None,
            members: &members,
        })
        .await
        .expect("chat");
    (storage, chat, [alice, bob, carol])
}

#[tokio::test]
async fn broadcast_reaches_online_members_only() {
    let (storage, chat, [alice, bob, carol]) = group_of_three().await;
    let registry = ConnectionRegistry::new();
    let dispatcher = Dispatcher::new(storage, registry.clone(), DEFAULT_WRITE_TIMEOUT);

    let alice_conn = RecordingHandle::new();
    let carol_conn = RecordingHandle::new();
    registry.bind(alice, alice_conn.shared());
    registry.bind(carol, carol_conn.shared());

    let delivered = dispatcher
        .broadcast(chat, &ServerEvent::NewChat { chat_id: chat })
        .await
        .expect("broadcast");

    assert_eq!(delivered, 1);
    assert_eq!(alice_conn.event_names(), vec!["new_chat"]);
    assert!(carol_conn.sent().is_empty());
    assert!(registry.lookup(bob).is_none());
}

#[tokio::test]
async fn failed_write_evicts_connection_without_aborting_fanout() {
    let (storage, chat, [alice, bob, _]) = group_of_three().await;
    let registry = ConnectionRegistry::new();
    let dispatcher = Dispatcher::new(storage, registry.clone(), DEFAULT_WRITE_TIMEOUT);

    let broken = RecordingHandle::failing();
    let healthy = RecordingHandle::new();
    registry.bind(alice, broken.shared());
    registry.bind(bob, healthy.shared());

    let delivered = dispatcher
        .broadcast(chat, &ServerEvent::NewChat { chat_id: chat })
        .await
        .expect("broadcast");

    assert_eq!(delivered, 1);
    assert!(broken.is_closed());
    assert!(registry.lookup(alice).is_none());
    assert_eq!(healthy.sent().len(), 1);
}

#[tokio::test]
async fn stalled_write_times_out_and_is_evicted() {
    let (storage, chat, [alice, bob, _]) = group_of_three().await;
    let registry = ConnectionRegistry::new();
    let dispatcher = Dispatcher::new(storage, registry.clone(), Duration::from_millis(50));

    let stalled = RecordingHandle::stalling();
    let healthy = RecordingHandle::new();
    registry.bind(alice, stalled.shared());
    registry.bind(bob, healthy.shared());

    let delivered = dispatcher
        .broadcast(chat, &ServerEvent::NewChat { chat_id: chat })
        .await
        .expect("broadcast");

    assert_eq!(delivered, 1);
    assert!(stalled.is_closed());
    assert!(registry.lookup(alice).is_none());
    assert!(registry.lookup(bob).is_some());
}

#[tokio::test]
async fn eviction_spares_a_newer_connection() {
    let (storage, _, [alice, _, _]) = group_of_three().await;
    let registry = ConnectionRegistry::new();
    let dispatcher = Dispatcher::new(storage, registry.clone(), DEFAULT_WRITE_TIMEOUT);

    let stale = RecordingHandle::failing();
    let fresh = RecordingHandle::new();
    registry.bind(alice, stale.shared());
    let snapshot = registry.snapshot(&[alice]);
    registry.bind(alice, fresh.shared());

    let (user_id, handle) = snapshot.into_iter().next().expect("snapshot");
    assert!(!dispatcher.write(user_id, &handle, "{}".into()).await);
    assert_eq!(
        registry.lookup(alice).expect("still bound").connection_id(),
        fresh.connection_id()
    );
}

#[tokio::test]
async fn notify_users_targets_listed_users() {
    let (storage, chat, [alice, bob, _]) = group_of_three().await;
    let registry = ConnectionRegistry::new();
    let dispatcher = Dispatcher::new(storage, registry.clone(), DEFAULT_WRITE_TIMEOUT);

    let alice_conn = RecordingHandle::new();
    let bob_conn = RecordingHandle::new();
    registry.bind(alice, alice_conn.shared());
    registry.bind(bob, bob_conn.shared());

    let delivered = dispatcher
        .notify_users(&[alice], &ServerEvent::NewChat { chat_id: chat })
        .await;
    assert_eq!(delivered, 1);
    assert_eq!(alice_conn.sent().len(), 1);
    assert!(bob_conn.sent().is_empty());
}

#[tokio::test]
async fn wedged_connection_does_not_block_fanout() {
    let (storage, chat, [alice, bob, _]) = group_of_three().await;
    let registry = ConnectionRegistry::new();
    let dispatcher = Dispatcher::new(storage, registry.clone(), Duration::from_millis(50));

    let wedged = RecordingHandle::wedged();
    let healthy = RecordingHandle::new();
    registry.bind(alice, wedged.shared());
    registry.bind(bob, healthy.shared());

    let delivered = tokio::time::timeout(
        Duration::from_secs(2),
        dispatcher.broadcast(chat, &ServerEvent::NewChat { chat_id: chat }),
    )
    .await
    .expect("broadcast finishes despite a hung close")
    .expect("broadcast");

    assert_eq!(delivered, 1);
    assert!(wedged.is_closed());
    assert!(registry.lookup(alice).is_none());
    assert_eq!(healthy.sent().len(), 1);
}
