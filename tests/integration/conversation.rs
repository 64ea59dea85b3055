use std::time::Duration;

use serde_json::json;

use message_hub::conversation::ConversationEvent;
use message_hub::error::HistoryError;
use message_hub::models::MessageFlags;

use crate::common::{
    attach_session, auto_ack, no_event, recv_event, test_service, wait_until,
};

fn no_flags() -> MessageFlags {
    MessageFlags::new()
}

// --- Live delivery ---

#[rocket::async_test]
async fn test_deliver_online() {
    let service = test_service().await;

    let session = attach_session(&service, 1, "1").await;
    let mut events = auto_ack(session.deliveries);

    let uuid = service
        .queue
        .add_message(1, "2", "user", "1", "hello", &json!({"s": "hi"}), &no_flags())
        .await
        .unwrap();

    match recv_event(&mut events).await {
        ConversationEvent::Message {
            uuid: pushed,
            sender,
            message_type,
            payload,
            ..
        } => {
            assert_eq!(pushed, uuid);
            assert_eq!(sender, "2");
            assert_eq!(message_type, "hello");
            assert_eq!(payload, json!({"s": "hi"}));
        }
        other => panic!("expected a message push, got {other:?}"),
    }

    let history = &service.history;
    assert!(
        wait_until(|| async {
            history
                .get_message_uuid(1, &uuid)
                .await
                .map(|m| m.delivered)
                .unwrap_or(false)
        })
        .await,
        "an acked push should be stored delivered"
    );
}

#[rocket::async_test]
async fn test_remove_delivered_leaves_no_row() {
    let service = test_service().await;

    let session = attach_session(&service, 1, "3").await;
    let mut events = auto_ack(session.deliveries);

    let flags = MessageFlags::from_list(["remove_delivered"]).unwrap();
    let uuid = service
        .queue
        .add_message(1, "2", "user", "3", "ping", &json!({"n": 1}), &flags)
        .await
        .unwrap();

    let event = recv_event(&mut events).await;
    assert!(matches!(event, ConversationEvent::Message { .. }));

    // Give the worker time to resolve the reply; the row must never appear.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(matches!(
        service.history.get_message_uuid(1, &uuid).await.unwrap_err(),
        HistoryError::NotFound
    ));
}

#[rocket::async_test]
async fn test_refused_push_stays_undelivered() {
    let service = test_service().await;

    let mut session = attach_session(&service, 1, "4").await;
    // A client whose handler fails: refuse every delivery.
    let refuse = tokio::spawn(async move {
        while let Some(delivery) = session.deliveries.recv().await {
            let _ = delivery.reply.send(false);
        }
    });

    let uuid = service
        .queue
        .add_message(1, "2", "user", "4", "hello", &json!({}), &no_flags())
        .await
        .unwrap();

    let history = &service.history;
    assert!(
        wait_until(|| async { history.get_message_uuid(1, &uuid).await.is_ok() }).await
    );
    assert!(!history.get_message_uuid(1, &uuid).await.unwrap().delivered);
    refuse.abort();
}

// --- Offline then drain ---

#[rocket::async_test]
async fn test_deliver_offline_then_drain() {
    let service = test_service().await;

    let uuid = service
        .queue
        .add_message(1, "9", "user", "2", "hello", &json!({"s": "later"}), &no_flags())
        .await
        .unwrap();

    let history = &service.history;
    assert!(
        wait_until(|| async { history.get_message_uuid(1, &uuid).await.is_ok() }).await
    );
    assert!(!history.get_message_uuid(1, &uuid).await.unwrap().delivered);

    // The account comes online: the drain pushes the stored message.
    let session = attach_session(&service, 1, "2").await;
    let mut events = auto_ack(session.deliveries);

    match recv_event(&mut events).await {
        ConversationEvent::Message { uuid: pushed, payload, .. } => {
            assert_eq!(pushed, uuid);
            assert_eq!(payload, json!({"s": "later"}));
        }
        other => panic!("expected the drained message, got {other:?}"),
    }

    assert!(
        wait_until(|| async {
            history
                .get_message_uuid(1, &uuid)
                .await
                .map(|m| m.delivered)
                .unwrap_or(false)
        })
        .await
    );
}

#[rocket::async_test]
async fn test_drain_happens_once_per_message() {
    let service = test_service().await;

    service
        .queue
        .add_message(1, "9", "user", "2", "hello", &json!({}), &no_flags())
        .await
        .unwrap();
    let history = &service.history;
    assert!(
        wait_until(|| async {
            history.list_incoming(1, "user", "2", 10).await.map(|m| m.len() == 1).unwrap_or(false)
        })
        .await
    );

    let mut session = attach_session(&service, 1, "2").await;
    let mut events = auto_ack(session.deliveries);
    assert!(matches!(recv_event(&mut events).await, ConversationEvent::Message { .. }));
    // Let the drain transaction commit before detaching.
    assert!(
        wait_until(|| async {
            history
                .list_incoming(1, "user", "2", 10)
                .await
                .map(|m| m.iter().all(|m| m.delivered))
                .unwrap_or(false)
        })
        .await
    );
    session.conversation.detach();

    // A fresh attach drains nothing.
    let session = attach_session(&service, 1, "2").await;
    let mut events = auto_ack(session.deliveries);
    assert!(no_event(&mut events).await);
}

// --- Group fan-out ---

#[rocket::async_test]
async fn test_flat_group_fanout() {
    let service = test_service().await;

    let group_id = service
        .groups
        .add_group(1, "chat", "10", true, false, None)
        .await
        .unwrap();
    let group = service.groups.find_group(1, "chat", "10").await.unwrap();
    service.groups.join_group(&group, "4", "member").await.unwrap();
    service.groups.join_group(&group, "5", "member").await.unwrap();

    let session_a = attach_session(&service, 1, "4").await;
    let session_b = attach_session(&service, 1, "5").await;
    let mut events_a = auto_ack(session_a.deliveries);
    let mut events_b = auto_ack(session_b.deliveries);

    let uuid = service
        .queue
        .add_message(1, "9", "chat", &group_id.to_string(), "room", &json!({}), &no_flags())
        .await
        .unwrap();

    for events in [&mut events_a, &mut events_b] {
        match recv_event(events).await {
            ConversationEvent::Message { uuid: pushed, .. } => assert_eq!(pushed, uuid),
            other => panic!("expected the group message, got {other:?}"),
        }
    }

    // One row in storage, not one per receiver.
    let history = &service.history;
    assert!(
        wait_until(|| async { history.get_message_uuid(1, &uuid).await.is_ok() }).await
    );
    let mut query = history.messages_query(1);
    query.message_recipient_class = Some("chat".to_string());
    let (_, total) = query.query_with_count().await.unwrap();
    assert_eq!(total, 1);
}

#[rocket::async_test]
async fn test_clustered_group_fanout_bound() {
    let service = test_service().await;

    let group_id = service
        .groups
        .add_group(1, "chat", "11", true, true, Some(2))
        .await
        .unwrap();
    let group = service.groups.find_group(1, "chat", "11").await.unwrap();

    // Cluster size 2: 6 and 7 land in cluster 0, 8 spills into cluster 1.
    let p6 = service.groups.join_group(&group, "6", "member").await.unwrap();
    let p7 = service.groups.join_group(&group, "7", "member").await.unwrap();
    let p8 = service.groups.join_group(&group, "8", "member").await.unwrap();
    assert_eq!(p6.cluster, 0);
    assert_eq!(p7.cluster, 0);
    assert_eq!(p8.cluster, 1);

    let session_6 = attach_session(&service, 1, "6").await;
    let session_7 = attach_session(&service, 1, "7").await;
    let session_8 = attach_session(&service, 1, "8").await;
    let mut events_6 = auto_ack(session_6.deliveries);
    let mut events_7 = auto_ack(session_7.deliveries);
    let mut events_8 = auto_ack(session_8.deliveries);

    let uuid = service
        .queue
        .add_message(1, "9", "chat", &format!("{group_id}-0"), "room", &json!({}), &no_flags())
        .await
        .unwrap();

    for events in [&mut events_6, &mut events_7] {
        match recv_event(events).await {
            ConversationEvent::Message { uuid: pushed, .. } => assert_eq!(pushed, uuid),
            other => panic!("expected the cluster message, got {other:?}"),
        }
    }
    // The other cluster never sees it.
    assert!(no_event(&mut events_8).await);
}

#[rocket::async_test]
async fn test_bind_account_to_group_while_online() {
    let service = test_service().await;

    let session = attach_session(&service, 1, "1").await;
    let mut events = auto_ack(session.deliveries);

    // The participation appears while the account is online.
    let group_id = service
        .groups
        .add_group(1, "chat", "late", true, false, None)
        .await
        .unwrap();
    let group = service.groups.find_group(1, "chat", "late").await.unwrap();
    let participation = service.groups.join_group(&group, "1", "member").await.unwrap();
    service
        .online
        .bind_account_to_group("1", &group, participation.cluster)
        .unwrap();

    let uuid = service
        .queue
        .add_message(1, "9", "chat", &group_id.to_string(), "room", &json!({}), &no_flags())
        .await
        .unwrap();

    match recv_event(&mut events).await {
        ConversationEvent::Message { uuid: pushed, .. } => assert_eq!(pushed, uuid),
        other => panic!("expected the group message, got {other:?}"),
    }
}

#[rocket::async_test]
async fn test_bind_is_noop_when_offline() {
    let service = test_service().await;

    let group = {
        service.groups.add_group(1, "chat", "idle", true, false, None).await.unwrap();
        service.groups.find_group(1, "chat", "idle").await.unwrap()
    };
    // No conversation for the account: nothing to bind, nothing to fail.
    service.online.bind_account_to_group("42", &group, 0).unwrap();
}

// --- Update / delete pushes ---

#[rocket::async_test]
async fn test_update_and_delete_reach_live_session() {
    let service = test_service().await;

    let session = attach_session(&service, 1, "1").await;
    let mut events = auto_ack(session.deliveries);

    let uuid = service
        .queue
        .add_message(1, "2", "user", "1", "note", &json!({"s": "v1"}), &no_flags())
        .await
        .unwrap();
    assert!(matches!(recv_event(&mut events).await, ConversationEvent::Message { .. }));
    let history = &service.history;
    assert!(
        wait_until(|| async { history.get_message_uuid(1, &uuid).await.is_ok() }).await
    );

    // The sender edits: the live session gets the merged payload.
    service
        .history
        .update_message_concurrent(&service.queue, 1, "2", &uuid, &json!({"s": "v2"}), false)
        .await
        .unwrap();
    match recv_event(&mut events).await {
        ConversationEvent::MessageUpdated { uuid: pushed, sender, payload } => {
            assert_eq!(pushed, uuid);
            assert_eq!(sender, "2");
            assert_eq!(payload, json!({"s": "v2"}));
        }
        other => panic!("expected an update push, got {other:?}"),
    }

    service
        .history
        .delete_message_concurrent(&service.queue, 1, "2", &uuid, false)
        .await
        .unwrap();
    match recv_event(&mut events).await {
        ConversationEvent::MessageDeleted { uuid: pushed, sender } => {
            assert_eq!(pushed, uuid);
            assert_eq!(sender, "2");
        }
        other => panic!("expected a delete push, got {other:?}"),
    }
}

// --- Detach and isolation ---

#[rocket::async_test]
async fn test_detach_goes_back_to_offline_storage() {
    let service = test_service().await;

    let mut session = attach_session(&service, 1, "1").await;
    session.conversation.detach();

    let uuid = service
        .queue
        .add_message(1, "2", "user", "1", "hello", &json!({}), &no_flags())
        .await
        .unwrap();

    let history = &service.history;
    assert!(
        wait_until(|| async { history.get_message_uuid(1, &uuid).await.is_ok() }).await
    );
    assert!(!history.get_message_uuid(1, &uuid).await.unwrap().delivered);
}

#[rocket::async_test]
async fn test_foreign_gamespace_is_refused() {
    let service = test_service().await;

    let session = attach_session(&service, 1, "1").await;
    let mut events = auto_ack(session.deliveries);

    // Same account key, different tenant: the conversation refuses it and
    // it lands undelivered in its own gamespace.
    let uuid = service
        .queue
        .add_message(2, "9", "user", "1", "hello", &json!({}), &no_flags())
        .await
        .unwrap();

    assert!(no_event(&mut events).await);
    let history = &service.history;
    assert!(
        wait_until(|| async { history.get_message_uuid(2, &uuid).await.is_ok() }).await
    );
    assert!(!history.get_message_uuid(2, &uuid).await.unwrap().delivered);
}

// --- Client-callable methods ---

#[rocket::async_test]
async fn test_conversation_send_and_mark_as_read() {
    let service = test_service().await;

    let recipient = attach_session(&service, 1, "1").await;
    let mut events = auto_ack(recipient.deliveries);

    let sender = attach_session(&service, 1, "2").await;
    // Keep the sender's channel alive but idle.
    let _sender_events = auto_ack(sender.deliveries);

    let uuid = sender
        .conversation
        .send_message("user", "1", "hello", &json!({"s": "hi"}), &[])
        .await
        .unwrap();

    match recv_event(&mut events).await {
        ConversationEvent::Message { uuid: pushed, sender, .. } => {
            assert_eq!(pushed, uuid);
            assert_eq!(sender, "2");
        }
        other => panic!("expected a message push, got {other:?}"),
    }

    let history = &service.history;
    assert!(
        wait_until(|| async { history.get_message_uuid(1, &uuid).await.is_ok() }).await
    );

    let mark = recipient.conversation.mark_as_read(&uuid).await.unwrap();
    assert_eq!(mark.last_message_uuid, uuid);
    assert_eq!(mark.recipient_class, "user");
    assert_eq!(mark.recipient, "1");
}

#[rocket::async_test]
async fn test_conversation_send_rejects_unknown_flags() {
    let service = test_service().await;
    let session = attach_session(&service, 1, "2").await;

    let err = session
        .conversation
        .send_message("user", "1", "hello", &json!({}), &["sparkly".to_string()])
        .await
        .unwrap_err();
    assert!(matches!(err, message_hub::error::QueueError::BadInput(_)));
}
