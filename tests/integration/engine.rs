use std::time::Duration;

use serde_json::json;

use message_hub::broker::QueueOptions;
use message_hub::models::MessageFlags;

use crate::common::{test_service, wait_until};

fn no_flags() -> MessageFlags {
    MessageFlags::new()
}

// --- Offline persistence ---

#[rocket::async_test]
async fn test_offline_recipient_stored_undelivered() {
    let service = test_service().await;

    let uuid = service
        .queue
        .add_message(1, "9", "user", "2", "hello", &json!({"s": "hi"}), &no_flags())
        .await
        .unwrap();

    let history = &service.history;
    assert!(
        wait_until(|| async { history.get_message_uuid(1, &uuid).await.is_ok() }).await,
        "the worker should persist the message"
    );

    let stored = history.get_message_uuid(1, &uuid).await.unwrap();
    assert!(!stored.delivered);
    assert_eq!(stored.sender, "9");
    assert_eq!(stored.recipient_class, "user");
    assert_eq!(stored.recipient, "2");
    assert_eq!(stored.payload, json!({"s": "hi"}));
}

#[rocket::async_test]
async fn test_rejects_non_object_payload() {
    let service = test_service().await;
    let err = service
        .queue
        .add_message(1, "9", "user", "2", "hello", &json!("nope"), &no_flags())
        .await
        .unwrap_err();
    assert!(matches!(err, message_hub::error::QueueError::BadInput(_)));
}

// --- Delivery timeout ---

#[rocket::async_test]
async fn test_unanswered_delivery_times_out_as_undelivered() {
    let service = test_service().await;

    // A queue bound to the recipient exchange with no consumer: the publish
    // routes, but no reply ever comes back.
    let channel = service.broker.connect().channel();
    channel.exchange_declare("conv.user.99", true).unwrap();
    let queue = channel
        .queue_declare(None, QueueOptions { exclusive: true, ..Default::default() })
        .unwrap();
    channel.queue_bind(&queue, "conv.user.99").unwrap();

    let uuid = service
        .queue
        .add_message(1, "9", "user", "99", "hello", &json!({}), &no_flags())
        .await
        .unwrap();

    // Resolved by the 5 s delivery timeout.
    tokio::time::sleep(Duration::from_millis(5600)).await;
    let history = &service.history;
    assert!(
        wait_until(|| async { history.get_message_uuid(1, &uuid).await.is_ok() }).await
    );
    assert!(!history.get_message_uuid(1, &uuid).await.unwrap().delivered);
}

// --- Batch ---

#[rocket::async_test]
async fn test_batch_skips_malformed_entries() {
    let service = test_service().await;

    service
        .queue
        .add_messages(
            1,
            "9",
            vec![
                // Missing recipient_key: skipped.
                json!({"recipient_class": "user", "message_type": "a", "payload": {}}),
                // Flags not a list: skipped.
                json!({"recipient_class": "user", "recipient_key": "2", "message_type": "a",
                       "payload": {}, "flags": "editable"}),
                // Unknown flag: skipped.
                json!({"recipient_class": "user", "recipient_key": "2", "message_type": "a",
                       "payload": {}, "flags": ["shiny"]}),
                // Good.
                json!({"recipient_class": "user", "recipient_key": "2", "message_type": "a",
                       "payload": {"n": 1}, "flags": ["editable"]}),
            ],
        )
        .await
        .unwrap();

    let history = &service.history;
    assert!(
        wait_until(|| async {
            let mut query = history.messages_query(1);
            query.message_recipient_class = Some("user".to_string());
            query.message_recipient = Some("2".to_string());
            query.query().await.map(|rows| rows.len() == 1).unwrap_or(false)
        })
        .await,
        "exactly the well-formed entry should land"
    );

    // And nothing else trickles in.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let mut query = history.messages_query(1);
    query.message_recipient_class = Some("user".to_string());
    query.message_recipient = Some("2".to_string());
    assert_eq!(query.query().await.unwrap().len(), 1);
}

// --- Restart durability ---

#[rocket::async_test]
async fn test_stop_preserves_incoming_queue() {
    let service = test_service().await;

    service.queue.stop();

    // The durable queue outlives the engine: the publish is still
    // confirmed, the envelope just waits.
    let uuid = service
        .queue
        .add_message(1, "9", "user", "2", "hello", &json!({}), &no_flags())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(service.history.get_message_uuid(1, &uuid).await.is_err());

    // A restarted engine drains what accumulated.
    std::sync::Arc::clone(&service.queue).start().await.unwrap();
    let history = &service.history;
    assert!(
        wait_until(|| async { history.get_message_uuid(1, &uuid).await.is_ok() }).await,
        "the envelope should be processed after restart"
    );
}
