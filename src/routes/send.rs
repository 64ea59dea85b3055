use std::sync::Arc;

use rocket::serde::json::Json;
use rocket::{State, post};

use crate::models::{MessageFlags, SendBatch, SendMessage};
use crate::queue::MessageQueueEngine;

use super::{ApiError, Caller, bad_request, queue_error};

/// POST /send/<class>/<key> — enqueue one message to a recipient. Returns
/// the assigned uuid once the broker confirms the publication.
#[post("/send/<recipient_class>/<recipient_key>", format = "json", data = "<body>")]
pub async fn send_message(
    queue: &State<Arc<MessageQueueEngine>>,
    caller: Caller,
    recipient_class: &str,
    recipient_key: &str,
    body: Json<SendMessage>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if !body.payload.is_object() {
        return Err(bad_request("payload must be an object"));
    }
    let flags = match &body.flags {
        Some(list) => MessageFlags::from_list(list).map_err(bad_request)?,
        None => MessageFlags::new(),
    };

    let message_uuid = queue
        .add_message(
            caller.gamespace_id,
            &caller.account_id,
            recipient_class,
            recipient_key,
            &body.message_type,
            &body.payload,
            &flags,
        )
        .await
        .map_err(queue_error)?;

    Ok(Json(serde_json::json!({ "uuid": message_uuid })))
}

/// POST /send — enqueue a batch. Malformed entries are skipped with a log;
/// the response only vouches for the batch reaching the incoming queue.
#[post("/send", format = "json", data = "<body>")]
pub async fn send_batch(
    queue: &State<Arc<MessageQueueEngine>>,
    caller: Caller,
    body: Json<SendBatch>,
) -> Result<Json<serde_json::Value>, ApiError> {
    queue
        .add_messages(
            caller.gamespace_id,
            &caller.account_id,
            body.into_inner().messages,
        )
        .await
        .map_err(queue_error)?;

    Ok(Json(serde_json::json!({ "enqueued": true })))
}
