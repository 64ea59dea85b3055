use std::sync::Arc;

use rocket::serde::json::Json;
use rocket::{State, delete, get, post, put};

use crate::history::HistoryModel;
use crate::models::{LastReadMessage, MessageRecord};
use crate::queue::MessageQueueEngine;

use super::{ApiError, Caller, bad_request, history_error};

/// GET /message/<uuid> — fetch one message.
#[get("/message/<message_uuid>")]
pub async fn get_message(
    history: &State<Arc<HistoryModel>>,
    caller: Caller,
    message_uuid: &str,
) -> Result<Json<MessageRecord>, ApiError> {
    history
        .get_message_uuid(caller.gamespace_id, message_uuid)
        .await
        .map(Json)
        .map_err(history_error)
}

/// PUT /message/<uuid> — patch the message payload (deep merge, `null`
/// deletes a key). 409 when the caller may not edit it.
#[put("/message/<message_uuid>", format = "json", data = "<body>")]
pub async fn update_message(
    history: &State<Arc<HistoryModel>>,
    queue: &State<Arc<MessageQueueEngine>>,
    caller: Caller,
    message_uuid: &str,
    body: Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if !body.is_object() {
        return Err(bad_request("payload must be an object"));
    }

    let engine: &MessageQueueEngine = queue;
    let patch = body.into_inner();
    let payload = history
        .update_message_concurrent(
            engine,
            caller.gamespace_id,
            &caller.account_id,
            message_uuid,
            &patch,
            caller.authoritative,
        )
        .await
        .map_err(history_error)?;

    Ok(Json(serde_json::json!({ "payload": payload })))
}

/// DELETE /message/<uuid> — delete a message. 409 when the caller may not.
#[delete("/message/<message_uuid>")]
pub async fn delete_message(
    history: &State<Arc<HistoryModel>>,
    queue: &State<Arc<MessageQueueEngine>>,
    caller: Caller,
    message_uuid: &str,
) -> Result<Json<serde_json::Value>, ApiError> {
    let engine: &MessageQueueEngine = queue;
    history
        .delete_message_concurrent(
            engine,
            caller.gamespace_id,
            &caller.account_id,
            message_uuid,
            caller.authoritative,
        )
        .await
        .map_err(history_error)?;

    Ok(Json(serde_json::json!({ "deleted": true })))
}

/// POST /message/<uuid>/read — advance the caller's read watermark for the
/// stream this message belongs to.
#[post("/message/<message_uuid>/read")]
pub async fn mark_read(
    history: &State<Arc<HistoryModel>>,
    caller: Caller,
    message_uuid: &str,
) -> Result<Json<LastReadMessage>, ApiError> {
    history
        .mark_message_as_read(caller.gamespace_id, &caller.account_id, message_uuid)
        .await
        .map(Json)
        .map_err(history_error)
}

/// GET /messages — the paged union of everything the caller can see:
/// direct messages to or from the account plus the streams of every group
/// it participates in. Newest-first, with the total count.
#[get("/messages?<limit>&<offset>")]
pub async fn list_messages(
    history: &State<Arc<HistoryModel>>,
    caller: Caller,
    limit: Option<i64>,
    offset: Option<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let limit = limit.unwrap_or(100).clamp(1, 500);
    let offset = offset.unwrap_or(0).max(0);

    let (messages, total) = history
        .list_messages_account(caller.gamespace_id, &caller.account_id, limit, offset)
        .await
        .map_err(history_error)?;

    Ok(Json(serde_json::json!({
        "total-count": total,
        "messages": messages,
    })))
}
