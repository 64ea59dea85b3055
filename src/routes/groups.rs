use std::sync::Arc;

use log::warn;
use rocket::form::FromForm;
use rocket::serde::json::Json;
use rocket::{State, get, post};

use crate::groups::GroupsModel;
use crate::history::HistoryModel;
use crate::online::OnlineModel;

use super::{ApiError, Caller, group_error, history_error};

/// POST /group/<class>/<key>/join — join the caller into a group. For
/// clustered groups this assigns the cluster whose exchange the account
/// will bind; if the account is online the binding happens right away.
#[post("/group/<group_class>/<group_key>/join?<role>")]
pub async fn join_group(
    groups: &State<Arc<GroupsModel>>,
    online: &State<Arc<OnlineModel>>,
    caller: Caller,
    group_class: &str,
    group_key: &str,
    role: Option<&str>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let group = groups
        .find_group(caller.gamespace_id, group_class, group_key)
        .await
        .map_err(group_error)?;

    let participation = groups
        .join_group(&group, &caller.account_id, role.unwrap_or("member"))
        .await
        .map_err(group_error)?;

    if let Err(e) = online.bind_account_to_group(&caller.account_id, &group, participation.cluster)
    {
        warn!(
            "Failed to bind account {} to group {}: {e}",
            caller.account_id, group.group_id
        );
    }

    Ok(Json(serde_json::json!({
        "reply-to-class": group.group_class,
        "reply-to": group.effective_recipient(participation.cluster),
    })))
}

#[derive(FromForm)]
pub struct InboxQuery {
    pub limit: Option<i64>,
    #[field(name = "type")]
    pub message_type: Option<String>,
}

/// GET /group/<class>/<key> — the group inbox for the caller's own cluster,
/// oldest-first, with the total count. 406 when the caller is not a
/// participant.
#[get("/group/<group_class>/<group_key>?<q..>")]
pub async fn group_inbox(
    groups: &State<Arc<GroupsModel>>,
    history: &State<Arc<HistoryModel>>,
    caller: Caller,
    group_class: &str,
    group_key: &str,
    q: InboxQuery,
) -> Result<Json<serde_json::Value>, ApiError> {
    let group = groups
        .find_group(caller.gamespace_id, group_class, group_key)
        .await
        .map_err(group_error)?;
    let participation = groups
        .find_group_participant(caller.gamespace_id, group.group_id, &caller.account_id)
        .await
        .map_err(group_error)?;

    let recipient = group.effective_recipient(participation.cluster);

    let mut query = history.messages_query(caller.gamespace_id);
    query.message_recipient_class = Some(group.group_class.clone());
    query.message_recipient = Some(recipient.clone());
    query.message_type = q.message_type.clone();
    query.limit = q.limit.unwrap_or(100).clamp(1, 500);

    let (messages, total) = query.query_with_count().await.map_err(history_error)?;
    let messages: Vec<_> = messages.into_iter().rev().collect();

    Ok(Json(serde_json::json!({
        "reply-to-class": group.group_class,
        "reply-to": recipient,
        "total-count": total,
        "messages": messages,
    })))
}
