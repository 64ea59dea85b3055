use std::sync::Arc;

use log::error;
use rocket::response::stream::{Event, EventStream};
use rocket::{State, get};
use tokio::sync::mpsc;
use tokio::time::{Duration, interval};

use crate::conversation::ClientDelivery;
use crate::online::OnlineModel;

use super::Caller;

/// Pushes the conversation buffers ahead of the client.
const CLIENT_CHANNEL_CAPACITY: usize = 16;

/// GET /listen — attach the caller's conversation and stream its pushes as
/// server-sent events (`message`, `message_updated`, `message_deleted`).
/// An event successfully handed to the stream is acknowledged as
/// delivered; dropping the stream detaches the conversation.
#[get("/listen")]
pub fn listen(online: &State<Arc<OnlineModel>>, caller: Caller) -> EventStream![] {
    let online = Arc::clone(online);

    EventStream! {
        let (tx, mut rx) = mpsc::channel::<ClientDelivery>(CLIENT_CHANNEL_CAPACITY);
        let mut conversation = online.conversation(
            caller.gamespace_id,
            &caller.account_id,
            caller.authoritative,
            tx,
        );

        match conversation.attach().await {
            Err(e) => {
                error!("Failed to open a conversation for account {}: {e}", caller.account_id);
                yield Event::json(&serde_json::json!({"error": "failed to open the conversation"}))
                    .event("error");
            }
            Ok(()) => {
                let mut heartbeat = interval(Duration::from_secs(15));

                loop {
                    tokio::select! {
                        delivery = rx.recv() => {
                            match delivery {
                                Some(delivery) => {
                                    let method = delivery.event.method();
                                    yield Event::json(&delivery.event).event(method);
                                    let _ = delivery.reply.send(true);
                                }
                                // The conversation dropped its sender: the
                                // session is unusable, make the client
                                // reconnect.
                                None => break,
                            }
                        }
                        _ = heartbeat.tick() => {
                            let now = chrono::Utc::now().to_rfc3339();
                            yield Event::json(&serde_json::json!({"time": now})).event("heartbeat");
                        }
                    }
                }
            }
        }

        conversation.detach();
    }
}
