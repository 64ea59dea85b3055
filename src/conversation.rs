use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::broker::{Channel, Properties, QueueOptions};
use crate::error::{ConversationError, HistoryError, QueueError};
use crate::groups::GroupsModel;
use crate::history::HistoryModel;
use crate::models::{
    Action, CLASS_USER, Envelope, LastReadMessage, MessageFlags, MessageRecord,
};
use crate::queue::{DELIVERY_TIMEOUT, MessageQueueEngine};

pub const EXCHANGE_PREFIX: &str = "conv";

/// Name of the fan-out exchange serving `(recipient_class, recipient_key)`.
pub fn exchange_id(recipient_class: &str, recipient_key: &str) -> String {
    format!("{EXCHANGE_PREFIX}.{recipient_class}.{recipient_key}")
}

/// TTL on the private consumer queue: messages published while nobody is
/// listening are reclaimed instead of piling up.
const RECEIVE_QUEUE_TTL: Duration = Duration::from_millis(1000);

/// A push to the connected client.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ConversationEvent {
    Message {
        uuid: String,
        sender: String,
        recipient_class: String,
        recipient_key: String,
        #[serde(rename = "type")]
        message_type: String,
        payload: serde_json::Value,
        time: i64,
        flags: MessageFlags,
    },
    MessageUpdated {
        uuid: String,
        sender: String,
        payload: serde_json::Value,
    },
    MessageDeleted {
        uuid: String,
        sender: String,
    },
}

impl ConversationEvent {
    /// The server-push method this event maps to.
    pub fn method(&self) -> &'static str {
        match self {
            ConversationEvent::Message { .. } => "message",
            ConversationEvent::MessageUpdated { .. } => "message_updated",
            ConversationEvent::MessageDeleted { .. } => "message_deleted",
        }
    }

    fn from_record(record: MessageRecord) -> Self {
        ConversationEvent::Message {
            uuid: record.message_uuid,
            sender: record.sender,
            recipient_class: record.recipient_class,
            recipient_key: record.recipient,
            message_type: record.message_type,
            payload: record.payload,
            time: record.time.timestamp(),
            flags: record.flags,
        }
    }
}

/// One delivery handed to the client session. The client answers `reply`
/// once its handler ran; `true` marks the message delivered.
pub struct ClientDelivery {
    pub event: ConversationEvent,
    pub reply: oneshot::Sender<bool>,
}

/// Push an event to the client and wait for its acknowledgement. A gone
/// client, a refusal, or a timeout all count as not delivered.
pub(crate) async fn push_to_client(
    client: &mpsc::Sender<ClientDelivery>,
    event: ConversationEvent,
) -> bool {
    let (reply, result) = oneshot::channel();
    if client.send(ClientDelivery { event, reply }).await.is_err() {
        return false;
    }
    matches!(
        tokio::time::timeout(DELIVERY_TIMEOUT, result).await,
        Ok(Ok(true))
    )
}

/// A single communication point for an account: its private fan-out
/// exchange, the exclusive consumer queue, and the bindings into every
/// group the account participates in.
pub struct AccountConversation {
    gamespace_id: i64,
    account_id: String,
    authoritative: bool,
    channel: Channel,
    client: mpsc::Sender<ClientDelivery>,
    history: Arc<HistoryModel>,
    groups: Arc<GroupsModel>,
    queue: Arc<MessageQueueEngine>,
    receive_queue: Option<String>,
    run_task: Option<JoinHandle<()>>,
}

impl AccountConversation {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        gamespace_id: i64,
        account_id: String,
        authoritative: bool,
        channel: Channel,
        client: mpsc::Sender<ClientDelivery>,
        history: Arc<HistoryModel>,
        groups: Arc<GroupsModel>,
        queue: Arc<MessageQueueEngine>,
    ) -> Self {
        AccountConversation {
            gamespace_id,
            account_id,
            authoritative,
            channel,
            client,
            history,
            groups,
            queue,
            receive_queue: None,
            run_task: None,
        }
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    /// Bring the conversation online: declare the private exchange and
    /// queue, bind every participation's group exchange into it, then hand
    /// off to a background task that drains undelivered history through the
    /// client and goes on consuming live deliveries.
    ///
    /// The caller must be consuming the client channel for the drain to
    /// make progress.
    pub async fn attach(&mut self) -> Result<(), ConversationError> {
        debug!("Initializing conversation");

        let exchange_name = exchange_id(CLASS_USER, &self.account_id);
        self.channel.exchange_declare(&exchange_name, true)?;

        let queue_name = self.channel.queue_declare(
            None,
            QueueOptions {
                exclusive: true,
                message_ttl: Some(RECEIVE_QUEUE_TTL),
                ..Default::default()
            },
        )?;
        self.channel.queue_bind(&queue_name, &exchange_name)?;
        self.receive_queue = Some(queue_name.clone());

        let participations = self
            .groups
            .list_participations_by_account(self.gamespace_id, &self.account_id)
            .await?;
        for info in &participations {
            let group_exchange =
                exchange_id(&info.group.group_class, &info.effective_recipient());
            self.channel.exchange_declare(&group_exchange, true)?;
            self.channel.exchange_bind(&exchange_name, &group_exchange)?;
        }

        self.run_task = Some(tokio::spawn(run(
            self.gamespace_id,
            self.account_id.clone(),
            self.channel.clone(),
            queue_name,
            self.client.clone(),
            Arc::clone(&self.history),
        )));

        info!("Conversation for account {} started.", self.account_id);
        Ok(())
    }

    /// Tear everything down. Tolerates broker failures: cleanup is logged,
    /// never propagated. Dropping the conversation does the same.
    pub fn detach(&mut self) {
        let was_attached = self.run_task.is_some() || self.receive_queue.is_some();

        if let Some(task) = self.run_task.take() {
            task.abort();
        }
        if let Some(queue_name) = self.receive_queue.take()
            && let Err(e) = self.channel.queue_delete(&queue_name)
        {
            warn!("Failed to delete the queue: {e}");
        }
        self.channel.close();

        if was_attached {
            info!("Conversation for account {} released.", self.account_id);
        }
    }

    // --- Client-callable methods ---

    /// Enqueue a new message from this account. Returns the assigned uuid.
    pub async fn send_message(
        &self,
        recipient_class: &str,
        recipient_key: &str,
        message_type: &str,
        payload: &serde_json::Value,
        flags: &[String],
    ) -> Result<String, QueueError> {
        let flags = MessageFlags::from_list(flags).map_err(QueueError::BadInput)?;
        self.queue
            .add_message(
                self.gamespace_id,
                &self.account_id,
                recipient_class,
                recipient_key,
                message_type,
                payload,
                &flags,
            )
            .await
    }

    pub async fn delete_message(&self, message_uuid: &str) -> Result<(), HistoryError> {
        self.history
            .delete_message_concurrent(
                &self.queue,
                self.gamespace_id,
                &self.account_id,
                message_uuid,
                self.authoritative,
            )
            .await
    }

    pub async fn update_message(
        &self,
        message_uuid: &str,
        payload: &serde_json::Value,
    ) -> Result<serde_json::Value, HistoryError> {
        self.history
            .update_message_concurrent(
                &self.queue,
                self.gamespace_id,
                &self.account_id,
                message_uuid,
                payload,
                self.authoritative,
            )
            .await
    }

    pub async fn mark_as_read(&self, message_uuid: &str) -> Result<LastReadMessage, HistoryError> {
        self.history
            .mark_message_as_read(self.gamespace_id, &self.account_id, message_uuid)
            .await
    }
}

impl Drop for AccountConversation {
    fn drop(&mut self) {
        self.detach();
    }
}

/// The conversation's background half: drain undelivered history inside one
/// transaction, then consume live deliveries until detach. Every broker
/// delivery is acked after the client handler ran, and the single-byte RPC
/// reply goes back to the engine's callback queue.
async fn run(
    gamespace_id: i64,
    account_id: String,
    channel: Channel,
    queue_name: String,
    client: mpsc::Sender<ClientDelivery>,
    history: Arc<HistoryModel>,
) {
    let drained = history
        .read_incoming_messages(gamespace_id, CLASS_USER, &account_id, |record| {
            let client = client.clone();
            async move { push_to_client(&client, ConversationEvent::from_record(record)).await }
        })
        .await;
    if let Err(e) = drained {
        error!("Failed to read incoming messages for account {account_id}: {e}");
        return;
    }

    let mut consumer = match channel.consume(&queue_name, false) {
        Ok(consumer) => consumer,
        Err(e) => {
            error!("Failed to consume for account {account_id}: {e}");
            return;
        }
    };

    while let Some(delivery) = consumer.next().await {
        let delivered = handle_delivery(gamespace_id, &client, &delivery.body).await;
        let properties = delivery.properties.clone();
        delivery.ack();

        if let Some(reply_to) = &properties.reply_to {
            let reply_properties = Properties {
                correlation_id: properties.correlation_id.clone(),
                ..Default::default()
            };
            let body: &[u8] = if delivered { b"true" } else { b"false" };
            if let Err(e) = channel.publish("", reply_to, body, reply_properties, false) {
                warn!("Failed to reply a delivery confirmation: {e}");
            }
        }
    }
}

/// Decode one broker delivery and dispatch it by action. Malformed bodies,
/// foreign gamespaces, and incomplete envelopes are refused.
async fn handle_delivery(
    gamespace_id: i64,
    client: &mpsc::Sender<ClientDelivery>,
    body: &[u8],
) -> bool {
    let envelope: Envelope = match serde_json::from_slice(body) {
        Ok(envelope) => envelope,
        Err(e) => {
            error!("Failed to process incoming message: corrupted body: {e}");
            return false;
        }
    };
    if envelope.gamespace_id != gamespace_id {
        error!("Failed to process incoming message: bad gamespace");
        return false;
    }

    let event = match envelope.action {
        Action::NewMessage => {
            let (Some(message_type), Some(payload), Some(time)) =
                (envelope.message_type, envelope.payload, envelope.time)
            else {
                return false;
            };
            ConversationEvent::Message {
                uuid: envelope.message_uuid,
                sender: envelope.sender,
                recipient_class: envelope.recipient_class,
                recipient_key: envelope.recipient_key,
                message_type,
                payload,
                time,
                flags: envelope.flags.unwrap_or_default(),
            }
        }
        Action::MessageUpdated => {
            let Some(payload) = envelope.payload else {
                return false;
            };
            ConversationEvent::MessageUpdated {
                uuid: envelope.message_uuid,
                sender: envelope.sender,
                payload,
            }
        }
        Action::MessageDeleted => ConversationEvent::MessageDeleted {
            uuid: envelope.message_uuid,
            sender: envelope.sender,
        },
    };

    push_to_client(client, event).await
}
