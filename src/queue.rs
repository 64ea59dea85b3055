use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::broker::{Connection, Delivery, Properties, QueueOptions};
use crate::conversation::exchange_id;
use crate::error::QueueError;
use crate::history::HistoryModel;
use crate::models::{Action, Envelope, MessageFlag, MessageFlags};

/// How long a worker waits for the recipient conversation's reply before
/// treating the message as undelivered.
pub const DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Total budget for publishing one batch of outgoing messages.
pub const PROCESS_TIMEOUT: Duration = Duration::from_secs(60);

/// The central ingress of the messaging system.
///
/// Every mutation (new message, update, delete) lands as an envelope on the
/// durable incoming queue. Workers pop envelopes, try real-time delivery to
/// the recipient exchange, await the conversation's reply on a shared
/// callback queue, and commit the outcome to history. The incoming delivery
/// is acked unconditionally afterwards: a lost message beats a stalled
/// queue.
pub struct MessageQueueEngine {
    history: Arc<HistoryModel>,
    connection: Connection,
    incoming_queue_name: String,
    prefetch_count: usize,
    outgoing_message_workers: usize,
    handle_futures: StdMutex<HashMap<String, oneshot::Sender<bool>>>,
    callback_queue: StdMutex<Option<String>>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl MessageQueueEngine {
    pub fn new(
        history: Arc<HistoryModel>,
        connection: Connection,
        config: &crate::config::ServiceConfig,
    ) -> Self {
        MessageQueueEngine {
            history,
            connection,
            incoming_queue_name: config.incoming_queue_name.clone(),
            prefetch_count: config.prefetch_count,
            outgoing_message_workers: config.outgoing_message_workers,
            handle_futures: StdMutex::new(HashMap::new()),
            callback_queue: StdMutex::new(None),
            tasks: StdMutex::new(Vec::new()),
        }
    }

    /// Open the consuming side: the durable incoming queue (whatever it
    /// accumulated while the engine was down is drained now) and the
    /// exclusive callback queue for delivery replies.
    pub async fn start(self: Arc<Self>) -> Result<(), QueueError> {
        let channel = self.connection.channel();
        channel.basic_qos(self.prefetch_count);

        channel.queue_declare(
            Some(&self.incoming_queue_name),
            QueueOptions {
                durable: true,
                ..Default::default()
            },
        )?;
        let mut incoming = channel.consume(&self.incoming_queue_name, false)?;

        let callback_name = channel.queue_declare(
            None,
            QueueOptions {
                exclusive: true,
                ..Default::default()
            },
        )?;
        let mut callbacks = channel.consume(&callback_name, true)?;
        *self.callback_queue.lock().unwrap() = Some(callback_name);

        let engine = Arc::clone(&self);
        let callback_task = tokio::spawn(async move {
            while let Some(delivery) = callbacks.next().await {
                engine.on_callback(delivery);
            }
        });

        let engine = Arc::clone(&self);
        let consume_task = tokio::spawn(async move {
            while let Some(delivery) = incoming.next().await {
                let engine = Arc::clone(&engine);
                tokio::spawn(async move {
                    engine.process(delivery).await;
                });
            }
        });

        self.tasks
            .lock()
            .unwrap()
            .extend([callback_task, consume_task]);
        info!("Started message consuming queue");
        Ok(())
    }

    /// Stop consuming. The durable incoming queue is deliberately left in
    /// place so pending envelopes survive a restart.
    pub fn stop(&self) {
        info!("Releasing message consuming queue");
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        *self.callback_queue.lock().unwrap() = None;
    }

    fn on_callback(&self, delivery: Delivery) {
        let Some(correlation_id) = delivery.properties.correlation_id.clone() else {
            return;
        };
        let delivered = delivery.body.as_slice() == b"true";
        // Late or unknown replies resolve nothing and are dropped.
        if let Some(handle) = self.handle_futures.lock().unwrap().remove(&correlation_id) {
            let _ = handle.send(delivered);
        }
    }

    fn cancel_handle(&self, message_uuid: &str) {
        self.handle_futures.lock().unwrap().remove(message_uuid);
    }

    async fn process(&self, delivery: Delivery) {
        match serde_json::from_slice::<Envelope>(&delivery.body) {
            Ok(envelope) => match envelope.action {
                Action::NewMessage => self.process_new_message(envelope).await,
                Action::MessageUpdated | Action::MessageDeleted => {
                    self.process_pass_through(envelope).await;
                }
            },
            Err(e) => error!("Failed to process incoming message: corrupted body: {e}"),
        }
        delivery.ack();
    }

    async fn process_new_message(&self, mut envelope: Envelope) {
        let Some(message_type) = envelope.message_type.clone() else {
            error!("Dropping envelope '{}': missing type", envelope.message_uuid);
            return;
        };
        let Some(payload) = envelope.payload.clone() else {
            error!(
                "Dropping envelope '{}': missing payload",
                envelope.message_uuid
            );
            return;
        };
        let flags = envelope.flags.clone().unwrap_or_default();

        let now = Utc::now();
        envelope.time = Some(now.timestamp());

        let delivered = match self.deliver(&envelope).await {
            Ok(delivered) => delivered,
            Err(e) => {
                error!("Failed to deliver message: {e}");
                return;
            }
        };

        if delivered && flags.contains(MessageFlag::RemoveDelivered) {
            return;
        }

        if let Err(e) = self
            .history
            .add_message(
                envelope.gamespace_id,
                &envelope.sender,
                &envelope.message_uuid,
                &envelope.recipient_class,
                &envelope.recipient_key,
                now,
                &message_type,
                &payload,
                &flags,
                delivered,
            )
            .await
        {
            error!(
                "Failed to store message '{}': {e}",
                envelope.message_uuid
            );
        }
    }

    /// Updates and deletions only need to reach live sessions; history was
    /// already mutated before they were enqueued.
    async fn process_pass_through(&self, envelope: Envelope) {
        if let Err(e) = self.deliver(&envelope).await {
            error!("Failed to deliver message: {e}");
        }
    }

    /// Publish the envelope to the recipient exchange and wait for the
    /// conversation's reply. Unroutable, timed out, or refused all resolve
    /// to `false`; the engine never stalls on a lost reply.
    async fn deliver(&self, envelope: &Envelope) -> Result<bool, QueueError> {
        let reply_to = self
            .callback_queue
            .lock()
            .unwrap()
            .clone()
            .ok_or(QueueError::NotStarted)?;

        let message_uuid = envelope.message_uuid.clone();
        let channel = self.connection.channel();

        let (handle, reply) = oneshot::channel();
        self.handle_futures
            .lock()
            .unwrap()
            .insert(message_uuid.clone(), handle);

        let properties = Properties {
            reply_to: Some(reply_to),
            correlation_id: Some(message_uuid.clone()),
            persistent: false,
        };
        let body = serde_json::to_vec(envelope).unwrap();

        let routed = match channel.publish(
            &exchange_id(&envelope.recipient_class, &envelope.recipient_key),
            "",
            &body,
            properties,
            true,
        ) {
            Ok(routed) => routed,
            Err(e) => {
                self.cancel_handle(&message_uuid);
                return Err(e.into());
            }
        };
        if !routed {
            self.cancel_handle(&message_uuid);
            debug!("Message '{message_uuid}' has not been delivered.");
            return Ok(false);
        }

        let delivered = match tokio::time::timeout(DELIVERY_TIMEOUT, reply).await {
            Ok(Ok(delivered)) => delivered,
            _ => {
                self.cancel_handle(&message_uuid);
                false
            }
        };

        debug!(
            "Message '{message_uuid}' {} been delivered.",
            if delivered { "has" } else { "has not" }
        );
        Ok(delivered)
    }

    // --- Enqueue primitives ---

    /// Queue a new message for delivery. Returns the assigned uuid once the
    /// broker confirms the publication.
    pub async fn add_message(
        &self,
        gamespace_id: i64,
        sender: &str,
        recipient_class: &str,
        recipient_key: &str,
        message_type: &str,
        payload: &serde_json::Value,
        flags: &MessageFlags,
    ) -> Result<String, QueueError> {
        if !payload.is_object() {
            return Err(QueueError::BadInput("payload must be an object".into()));
        }

        let message_uuid = uuid::Uuid::new_v4().to_string();
        let envelope = Envelope {
            action: Action::NewMessage,
            gamespace_id,
            message_uuid: message_uuid.clone(),
            sender: sender.to_string(),
            recipient_class: recipient_class.to_string(),
            recipient_key: recipient_key.to_string(),
            message_type: Some(message_type.to_string()),
            payload: Some(payload.clone()),
            flags: Some(flags.clone()),
            time: None,
        };
        self.enqueue(&envelope)?;
        Ok(message_uuid)
    }

    /// Announce a deletion to the recipient's live sessions.
    pub async fn delete_message(
        &self,
        gamespace_id: i64,
        sender: &str,
        recipient_class: &str,
        recipient_key: &str,
        message_uuid: &str,
    ) -> Result<(), QueueError> {
        let envelope = Envelope {
            action: Action::MessageDeleted,
            gamespace_id,
            message_uuid: message_uuid.to_string(),
            sender: sender.to_string(),
            recipient_class: recipient_class.to_string(),
            recipient_key: recipient_key.to_string(),
            message_type: None,
            payload: None,
            flags: None,
            time: None,
        };
        self.enqueue(&envelope)
    }

    /// Announce an updated payload to the recipient's live sessions.
    pub async fn update_message(
        &self,
        gamespace_id: i64,
        sender: &str,
        recipient_class: &str,
        recipient_key: &str,
        message_uuid: &str,
        payload: &serde_json::Value,
    ) -> Result<(), QueueError> {
        let envelope = Envelope {
            action: Action::MessageUpdated,
            gamespace_id,
            message_uuid: message_uuid.to_string(),
            sender: sender.to_string(),
            recipient_class: recipient_class.to_string(),
            recipient_key: recipient_key.to_string(),
            message_type: None,
            payload: Some(payload.clone()),
            flags: None,
            time: None,
        };
        self.enqueue(&envelope)
    }

    fn enqueue(&self, envelope: &Envelope) -> Result<(), QueueError> {
        let channel = self.connection.channel();
        let body = serde_json::to_vec(envelope).unwrap();
        let properties = Properties {
            persistent: true,
            ..Default::default()
        };
        let confirmed = channel.publish("", &self.incoming_queue_name, &body, properties, true)?;
        if !confirmed {
            error!("Failed to publish message.");
            return Err(QueueError::Rejected);
        }
        Ok(())
    }

    /// Queue a whole batch, fanning the publishes over a pool of workers.
    /// Entries missing required fields (or with malformed flags) are skipped
    /// with a log; the sender only ever sees success up to the publisher
    /// confirm.
    pub async fn add_messages(
        &self,
        gamespace_id: i64,
        sender: &str,
        messages: Vec<serde_json::Value>,
    ) -> Result<(), QueueError> {
        let mut pending = VecDeque::new();

        for message in messages {
            let fields = (
                message.get("recipient_class").and_then(|v| v.as_str()),
                message.get("recipient_key").and_then(|v| v.as_str()),
                message.get("message_type").and_then(|v| v.as_str()),
                message.get("payload").filter(|v| v.is_object()),
            );
            let (Some(recipient_class), Some(recipient_key), Some(message_type), Some(payload)) =
                fields
            else {
                error!("A message '{message}' skipped since missing fields.");
                continue;
            };

            let flags = match message.get("flags") {
                None | Some(serde_json::Value::Null) => MessageFlags::new(),
                Some(serde_json::Value::Array(list)) => {
                    let names: Vec<&str> = list.iter().filter_map(|v| v.as_str()).collect();
                    match MessageFlags::from_list(names) {
                        Ok(flags) => flags,
                        Err(e) => {
                            error!("A message '{message}' skipped: {e}.");
                            continue;
                        }
                    }
                }
                Some(_) => {
                    error!("A message '{message}' flags should be a list.");
                    continue;
                }
            };

            pending.push_back(Envelope {
                action: Action::NewMessage,
                gamespace_id,
                message_uuid: uuid::Uuid::new_v4().to_string(),
                sender: sender.to_string(),
                recipient_class: recipient_class.to_string(),
                recipient_key: recipient_key.to_string(),
                message_type: Some(message_type.to_string()),
                payload: Some(payload.clone()),
                flags: Some(flags),
                time: None,
            });
        }

        let workers_count = self.outgoing_message_workers.min(pending.len());
        if workers_count == 0 {
            return Ok(());
        }

        let pending = Arc::new(StdMutex::new(pending));
        let mut workers = Vec::with_capacity(workers_count);
        for _ in 0..workers_count {
            let pending = Arc::clone(&pending);
            let connection = self.connection.clone();
            let queue_name = self.incoming_queue_name.clone();
            workers.push(tokio::spawn(async move {
                let channel = connection.channel();
                let properties = Properties {
                    persistent: true,
                    ..Default::default()
                };
                loop {
                    let Some(envelope) = pending.lock().unwrap().pop_front() else {
                        return;
                    };
                    let body = serde_json::to_vec(&envelope).unwrap();
                    match channel.publish("", &queue_name, &body, properties.clone(), true) {
                        Ok(true) => {}
                        Ok(false) | Err(_) => {
                            error!("Failed to publish message.");
                            return;
                        }
                    }
                }
            }));
        }

        let join = async {
            for worker in workers {
                let _ = worker.await;
            }
        };
        tokio::time::timeout(PROCESS_TIMEOUT, join)
            .await
            .map_err(|_| QueueError::Timeout)
    }
}
