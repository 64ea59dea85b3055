use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use log::{debug, error, warn};
use rusqlite::{OptionalExtension, Row, ToSql, params};

use crate::db::Db;
use crate::error::HistoryError;
use crate::models::{LastReadMessage, MessageFlag, MessageFlags, MessageRecord, merge_payload};
use crate::queue::MessageQueueEngine;

const MESSAGE_COLUMNS: &str = "message_id, gamespace_id, message_uuid, message_recipient_class, \
     message_sender, message_recipient, message_time, message_type, message_payload, \
     message_delivered, message_flags";

/// Fixed-width UTC timestamp text; lexicographic order matches time order.
fn format_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, false)
}

fn parse_time(text: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_default()
}

fn row_to_message(row: &Row) -> rusqlite::Result<MessageRecord> {
    let time_text: String = row.get(6)?;
    let payload_text: String = row.get(8)?;
    let flags_text: String = row.get(10)?;
    Ok(MessageRecord {
        message_id: row.get(0)?,
        gamespace_id: row.get(1)?,
        message_uuid: row.get(2)?,
        recipient_class: row.get(3)?,
        sender: row.get(4)?,
        recipient: row.get(5)?,
        time: parse_time(&time_text),
        message_type: row.get(7)?,
        payload: serde_json::from_str(&payload_text).unwrap_or(serde_json::json!({})),
        delivered: row.get::<_, i64>(9)? != 0,
        flags: MessageFlags::parse_stored(&flags_text),
    })
}

fn row_to_last_read(row: &Row) -> rusqlite::Result<LastReadMessage> {
    let time_text: String = row.get(4)?;
    Ok(LastReadMessage {
        gamespace_id: row.get(0)?,
        account_id: row.get(1)?,
        recipient_class: row.get(2)?,
        recipient: row.get(3)?,
        last_message_time: parse_time(&time_text),
        last_message_uuid: row.get(5)?,
    })
}

/// Durable message history and read watermarks.
pub struct HistoryModel {
    db: Arc<Db>,
}

impl HistoryModel {
    pub fn new(db: Arc<Db>) -> Self {
        HistoryModel { db }
    }

    /// Insert a message. `Duplicate` when the uuid already exists in the
    /// gamespace.
    #[allow(clippy::too_many_arguments)]
    pub async fn add_message(
        &self,
        gamespace_id: i64,
        sender: &str,
        message_uuid: &str,
        recipient_class: &str,
        recipient: &str,
        time: DateTime<Utc>,
        message_type: &str,
        payload: &serde_json::Value,
        flags: &MessageFlags,
        delivered: bool,
    ) -> Result<i64, HistoryError> {
        if !payload.is_object() {
            return Err(HistoryError::BadInput("payload must be an object".into()));
        }

        let conn = self.db.conn.lock().await;
        match conn.execute(
            "INSERT INTO messages (gamespace_id, message_uuid, message_recipient_class, \
                 message_sender, message_recipient, message_time, message_type, \
                 message_payload, message_delivered, message_flags)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                gamespace_id,
                message_uuid,
                recipient_class,
                sender,
                recipient,
                format_time(&time),
                message_type,
                serde_json::to_string(payload).unwrap(),
                delivered as i64,
                flags.dump(),
            ],
        ) {
            Ok(_) => Ok(conn.last_insert_rowid()),
            Err(e) if e.to_string().contains("UNIQUE") => Err(HistoryError::Duplicate),
            Err(e) => Err(HistoryError::Storage(e)),
        }
    }

    pub async fn get_message_uuid(
        &self,
        gamespace_id: i64,
        message_uuid: &str,
    ) -> Result<MessageRecord, HistoryError> {
        let conn = self.db.conn.lock().await;
        conn.query_row(
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages \
                 WHERE gamespace_id = ?1 AND message_uuid = ?2"
            ),
            params![gamespace_id, message_uuid],
            row_to_message,
        )
        .optional()?
        .ok_or(HistoryError::NotFound)
    }

    /// Newest-first messages addressed to `(recipient_class, recipient)`.
    pub async fn list_incoming(
        &self,
        gamespace_id: i64,
        recipient_class: &str,
        recipient: &str,
        limit: i64,
    ) -> Result<Vec<MessageRecord>, HistoryError> {
        let conn = self.db.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages \
             WHERE gamespace_id = ?1 AND message_recipient_class = ?2 AND message_recipient = ?3 \
             ORDER BY message_time DESC LIMIT ?4"
        ))?;
        let messages = stmt
            .query_map(
                params![gamespace_id, recipient_class, recipient, limit],
                row_to_message,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(messages)
    }

    /// Everything the account can see, newest-first by `message_id`: direct
    /// user messages to or from the account, plus messages addressed to the
    /// effective recipient of every group the account participates in.
    /// Returns the page and the total count in one round trip.
    pub async fn list_messages_account(
        &self,
        gamespace_id: i64,
        account_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<MessageRecord>, i64), HistoryError> {
        let conn = self.db.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS}, COUNT(*) OVER () AS total_count FROM messages \
             WHERE gamespace_id = ?1 AND ( \
                 (message_recipient_class = 'user' \
                     AND (message_recipient = ?2 OR message_sender = ?2)) \
                 OR EXISTS ( \
                     SELECT 1 FROM group_participants p \
                     JOIN groups g ON g.group_id = p.group_id \
                         AND g.gamespace_id = p.gamespace_id \
                     WHERE p.gamespace_id = messages.gamespace_id \
                       AND p.participation_account = ?2 \
                       AND g.group_class = messages.message_recipient_class \
                       AND messages.message_recipient = CASE WHEN g.group_clustered != 0 \
                           THEN CAST(g.group_id AS TEXT) || '-' || CAST(p.participation_cluster AS TEXT) \
                           ELSE CAST(g.group_id AS TEXT) END \
                 ) \
             ) \
             ORDER BY message_id DESC LIMIT ?3 OFFSET ?4"
        ))?;

        let mut total = 0i64;
        let messages = stmt
            .query_map(
                params![gamespace_id, account_id, limit, offset],
                |row| {
                    total = row.get(11)?;
                    row_to_message(row)
                },
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok((messages, total))
    }

    /// The transactional drain: feed every undelivered message for the
    /// recipient to `receiver`, newest-first, inside one transaction. Rows
    /// the receiver accepts are deleted (`remove_delivered`) or promoted to
    /// `delivered=1`; the rest stay eligible for the next drain. Any failure
    /// rolls the whole batch back.
    pub async fn read_incoming_messages<F, Fut>(
        &self,
        gamespace_id: i64,
        recipient_class: &str,
        recipient: &str,
        mut receiver: F,
    ) -> Result<(), HistoryError>
    where
        F: FnMut(MessageRecord) -> Fut,
        Fut: Future<Output = bool>,
    {
        let conn = self.db.conn.lock().await;
        conn.execute_batch("BEGIN IMMEDIATE;")?;

        // NOTE: this work is inlined (rather than wrapped in a nested
        // `async {}.await` try-block) because a nested block that is used
        // again afterwards (for commit/rollback) would capture `conn` by
        // reference, and `&Connection` is not `Send` across an `.await` —
        // which breaks the `Send` bound required to spawn/box this future.
        macro_rules! txn_try {
            ($e:expr) => {
                match $e {
                    Ok(v) => v,
                    Err(e) => {
                        let e: HistoryError = e.into();
                        if let Err(rollback) = conn.execute_batch("ROLLBACK;") {
                            error!("Failed to roll back the drain: {rollback}");
                        }
                        return Err(e);
                    }
                }
            };
        }

        let messages: Vec<MessageRecord> = {
            let mut stmt = txn_try!(conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages \
                 WHERE gamespace_id = ?1 AND message_recipient_class = ?2 \
                   AND message_recipient = ?3 AND message_delivered = 0 \
                 ORDER BY message_time DESC"
            )));
            let rows = txn_try!(stmt.query_map(
                params![gamespace_id, recipient_class, recipient],
                row_to_message,
            ));
            txn_try!(rows.collect::<Result<Vec<_>, _>>())
        };

        let mut mark_delivered = Vec::new();
        let mut remove = Vec::new();

        for message in messages {
            let message_id = message.message_id;
            let purge = message.flags.contains(MessageFlag::RemoveDelivered);
            if receiver(message).await {
                if purge {
                    remove.push(message_id);
                } else {
                    mark_delivered.push(message_id);
                }
            }
        }

        debug!(
            "Drained {} delivered / {} removed for {}.{}",
            mark_delivered.len(),
            remove.len(),
            recipient_class,
            recipient
        );

        for message_id in mark_delivered {
            txn_try!(conn.execute(
                "UPDATE messages SET message_delivered = 1 \
                 WHERE gamespace_id = ?1 AND message_id = ?2",
                params![gamespace_id, message_id],
            ));
        }
        for message_id in remove {
            txn_try!(conn.execute(
                "DELETE FROM messages WHERE gamespace_id = ?1 AND message_id = ?2",
                params![gamespace_id, message_id],
            ));
        }

        conn.execute_batch("COMMIT;")?;
        Ok(())
    }

    /// Delete a message on behalf of `caller`. Non-senders without the
    /// authoritative scope need `deletable`. A `message_deleted` event is
    /// published to the recipient before the row goes.
    pub async fn delete_message_concurrent(
        &self,
        queue: &MessageQueueEngine,
        gamespace_id: i64,
        caller: &str,
        message_uuid: &str,
        authoritative: bool,
    ) -> Result<(), HistoryError> {
        let conn = self.db.conn.lock().await;
        conn.execute_batch("BEGIN IMMEDIATE;")?;

        // See the comment in `read_incoming_messages` for why this is
        // inlined instead of using a nested `async {}.await` try-block.
        macro_rules! txn_try {
            ($e:expr) => {
                match $e {
                    Ok(v) => v,
                    Err(e) => {
                        let e: HistoryError = e.into();
                        conn.execute_batch("ROLLBACK;").ok();
                        return Err(e);
                    }
                }
            };
        }

        let message = txn_try!(conn
            .query_row(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages \
                     WHERE gamespace_id = ?1 AND message_uuid = ?2"
                ),
                params![gamespace_id, message_uuid],
                row_to_message,
            )
            .optional());
        let message = txn_try!(message.ok_or(HistoryError::NotFound));

        if message.sender != caller
            && !authoritative
            && !message.flags.contains(MessageFlag::Deletable)
        {
            conn.execute_batch("ROLLBACK;").ok();
            return Err(HistoryError::Conflict(
                "the message is not deletable".into(),
            ));
        }

        if let Err(e) = queue
            .delete_message(
                gamespace_id,
                caller,
                &message.recipient_class,
                &message.recipient,
                message_uuid,
            )
            .await
        {
            warn!("Failed to announce a message deletion: {e}");
        }

        txn_try!(conn.execute(
            "DELETE FROM messages WHERE gamespace_id = ?1 AND message_uuid = ?2",
            params![gamespace_id, message_uuid],
        ));

        conn.execute_batch("COMMIT;")?;
        Ok(())
    }

    /// Patch a message payload on behalf of `caller` (deep merge, `null`
    /// deletes a key). Non-senders without the authoritative scope need
    /// `editable`. Returns the merged payload; a `message_updated` event is
    /// published to the recipient.
    pub async fn update_message_concurrent(
        &self,
        queue: &MessageQueueEngine,
        gamespace_id: i64,
        caller: &str,
        message_uuid: &str,
        patch: &serde_json::Value,
        authoritative: bool,
    ) -> Result<serde_json::Value, HistoryError> {
        if !patch.is_object() {
            return Err(HistoryError::BadInput("payload must be an object".into()));
        }

        let conn = self.db.conn.lock().await;
        conn.execute_batch("BEGIN IMMEDIATE;")?;

        // See the comment in `read_incoming_messages` for why this is
        // inlined instead of using a nested `async {}.await` try-block.
        macro_rules! txn_try {
            ($e:expr) => {
                match $e {
                    Ok(v) => v,
                    Err(e) => {
                        let e: HistoryError = e.into();
                        conn.execute_batch("ROLLBACK;").ok();
                        return Err(e);
                    }
                }
            };
        }

        let message = txn_try!(conn
            .query_row(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages \
                     WHERE gamespace_id = ?1 AND message_uuid = ?2"
                ),
                params![gamespace_id, message_uuid],
                row_to_message,
            )
            .optional());
        let mut message = txn_try!(message.ok_or(HistoryError::NotFound));

        if message.sender != caller
            && !authoritative
            && !message.flags.contains(MessageFlag::Editable)
        {
            conn.execute_batch("ROLLBACK;").ok();
            return Err(HistoryError::Conflict("the message is not editable".into()));
        }

        merge_payload(&mut message.payload, patch);

        if let Err(e) = queue
            .update_message(
                gamespace_id,
                caller,
                &message.recipient_class,
                &message.recipient,
                message_uuid,
                &message.payload,
            )
            .await
        {
            warn!("Failed to announce a message update: {e}");
        }

        txn_try!(conn.execute(
            "UPDATE messages SET message_payload = ?1 \
             WHERE gamespace_id = ?2 AND message_uuid = ?3",
            params![
                serde_json::to_string(&message.payload).unwrap(),
                gamespace_id,
                message_uuid
            ],
        ));

        conn.execute_batch("COMMIT;")?;
        Ok(message.payload)
    }

    /// Advance the account's read watermark for the stream the message
    /// belongs to. Older timestamps never regress the watermark.
    pub async fn mark_message_as_read(
        &self,
        gamespace_id: i64,
        account_id: &str,
        message_uuid: &str,
    ) -> Result<LastReadMessage, HistoryError> {
        let message = self.get_message_uuid(gamespace_id, message_uuid).await?;

        let conn = self.db.conn.lock().await;
        conn.execute(
            "INSERT INTO last_read_message (gamespace_id, account_id, \
                 message_recipient_class, message_recipient, last_message_time, \
                 last_message_uuid)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(gamespace_id, account_id, message_recipient_class, message_recipient)
             DO UPDATE SET
               last_message_time = excluded.last_message_time,
               last_message_uuid = excluded.last_message_uuid
             WHERE excluded.last_message_time > last_read_message.last_message_time",
            params![
                gamespace_id,
                account_id,
                message.recipient_class,
                message.recipient,
                format_time(&message.time),
                message.message_uuid,
            ],
        )?;

        conn.query_row(
            "SELECT gamespace_id, account_id, message_recipient_class, message_recipient, \
                 last_message_time, last_message_uuid
             FROM last_read_message
             WHERE gamespace_id = ?1 AND account_id = ?2 \
               AND message_recipient_class = ?3 AND message_recipient = ?4",
            params![
                gamespace_id,
                account_id,
                message.recipient_class,
                message.recipient
            ],
            row_to_last_read,
        )
        .map_err(HistoryError::Storage)
    }

    pub async fn get_last_read_message(
        &self,
        gamespace_id: i64,
        account_id: &str,
        recipient_class: &str,
        recipient: &str,
    ) -> Result<Option<LastReadMessage>, HistoryError> {
        let conn = self.db.conn.lock().await;
        conn.query_row(
            "SELECT gamespace_id, account_id, message_recipient_class, message_recipient, \
                 last_message_time, last_message_uuid
             FROM last_read_message
             WHERE gamespace_id = ?1 AND account_id = ?2 \
               AND message_recipient_class = ?3 AND message_recipient = ?4",
            params![gamespace_id, account_id, recipient_class, recipient],
            row_to_last_read,
        )
        .optional()
        .map_err(HistoryError::Storage)
    }

    /// Purge every message addressed to the recipient. Used when a group
    /// goes away.
    pub async fn delete_messages(
        &self,
        gamespace_id: i64,
        recipient_class: &str,
        recipient: &str,
    ) -> Result<(), HistoryError> {
        let conn = self.db.conn.lock().await;
        conn.execute(
            "DELETE FROM messages WHERE gamespace_id = ?1 \
             AND message_recipient_class = ?2 AND message_recipient = ?3",
            params![gamespace_id, recipient_class, recipient],
        )?;
        Ok(())
    }

    /// Purge by recipient LIKE-pattern (clustered groups address several
    /// recipient keys).
    pub async fn delete_messages_like(
        &self,
        gamespace_id: i64,
        recipient_class: &str,
        recipient_like: &str,
    ) -> Result<(), HistoryError> {
        let conn = self.db.conn.lock().await;
        conn.execute(
            "DELETE FROM messages WHERE gamespace_id = ?1 \
             AND message_recipient_class = ?2 AND message_recipient LIKE ?3",
            params![gamespace_id, recipient_class, recipient_like],
        )?;
        Ok(())
    }

    pub fn messages_query(&self, gamespace_id: i64) -> MessagesQuery<'_> {
        MessagesQuery {
            model: self,
            gamespace_id,
            message_sender: None,
            message_recipient_class: None,
            message_recipient: None,
            message_type: None,
            message_delivered: None,
            offset: 0,
            limit: 0,
        }
    }
}

/// Filterable history query. Set the public fields, then call
/// [`MessagesQuery::query`] or [`MessagesQuery::query_with_count`].
pub struct MessagesQuery<'a> {
    model: &'a HistoryModel,
    gamespace_id: i64,
    pub message_sender: Option<String>,
    pub message_recipient_class: Option<String>,
    /// Matched with LIKE, so `%` patterns cover clustered recipient keys.
    pub message_recipient: Option<String>,
    pub message_type: Option<String>,
    pub message_delivered: Option<bool>,
    pub offset: i64,
    pub limit: i64,
}

impl MessagesQuery<'_> {
    fn build(&self, with_count: bool) -> (String, Vec<Box<dyn ToSql + Send>>) {
        let mut conditions = vec!["gamespace_id = ?1".to_string()];
        let mut values: Vec<Box<dyn ToSql + Send>> = vec![Box::new(self.gamespace_id)];

        if let Some(sender) = &self.message_sender {
            values.push(Box::new(sender.clone()));
            conditions.push(format!("message_sender = ?{}", values.len()));
        }
        if let Some(class) = &self.message_recipient_class {
            values.push(Box::new(class.clone()));
            conditions.push(format!("message_recipient_class = ?{}", values.len()));
        }
        if let Some(recipient) = &self.message_recipient {
            values.push(Box::new(recipient.clone()));
            conditions.push(format!("message_recipient LIKE ?{}", values.len()));
        }
        if let Some(message_type) = &self.message_type {
            values.push(Box::new(message_type.clone()));
            conditions.push(format!("message_type = ?{}", values.len()));
        }
        if let Some(delivered) = self.message_delivered {
            values.push(Box::new(delivered as i64));
            conditions.push(format!("message_delivered = ?{}", values.len()));
        }

        let count_column = if with_count {
            ", COUNT(*) OVER () AS total_count"
        } else {
            ""
        };
        let mut sql = format!(
            "SELECT {MESSAGE_COLUMNS}{count_column} FROM messages WHERE {} \
             ORDER BY message_time DESC",
            conditions.join(" AND ")
        );
        if self.limit > 0 {
            values.push(Box::new(self.limit));
            sql.push_str(&format!(" LIMIT ?{}", values.len()));
            values.push(Box::new(self.offset));
            sql.push_str(&format!(" OFFSET ?{}", values.len()));
        }
        (sql, values)
    }

    pub async fn query(&self) -> Result<Vec<MessageRecord>, HistoryError> {
        let (sql, values) = self.build(false);
        let conn = self.model.db.conn.lock().await;
        let mut stmt = conn.prepare(&sql)?;
        let refs: Vec<&dyn ToSql> = values.iter().map(|v| v.as_ref() as &dyn ToSql).collect();
        let messages = stmt
            .query_map(refs.as_slice(), row_to_message)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(messages)
    }

    pub async fn query_with_count(&self) -> Result<(Vec<MessageRecord>, i64), HistoryError> {
        let (sql, values) = self.build(true);
        let conn = self.model.db.conn.lock().await;
        let mut stmt = conn.prepare(&sql)?;
        let refs: Vec<&dyn ToSql> = values.iter().map(|v| v.as_ref() as &dyn ToSql).collect();
        let mut total = 0i64;
        let messages = stmt
            .query_map(refs.as_slice(), |row| {
                total = row.get(11)?;
                row_to_message(row)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok((messages, total))
    }
}
