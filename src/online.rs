use std::sync::Arc;

use log::debug;
use tokio::sync::mpsc;

use crate::broker::{BrokerError, BrokerPool, Channel};
use crate::conversation::{AccountConversation, ClientDelivery, exchange_id};
use crate::groups::GroupsModel;
use crate::history::HistoryModel;
use crate::models::{CLASS_USER, Group};
use crate::queue::MessageQueueEngine;

/// Registry of live sessions, realized at the broker level: an account is
/// online exactly when its private exchange exists.
pub struct OnlineModel {
    pool: BrokerPool,
    groups: Arc<GroupsModel>,
    history: Arc<HistoryModel>,
    queue: Arc<MessageQueueEngine>,
}

impl OnlineModel {
    pub fn new(
        pool: BrokerPool,
        groups: Arc<GroupsModel>,
        history: Arc<HistoryModel>,
        queue: Arc<MessageQueueEngine>,
    ) -> Self {
        OnlineModel {
            pool,
            groups,
            history,
            queue,
        }
    }

    /// Build a conversation for an accepted session on a pooled connection.
    /// The caller attaches it and consumes `client`.
    pub fn conversation(
        &self,
        gamespace_id: i64,
        account_id: &str,
        authoritative: bool,
        client: mpsc::Sender<ClientDelivery>,
    ) -> AccountConversation {
        let connection = self.pool.get();
        AccountConversation::new(
            gamespace_id,
            account_id.to_string(),
            authoritative,
            connection.channel(),
            client,
            Arc::clone(&self.history),
            Arc::clone(&self.groups),
            Arc::clone(&self.queue),
        )
    }

    /// Whether the account has a live conversation (passive declare of its
    /// private exchange).
    pub fn account_online(&self, account_id: &str, channel: &Channel) -> Result<bool, BrokerError> {
        match channel.exchange_declare_passive(&exchange_id(CLASS_USER, account_id)) {
            Ok(()) => Ok(true),
            Err(e) if e.code == 404 => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Called by the group directory when a participation appears while the
    /// account is online: bind the new group exchange into the account's
    /// private exchange without disconnecting the client. No-op offline.
    pub fn bind_account_to_group(
        &self,
        account_id: &str,
        group: &Group,
        cluster: i64,
    ) -> Result<(), BrokerError> {
        let connection = self.pool.get();
        let channel = connection.channel();

        if !self.account_online(account_id, &channel)? {
            debug!("Account {account_id} is offline, not binding");
            return Ok(());
        }

        let group_exchange = exchange_id(&group.group_class, &group.effective_recipient(cluster));
        channel.exchange_declare(&group_exchange, true)?;
        channel.exchange_bind(&exchange_id(CLASS_USER, account_id), &group_exchange)?;
        channel.close();
        Ok(())
    }
}
