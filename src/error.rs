use rocket::http::Status;
use thiserror::Error;

use crate::broker::BrokerError;

/// History store failures.
#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("message not found")]
    NotFound,
    #[error("a message with this uuid already exists")]
    Duplicate,
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    BadInput(String),
    #[error("storage failure: {0}")]
    Storage(#[from] rusqlite::Error),
}

impl HistoryError {
    pub fn status(&self) -> Status {
        match self {
            HistoryError::NotFound => Status::NotFound,
            HistoryError::Duplicate | HistoryError::Conflict(_) => Status::Conflict,
            HistoryError::BadInput(_) => Status::BadRequest,
            HistoryError::Storage(_) => Status::InternalServerError,
        }
    }

    /// Client-facing text. Storage detail never leaves the process.
    pub fn public_message(&self) -> String {
        match self {
            HistoryError::Storage(_) => "storage error".to_string(),
            other => other.to_string(),
        }
    }
}

/// Group directory failures.
#[derive(Debug, Error)]
pub enum GroupError {
    #[error("no such group")]
    GroupNotFound,
    #[error("account is not a participant of this group")]
    ParticipantNotFound,
    #[error("group already exists")]
    AlreadyExists,
    #[error("account already joined")]
    AlreadyJoined,
    #[error("failed to purge group history: {0}")]
    History(#[from] HistoryError),
    #[error("storage failure: {0}")]
    Storage(#[from] rusqlite::Error),
}

impl GroupError {
    pub fn status(&self) -> Status {
        match self {
            GroupError::GroupNotFound => Status::NotFound,
            GroupError::ParticipantNotFound => Status::NotAcceptable,
            GroupError::AlreadyExists | GroupError::AlreadyJoined => Status::Conflict,
            GroupError::History(_) | GroupError::Storage(_) => Status::InternalServerError,
        }
    }

    pub fn public_message(&self) -> String {
        match self {
            GroupError::History(_) | GroupError::Storage(_) => "storage error".to_string(),
            other => other.to_string(),
        }
    }
}

/// Conversation attach/detach failures.
#[derive(Debug, Error)]
pub enum ConversationError {
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error(transparent)]
    Groups(#[from] GroupError),
    #[error(transparent)]
    History(#[from] HistoryError),
}

/// Queue engine failures surfaced to senders.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("{0}")]
    BadInput(String),
    #[error("the broker did not confirm the publication")]
    Rejected,
    #[error("timed out processing the batch")]
    Timeout,
    #[error("the queue engine is not started")]
    NotStarted,
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

impl QueueError {
    pub fn status(&self) -> Status {
        match self {
            QueueError::BadInput(_) => Status::BadRequest,
            QueueError::Rejected
            | QueueError::Timeout
            | QueueError::NotStarted
            | QueueError::Broker(_) => Status::InternalServerError,
        }
    }
}
