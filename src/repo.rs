use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::error::Resource;
use crate::models::*;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum RepoError {
    #[error("{resource} {id} not found")]
    NotFound { resource: Resource, id: Id },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("storage failure: {0}")]
    Internal(String),
}

impl RepoError {
    pub fn not_found(resource: Resource, id: Id) -> Self {
        RepoError::NotFound { resource, id }
    }
}

pub type RepoResult<T> = Result<T, RepoError>;

use async_trait::async_trait;

#[async_trait]
pub trait ThreadRepo: Send + Sync {
    /// Fails with `Conflict` when the intervention already has a thread of that type.
    async fn create_thread(&self, new: NewThread) -> RepoResult<Thread>;
    async fn get_thread(&self, id: Id) -> RepoResult<Thread>;
    async fn list_threads_by_intervention(&self, intervention_id: Id) -> RepoResult<Vec<Thread>>;
    /// Threads where `user_id` is an explicit participant, across interventions.
    async fn list_threads_for_participant(&self, user_id: Id) -> RepoResult<Vec<Thread>>;
    async fn bump_activity(&self, thread_id: Id, message_at: DateTime<Utc>) -> RepoResult<()>;
}

#[async_trait]
pub trait ParticipantRepo: Send + Sync {
    /// Idempotent: re-adding an existing participant returns the stored row.
    async fn add_participant(&self, thread_id: Id, user_id: Id) -> RepoResult<Participant>;
    /// Atomically refuses (`Conflict`) to remove the last remaining participant.
    async fn remove_participant(&self, thread_id: Id, user_id: Id) -> RepoResult<()>;
    async fn list_participants(&self, thread_id: Id) -> RepoResult<Vec<Participant>>;
}

#[async_trait]
pub trait MessageRepo: Send + Sync {
    async fn create_message(&self, new: NewMessage) -> RepoResult<Message>;
    async fn get_message(&self, id: Id) -> RepoResult<Message>;
    /// One page of the thread, oldest first. Soft-deleted rows come back redacted.
    async fn list_messages(&self, thread_id: Id, page: Page) -> RepoResult<Vec<Message>>;
    /// Idempotent; the first deletion wins.
    async fn soft_delete_message(&self, id: Id, deleted_by: Id) -> RepoResult<Message>;
    /// Live (non-deleted) messages positioned strictly after `after`, or all of them.
    async fn count_after(&self, thread_id: Id, after: Option<(DateTime<Utc>, Id)>) -> RepoResult<u64>;
    async fn latest_message(&self, thread_id: Id) -> RepoResult<Option<Message>>;
    async fn link_attachments(&self, message_id: Id, attachment_ids: &[String]) -> RepoResult<()>;
}

#[async_trait]
pub trait ReadStateRepo: Send + Sync {
    async fn get_read_marker(&self, thread_id: Id, user_id: Id) -> RepoResult<Option<ReadMarker>>;
    /// Moves the marker to `message` unless it already points at or past it. Returns the
    /// marker as stored afterwards.
    async fn advance_read_marker(&self, thread_id: Id, user_id: Id, message: &Message) -> RepoResult<ReadMarker>;
}

/// Stream of freshly persisted messages, in commit order.
pub trait ChangeFeed: Send + Sync {
    fn message_feed(&self) -> broadcast::Receiver<Message>;
}

pub trait Repo: ThreadRepo + ParticipantRepo + MessageRepo + ReadStateRepo + ChangeFeed {}

impl<T> Repo for T where T: ThreadRepo + ParticipantRepo + MessageRepo + ReadStateRepo + ChangeFeed {}

/// Capacity of the store-side change feed buffer.
pub(crate) const FEED_CAPACITY: usize = 1024;

#[cfg(feature = "inmem-store")]
pub mod inmem;

#[cfg(feature = "postgres-store")]
pub mod pg;
