#![forbid(unsafe_code)]

//! Durable storage for notifications and conversations.
//!
//! The in-memory backend serves tests and single-node development. The SQL backend (SQLite or
//! Postgres, picked from the database URL) is what production runs on.

mod memory;
mod sql;


use campus_domain::models::{Conversation, Message, NewMessage, NewNotification, Notification, Participant, ReadReceipt};
use campus_domain::{ConversationId, MessageId, NotificationId, UserId};
use thiserror::Error;

pub use memory::MemoryStore;
pub use sql::SqlStore;

#[derive(Debug, Error)]
pub enum StoreError {
	#[error("{0} not found")]
	NotFound(String),

	#[error("conflict: {0}")]
	Conflict(String),

	#[error(transparent)]
	Backend(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Result of a notification insert.
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
	Inserted(Notification),
	/// A row with the same dedup key already exists; nothing was written.
	Duplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotificationQuery {
	pub unread_only: bool,
	/// Only rows created strictly before this timestamp (pagination cursor).
	pub before_ms: Option<i64>,
	pub limit: usize,
}

impl Default for NotificationQuery {
	fn default() -> Self {
		Self {
			unread_only: false,
			before_ms: None,
			limit: 50,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageQuery {
	/// Only messages with a sequence number greater than this.
	pub after_seq: Option<i64>,
	pub limit: usize,
}

impl Default for MessageQuery {
	fn default() -> Self {
		Self {
			after_seq: None,
			limit: 100,
		}
	}
}

#[async_trait::async_trait]
pub trait NotificationStore: Send + Sync {
	/// Insert a notification. Inserts sharing a dedup key are no-ops after the first.
	async fn insert_notification(&self, new: NewNotification, now_ms: i64) -> StoreResult<InsertOutcome>;

	async fn unread_count(&self, user: &UserId) -> StoreResult<u64>;

	/// Mark one notification read. Returns whether the row changed.
	///
	/// Fails with `NotFound` when the notification does not exist or belongs to someone else.
	async fn mark_notification_read(&self, user: &UserId, id: &NotificationId, now_ms: i64) -> StoreResult<bool>;

	/// Mark every unread notification of `user` read. Returns the number of rows changed.
	async fn mark_all_notifications_read(&self, user: &UserId, now_ms: i64) -> StoreResult<u64>;

	/// Newest first.
	async fn list_notifications(&self, user: &UserId, query: NotificationQuery) -> StoreResult<Vec<Notification>>;

	async fn delete_notification(&self, user: &UserId, id: &NotificationId) -> StoreResult<bool>;

	/// Delete read notifications created before `cutoff_ms`. Returns the number of rows deleted.
	async fn delete_read_notifications_before(&self, cutoff_ms: i64) -> StoreResult<u64>;
}

#[async_trait::async_trait]
pub trait ConversationStore: Send + Sync {
	async fn create_conversation(&self, conversation: &Conversation, participants: &[Participant]) -> StoreResult<()>;

	async fn conversation(&self, id: &ConversationId) -> StoreResult<Option<Conversation>>;

	async fn participants(&self, id: &ConversationId) -> StoreResult<Vec<Participant>>;

	async fn conversations_for_user(&self, user: &UserId) -> StoreResult<Vec<Conversation>>;

	async fn delete_conversation(&self, id: &ConversationId) -> StoreResult<bool>;

	/// Append a message, assigning the next sequence number and a timestamp that never goes
	/// backwards within the conversation. Also refreshes the conversation preview.
	async fn append_message(&self, new: NewMessage, preview: String, now_ms: i64) -> StoreResult<Message>;

	/// Oldest first.
	async fn list_messages(&self, id: &ConversationId, query: MessageQuery) -> StoreResult<Vec<Message>>;

	/// Record a receipt for every message in the conversation not sent by `reader` and not yet
	/// read by them. Returns the number of receipts created.
	async fn mark_conversation_read(&self, id: &ConversationId, reader: &UserId, now_ms: i64) -> StoreResult<u64>;

	async fn receipts(&self, message: &MessageId) -> StoreResult<Vec<ReadReceipt>>;
}
