#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};

use campus_domain::models::{
	Attachment, Conversation, Message, NewMessage, NewNotification, Notification, Participant, ReadReceipt,
};
use campus_domain::{ConversationId, MessageId, NotificationId, UserId};
use tokio::sync::Mutex;

use super::{
	ConversationStore, InsertOutcome, MessageQuery, NotificationQuery, NotificationStore, StoreError, StoreResult,
};

/// Process-local store. Also used as the test double for the SQL store.
#[derive(Default)]
pub struct MemoryStore {
	inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
	/// Insertion order.
	notifications: Vec<Notification>,
	/// Keys of rows that still exist.
	dedup_keys: HashMap<String, NotificationId>,

	conversations: HashMap<ConversationId, Conversation>,
	participants: HashMap<ConversationId, Vec<Participant>>,
	messages: HashMap<ConversationId, Vec<Message>>,
	receipts: HashMap<MessageId, Vec<ReadReceipt>>,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait::async_trait]
impl NotificationStore for MemoryStore {
	async fn insert_notification(&self, new: NewNotification, now_ms: i64) -> StoreResult<InsertOutcome> {
		let mut inner = self.inner.lock().await;
		if let Some(key) = new.dedup_key.as_ref()
			&& inner.dedup_keys.contains_key(key)
		{
			return Ok(InsertOutcome::Duplicate);
		}

		let id = NotificationId::generate();
		if let Some(key) = new.dedup_key.clone() {
			inner.dedup_keys.insert(key, id.clone());
		}
		let notification = Notification::from_new(id, new, now_ms);
		inner.notifications.push(notification.clone());
		Ok(InsertOutcome::Inserted(notification))
	}

	async fn unread_count(&self, user: &UserId) -> StoreResult<u64> {
		let inner = self.inner.lock().await;
		Ok(inner
			.notifications
			.iter()
			.filter(|n| &n.user_id == user && !n.is_read)
			.count() as u64)
	}

	async fn mark_notification_read(&self, user: &UserId, id: &NotificationId, now_ms: i64) -> StoreResult<bool> {
		let mut inner = self.inner.lock().await;
		let Some(n) = inner
			.notifications
			.iter_mut()
			.find(|n| &n.id == id && &n.user_id == user)
		else {
			return Err(StoreError::NotFound(format!("notification {id}")));
		};

		if n.is_read {
			return Ok(false);
		}
		n.is_read = true;
		n.read_at_ms = Some(now_ms);
		Ok(true)
	}

	async fn mark_all_notifications_read(&self, user: &UserId, now_ms: i64) -> StoreResult<u64> {
		let mut inner = self.inner.lock().await;
		let mut changed = 0u64;
		for n in inner.notifications.iter_mut().filter(|n| &n.user_id == user && !n.is_read) {
			n.is_read = true;
			n.read_at_ms = Some(now_ms);
			changed += 1;
		}
		Ok(changed)
	}

	async fn list_notifications(&self, user: &UserId, query: NotificationQuery) -> StoreResult<Vec<Notification>> {
		let inner = self.inner.lock().await;
		let mut out = inner
			.notifications
			.iter()
			.rev()
			.filter(|n| &n.user_id == user)
			.filter(|n| !query.unread_only || !n.is_read)
			.filter(|n| query.before_ms.is_none_or(|before| n.created_at_ms < before))
			.cloned()
			.collect::<Vec<_>>();
		out.sort_by(|a, b| b.created_at_ms.cmp(&a.created_at_ms));
		out.truncate(query.limit);
		Ok(out)
	}

	async fn delete_notification(&self, user: &UserId, id: &NotificationId) -> StoreResult<bool> {
		let mut inner = self.inner.lock().await;
		let before = inner.notifications.len();
		inner.notifications.retain(|n| !(&n.id == id && &n.user_id == user));
		let removed = inner.notifications.len() != before;
		if removed {
			inner.dedup_keys.retain(|_, v| v != id);
		}
		Ok(removed)
	}

	async fn delete_read_notifications_before(&self, cutoff_ms: i64) -> StoreResult<u64> {
		let mut guard = self.inner.lock().await;
		let inner = &mut *guard;
		let mut purged = HashSet::new();
		inner.notifications.retain(|n| {
			let expired = n.is_read && n.created_at_ms < cutoff_ms;
			if expired {
				purged.insert(n.id.clone());
			}
			!expired
		});
		if !purged.is_empty() {
			inner.dedup_keys.retain(|_, id| !purged.contains(id));
		}
		Ok(purged.len() as u64)
	}
}

#[async_trait::async_trait]
impl ConversationStore for MemoryStore {
	async fn create_conversation(&self, conversation: &Conversation, participants: &[Participant]) -> StoreResult<()> {
		let mut inner = self.inner.lock().await;
		if inner.conversations.contains_key(&conversation.id) {
			return Err(StoreError::Conflict(format!("conversation {} exists", conversation.id)));
		}
		inner.conversations.insert(conversation.id.clone(), conversation.clone());
		inner
			.participants
			.insert(conversation.id.clone(), participants.to_vec());
		inner.messages.insert(conversation.id.clone(), Vec::new());
		Ok(())
	}

	async fn conversation(&self, id: &ConversationId) -> StoreResult<Option<Conversation>> {
		let inner = self.inner.lock().await;
		Ok(inner.conversations.get(id).cloned())
	}

	async fn participants(&self, id: &ConversationId) -> StoreResult<Vec<Participant>> {
		let inner = self.inner.lock().await;
		Ok(inner.participants.get(id).cloned().unwrap_or_default())
	}

	async fn conversations_for_user(&self, user: &UserId) -> StoreResult<Vec<Conversation>> {
		let inner = self.inner.lock().await;
		let mut out = inner
			.participants
			.iter()
			.filter(|(_, ps)| ps.iter().any(|p| &p.user_id == user))
			.filter_map(|(id, _)| inner.conversations.get(id).cloned())
			.collect::<Vec<_>>();
		out.sort_by(|a, b| {
			let a_at = a.last_message_at_ms.unwrap_or(a.created_at_ms);
			let b_at = b.last_message_at_ms.unwrap_or(b.created_at_ms);
			b_at.cmp(&a_at)
		});
		Ok(out)
	}

	async fn delete_conversation(&self, id: &ConversationId) -> StoreResult<bool> {
		let mut inner = self.inner.lock().await;
		let existed = inner.conversations.remove(id).is_some();
		inner.participants.remove(id);
		if let Some(messages) = inner.messages.remove(id) {
			for m in messages {
				inner.receipts.remove(&m.id);
			}
		}
		Ok(existed)
	}

	async fn append_message(&self, new: NewMessage, preview: String, now_ms: i64) -> StoreResult<Message> {
		let mut guard = self.inner.lock().await;
		let inner = &mut *guard;
		let Some(conversation) = inner.conversations.get_mut(&new.conversation_id) else {
			return Err(StoreError::NotFound(format!("conversation {}", new.conversation_id)));
		};

		let created_at_ms = now_ms.max(conversation.last_message_at_ms.unwrap_or(i64::MIN));
		conversation.last_message_at_ms = Some(created_at_ms);
		conversation.last_message_preview = Some(preview);

		let messages = inner.messages.entry(new.conversation_id.clone()).or_default();
		let seq = messages.last().map(|m| m.seq + 1).unwrap_or(1);
		let message = Message {
			id: MessageId::generate(),
			conversation_id: new.conversation_id,
			seq,
			sender_id: new.sender_id,
			sender_name: new.sender_name,
			sender_role: new.sender_role,
			body: new.body,
			created_at_ms,
			attachments: new
				.attachments
				.into_iter()
				.map(|a| Attachment {
					id: uuid::Uuid::new_v4().to_string(),
					file_name: a.file_name,
					url: a.url,
					mime_type: a.mime_type,
					size_bytes: a.size_bytes,
				})
				.collect(),
		};
		messages.push(message.clone());
		Ok(message)
	}

	async fn list_messages(&self, id: &ConversationId, query: MessageQuery) -> StoreResult<Vec<Message>> {
		let inner = self.inner.lock().await;
		let Some(messages) = inner.messages.get(id) else {
			return Err(StoreError::NotFound(format!("conversation {id}")));
		};
		Ok(messages
			.iter()
			.filter(|m| query.after_seq.is_none_or(|after| m.seq > after))
			.take(query.limit)
			.cloned()
			.collect())
	}

	async fn mark_conversation_read(&self, id: &ConversationId, reader: &UserId, now_ms: i64) -> StoreResult<u64> {
		let mut inner = self.inner.lock().await;
		let Some(messages) = inner.messages.get(id) else {
			return Err(StoreError::NotFound(format!("conversation {id}")));
		};

		let unread = messages
			.iter()
			.filter(|m| &m.sender_id != reader)
			.map(|m| m.id.clone())
			.collect::<Vec<_>>();

		let mut created = 0u64;
		for message_id in unread {
			let receipts = inner.receipts.entry(message_id.clone()).or_default();
			if receipts.iter().any(|r| &r.reader_id == reader) {
				continue;
			}
			receipts.push(ReadReceipt {
				message_id,
				reader_id: reader.clone(),
				read_at_ms: now_ms,
			});
			created += 1;
		}
		Ok(created)
	}

	async fn receipts(&self, message: &MessageId) -> StoreResult<Vec<ReadReceipt>> {
		let inner = self.inner.lock().await;
		Ok(inner.receipts.get(message).cloned().unwrap_or_default())
	}
}
