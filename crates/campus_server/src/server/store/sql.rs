#![forbid(unsafe_code)]

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, anyhow};
use campus_domain::events::Money;
use campus_domain::models::{
	Account, Attachment, Conversation, Message, NewMessage, NewNotification, Notification, NotificationCategory,
	Participant, ParticipantRole, ReadReceipt, StudentRef,
};
use campus_domain::{
	ConversationId, CourseId, MessageId, NotificationId, PaymentId, Role, StudentId, TaskId, TenantId, UserId,
};
use chrono::NaiveDate;

use super::{
	ConversationStore, InsertOutcome, MessageQuery, NotificationQuery, NotificationStore, StoreError, StoreResult,
};
use crate::server::directory::{Directory, DuePayment, OverdueTask};

/// SQL-backed store. Owns the notification and messaging tables and reads the relationship tables
/// maintained by the CRUD services.
#[derive(Clone)]
pub struct SqlStore {
	backend: SqlBackend,
}

#[derive(Clone)]
enum SqlBackend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
}

/// Runs `$body` against whichever pool backs the store. `$q` rewrites `?` placeholders into the
/// backend's dialect.
macro_rules! with_pool {
	($backend:expr, |$pool:ident, $q:ident| $body:block) => {
		match $backend {
			SqlBackend::Sqlite($pool) => {
				let $q = |sql: &'static str| -> Cow<'static, str> { Cow::Borrowed(sql) };
				$body
			}
			SqlBackend::Postgres($pool) => {
				let $q = |sql: &'static str| -> Cow<'static, str> { Cow::Owned(postgres_placeholders(sql)) };
				$body
			}
		}
	};
}

pub(super) fn postgres_placeholders(sql: &str) -> String {
	let mut out = String::with_capacity(sql.len() + 16);
	let mut n = 0;
	for ch in sql.chars() {
		if ch == '?' {
			n += 1;
			out.push('$');
			out.push_str(&n.to_string());
		} else {
			out.push(ch);
		}
	}
	out
}

const DATE_FMT: &str = "%Y-%m-%d";

fn fmt_date(day: NaiveDate) -> String {
	day.format(DATE_FMT).to_string()
}

fn parse_date(s: &str) -> anyhow::Result<NaiveDate> {
	NaiveDate::parse_from_str(s, DATE_FMT).with_context(|| format!("parse date {s:?}"))
}

impl SqlStore {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		if database_url.starts_with("sqlite:") {
			let mut options = sqlx::sqlite::SqlitePoolOptions::new();
			// Every connection to an in-memory database gets its own empty one.
			if database_url.contains(":memory:") || database_url.contains("mode=memory") {
				options = options
					.max_connections(1)
					.idle_timeout(None::<Duration>)
					.max_lifetime(None::<Duration>);
			}
			let pool = options.connect(database_url).await.context("connect sqlite")?;
			sqlx::migrate!("migrations/sqlite")
				.run(&pool)
				.await
				.context("run sqlite migrations")?;

			Ok(Self {
				backend: SqlBackend::Sqlite(pool),
			})
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::PgPool::connect(database_url).await.context("connect postgres")?;
			sqlx::migrate!("migrations/postgres")
				.run(&pool)
				.await
				.context("run postgres migrations")?;

			Ok(Self {
				backend: SqlBackend::Postgres(pool),
			})
		} else {
			Err(anyhow!("unsupported database_url (use sqlite: or postgres:)"))
		}
	}

	#[cfg(test)]
	pub(super) fn sqlite_pool(&self) -> Option<&sqlx::SqlitePool> {
		match &self.backend {
			SqlBackend::Sqlite(pool) => Some(pool),
			SqlBackend::Postgres(_) => None,
		}
	}

	pub fn backend_name(&self) -> &'static str {
		match self.backend {
			SqlBackend::Sqlite(_) => "sqlite",
			SqlBackend::Postgres(_) => "postgres",
		}
	}

	async fn attachments_for(&self, id: &ConversationId, from_seq: i64, to_seq: i64) -> anyhow::Result<Vec<(String, Attachment)>> {
		let rows: Vec<AttachmentRow> = with_pool!(&self.backend, |pool, q| {
			sqlx::query_as(&q(
				"SELECT a.message_id, a.id, a.file_name, a.url, a.mime_type, a.size_bytes \
				FROM message_attachments a JOIN messages m ON m.id = a.message_id \
				WHERE m.conversation_id = ? AND m.seq >= ? AND m.seq <= ? ORDER BY a.id",
			))
			.bind(id.as_str())
			.bind(from_seq)
			.bind(to_seq)
			.fetch_all(pool)
			.await
			.context("select attachments")?
		});

		Ok(rows
			.into_iter()
			.map(|(message_id, id, file_name, url, mime_type, size_bytes)| {
				(
					message_id,
					Attachment {
						id,
						file_name,
						url,
						mime_type,
						size_bytes,
					},
				)
			})
			.collect())
	}
}

type NotificationRow = (
	String,
	String,
	String,
	String,
	String,
	String,
	Option<String>,
	String,
	i64,
	Option<i64>,
);

fn notification_from_row(row: NotificationRow) -> anyhow::Result<Notification> {
	let (id, user_id, tenant_id, title, body, category, link, metadata, created_at_ms, read_at_ms) = row;
	Ok(Notification {
		id: NotificationId::new(id)?,
		user_id: UserId::new(user_id)?,
		tenant_id: TenantId::new(tenant_id)?,
		title,
		body,
		category: NotificationCategory::from_str(&category)?,
		link,
		metadata: serde_json::from_str(&metadata).context("parse notification metadata")?,
		is_read: read_at_ms.is_some(),
		created_at_ms,
		read_at_ms,
	})
}

type ConversationRow = (String, String, String, String, String, Option<String>, Option<i64>, i64);

fn conversation_from_row(row: ConversationRow) -> anyhow::Result<Conversation> {
	let (id, tenant_id, student_id, student_name, created_by, preview, last_at, created_at_ms) = row;
	Ok(Conversation {
		id: ConversationId::new(id)?,
		tenant_id: TenantId::new(tenant_id)?,
		student: StudentRef::new(StudentId::new(student_id)?, student_name),
		created_by: UserId::new(created_by)?,
		last_message_preview: preview,
		last_message_at_ms: last_at,
		created_at_ms,
	})
}

type MessageRow = (String, String, i64, String, String, String, String, i64);

fn message_from_row(row: MessageRow) -> anyhow::Result<Message> {
	let (id, conversation_id, seq, sender_id, sender_name, sender_role, body, created_at_ms) = row;
	Ok(Message {
		id: MessageId::new(id)?,
		conversation_id: ConversationId::new(conversation_id)?,
		seq,
		sender_id: UserId::new(sender_id)?,
		sender_name,
		sender_role: Role::from_str(&sender_role)?,
		body,
		created_at_ms,
		attachments: Vec::new(),
	})
}

type AttachmentRow = (String, String, String, String, Option<String>, i64);

type PaymentRow = (String, String, String, String, i64, String, String, String);

fn payment_from_row(row: PaymentRow) -> anyhow::Result<DuePayment> {
	let (id, tenant_id, student_id, student_name, amount_cents, currency, description, due_date) = row;
	Ok(DuePayment {
		payment_id: PaymentId::new(id)?,
		tenant_id: TenantId::new(tenant_id)?,
		student: StudentRef::new(StudentId::new(student_id)?, student_name),
		amount: Money::new(amount_cents, currency),
		description,
		due_date: parse_date(&due_date)?,
	})
}

fn user_ids(rows: Vec<(String,)>) -> anyhow::Result<Vec<UserId>> {
	rows.into_iter()
		.map(|(id,)| UserId::new(id).map_err(anyhow::Error::from))
		.collect()
}

#[async_trait::async_trait]
impl NotificationStore for SqlStore {
	async fn insert_notification(&self, new: NewNotification, now_ms: i64) -> StoreResult<InsertOutcome> {
		let id = NotificationId::generate();
		let metadata = serde_json::to_string(&new.content.metadata).context("encode notification metadata")?;

		let inserted = with_pool!(&self.backend, |pool, q| {
			sqlx::query(&q(
				"INSERT INTO notifications \
				(id, user_id, tenant_id, title, body, category, link, metadata, dedup_key, created_at_ms) \
				VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) ON CONFLICT (dedup_key) DO NOTHING",
			))
			.bind(id.as_str())
			.bind(new.user_id.as_str())
			.bind(new.tenant_id.as_str())
			.bind(new.content.title.as_str())
			.bind(new.content.body.as_str())
			.bind(new.content.category.as_str())
			.bind(new.content.link.as_deref())
			.bind(metadata.as_str())
			.bind(new.dedup_key.as_deref())
			.bind(now_ms)
			.execute(pool)
			.await
			.context("insert notification")?
			.rows_affected()
		});

		if inserted == 0 {
			return Ok(InsertOutcome::Duplicate);
		}
		Ok(InsertOutcome::Inserted(Notification::from_new(id, new, now_ms)))
	}

	async fn unread_count(&self, user: &UserId) -> StoreResult<u64> {
		let (count,): (i64,) = with_pool!(&self.backend, |pool, q| {
			sqlx::query_as(&q(
				"SELECT COUNT(*) FROM notifications WHERE user_id = ? AND read_at_ms IS NULL",
			))
			.bind(user.as_str())
			.fetch_one(pool)
			.await
			.context("count unread notifications")?
		});
		Ok(count.max(0) as u64)
	}

	async fn mark_notification_read(&self, user: &UserId, id: &NotificationId, now_ms: i64) -> StoreResult<bool> {
		let (changed, exists) = with_pool!(&self.backend, |pool, q| {
			let changed = sqlx::query(&q(
				"UPDATE notifications SET read_at_ms = ? WHERE id = ? AND user_id = ? AND read_at_ms IS NULL",
			))
			.bind(now_ms)
			.bind(id.as_str())
			.bind(user.as_str())
			.execute(pool)
			.await
			.context("mark notification read")?
			.rows_affected();

			let (exists,): (i64,) = sqlx::query_as(&q("SELECT COUNT(*) FROM notifications WHERE id = ? AND user_id = ?"))
				.bind(id.as_str())
				.bind(user.as_str())
				.fetch_one(pool)
				.await
				.context("check notification owner")?;
			(changed, exists)
		});

		if exists == 0 {
			return Err(StoreError::NotFound(format!("notification {id}")));
		}
		Ok(changed > 0)
	}

	async fn mark_all_notifications_read(&self, user: &UserId, now_ms: i64) -> StoreResult<u64> {
		let changed = with_pool!(&self.backend, |pool, q| {
			sqlx::query(&q(
				"UPDATE notifications SET read_at_ms = ? WHERE user_id = ? AND read_at_ms IS NULL",
			))
			.bind(now_ms)
			.bind(user.as_str())
			.execute(pool)
			.await
			.context("mark all notifications read")?
			.rows_affected()
		});
		Ok(changed)
	}

	async fn list_notifications(&self, user: &UserId, query: NotificationQuery) -> StoreResult<Vec<Notification>> {
		let rows: Vec<NotificationRow> = with_pool!(&self.backend, |pool, q| {
			sqlx::query_as(&q(
				"SELECT id, user_id, tenant_id, title, body, category, link, metadata, created_at_ms, read_at_ms \
				FROM notifications WHERE user_id = ? AND (read_at_ms IS NULL OR ? = 0) AND created_at_ms < ? \
				ORDER BY created_at_ms DESC, id DESC LIMIT ?",
			))
			.bind(user.as_str())
			.bind(i64::from(query.unread_only))
			.bind(query.before_ms.unwrap_or(i64::MAX))
			.bind(query.limit as i64)
			.fetch_all(pool)
			.await
			.context("list notifications")?
		});

		Ok(rows
			.into_iter()
			.map(notification_from_row)
			.collect::<anyhow::Result<Vec<_>>>()?)
	}

	async fn delete_notification(&self, user: &UserId, id: &NotificationId) -> StoreResult<bool> {
		let deleted = with_pool!(&self.backend, |pool, q| {
			sqlx::query(&q("DELETE FROM notifications WHERE id = ? AND user_id = ?"))
				.bind(id.as_str())
				.bind(user.as_str())
				.execute(pool)
				.await
				.context("delete notification")?
				.rows_affected()
		});
		Ok(deleted > 0)
	}

	async fn delete_read_notifications_before(&self, cutoff_ms: i64) -> StoreResult<u64> {
		let deleted = with_pool!(&self.backend, |pool, q| {
			sqlx::query(&q(
				"DELETE FROM notifications WHERE read_at_ms IS NOT NULL AND created_at_ms < ?",
			))
			.bind(cutoff_ms)
			.execute(pool)
			.await
			.context("purge read notifications")?
			.rows_affected()
		});
		Ok(deleted)
	}
}

#[async_trait::async_trait]
impl ConversationStore for SqlStore {
	async fn create_conversation(&self, conversation: &Conversation, participants: &[Participant]) -> StoreResult<()> {
		with_pool!(&self.backend, |pool, q| {
			let mut tx = pool.begin().await.context("begin create conversation")?;
			sqlx::query(&q(
				"INSERT INTO conversations \
				(id, tenant_id, student_id, student_name, created_by, created_at_ms) VALUES (?, ?, ?, ?, ?, ?)",
			))
			.bind(conversation.id.as_str())
			.bind(conversation.tenant_id.as_str())
			.bind(conversation.student.id.as_str())
			.bind(conversation.student.name.as_str())
			.bind(conversation.created_by.as_str())
			.bind(conversation.created_at_ms)
			.execute(&mut *tx)
			.await
			.context("insert conversation")?;

			for p in participants {
				sqlx::query(&q(
					"INSERT INTO conversation_participants (conversation_id, user_id, role, display_name) \
					VALUES (?, ?, ?, ?)",
				))
				.bind(p.conversation_id.as_str())
				.bind(p.user_id.as_str())
				.bind(p.role.as_str())
				.bind(p.display_name.as_str())
				.execute(&mut *tx)
				.await
				.context("insert participant")?;
			}

			tx.commit().await.context("commit create conversation")?;
		});
		Ok(())
	}

	async fn conversation(&self, id: &ConversationId) -> StoreResult<Option<Conversation>> {
		let row: Option<ConversationRow> = with_pool!(&self.backend, |pool, q| {
			sqlx::query_as(&q(
				"SELECT id, tenant_id, student_id, student_name, created_by, last_message_preview, \
				last_message_at_ms, created_at_ms FROM conversations WHERE id = ?",
			))
			.bind(id.as_str())
			.fetch_optional(pool)
			.await
			.context("select conversation")?
		});
		Ok(row.map(conversation_from_row).transpose()?)
	}

	async fn participants(&self, id: &ConversationId) -> StoreResult<Vec<Participant>> {
		let rows: Vec<(String, String, String, String)> = with_pool!(&self.backend, |pool, q| {
			sqlx::query_as(&q(
				"SELECT conversation_id, user_id, role, display_name FROM conversation_participants \
				WHERE conversation_id = ? ORDER BY user_id",
			))
			.bind(id.as_str())
			.fetch_all(pool)
			.await
			.context("select participants")?
		});

		let mut out = Vec::with_capacity(rows.len());
		for (conversation_id, user_id, role, display_name) in rows {
			out.push(Participant {
				conversation_id: ConversationId::new(conversation_id).map_err(anyhow::Error::from)?,
				user_id: UserId::new(user_id).map_err(anyhow::Error::from)?,
				role: ParticipantRole::from_str(&role).map_err(anyhow::Error::from)?,
				display_name,
			});
		}
		Ok(out)
	}

	async fn conversations_for_user(&self, user: &UserId) -> StoreResult<Vec<Conversation>> {
		let rows: Vec<ConversationRow> = with_pool!(&self.backend, |pool, q| {
			sqlx::query_as(&q(
				"SELECT c.id, c.tenant_id, c.student_id, c.student_name, c.created_by, c.last_message_preview, \
				c.last_message_at_ms, c.created_at_ms FROM conversations c \
				JOIN conversation_participants p ON p.conversation_id = c.id \
				WHERE p.user_id = ? ORDER BY COALESCE(c.last_message_at_ms, c.created_at_ms) DESC",
			))
			.bind(user.as_str())
			.fetch_all(pool)
			.await
			.context("select user conversations")?
		});
		Ok(rows
			.into_iter()
			.map(conversation_from_row)
			.collect::<anyhow::Result<Vec<_>>>()?)
	}

	async fn delete_conversation(&self, id: &ConversationId) -> StoreResult<bool> {
		let deleted = with_pool!(&self.backend, |pool, q| {
			let mut tx = pool.begin().await.context("begin delete conversation")?;
			sqlx::query(&q(
				"DELETE FROM message_reads WHERE message_id IN (SELECT id FROM messages WHERE conversation_id = ?)",
			))
			.bind(id.as_str())
			.execute(&mut *tx)
			.await
			.context("delete receipts")?;
			sqlx::query(&q(
				"DELETE FROM message_attachments WHERE message_id IN (SELECT id FROM messages WHERE conversation_id = ?)",
			))
			.bind(id.as_str())
			.execute(&mut *tx)
			.await
			.context("delete attachments")?;
			sqlx::query(&q("DELETE FROM messages WHERE conversation_id = ?"))
				.bind(id.as_str())
				.execute(&mut *tx)
				.await
				.context("delete messages")?;
			sqlx::query(&q("DELETE FROM conversation_participants WHERE conversation_id = ?"))
				.bind(id.as_str())
				.execute(&mut *tx)
				.await
				.context("delete participants")?;
			let deleted = sqlx::query(&q("DELETE FROM conversations WHERE id = ?"))
				.bind(id.as_str())
				.execute(&mut *tx)
				.await
				.context("delete conversation")?
				.rows_affected();
			tx.commit().await.context("commit delete conversation")?;
			deleted
		});
		Ok(deleted > 0)
	}

	async fn append_message(&self, new: NewMessage, preview: String, now_ms: i64) -> StoreResult<Message> {
		let id = MessageId::generate();
		let attachments = new
			.attachments
			.iter()
			.map(|a| Attachment {
				id: uuid::Uuid::new_v4().to_string(),
				file_name: a.file_name.clone(),
				url: a.url.clone(),
				mime_type: a.mime_type.clone(),
				size_bytes: a.size_bytes,
			})
			.collect::<Vec<_>>();

		let (seq, created_at_ms) = with_pool!(&self.backend, |pool, q| {
			let mut tx = pool.begin().await.context("begin append message")?;

			// Touch the conversation row first so concurrent appends serialize on it.
			let locked = sqlx::query(&q(
				"UPDATE conversations SET last_message_at_ms = last_message_at_ms WHERE id = ?",
			))
			.bind(new.conversation_id.as_str())
			.execute(&mut *tx)
			.await
			.context("lock conversation")?
			.rows_affected();
			if locked == 0 {
				return Err(StoreError::NotFound(format!("conversation {}", new.conversation_id)));
			}

			let (last_at,): (Option<i64>,) =
				sqlx::query_as(&q("SELECT last_message_at_ms FROM conversations WHERE id = ?"))
					.bind(new.conversation_id.as_str())
					.fetch_one(&mut *tx)
					.await
					.context("select last message time")?;
			let (max_seq,): (i64,) =
				sqlx::query_as(&q("SELECT COALESCE(MAX(seq), 0) FROM messages WHERE conversation_id = ?"))
					.bind(new.conversation_id.as_str())
					.fetch_one(&mut *tx)
					.await
					.context("select max seq")?;

			let seq = max_seq + 1;
			let created_at_ms = now_ms.max(last_at.unwrap_or(i64::MIN));

			sqlx::query(&q(
				"INSERT INTO messages \
				(id, conversation_id, seq, sender_id, sender_name, sender_role, body, created_at_ms) \
				VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
			))
			.bind(id.as_str())
			.bind(new.conversation_id.as_str())
			.bind(seq)
			.bind(new.sender_id.as_str())
			.bind(new.sender_name.as_str())
			.bind(new.sender_role.as_str())
			.bind(new.body.as_str())
			.bind(created_at_ms)
			.execute(&mut *tx)
			.await
			.context("insert message")?;

			for a in &attachments {
				sqlx::query(&q(
					"INSERT INTO message_attachments (id, message_id, file_name, url, mime_type, size_bytes) \
					VALUES (?, ?, ?, ?, ?, ?)",
				))
				.bind(a.id.as_str())
				.bind(id.as_str())
				.bind(a.file_name.as_str())
				.bind(a.url.as_str())
				.bind(a.mime_type.as_deref())
				.bind(a.size_bytes)
				.execute(&mut *tx)
				.await
				.context("insert attachment")?;
			}

			sqlx::query(&q(
				"UPDATE conversations SET last_message_preview = ?, last_message_at_ms = ? WHERE id = ?",
			))
			.bind(preview.as_str())
			.bind(created_at_ms)
			.bind(new.conversation_id.as_str())
			.execute(&mut *tx)
			.await
			.context("update conversation preview")?;

			tx.commit().await.context("commit append message")?;
			(seq, created_at_ms)
		});

		Ok(Message {
			id,
			conversation_id: new.conversation_id,
			seq,
			sender_id: new.sender_id,
			sender_name: new.sender_name,
			sender_role: new.sender_role,
			body: new.body,
			created_at_ms,
			attachments,
		})
	}

	async fn list_messages(&self, id: &ConversationId, query: MessageQuery) -> StoreResult<Vec<Message>> {
		if self.conversation(id).await?.is_none() {
			return Err(StoreError::NotFound(format!("conversation {id}")));
		}

		let rows: Vec<MessageRow> = with_pool!(&self.backend, |pool, q| {
			sqlx::query_as(&q(
				"SELECT id, conversation_id, seq, sender_id, sender_name, sender_role, body, created_at_ms \
				FROM messages WHERE conversation_id = ? AND seq > ? ORDER BY seq LIMIT ?",
			))
			.bind(id.as_str())
			.bind(query.after_seq.unwrap_or(0))
			.bind(query.limit as i64)
			.fetch_all(pool)
			.await
			.context("list messages")?
		});

		let mut messages = rows
			.into_iter()
			.map(message_from_row)
			.collect::<anyhow::Result<Vec<_>>>()?;

		if let (Some(first), Some(last)) = (messages.first(), messages.last()) {
			let mut by_message: BTreeMap<String, Vec<Attachment>> = BTreeMap::new();
			for (message_id, attachment) in self.attachments_for(id, first.seq, last.seq).await? {
				by_message.entry(message_id).or_default().push(attachment);
			}
			for m in messages.iter_mut() {
				if let Some(list) = by_message.remove(m.id.as_str()) {
					m.attachments = list;
				}
			}
		}

		Ok(messages)
	}

	async fn mark_conversation_read(&self, id: &ConversationId, reader: &UserId, now_ms: i64) -> StoreResult<u64> {
		if self.conversation(id).await?.is_none() {
			return Err(StoreError::NotFound(format!("conversation {id}")));
		}

		let created = with_pool!(&self.backend, |pool, q| {
			sqlx::query(&q(
				"INSERT INTO message_reads (message_id, reader_id, read_at_ms) \
				SELECT m.id, ?, ? FROM messages m \
				WHERE m.conversation_id = ? AND m.sender_id <> ? \
				AND NOT EXISTS (SELECT 1 FROM message_reads r WHERE r.message_id = m.id AND r.reader_id = ?) \
				ON CONFLICT (message_id, reader_id) DO NOTHING",
			))
			.bind(reader.as_str())
			.bind(now_ms)
			.bind(id.as_str())
			.bind(reader.as_str())
			.bind(reader.as_str())
			.execute(pool)
			.await
			.context("insert read receipts")?
			.rows_affected()
		});
		Ok(created)
	}

	async fn receipts(&self, message: &MessageId) -> StoreResult<Vec<ReadReceipt>> {
		let rows: Vec<(String, String, i64)> = with_pool!(&self.backend, |pool, q| {
			sqlx::query_as(&q(
				"SELECT message_id, reader_id, read_at_ms FROM message_reads WHERE message_id = ? ORDER BY reader_id",
			))
			.bind(message.as_str())
			.fetch_all(pool)
			.await
			.context("select receipts")?
		});

		let mut out = Vec::with_capacity(rows.len());
		for (message_id, reader_id, read_at_ms) in rows {
			out.push(ReadReceipt {
				message_id: MessageId::new(message_id).map_err(anyhow::Error::from)?,
				reader_id: UserId::new(reader_id).map_err(anyhow::Error::from)?,
				read_at_ms,
			});
		}
		Ok(out)
	}
}

#[async_trait::async_trait]
impl Directory for SqlStore {
	async fn account(&self, user: &UserId) -> anyhow::Result<Option<Account>> {
		let row: Option<(String, String, String, String, i64, Option<i64>)> = with_pool!(&self.backend, |pool, q| {
			sqlx::query_as(&q(
				"SELECT id, tenant_id, role, display_name, active, deleted_at_ms FROM users WHERE id = ?",
			))
			.bind(user.as_str())
			.fetch_optional(pool)
			.await
			.context("select account")?
		});

		let Some((id, tenant_id, role, display_name, active, deleted_at_ms)) = row else {
			return Ok(None);
		};
		Ok(Some(Account {
			id: UserId::new(id)?,
			tenant_id: TenantId::new(tenant_id)?,
			role: Role::from_str(&role)?,
			display_name,
			active: active != 0,
			deleted: deleted_at_ms.is_some(),
		}))
	}

	async fn is_token_revoked(&self, jti: &str) -> anyhow::Result<bool> {
		let (count,): (i64,) = with_pool!(&self.backend, |pool, q| {
			sqlx::query_as(&q("SELECT COUNT(*) FROM revoked_tokens WHERE jti = ?"))
				.bind(jti)
				.fetch_one(pool)
				.await
				.context("select revoked token")?
		});
		Ok(count > 0)
	}

	async fn student_accounts(&self, tenant: &TenantId, students: &[StudentId]) -> anyhow::Result<Vec<UserId>> {
		let mut out = Vec::new();
		for student in students {
			let rows: Vec<(String,)> = with_pool!(&self.backend, |pool, q| {
				sqlx::query_as(&q(
					"SELECT u.id FROM students s JOIN users u ON u.id = s.user_id \
					WHERE s.id = ? AND u.tenant_id = ? AND u.active <> 0 AND u.deleted_at_ms IS NULL",
				))
				.bind(student.as_str())
				.bind(tenant.as_str())
				.fetch_all(pool)
				.await
				.context("select student account")?
			});
			out.extend(user_ids(rows)?);
		}
		Ok(out)
	}

	async fn guardian_accounts(&self, tenant: &TenantId, students: &[StudentId]) -> anyhow::Result<Vec<UserId>> {
		let mut out: Vec<UserId> = Vec::new();
		for student in students {
			let rows: Vec<(String,)> = with_pool!(&self.backend, |pool, q| {
				sqlx::query_as(&q(
					"SELECT u.id FROM student_guardians g JOIN users u ON u.id = g.parent_user_id \
					WHERE g.student_id = ? AND u.tenant_id = ? AND u.role = 'parent' \
					AND u.active <> 0 AND u.deleted_at_ms IS NULL ORDER BY u.id",
				))
				.bind(student.as_str())
				.bind(tenant.as_str())
				.fetch_all(pool)
				.await
				.context("select guardians")?
			});
			for id in user_ids(rows)? {
				if !out.contains(&id) {
					out.push(id);
				}
			}
		}
		Ok(out)
	}

	async fn active_roster(&self, tenant: &TenantId, course: &CourseId) -> anyhow::Result<Vec<StudentId>> {
		let rows: Vec<(String,)> = with_pool!(&self.backend, |pool, q| {
			sqlx::query_as(&q(
				"SELECT e.student_id FROM enrollments e JOIN students s ON s.id = e.student_id \
				WHERE e.course_id = ? AND e.active <> 0 AND s.tenant_id = ? ORDER BY e.student_id",
			))
			.bind(course.as_str())
			.bind(tenant.as_str())
			.fetch_all(pool)
			.await
			.context("select roster")?
		});
		rows.into_iter()
			.map(|(id,)| StudentId::new(id).map_err(anyhow::Error::from))
			.collect()
	}

	async fn tenant_admins(&self, tenant: &TenantId) -> anyhow::Result<Vec<UserId>> {
		let rows: Vec<(String,)> = with_pool!(&self.backend, |pool, q| {
			sqlx::query_as(&q(
				"SELECT id FROM users WHERE tenant_id = ? AND role = 'admin' \
				AND active <> 0 AND deleted_at_ms IS NULL ORDER BY id",
			))
			.bind(tenant.as_str())
			.fetch_all(pool)
			.await
			.context("select tenant admins")?
		});
		user_ids(rows)
	}

	async fn open_payments_due_on(&self, day: NaiveDate) -> anyhow::Result<Vec<DuePayment>> {
		let rows: Vec<PaymentRow> = with_pool!(&self.backend, |pool, q| {
			sqlx::query_as(&q(
				"SELECT p.id, p.tenant_id, p.student_id, s.name, p.amount_cents, p.currency, p.description, p.due_date \
				FROM payments p JOIN students s ON s.id = p.student_id \
				WHERE p.paid_at_ms IS NULL AND p.due_date = ? ORDER BY p.id",
			))
			.bind(fmt_date(day))
			.fetch_all(pool)
			.await
			.context("select payments due")?
		});
		rows.into_iter().map(payment_from_row).collect()
	}

	async fn open_payments_due_before(&self, day: NaiveDate) -> anyhow::Result<Vec<DuePayment>> {
		let rows: Vec<PaymentRow> = with_pool!(&self.backend, |pool, q| {
			sqlx::query_as(&q(
				"SELECT p.id, p.tenant_id, p.student_id, s.name, p.amount_cents, p.currency, p.description, p.due_date \
				FROM payments p JOIN students s ON s.id = p.student_id \
				WHERE p.paid_at_ms IS NULL AND p.due_date < ? ORDER BY p.id",
			))
			.bind(fmt_date(day))
			.fetch_all(pool)
			.await
			.context("select overdue payments")?
		});
		rows.into_iter().map(payment_from_row).collect()
	}

	async fn overdue_tasks(&self, from: NaiveDate, to: NaiveDate) -> anyhow::Result<Vec<OverdueTask>> {
		let rows: Vec<(String, String, String, String, String, String, String)> =
			with_pool!(&self.backend, |pool, q| {
				sqlx::query_as(&q(
					"SELECT t.id, t.tenant_id, t.title, c.name, t.due_date, s.id, s.name \
					FROM tasks t \
					JOIN courses c ON c.id = t.course_id \
					JOIN enrollments e ON e.course_id = t.course_id AND e.active <> 0 \
					JOIN students s ON s.id = e.student_id \
					LEFT JOIN task_submissions ts ON ts.task_id = t.id AND ts.student_id = s.id AND ts.completed <> 0 \
					WHERE t.due_date >= ? AND t.due_date <= ? AND ts.task_id IS NULL \
					ORDER BY t.id, s.id",
				))
				.bind(fmt_date(from))
				.bind(fmt_date(to))
				.fetch_all(pool)
				.await
				.context("select overdue tasks")?
			});

		let mut out: Vec<OverdueTask> = Vec::new();
		for (task_id, tenant_id, title, course_name, due_date, student_id, student_name) in rows {
			let student = StudentRef::new(StudentId::new(student_id)?, student_name);
			match out.last_mut() {
				Some(task) if task.task_id.as_str() == task_id => task.missing.push(student),
				_ => out.push(OverdueTask {
					task_id: TaskId::new(task_id)?,
					tenant_id: TenantId::new(tenant_id)?,
					title,
					course_name,
					due_date: parse_date(&due_date)?,
					missing: vec![student],
				}),
			}
		}
		Ok(out)
	}
}
