//! Persisted records owned by the fan-out core, plus the account view it reads.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{ConversationId, MessageId, NotificationId, ParseIdError, Role, StudentId, TenantId, UserId};

/// Visual category of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationCategory {
	#[default]
	Info,
	Success,
	Warning,
	Error,
}

impl NotificationCategory {
	pub const fn as_str(self) -> &'static str {
		match self {
			NotificationCategory::Info => "info",
			NotificationCategory::Success => "success",
			NotificationCategory::Warning => "warning",
			NotificationCategory::Error => "error",
		}
	}
}

impl fmt::Display for NotificationCategory {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for NotificationCategory {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_lowercase().as_str() {
			"" => Err(ParseIdError::Empty),
			"info" => Ok(Self::Info),
			"success" => Ok(Self::Success),
			"warning" => Ok(Self::Warning),
			"error" => Ok(Self::Error),
			other => Err(ParseIdError::InvalidFormat(format!("unknown category: {other}"))),
		}
	}
}

/// Rendered text of a notification, before it is bound to an owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationContent {
	pub title: String,
	pub body: String,
	pub category: NotificationCategory,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub link: Option<String>,
	#[serde(default)]
	pub metadata: serde_json::Value,
}

impl NotificationContent {
	pub fn new(title: impl Into<String>, body: impl Into<String>, category: NotificationCategory) -> Self {
		Self {
			title: title.into(),
			body: body.into(),
			category,
			link: None,
			metadata: serde_json::Value::Null,
		}
	}

	pub fn with_link(mut self, link: impl Into<String>) -> Self {
		self.link = Some(link.into());
		self
	}

	pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
		self.metadata = metadata;
		self
	}
}

/// Notification row to be inserted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewNotification {
	pub user_id: UserId,
	pub tenant_id: TenantId,
	pub content: NotificationContent,
	/// Unique key; a second insert with the same key is a no-op.
	pub dedup_key: Option<String>,
}

/// Persisted notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
	pub id: NotificationId,
	pub user_id: UserId,
	pub tenant_id: TenantId,
	pub title: String,
	pub body: String,
	pub category: NotificationCategory,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub link: Option<String>,
	#[serde(default)]
	pub metadata: serde_json::Value,
	pub is_read: bool,
	pub created_at_ms: i64,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub read_at_ms: Option<i64>,
}

impl Notification {
	pub fn from_new(id: NotificationId, new: NewNotification, created_at_ms: i64) -> Self {
		Self {
			id,
			user_id: new.user_id,
			tenant_id: new.tenant_id,
			title: new.content.title,
			body: new.content.body,
			category: new.content.category,
			link: new.content.link,
			metadata: new.content.metadata,
			is_read: false,
			created_at_ms,
			read_at_ms: None,
		}
	}
}

/// Account as seen by the authenticator and the resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
	pub id: UserId,
	pub tenant_id: TenantId,
	pub role: Role,
	pub display_name: String,
	pub active: bool,
	pub deleted: bool,
}

impl Account {
	/// Whether the account may hold a connection.
	pub fn is_usable(&self) -> bool {
		self.active && !self.deleted
	}
}

/// Denormalized student reference carried by events.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentRef {
	pub id: StudentId,
	pub name: String,
}

impl StudentRef {
	pub fn new(id: StudentId, name: impl Into<String>) -> Self {
		Self { id, name: name.into() }
	}
}

/// Role tag of a conversation participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
	Teacher,
	Parent,
	Admin,
}

impl ParticipantRole {
	pub const fn as_str(self) -> &'static str {
		match self {
			ParticipantRole::Teacher => "teacher",
			ParticipantRole::Parent => "parent",
			ParticipantRole::Admin => "admin",
		}
	}

	/// Participant tag for an account role, if that role may take part in conversations.
	pub fn from_role(role: Role) -> Option<Self> {
		match role {
			Role::Teacher => Some(Self::Teacher),
			Role::Parent => Some(Self::Parent),
			Role::Admin => Some(Self::Admin),
			Role::Student => None,
		}
	}
}

impl FromStr for ParticipantRole {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_lowercase().as_str() {
			"" => Err(ParseIdError::Empty),
			"teacher" => Ok(Self::Teacher),
			"parent" => Ok(Self::Parent),
			"admin" => Ok(Self::Admin),
			other => Err(ParseIdError::UnknownRole(other.to_string())),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
	pub conversation_id: ConversationId,
	pub user_id: UserId,
	pub role: ParticipantRole,
	pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
	pub id: ConversationId,
	pub tenant_id: TenantId,
	pub student: StudentRef,
	pub created_by: UserId,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub last_message_preview: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub last_message_at_ms: Option<i64>,
	pub created_at_ms: i64,
}

/// Attachment metadata supplied by the sender (the upload already happened elsewhere).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewAttachment {
	pub file_name: String,
	pub url: String,
	#[serde(default)]
	pub mime_type: Option<String>,
	#[serde(default)]
	pub size_bytes: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
	pub id: String,
	pub file_name: String,
	pub url: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub mime_type: Option<String>,
	pub size_bytes: i64,
}

/// Message to append. Sequence and timestamp are assigned by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
	pub conversation_id: ConversationId,
	pub sender_id: UserId,
	pub sender_name: String,
	pub sender_role: Role,
	pub body: String,
	pub attachments: Vec<NewAttachment>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
	pub id: MessageId,
	pub conversation_id: ConversationId,
	/// Position within the conversation, starting at 1.
	pub seq: i64,
	pub sender_id: UserId,
	pub sender_name: String,
	pub sender_role: Role,
	pub body: String,
	pub created_at_ms: i64,
	#[serde(default)]
	pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
	pub message_id: MessageId,
	pub reader_id: UserId,
	pub read_at_ms: i64,
}

/// Short preview used for the conversation list and offline notifications.
pub fn preview(body: &str, max_chars: usize) -> String {
	let trimmed = body.trim();
	if trimmed.chars().count() <= max_chars {
		return trimmed.to_string();
	}
	let mut out: String = trimmed.chars().take(max_chars).collect();
	out.push('…');
	out
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn preview_truncates_on_char_boundary() {
		assert_eq!(preview("  hi  ", 10), "hi");
		assert_eq!(preview("héllo wörld", 5), "héllo…");
	}

	#[test]
	fn notification_serializes_camel_case() {
		let n = Notification::from_new(
			NotificationId::new("n1").unwrap(),
			NewNotification {
				user_id: UserId::new("u1").unwrap(),
				tenant_id: TenantId::new("t1").unwrap(),
				content: NotificationContent::new("Title", "Body", NotificationCategory::Success),
				dedup_key: None,
			},
			10,
		);
		let v = serde_json::to_value(&n).unwrap();
		assert_eq!(v["userId"], "u1");
		assert_eq!(v["category"], "success");
		assert_eq!(v["isRead"], false);
		assert!(v.get("readAtMs").is_none());
	}

	#[test]
	fn students_cannot_be_participants() {
		assert_eq!(ParticipantRole::from_role(Role::Student), None);
		assert_eq!(ParticipantRole::from_role(Role::Parent), Some(ParticipantRole::Parent));
	}
}
