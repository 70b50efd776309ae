#![forbid(unsafe_code)]

use core::fmt;

use campus_domain::models::{Message, NewAttachment, Notification};
use campus_domain::{ConversationId, NotificationId, Role, TenantId, UserId};
use serde::{Deserialize, Serialize};

/// Which persistent-connection gateway a connection arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayKind {
	Chat,
	Notifications,
}

impl GatewayKind {
	pub const fn as_str(self) -> &'static str {
		match self {
			GatewayKind::Chat => "chat",
			GatewayKind::Notifications => "notifications",
		}
	}
}

impl fmt::Display for GatewayKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Empty {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthPayload {
	pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSendPayload {
	pub conversation_id: ConversationId,
	pub content: String,
	#[serde(default)]
	pub attachments: Vec<NewAttachment>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRef {
	pub conversation_id: ConversationId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRef {
	pub notification_id: NotificationId,
}

/// Client -> server events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
	/// Handshake-embedded credential, only valid as the first frame.
	Auth(AuthPayload),
	MessageSend(MessageSendPayload),
	MessageRead(ConversationRef),
	TypingStart(ConversationRef),
	TypingStop(ConversationRef),
	ConversationJoin(ConversationRef),
	ConversationLeave(ConversationRef),
	NotificationMarkRead(NotificationRef),
	NotificationMarkAllRead,
}

impl ClientEvent {
	pub const fn name(&self) -> &'static str {
		match self {
			ClientEvent::Auth(_) => "auth",
			ClientEvent::MessageSend(_) => "message:send",
			ClientEvent::MessageRead(_) => "message:read",
			ClientEvent::TypingStart(_) => "typing:start",
			ClientEvent::TypingStop(_) => "typing:stop",
			ClientEvent::ConversationJoin(_) => "conversation:join",
			ClientEvent::ConversationLeave(_) => "conversation:leave",
			ClientEvent::NotificationMarkRead(_) => "notification:mark-read",
			ClientEvent::NotificationMarkAllRead => "notification:mark-all-read",
		}
	}

	/// Whether the event may be sent on the given gateway.
	pub fn allowed_on(&self, gateway: GatewayKind) -> bool {
		match self {
			ClientEvent::Auth(_) => true,
			ClientEvent::MessageSend(_)
			| ClientEvent::MessageRead(_)
			| ClientEvent::TypingStart(_)
			| ClientEvent::TypingStop(_)
			| ClientEvent::ConversationJoin(_)
			| ClientEvent::ConversationLeave(_) => gateway == GatewayKind::Chat,
			ClientEvent::NotificationMarkRead(_) | ClientEvent::NotificationMarkAllRead => {
				gateway == GatewayKind::Notifications
			}
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadyPayload {
	pub user_id: UserId,
	pub role: Role,
	pub tenant_id: TenantId,
	pub gateway: GatewayKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageNewPayload {
	pub message: Message,
	pub conversation_id: ConversationId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageReadPayload {
	pub conversation_id: ConversationId,
	pub read_by: UserId,
	pub read_by_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
	pub conversation_id: ConversationId,
	pub user_id: UserId,
	pub user_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPresencePayload {
	pub user_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationPayload {
	pub notification: Notification,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnreadCountPayload {
	pub unread_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
	Unauthorized,
	Forbidden,
	NotFound,
	BadRequest,
	UnknownEvent,
	FrameTooLarge,
	Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
	pub code: ErrorCode,
	pub message: String,
	/// Name of the client event that caused the error, if any.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub event: Option<String>,
}

/// Server -> client events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
	#[serde(rename = "ready")]
	Ready(ReadyPayload),
	#[serde(rename = "message:new")]
	MessageNew(MessageNewPayload),
	#[serde(rename = "message:read")]
	MessageRead(MessageReadPayload),
	#[serde(rename = "typing:start")]
	TypingStart(TypingPayload),
	#[serde(rename = "typing:stop")]
	TypingStop(TypingPayload),
	#[serde(rename = "user:online")]
	UserOnline(UserPresencePayload),
	#[serde(rename = "user:offline")]
	UserOffline(UserPresencePayload),
	#[serde(rename = "notification:new")]
	NotificationNew(NotificationPayload),
	#[serde(rename = "notification:unread-count")]
	NotificationUnreadCount(UnreadCountPayload),
	/// Some durable deliveries were dropped; the client should re-fetch its notification list.
	#[serde(rename = "notification:resync")]
	NotificationResync(Empty),
	#[serde(rename = "conversation:joined")]
	ConversationJoined(ConversationRef),
	#[serde(rename = "conversation:left")]
	ConversationLeft(ConversationRef),
	#[serde(rename = "error")]
	Error(ErrorPayload),
}

impl ServerEvent {
	pub fn error(code: ErrorCode, message: impl Into<String>, event: Option<&str>) -> Self {
		ServerEvent::Error(ErrorPayload {
			code,
			message: message.into(),
			event: event.map(str::to_string),
		})
	}

	pub fn notification(notification: Notification) -> Self {
		ServerEvent::NotificationNew(NotificationPayload { notification })
	}

	pub fn unread_count(unread_count: u64) -> Self {
		ServerEvent::NotificationUnreadCount(UnreadCountPayload { unread_count })
	}

	/// Ephemeral events may be dropped under backpressure; everything else must reach the client
	/// or trigger a resync.
	pub fn is_ephemeral(&self) -> bool {
		matches!(
			self,
			ServerEvent::TypingStart(_)
				| ServerEvent::TypingStop(_)
				| ServerEvent::UserOnline(_)
				| ServerEvent::UserOffline(_)
		)
	}

	pub const fn name(&self) -> &'static str {
		match self {
			ServerEvent::Ready(_) => "ready",
			ServerEvent::MessageNew(_) => "message:new",
			ServerEvent::MessageRead(_) => "message:read",
			ServerEvent::TypingStart(_) => "typing:start",
			ServerEvent::TypingStop(_) => "typing:stop",
			ServerEvent::UserOnline(_) => "user:online",
			ServerEvent::UserOffline(_) => "user:offline",
			ServerEvent::NotificationNew(_) => "notification:new",
			ServerEvent::NotificationUnreadCount(_) => "notification:unread-count",
			ServerEvent::NotificationResync(_) => "notification:resync",
			ServerEvent::ConversationJoined(_) => "conversation:joined",
			ServerEvent::ConversationLeft(_) => "conversation:left",
			ServerEvent::Error(_) => "error",
		}
	}
}
