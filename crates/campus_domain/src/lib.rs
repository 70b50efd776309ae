#![forbid(unsafe_code)]

pub mod events;
pub mod models;
mod secret;

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use secret::SecretString;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("unknown role: {0}")]
	UnknownRole(String),
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

macro_rules! string_id {
	($(#[$meta:meta])* $name:ident) => {
		$(#[$meta])*
		#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
		#[serde(transparent)]
		pub struct $name(String);

		impl $name {
			/// Create a non-empty identifier.
			pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
				let id = id.into();
				if id.trim().is_empty() {
					return Err(ParseIdError::Empty);
				}
				Ok(Self(id))
			}

			/// Random identifier for rows created by this service.
			pub fn generate() -> Self {
				Self(uuid::Uuid::new_v4().to_string())
			}

			pub fn as_str(&self) -> &str {
				&self.0
			}

			pub fn into_string(self) -> String {
				self.0
			}
		}

		impl fmt::Display for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				f.write_str(&self.0)
			}
		}

		impl FromStr for $name {
			type Err = ParseIdError;

			fn from_str(s: &str) -> Result<Self, Self::Err> {
				$name::new(s.to_string())
			}
		}
	};
}

string_id!(
	/// Account identifier (any role).
	UserId
);
string_id!(
	/// School (tenant) identifier.
	TenantId
);
string_id!(
	/// Student record identifier. Distinct from the student's login account.
	StudentId
);
string_id!(CourseId);
string_id!(TaskId);
string_id!(ExamId);
string_id!(PaymentId);
string_id!(ConversationId);
string_id!(MessageId);
string_id!(NotificationId);
string_id!(
	/// Stable identity of a server process.
	NodeId
);

/// Per-process connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub uuid::Uuid);

impl ConnectionId {
	pub fn new_v4() -> Self {
		Self(uuid::Uuid::new_v4())
	}
}

impl fmt::Display for ConnectionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Account role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
	Student,
	Parent,
	Teacher,
	Admin,
}

impl Role {
	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			Role::Student => "student",
			Role::Parent => "parent",
			Role::Teacher => "teacher",
			Role::Admin => "admin",
		}
	}
}

impl fmt::Display for Role {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for Role {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"student" => Ok(Role::Student),
			"parent" | "guardian" => Ok(Role::Parent),
			"teacher" => Ok(Role::Teacher),
			"admin" | "school_admin" => Ok(Role::Admin),
			other => Err(ParseIdError::UnknownRole(other.to_string())),
		}
	}
}

/// Logical delivery topic.
///
/// Topics are the unit of room membership on every node and the key used on the shared bus.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Topic {
	User(UserId),
	Role(Role),
	Tenant(TenantId),
	Conversation(ConversationId),
}

impl Topic {
	/// Parse `user:<id>`, `role:<role>`, `tenant:<id>` or `conversation:<id>`.
	pub fn parse(s: &str) -> Result<Self, ParseIdError> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		let (kind, rest) = s
			.split_once(':')
			.ok_or_else(|| ParseIdError::InvalidFormat(format!("expected <kind>:<id>, got {s}")))?;

		match kind {
			"user" => Ok(Topic::User(UserId::new(rest)?)),
			"role" => Ok(Topic::Role(Role::from_str(rest)?)),
			"tenant" => Ok(Topic::Tenant(TenantId::new(rest)?)),
			"conversation" => Ok(Topic::Conversation(ConversationId::new(rest)?)),
			other => Err(ParseIdError::InvalidFormat(format!("unknown topic kind: {other}"))),
		}
	}

	pub fn is_conversation(&self) -> bool {
		matches!(self, Topic::Conversation(_))
	}
}

impl fmt::Display for Topic {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Topic::User(id) => write!(f, "user:{id}"),
			Topic::Role(role) => write!(f, "role:{role}"),
			Topic::Tenant(id) => write!(f, "tenant:{id}"),
			Topic::Conversation(id) => write!(f, "conversation:{id}"),
		}
	}
}

impl FromStr for Topic {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Topic::parse(s)
	}
}

impl TryFrom<String> for Topic {
	type Error = ParseIdError;

	fn try_from(value: String) -> Result<Self, Self::Error> {
		Topic::parse(&value)
	}
}

impl From<Topic> for String {
	fn from(value: Topic) -> Self {
		value.to_string()
	}
}
