#![forbid(unsafe_code)]

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::events::{ClientEvent, Empty};

/// Default maximum text frame size.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024; // 64 KiB

#[derive(Debug, Error)]
pub enum FramingError {
	#[error("frame exceeds maximum size: len={len} max={max}")]
	FrameTooLarge {
		len: usize,
		max: usize,
	},

	#[error("malformed frame: {0}")]
	Malformed(#[source] serde_json::Error),

	#[error("unknown event: {0}")]
	UnknownEvent(String),

	#[error("invalid payload for {event}: {source}")]
	InvalidPayload {
		event: String,
		#[source]
		source: serde_json::Error,
	},

	#[error("json encode error: {0}")]
	Encode(#[source] serde_json::Error),
}

/// Encode a message as a JSON text frame.
pub fn encode_frame<M: Serialize>(msg: &M, max_frame_size: usize) -> Result<String, FramingError> {
	let text = serde_json::to_string(msg).map_err(FramingError::Encode)?;
	if text.len() > max_frame_size {
		return Err(FramingError::FrameTooLarge {
			len: text.len(),
			max: max_frame_size,
		});
	}
	Ok(text)
}

/// Decode a JSON text frame into any deserializable message.
pub fn decode_frame<M: DeserializeOwned>(text: &str, max_frame_size: usize) -> Result<M, FramingError> {
	check_len(text, max_frame_size)?;
	serde_json::from_str(text).map_err(FramingError::Malformed)
}

#[derive(serde::Deserialize)]
struct RawFrame {
	event: String,
	#[serde(default)]
	data: serde_json::Value,
}

/// Decode a client frame `{"event": <name>, "data": {...}}`.
///
/// Unknown event names and bad payloads are reported separately so the gateway can answer with a
/// precise error code.
pub fn decode_client_event(text: &str, max_frame_size: usize) -> Result<ClientEvent, FramingError> {
	check_len(text, max_frame_size)?;
	let raw: RawFrame = serde_json::from_str(text).map_err(FramingError::Malformed)?;

	let event = raw.event.as_str();
	let data = raw.data;
	let invalid = |source| FramingError::InvalidPayload {
		event: event.to_string(),
		source,
	};

	let parsed = match event {
		"auth" => ClientEvent::Auth(serde_json::from_value(data).map_err(invalid)?),
		"message:send" => ClientEvent::MessageSend(serde_json::from_value(data).map_err(invalid)?),
		"message:read" => ClientEvent::MessageRead(serde_json::from_value(data).map_err(invalid)?),
		"typing:start" => ClientEvent::TypingStart(serde_json::from_value(data).map_err(invalid)?),
		"typing:stop" => ClientEvent::TypingStop(serde_json::from_value(data).map_err(invalid)?),
		"conversation:join" => ClientEvent::ConversationJoin(serde_json::from_value(data).map_err(invalid)?),
		"conversation:leave" => ClientEvent::ConversationLeave(serde_json::from_value(data).map_err(invalid)?),
		"notification:mark-read" => ClientEvent::NotificationMarkRead(serde_json::from_value(data).map_err(invalid)?),
		"notification:mark-all-read" => {
			if !data.is_null() {
				let _: Empty = serde_json::from_value(data).map_err(invalid)?;
			}
			ClientEvent::NotificationMarkAllRead
		}
		other => return Err(FramingError::UnknownEvent(other.to_string())),
	};

	Ok(parsed)
}

fn check_len(text: &str, max_frame_size: usize) -> Result<(), FramingError> {
	if text.len() > max_frame_size {
		return Err(FramingError::FrameTooLarge {
			len: text.len(),
			max: max_frame_size,
		});
	}
	Ok(())
}
