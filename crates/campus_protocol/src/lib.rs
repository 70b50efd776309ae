#![forbid(unsafe_code)]

pub mod events;
pub mod framing;

pub use events::{
	AuthPayload, ClientEvent, ConversationRef, Empty, ErrorCode, ErrorPayload, GatewayKind, MessageNewPayload,
	MessageReadPayload, MessageSendPayload, NotificationPayload, NotificationRef, ReadyPayload, ServerEvent,
	TypingPayload, UnreadCountPayload, UserPresencePayload,
};
pub use framing::{DEFAULT_MAX_FRAME_SIZE, FramingError, decode_client_event, decode_frame, encode_frame};
