#![forbid(unsafe_code)]

use campus_protocol::ErrorCode;
use thiserror::Error;

use crate::server::auth::AuthError;
use crate::server::store::StoreError;

/// Error returned by the conversation and notification services.
#[derive(Debug, Error)]
pub enum ServiceError {
	#[error("unauthorized: {0}")]
	Unauthorized(#[from] AuthError),

	#[error("forbidden: {0}")]
	Forbidden(String),

	#[error("not found: {0}")]
	NotFound(String),

	#[error("invalid request: {0}")]
	Invalid(String),

	#[error(transparent)]
	Store(StoreError),

	#[error(transparent)]
	Internal(#[from] anyhow::Error),
}

impl From<StoreError> for ServiceError {
	fn from(e: StoreError) -> Self {
		match e {
			StoreError::NotFound(what) => ServiceError::NotFound(what),
			other => ServiceError::Store(other),
		}
	}
}

impl ServiceError {
	/// Wire error code reported to the client.
	pub fn code(&self) -> ErrorCode {
		match self {
			ServiceError::Unauthorized(_) => ErrorCode::Unauthorized,
			ServiceError::Forbidden(_) => ErrorCode::Forbidden,
			ServiceError::NotFound(_) => ErrorCode::NotFound,
			ServiceError::Invalid(_) => ErrorCode::BadRequest,
			ServiceError::Store(_) | ServiceError::Internal(_) => ErrorCode::Internal,
		}
	}

	/// Message safe to show to the client. Backend details stay in the logs.
	pub fn public_message(&self) -> String {
		match self {
			ServiceError::Store(_) | ServiceError::Internal(_) => "internal error".to_string(),
			other => other.to_string(),
		}
	}
}
