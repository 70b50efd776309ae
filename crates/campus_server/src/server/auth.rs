#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{Context, anyhow};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use campus_domain::{Role, SecretString, TenantId, UserId};
use campus_util::time::unix_secs_now;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use tokio_tungstenite::tungstenite::http::Request;
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, COOKIE};
use tracing::debug;

use crate::server::directory::Directory;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
	#[default]
	Access,
	Refresh,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthClaims {
	pub sub: String,
	pub role: Role,
	pub tenant: String,
	pub exp: u64,
	#[serde(default)]
	pub typ: TokenKind,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub jti: Option<String>,
}

#[derive(Debug, Error)]
pub enum AuthError {
	#[error("missing credential")]
	MissingCredential,
	#[error("malformed token: {0}")]
	Malformed(String),
	#[error("invalid token signature")]
	BadSignature,
	#[error("token expired")]
	Expired,
	#[error("token revoked")]
	Revoked,
	#[error("unknown account")]
	UnknownAccount,
	#[error("account disabled")]
	AccountDisabled,
	#[error("account no longer matches token")]
	AccountMismatch,
	#[error(transparent)]
	Backend(#[from] anyhow::Error),
}

/// Authenticated identity bound to a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
	pub user_id: UserId,
	pub role: Role,
	pub tenant_id: TenantId,
	pub display_name: String,
	/// Token expiry, unix seconds.
	pub expires_at: u64,
}

/// Where a credential was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
	Cookie,
	Query,
	Header,
	Handshake,
}

impl CredentialSource {
	pub const fn as_str(self) -> &'static str {
		match self {
			CredentialSource::Cookie => "cookie",
			CredentialSource::Query => "query",
			CredentialSource::Header => "header",
			CredentialSource::Handshake => "handshake",
		}
	}
}

/// Verify a `v1.<payload>.<signature>` token against any of `secrets`. The first secret is the
/// current one; the rest are accepted during rotation.
pub fn verify_hmac_token(token: &str, secrets: &[SecretString]) -> Result<AuthClaims, AuthError> {
	let parts = token.trim().split('.').collect::<Vec<_>>();
	if parts.len() != 3 || parts[0] != "v1" {
		return Err(AuthError::Malformed("invalid token format".to_string()));
	}

	let payload_b64 = parts[1];
	let sig_b64 = parts[2];

	let provided_sig = URL_SAFE_NO_PAD
		.decode(sig_b64)
		.map_err(|e| AuthError::Malformed(format!("decode token signature: {e}")))?;

	let mut verified = false;
	for secret in secrets {
		let expected_sig = sign(payload_b64.as_bytes(), secret.expose().as_bytes())?;
		if constant_time_eq(&expected_sig, &provided_sig) {
			verified = true;
			break;
		}
	}
	if !verified {
		return Err(AuthError::BadSignature);
	}

	let payload = URL_SAFE_NO_PAD
		.decode(payload_b64)
		.map_err(|e| AuthError::Malformed(format!("decode token payload: {e}")))?;
	let claims: AuthClaims =
		serde_json::from_slice(&payload).map_err(|e| AuthError::Malformed(format!("parse token claims: {e}")))?;

	if claims.exp <= unix_secs_now() {
		return Err(AuthError::Expired);
	}

	Ok(claims)
}

/// Sign claims into a `v1` token. Issuance belongs to the login service; this is used by tooling
/// and tests.
pub fn sign_hmac_token(claims: &AuthClaims, secret: &SecretString) -> anyhow::Result<String> {
	let payload = serde_json::to_vec(claims).context("encode token claims")?;
	let payload_b64 = URL_SAFE_NO_PAD.encode(payload);
	let sig = sign(payload_b64.as_bytes(), secret.expose().as_bytes())?;
	Ok(format!("v1.{payload_b64}.{}", URL_SAFE_NO_PAD.encode(sig)))
}

fn sign(payload_b64: &[u8], secret: &[u8]) -> anyhow::Result<Vec<u8>> {
	let mut mac = Hmac::<Sha256>::new_from_slice(secret).map_err(|e| anyhow!("hmac key: {e}"))?;
	mac.update(payload_b64);
	Ok(mac.finalize().into_bytes().to_vec())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}

	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}

	diff == 0
}

/// Names used to look up a credential on the upgrade request.
#[derive(Debug, Clone)]
pub struct CredentialNames {
	pub cookie: String,
	pub query_param: String,
}

impl Default for CredentialNames {
	fn default() -> Self {
		Self {
			cookie: "access_token".to_string(),
			query_param: "token".to_string(),
		}
	}
}

/// Find a credential on an upgrade request: cookie first, then query parameter, then an
/// `Authorization: Bearer` header.
pub fn credential_from_request<B>(req: &Request<B>, names: &CredentialNames) -> Option<(CredentialSource, String)> {
	let from_cookie = req
		.headers()
		.get_all(COOKIE)
		.iter()
		.filter_map(|v| v.to_str().ok())
		.flat_map(|v| v.split(';'))
		.filter_map(|pair| pair.trim().split_once('='))
		.find(|(k, v)| *k == names.cookie && !v.is_empty())
		.map(|(_, v)| v.to_string());
	if let Some(token) = from_cookie {
		return Some((CredentialSource::Cookie, token));
	}

	let from_query = req.uri().query().and_then(|q| {
		q.split('&')
			.filter_map(|pair| pair.split_once('='))
			.find(|(k, v)| *k == names.query_param && !v.is_empty())
			.map(|(_, v)| v.to_string())
	});
	if let Some(token) = from_query {
		return Some((CredentialSource::Query, token));
	}

	req.headers()
		.get(AUTHORIZATION)
		.and_then(|v| v.to_str().ok())
		.and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")))
		.map(str::trim)
		.filter(|t| !t.is_empty())
		.map(|t| (CredentialSource::Header, t.to_string()))
}

/// Verifies credentials and checks them against the current account state.
#[derive(Clone)]
pub struct Authenticator {
	secrets: Arc<Vec<SecretString>>,
	directory: Arc<dyn Directory>,
}

impl Authenticator {
	pub fn new(secrets: Vec<SecretString>, directory: Arc<dyn Directory>) -> Self {
		Self {
			secrets: Arc::new(secrets),
			directory,
		}
	}

	/// Resolve a token to a principal bound to an active account.
	///
	/// Refresh-class tokens must carry a token id that is not on the revocation list.
	pub async fn authenticate(&self, token: &str) -> Result<Principal, AuthError> {
		if self.secrets.is_empty() {
			return Err(AuthError::Backend(anyhow!("no token secrets configured")));
		}
		let claims = verify_hmac_token(token, &self.secrets)?;

		let jti = match (claims.typ, claims.jti.as_deref()) {
			(TokenKind::Refresh, None) => return Err(AuthError::Malformed("refresh token without jti".to_string())),
			(_, jti) => jti,
		};
		if let Some(jti) = jti
			&& self.directory.is_token_revoked(jti).await?
		{
			return Err(AuthError::Revoked);
		}

		let user_id = UserId::new(claims.sub.clone()).map_err(|e| AuthError::Malformed(e.to_string()))?;
		let account = self
			.directory
			.account(&user_id)
			.await?
			.ok_or(AuthError::UnknownAccount)?;

		if !account.is_usable() {
			return Err(AuthError::AccountDisabled);
		}
		if account.tenant_id.as_str() != claims.tenant || account.role != claims.role {
			debug!(user = %user_id, "token claims differ from account");
			return Err(AuthError::AccountMismatch);
		}

		Ok(Principal {
			user_id,
			role: account.role,
			tenant_id: account.tenant_id,
			display_name: account.display_name,
			expires_at: claims.exp,
		})
	}

	/// Re-check a connected principal before a privileged operation: the token must not have
	/// expired and the account must still be active with the same tenant and role.
	pub async fn revalidate(&self, principal: &Principal) -> Result<(), AuthError> {
		if principal.expires_at <= unix_secs_now() {
			return Err(AuthError::Expired);
		}

		let account = self
			.directory
			.account(&principal.user_id)
			.await?
			.ok_or(AuthError::UnknownAccount)?;
		if !account.is_usable() {
			return Err(AuthError::AccountDisabled);
		}
		if account.tenant_id != principal.tenant_id || account.role != principal.role {
			return Err(AuthError::AccountMismatch);
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use campus_domain::models::Account;

	use super::*;
	use crate::server::directory::MemoryDirectory;

	fn secret(s: &str) -> SecretString {
		SecretString::new(s.to_string())
	}

	fn claims(sub: &str, exp: u64) -> AuthClaims {
		AuthClaims {
			sub: sub.to_string(),
			role: Role::Teacher,
			tenant: "t1".to_string(),
			exp,
			typ: TokenKind::Access,
			jti: Some("j1".to_string()),
		}
	}

	fn directory() -> Arc<MemoryDirectory> {
		let dir = MemoryDirectory::new();
		dir.upsert_account(Account {
			id: UserId::new("u1").unwrap(),
			tenant_id: TenantId::new("t1").unwrap(),
			role: Role::Teacher,
			display_name: "Prof. Silva".to_string(),
			active: true,
			deleted: false,
		});
		Arc::new(dir)
	}

	#[test]
	fn accepts_rotated_secret() {
		let token = sign_hmac_token(&claims("u1", unix_secs_now() + 60), &secret("old")).unwrap();
		let parsed = verify_hmac_token(&token, &[secret("new"), secret("old")]).unwrap();
		assert_eq!(parsed.sub, "u1");
	}

	#[test]
	fn rejects_tampering_and_expiry() {
		let token = sign_hmac_token(&claims("u1", unix_secs_now() + 60), &secret("s")).unwrap();
		assert!(matches!(verify_hmac_token(&token, &[secret("other")]), Err(AuthError::BadSignature)));

		let mut forged = token.clone();
		forged.push('A');
		assert!(verify_hmac_token(&forged, &[secret("s")]).is_err());

		let expired = sign_hmac_token(&claims("u1", 1), &secret("s")).unwrap();
		assert!(matches!(verify_hmac_token(&expired, &[secret("s")]), Err(AuthError::Expired)));

		assert!(matches!(verify_hmac_token("v2.a.b", &[secret("s")]), Err(AuthError::Malformed(_))));
	}

	#[tokio::test]
	async fn authenticate_checks_account_and_revocation() {
		let dir = directory();
		let auth = Authenticator::new(vec![secret("s")], dir.clone());
		let exp = unix_secs_now() + 60;

		let token = sign_hmac_token(&claims("u1", exp), &secret("s")).unwrap();
		let principal = auth.authenticate(&token).await.unwrap();
		assert_eq!(principal.display_name, "Prof. Silva");
		assert_eq!(principal.tenant_id.as_str(), "t1");

		let mut refresh = claims("u1", exp);
		refresh.typ = TokenKind::Refresh;
		let token = sign_hmac_token(&refresh, &secret("s")).unwrap();
		assert!(auth.authenticate(&token).await.is_ok());

		refresh.jti = None;
		let token = sign_hmac_token(&refresh, &secret("s")).unwrap();
		assert!(matches!(auth.authenticate(&token).await, Err(AuthError::Malformed(_))));

		let mut wrong_tenant = claims("u1", exp);
		wrong_tenant.tenant = "t2".to_string();
		let token = sign_hmac_token(&wrong_tenant, &secret("s")).unwrap();
		assert!(matches!(auth.authenticate(&token).await, Err(AuthError::AccountMismatch)));

		let token = sign_hmac_token(&claims("ghost", exp), &secret("s")).unwrap();
		assert!(matches!(auth.authenticate(&token).await, Err(AuthError::UnknownAccount)));

		dir.revoke_token("j1");
		let token = sign_hmac_token(&claims("u1", exp), &secret("s")).unwrap();
		assert!(matches!(auth.authenticate(&token).await, Err(AuthError::Revoked)));
	}

	#[tokio::test]
	async fn revalidate_sees_deactivation() {
		let dir = directory();
		let auth = Authenticator::new(vec![secret("s")], dir.clone());
		let mut c = claims("u1", unix_secs_now() + 60);
		c.jti = None;
		let principal = auth
			.authenticate(&sign_hmac_token(&c, &secret("s")).unwrap())
			.await
			.unwrap();
		auth.revalidate(&principal).await.unwrap();

		dir.set_account_active(&principal.user_id, false);
		assert!(matches!(auth.revalidate(&principal).await, Err(AuthError::AccountDisabled)));
	}

	#[test]
	fn credential_lookup_order() {
		let names = CredentialNames::default();

		let req = Request::builder()
			.uri("/chat?token=from-query")
			.header(COOKIE, "theme=dark; access_token=from-cookie")
			.header(AUTHORIZATION, "Bearer from-header")
			.body(())
			.unwrap();
		assert_eq!(
			credential_from_request(&req, &names),
			Some((CredentialSource::Cookie, "from-cookie".to_string()))
		);

		let req = Request::builder()
			.uri("/chat?a=1&token=from-query")
			.header(AUTHORIZATION, "Bearer from-header")
			.body(())
			.unwrap();
		assert_eq!(
			credential_from_request(&req, &names),
			Some((CredentialSource::Query, "from-query".to_string()))
		);

		let req = Request::builder()
			.uri("/chat")
			.header(AUTHORIZATION, "Bearer from-header")
			.body(())
			.unwrap();
		assert_eq!(
			credential_from_request(&req, &names),
			Some((CredentialSource::Header, "from-header".to_string()))
		);

		let req = Request::builder().uri("/chat").body(()).unwrap();
		assert_eq!(credential_from_request(&req, &names), None);
	}
}
