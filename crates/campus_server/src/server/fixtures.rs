#![forbid(unsafe_code)]

//! Shared setup for the server tests: one in-memory world that several nodes can join.

use std::sync::Arc;
use std::time::Duration;

use campus_domain::models::{Account, StudentRef};
use campus_domain::{CourseId, NodeId, Role, SecretString, StudentId, TenantId, UserId};
use campus_protocol::ServerEvent;

use crate::server::auth::{AuthClaims, Principal, TokenKind, sign_hmac_token};
use crate::server::bus::{BroadcastAdapter, MemoryBus};
use crate::server::directory::MemoryDirectory;
use crate::server::presence::InMemoryPresenceStore;
use crate::server::room_hub::{OutboundReceiver, RoomHub, RoomHubConfig, RoomHubItem};
use crate::server::state::{Backends, ConnectionSettings, ServerContext};
use crate::server::store::MemoryStore;

pub const SECRET: &str = "fixture-secret";

pub fn tenant() -> TenantId {
	TenantId::new("school-1").unwrap()
}

pub fn uid(s: &str) -> UserId {
	UserId::new(s).unwrap()
}

pub fn sid(s: &str) -> StudentId {
	StudentId::new(s).unwrap()
}

pub fn cid(s: &str) -> CourseId {
	CourseId::new(s).unwrap()
}

/// Directory, stores and bus shared by every node created from it.
pub struct World {
	pub directory: Arc<MemoryDirectory>,
	pub store: Arc<MemoryStore>,
	pub presence: Arc<InMemoryPresenceStore>,
	pub bus: MemoryBus,
}

impl World {
	pub fn new() -> Self {
		Self {
			directory: Arc::new(MemoryDirectory::new()),
			store: Arc::new(MemoryStore::new()),
			presence: Arc::new(InMemoryPresenceStore::new()),
			bus: MemoryBus::new(4096),
		}
	}

	fn backends(&self) -> Backends {
		Backends {
			directory: self.directory.clone(),
			notifications: self.store.clone(),
			conversations: self.store.clone(),
			presence: self.presence.clone(),
		}
	}

	/// A node attached to the shared bus.
	pub async fn node(&self, name: &str) -> ServerContext {
		self.node_with_queue(name, 256).await
	}

	pub async fn node_with_queue(&self, name: &str, queue: usize) -> ServerContext {
		let hub = RoomHub::new(RoomHubConfig {
			subscriber_queue_capacity: queue,
			debug_logs: false,
		});
		let broadcaster = BroadcastAdapter::with_bus(NodeId::new(name).unwrap(), hub, Arc::new(self.bus.clone()))
			.await
			.unwrap();
		ServerContext::assemble(
			vec![SecretString::new(SECRET)],
			self.backends(),
			broadcaster,
			ConnectionSettings::default(),
		)
	}

	pub fn account(&self, id: &str, role: Role, name: &str) -> UserId {
		self.account_in(id, &tenant(), role, name)
	}

	pub fn account_in(&self, id: &str, tenant: &TenantId, role: Role, name: &str) -> UserId {
		let user = uid(id);
		self.directory.upsert_account(Account {
			id: user.clone(),
			tenant_id: tenant.clone(),
			role,
			display_name: name.to_string(),
			active: true,
			deleted: false,
		});
		user
	}

	/// A student record with a login account, linked to the given guardians.
	pub fn student(&self, id: &str, name: &str, guardians: &[&UserId]) -> StudentRef {
		let student = sid(id);
		let login = self.account(&format!("{id}-login"), Role::Student, name);
		self.directory.link_student_account(student.clone(), login);
		for g in guardians {
			self.directory.link_guardian(student.clone(), (*g).clone());
		}
		StudentRef::new(student, name)
	}

	pub fn principal(&self, user: &UserId) -> Principal {
		let account = self
			.directory
			.account_snapshot(user)
			.expect("fixture account exists");
		Principal {
			user_id: account.id,
			role: account.role,
			tenant_id: account.tenant_id,
			display_name: account.display_name,
			expires_at: campus_util::time::unix_secs_now() + 3600,
		}
	}

	pub fn token(&self, user: &UserId) -> String {
		let p = self.principal(user);
		sign_hmac_token(
			&AuthClaims {
				sub: p.user_id.to_string(),
				role: p.role,
				tenant: p.tenant_id.to_string(),
				exp: p.expires_at,
				typ: TokenKind::Access,
				jti: None,
			},
			&SecretString::new(SECRET),
		)
		.unwrap()
	}
}

/// Next event on an outbound stream, skipping lag markers and presence announcements.
pub async fn next_event(rx: &mut OutboundReceiver) -> Option<ServerEvent> {
	loop {
		match tokio::time::timeout(Duration::from_millis(500), rx.recv()).await {
			Ok(Some(RoomHubItem::Event(ev))) => match *ev {
				ServerEvent::UserOnline(_) | ServerEvent::UserOffline(_) => continue,
				_ => return Some((*ev).clone()),
			},
			Ok(Some(RoomHubItem::Lagged { .. })) => continue,
			Ok(None) | Err(_) => return None,
		}
	}
}

/// Everything that arrives within a short quiet period.
pub async fn drain(rx: &mut OutboundReceiver) -> Vec<RoomHubItem> {
	let mut out = Vec::new();
	while let Ok(Some(item)) = tokio::time::timeout(Duration::from_millis(150), rx.recv()).await {
		out.push(item);
	}
	out
}

pub fn events(items: &[RoomHubItem]) -> Vec<ServerEvent> {
	items
		.iter()
		.filter_map(|i| match i {
			RoomHubItem::Event(ev) => Some((**ev).clone()),
			RoomHubItem::Lagged { .. } => None,
		})
		.collect()
}
