#![forbid(unsafe_code)]

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use anyhow::Context;
use campus_domain::{ConnectionId, NodeId, Role, TenantId, Topic, UserId};
use campus_protocol::{GatewayKind, ServerEvent, UserPresencePayload};
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::server::bus::BroadcastAdapter;

/// One live connection as recorded in the presence store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
	pub connection_id: ConnectionId,
	pub user_id: UserId,
	pub role: Role,
	pub tenant_id: TenantId,
	pub node_id: NodeId,
	pub gateway: GatewayKind,
	pub connected_at_ms: i64,
}

/// Shared per-user connection sets. Every mutation is atomic per user.
#[async_trait::async_trait]
pub trait PresenceStore: Send + Sync {
	/// Add a connection. Returns the user's connection count afterwards.
	async fn add(&self, record: &PresenceRecord) -> anyhow::Result<usize>;

	/// Remove a connection. Returns the user's remaining connection count.
	async fn remove(&self, record: &PresenceRecord) -> anyhow::Result<usize>;

	async fn connections(&self, user: &UserId) -> anyhow::Result<Vec<PresenceRecord>>;

	/// Every live connection record.
	async fn all(&self) -> anyhow::Result<Vec<PresenceRecord>>;

	/// Drop every record owned by `node`. Returns the removed records.
	async fn purge_node(&self, node: &NodeId) -> anyhow::Result<Vec<PresenceRecord>>;
}

/// Process-local presence, safe to share between several simulated nodes.
#[derive(Default)]
pub struct InMemoryPresenceStore {
	users: DashMap<UserId, HashMap<ConnectionId, PresenceRecord>>,
}

impl InMemoryPresenceStore {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait::async_trait]
impl PresenceStore for InMemoryPresenceStore {
	async fn add(&self, record: &PresenceRecord) -> anyhow::Result<usize> {
		let mut conns = self.users.entry(record.user_id.clone()).or_default();
		conns.insert(record.connection_id, record.clone());
		Ok(conns.len())
	}

	async fn remove(&self, record: &PresenceRecord) -> anyhow::Result<usize> {
		let remaining = match self.users.get_mut(&record.user_id) {
			Some(mut conns) => {
				conns.remove(&record.connection_id);
				conns.len()
			}
			None => return Ok(0),
		};
		if remaining == 0 {
			self.users.remove_if(&record.user_id, |_, conns| conns.is_empty());
		}
		Ok(remaining)
	}

	async fn connections(&self, user: &UserId) -> anyhow::Result<Vec<PresenceRecord>> {
		Ok(self
			.users
			.get(user)
			.map(|conns| conns.values().cloned().collect())
			.unwrap_or_default())
	}

	async fn all(&self) -> anyhow::Result<Vec<PresenceRecord>> {
		Ok(self
			.users
			.iter()
			.flat_map(|entry| entry.value().values().cloned().collect::<Vec<_>>())
			.collect())
	}

	async fn purge_node(&self, node: &NodeId) -> anyhow::Result<Vec<PresenceRecord>> {
		let stale = self
			.all()
			.await?
			.into_iter()
			.filter(|r| &r.node_id == node)
			.collect::<Vec<_>>();
		for record in &stale {
			self.remove(record).await?;
		}
		Ok(stale)
	}
}

const ADD_SCRIPT: &str = r"
redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
redis.call('SADD', KEYS[2], ARGV[3])
redis.call('SADD', KEYS[3], ARGV[3] .. '|' .. ARGV[1])
return redis.call('HLEN', KEYS[1])
";

const REMOVE_SCRIPT: &str = r"
redis.call('HDEL', KEYS[1], ARGV[1])
redis.call('SREM', KEYS[3], ARGV[2] .. '|' .. ARGV[1])
local n = redis.call('HLEN', KEYS[1])
if n == 0 then
	redis.call('SREM', KEYS[2], ARGV[2])
end
return n
";

/// Redis presence: a hash per user (connection id -> record), a set of online users, and a set of
/// `user|connection` members per node for startup cleanup. Mutations run as Lua scripts.
pub struct RedisPresenceStore {
	conn: ConnectionManager,
	prefix: String,
}

impl RedisPresenceStore {
	pub fn new(conn: ConnectionManager, prefix: &str) -> Self {
		Self {
			conn,
			prefix: prefix.to_string(),
		}
	}

	fn user_key(&self, user: &UserId) -> String {
		format!("{}presence:user:{}", self.prefix, user)
	}

	fn online_key(&self) -> String {
		format!("{}presence:online", self.prefix)
	}

	fn node_key(&self, node: &NodeId) -> String {
		format!("{}presence:node:{}", self.prefix, node)
	}

	async fn records_for(&self, user: &UserId) -> anyhow::Result<Vec<PresenceRecord>> {
		let mut conn = self.conn.clone();
		let raw: Vec<String> = redis::cmd("HVALS")
			.arg(self.user_key(user))
			.query_async(&mut conn)
			.await
			.context("redis HVALS presence")?;
		raw.iter()
			.map(|s| serde_json::from_str(s).context("decode presence record"))
			.collect()
	}
}

#[async_trait::async_trait]
impl PresenceStore for RedisPresenceStore {
	async fn add(&self, record: &PresenceRecord) -> anyhow::Result<usize> {
		let mut conn = self.conn.clone();
		let json = serde_json::to_string(record).context("encode presence record")?;
		let n: i64 = redis::Script::new(ADD_SCRIPT)
			.key(self.user_key(&record.user_id))
			.key(self.online_key())
			.key(self.node_key(&record.node_id))
			.arg(record.connection_id.to_string())
			.arg(json)
			.arg(record.user_id.as_str())
			.invoke_async(&mut conn)
			.await
			.context("redis presence add")?;
		Ok(n.max(0) as usize)
	}

	async fn remove(&self, record: &PresenceRecord) -> anyhow::Result<usize> {
		let mut conn = self.conn.clone();
		let n: i64 = redis::Script::new(REMOVE_SCRIPT)
			.key(self.user_key(&record.user_id))
			.key(self.online_key())
			.key(self.node_key(&record.node_id))
			.arg(record.connection_id.to_string())
			.arg(record.user_id.as_str())
			.invoke_async(&mut conn)
			.await
			.context("redis presence remove")?;
		Ok(n.max(0) as usize)
	}

	async fn connections(&self, user: &UserId) -> anyhow::Result<Vec<PresenceRecord>> {
		self.records_for(user).await
	}

	async fn all(&self) -> anyhow::Result<Vec<PresenceRecord>> {
		let mut conn = self.conn.clone();
		let users: Vec<String> = redis::cmd("SMEMBERS")
			.arg(self.online_key())
			.query_async(&mut conn)
			.await
			.context("redis SMEMBERS online")?;

		let mut out = Vec::new();
		for user in users {
			let Ok(user) = UserId::new(user) else {
				continue;
			};
			out.extend(self.records_for(&user).await?);
		}
		Ok(out)
	}

	async fn purge_node(&self, node: &NodeId) -> anyhow::Result<Vec<PresenceRecord>> {
		let mut conn = self.conn.clone();
		let members: Vec<String> = redis::cmd("SMEMBERS")
			.arg(self.node_key(node))
			.query_async(&mut conn)
			.await
			.context("redis SMEMBERS node")?;

		let mut removed = Vec::new();
		for member in members {
			let Some((user, conn_id)) = member.rsplit_once('|') else {
				continue;
			};
			let Ok(user) = UserId::new(user) else {
				continue;
			};
			let Some(record) = self
				.records_for(&user)
				.await?
				.into_iter()
				.find(|r| r.connection_id.to_string() == conn_id)
			else {
				continue;
			};
			self.remove(&record).await?;
			removed.push(record);
		}
		Ok(removed)
	}
}

/// Which online users to list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceFilter {
	pub tenant: Option<TenantId>,
	pub role: Option<Role>,
}

impl PresenceFilter {
	fn matches(&self, r: &PresenceRecord) -> bool {
		self.tenant.as_ref().is_none_or(|t| t == &r.tenant_id) && self.role.is_none_or(|role| role == r.role)
	}
}

/// Announcements waiting for the publisher task.
const ANNOUNCE_QUEUE: usize = 4096;

/// Presence plus online/offline announcements.
///
/// Announcements go through one publisher task, so they leave this node in the order the
/// transitions happened here.
pub struct PresenceRegistry {
	store: Arc<dyn PresenceStore>,
	announcements: mpsc::Sender<(Topic, ServerEvent)>,
}

impl PresenceRegistry {
	pub fn new(store: Arc<dyn PresenceStore>, broadcaster: BroadcastAdapter) -> Self {
		let (announcements, mut rx) = mpsc::channel::<(Topic, ServerEvent)>(ANNOUNCE_QUEUE);
		tokio::spawn(async move {
			while let Some((topic, event)) = rx.recv().await {
				broadcaster.publish(topic, event).await;
			}
		});
		Self { store, announcements }
	}

	/// Record a connection. The first connection of a user announces `user:online` to the tenant.
	pub async fn register(&self, record: &PresenceRecord) -> anyhow::Result<usize> {
		let count = self.store.add(record).await?;
		debug!(user = %record.user_id, conn = %record.connection_id, count, "presence: registered");
		if count == 1 {
			self.announce(
				record,
				ServerEvent::UserOnline(UserPresencePayload {
					user_id: record.user_id.clone(),
				}),
			);
		}
		Ok(count)
	}

	/// Remove a connection. The last connection of a user announces `user:offline`.
	pub async fn unregister(&self, record: &PresenceRecord) -> anyhow::Result<usize> {
		let remaining = self.store.remove(record).await?;
		debug!(user = %record.user_id, conn = %record.connection_id, remaining, "presence: unregistered");
		if remaining == 0 {
			self.announce(
				record,
				ServerEvent::UserOffline(UserPresencePayload {
					user_id: record.user_id.clone(),
				}),
			);
		}
		Ok(remaining)
	}

	pub async fn is_online(&self, user: &UserId) -> anyhow::Result<bool> {
		Ok(!self.store.connections(user).await?.is_empty())
	}

	/// Whether the user has at least one connection open on `gateway`, on any node.
	pub async fn is_connected_on(&self, user: &UserId, gateway: GatewayKind) -> anyhow::Result<bool> {
		Ok(self
			.store
			.connections(user)
			.await?
			.iter()
			.any(|r| r.gateway == gateway))
	}

	pub async fn connections(&self, user: &UserId) -> anyhow::Result<Vec<PresenceRecord>> {
		self.store.connections(user).await
	}

	/// Online users matching `filter`, sorted.
	pub async fn list_online(&self, filter: &PresenceFilter) -> anyhow::Result<Vec<UserId>> {
		let users = self
			.store
			.all()
			.await?
			.into_iter()
			.filter(|r| filter.matches(r))
			.map(|r| r.user_id)
			.collect::<BTreeSet<_>>();
		Ok(users.into_iter().collect())
	}

	/// Remove records left behind by an earlier run of `node`.
	pub async fn purge_node(&self, node: &NodeId) -> anyhow::Result<usize> {
		let removed = self.store.purge_node(node).await?;
		if !removed.is_empty() {
			info!(node = %node, removed = removed.len(), "presence: purged stale connections");
		}
		Ok(removed.len())
	}

	/// Best-effort, off the admission path.
	fn announce(&self, record: &PresenceRecord, event: ServerEvent) {
		let topic = Topic::Tenant(record.tenant_id.clone());
		if let Err(e) = self.announcements.try_send((topic, event)) {
			metrics::counter!("campus_presence_announce_dropped_total").increment(1);
			warn!(user = %record.user_id, error = %e, "presence announcement dropped");
		}
	}
}
