#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use campus_domain::{ConnectionId, Topic};
use campus_protocol::{ConversationRef, GatewayKind, ServerEvent};
use tokio::sync::{Mutex, Notify};
use tracing::debug;

/// Node-local room registry. Maps topics to the connections attached to this process and fans
/// events out to their outbound queues.
#[derive(Debug, Clone)]
pub struct RoomHub {
	inner: Arc<Mutex<Inner>>,
	cfg: RoomHubConfig,
}

/// Configuration for `RoomHub`.
#[derive(Debug, Clone)]
pub struct RoomHubConfig {
	/// Maximum number of queued items per connection.
	pub subscriber_queue_capacity: usize,

	pub debug_logs: bool,
}

impl Default for RoomHubConfig {
	fn default() -> Self {
		Self {
			subscriber_queue_capacity: 256,
			debug_logs: false,
		}
	}
}

/// Items emitted on a connection's outbound stream.
#[derive(Debug, Clone)]
pub enum RoomHubItem {
	Event(Arc<ServerEvent>),

	/// Durable events were dropped because the queue was full.
	Lagged {
		dropped: u64,
	},
}

impl RoomHubItem {
	fn is_ephemeral(&self) -> bool {
		matches!(self, RoomHubItem::Event(ev) if ev.is_ephemeral())
	}
}

/// Membership change applied to every connection of a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipCommand {
	Join(Topic),
	Leave(Topic),
}

/// Outcome of a local dispatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
	pub delivered: usize,
	pub dropped: usize,
}

impl RoomHub {
	pub fn new(cfg: RoomHubConfig) -> Self {
		Self {
			inner: Arc::new(Mutex::new(Inner::default())),
			cfg,
		}
	}

	/// Register a connection and return its outbound stream.
	pub async fn attach(&self, conn: ConnectionId, gateway: GatewayKind) -> OutboundReceiver {
		let queue = Arc::new(Outbound::new(self.cfg.subscriber_queue_capacity.max(1)));

		let mut inner = self.inner.lock().await;
		if let Some(previous) = inner.connections.insert(
			conn,
			Subscriber {
				queue: queue.clone(),
				gateway,
				topics: HashSet::new(),
			},
		) {
			previous.queue.close();
		}

		if self.cfg.debug_logs {
			debug!(conn = %conn, gateway = %gateway, "room hub: attached");
		}

		OutboundReceiver { queue }
	}

	/// Remove a connection from every room. Returns the topics it was in.
	pub async fn detach(&self, conn: ConnectionId) -> Vec<Topic> {
		let mut inner = self.inner.lock().await;
		let Some(sub) = inner.connections.remove(&conn) else {
			return Vec::new();
		};
		sub.queue.close();

		let topics = sub.topics.into_iter().collect::<Vec<_>>();
		for topic in &topics {
			inner.remove_member(topic, conn);
		}

		if self.cfg.debug_logs {
			debug!(conn = %conn, rooms = topics.len(), "room hub: detached");
		}
		topics
	}

	/// Add a connection to a room. Returns false when the connection is unknown or already a member.
	pub async fn join(&self, conn: ConnectionId, topic: Topic) -> bool {
		let mut guard = self.inner.lock().await;
		let inner = &mut *guard;
		let Some(sub) = inner.connections.get_mut(&conn) else {
			return false;
		};
		if !sub.topics.insert(topic.clone()) {
			return false;
		}
		inner.rooms.entry(topic).or_default().insert(conn);
		true
	}

	/// Remove a connection from a room. Returns whether it was a member.
	pub async fn leave(&self, conn: ConnectionId, topic: &Topic) -> bool {
		let mut inner = self.inner.lock().await;
		let removed = inner
			.connections
			.get_mut(&conn)
			.is_some_and(|sub| sub.topics.remove(topic));
		if removed {
			inner.remove_member(topic, conn);
		}
		removed
	}

	pub async fn is_member(&self, conn: ConnectionId, topic: &Topic) -> bool {
		let inner = self.inner.lock().await;
		inner.rooms.get(topic).is_some_and(|members| members.contains(&conn))
	}

	pub async fn topics_for(&self, conn: ConnectionId) -> HashSet<Topic> {
		let inner = self.inner.lock().await;
		inner
			.connections
			.get(&conn)
			.map(|s| s.topics.clone())
			.unwrap_or_default()
	}

	/// Deliver an event to every local member of `topic`.
	///
	/// A full queue first gives up its oldest ephemeral item. When none is left, an incoming
	/// ephemeral event is dropped, and an incoming durable one is counted and reported to the
	/// connection with a `Lagged` marker once it has room again.
	pub async fn dispatch(&self, topic: &Topic, event: Arc<ServerEvent>) -> DispatchStats {
		let mut inner = self.inner.lock().await;
		let Some(members) = inner.rooms.get(topic) else {
			return DispatchStats::default();
		};
		let members = members.iter().copied().collect::<Vec<_>>();

		let ephemeral = event.is_ephemeral();
		let mut stats = DispatchStats::default();
		let mut closed = Vec::new();

		for conn in members {
			let Some(sub) = inner.connections.get(&conn) else {
				continue;
			};

			match sub.queue.push(RoomHubItem::Event(event.clone())) {
				Push::Queued => stats.delivered += 1,
				Push::Evicted => {
					stats.delivered += 1;
					stats.dropped += 1;
					metrics::counter!("campus_outbound_dropped_total", "kind" => "ephemeral").increment(1);
				}
				Push::Dropped => {
					stats.dropped += 1;
					let kind = if ephemeral { "ephemeral" } else { "durable" };
					metrics::counter!("campus_outbound_dropped_total", "kind" => kind).increment(1);
				}
				Push::Closed => closed.push(conn),
			}
		}

		for conn in closed {
			if let Some(sub) = inner.connections.remove(&conn) {
				sub.queue.close();
				for topic in sub.topics {
					inner.remove_member(&topic, conn);
				}
			}
		}

		if self.cfg.debug_logs && stats.dropped > 0 {
			debug!(
				topic = %topic,
				dropped = stats.dropped,
				"room hub: dropped due to full subscriber queues"
			);
		}

		stats
	}

	/// Apply a membership command to every local connection in `target` (a personal topic).
	///
	/// Conversation membership only applies to chat connections. Affected connections are told
	/// with `conversation:joined` / `conversation:left`. Returns how many connections changed.
	pub async fn apply_membership(&self, target: &Topic, cmd: &MembershipCommand) -> usize {
		let mut guard = self.inner.lock().await;
		let inner = &mut *guard;
		let Some(members) = inner.rooms.get(target) else {
			return 0;
		};
		let members = members.iter().copied().collect::<Vec<_>>();

		let mut changed = 0usize;
		for conn in members {
			let Some(sub) = inner.connections.get_mut(&conn) else {
				continue;
			};

			let (topic, joined) = match cmd {
				MembershipCommand::Join(t) => (t, true),
				MembershipCommand::Leave(t) => (t, false),
			};
			if topic.is_conversation() && sub.gateway != GatewayKind::Chat {
				continue;
			}

			let did = if joined {
				sub.topics.insert(topic.clone())
			} else {
				sub.topics.remove(topic)
			};
			if !did {
				continue;
			}
			changed += 1;

			if let Topic::Conversation(id) = topic {
				let notice = ConversationRef {
					conversation_id: id.clone(),
				};
				let ev = if joined {
					ServerEvent::ConversationJoined(notice)
				} else {
					ServerEvent::ConversationLeft(notice)
				};
				sub.queue.push(RoomHubItem::Event(Arc::new(ev)));
			}

			if joined {
				inner.rooms.entry(topic.clone()).or_default().insert(conn);
			} else {
				inner.remove_member(topic, conn);
			}
		}

		changed
	}

	/// Get a snapshot of local member counts per room.
	pub async fn room_subscriber_counts(&self) -> HashMap<Topic, usize> {
		let inner = self.inner.lock().await;
		inner.rooms.iter().map(|(k, v)| (k.clone(), v.len())).collect()
	}

	pub async fn connection_count(&self) -> usize {
		self.inner.lock().await.connections.len()
	}
}

#[derive(Debug, Default)]
struct Inner {
	connections: HashMap<ConnectionId, Subscriber>,
	rooms: HashMap<Topic, HashSet<ConnectionId>>,
}

impl Inner {
	fn remove_member(&mut self, topic: &Topic, conn: ConnectionId) {
		if let Some(members) = self.rooms.get_mut(topic) {
			members.remove(&conn);
			if members.is_empty() {
				self.rooms.remove(topic);
			}
		}
	}
}

#[derive(Debug)]
struct Subscriber {
	queue: Arc<Outbound>,
	gateway: GatewayKind,
	topics: HashSet<Topic>,
}

/// What happened to an item offered to a connection's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Push {
	Queued,
	/// Queued after evicting the oldest ephemeral item.
	Evicted,
	/// Not queued. Durable drops are remembered for the next `Lagged` marker.
	Dropped,
	/// The receiver is gone.
	Closed,
}

/// Bounded per-connection queue shared by the hub (producer) and the connection task (consumer).
#[derive(Debug)]
struct Outbound {
	state: parking_lot::Mutex<OutboundState>,
	notify: Notify,
	capacity: usize,
}

#[derive(Debug, Default)]
struct OutboundState {
	items: VecDeque<RoomHubItem>,
	/// Durable items dropped since the last marker.
	lagged: u64,
	receiver_dropped: bool,
	/// Detached from the hub; nothing more will be pushed.
	closed: bool,
}

impl Outbound {
	fn new(capacity: usize) -> Self {
		Self {
			state: parking_lot::Mutex::new(OutboundState::default()),
			notify: Notify::new(),
			capacity,
		}
	}

	fn push(&self, item: RoomHubItem) -> Push {
		let mut state = self.state.lock();
		if state.receiver_dropped {
			return Push::Closed;
		}
		if state.closed {
			return Push::Dropped;
		}

		let mut outcome = Push::Queued;
		if state.items.len() >= self.capacity {
			match state.items.iter().position(RoomHubItem::is_ephemeral) {
				Some(oldest) => {
					state.items.remove(oldest);
					outcome = Push::Evicted;
				}
				None if item.is_ephemeral() => return Push::Dropped,
				None => {
					state.lagged += 1;
					return Push::Dropped;
				}
			}
		}
		state.items.push_back(item);
		drop(state);

		self.notify.notify_one();
		outcome
	}

	fn close(&self) {
		self.state.lock().closed = true;
		self.notify.notify_one();
	}
}

/// Receiving half of a connection's outbound queue.
#[derive(Debug)]
pub struct OutboundReceiver {
	queue: Arc<Outbound>,
}

impl OutboundReceiver {
	/// Next item, or `None` once the connection was detached and the queue is drained.
	///
	/// Cancel safe: an item is only taken out of the queue when it is returned.
	pub async fn recv(&mut self) -> Option<RoomHubItem> {
		loop {
			{
				let mut state = self.queue.state.lock();
				if let Some(item) = state.items.pop_front() {
					// The pop freed a slot for the marker.
					if state.lagged > 0 {
						let dropped = std::mem::take(&mut state.lagged);
						state.items.push_back(RoomHubItem::Lagged { dropped });
					}
					return Some(item);
				}
				if state.closed {
					return None;
				}
			}
			self.queue.notify.notified().await;
		}
	}
}

impl Drop for OutboundReceiver {
	fn drop(&mut self) {
		self.queue.state.lock().receiver_dropped = true;
	}
}
