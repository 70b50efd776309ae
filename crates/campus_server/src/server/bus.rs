#![forbid(unsafe_code)]

//! Cross-node broadcast.
//!
//! Every publish goes through the shared bus when one is configured; each node (including the
//! publisher) dispatches what it receives to its local rooms. Without a bus, or when the bus is
//! unreachable, delivery falls back to this node's rooms only.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, anyhow};
use campus_domain::{NodeId, Topic, UserId};
use campus_protocol::ServerEvent;
use futures::StreamExt;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::server::room_hub::{MembershipCommand, RoomHub};

/// Message carried on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusEnvelope {
	pub origin: NodeId,
	pub topic: Topic,
	pub body: BusBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BusBody {
	Event { event: ServerEvent },
	/// Make every connection in `topic` join `room`.
	Join { room: Topic },
	/// Make every connection in `topic` leave `room`.
	Leave { room: Topic },
}

#[async_trait::async_trait]
pub trait Bus: Send + Sync {
	async fn publish(&self, envelope: &BusEnvelope) -> anyhow::Result<()>;

	/// Stream of every envelope published by any node, including this one.
	async fn subscribe(&self) -> anyhow::Result<mpsc::Receiver<BusEnvelope>>;

	fn name(&self) -> &'static str;
}

/// In-process bus. Clones share one channel, which lets tests run several nodes in one process.
#[derive(Clone)]
pub struct MemoryBus {
	tx: broadcast::Sender<BusEnvelope>,
	available: Arc<AtomicBool>,
}

impl Default for MemoryBus {
	fn default() -> Self {
		Self::new(1024)
	}
}

impl MemoryBus {
	pub fn new(capacity: usize) -> Self {
		let (tx, _rx) = broadcast::channel(capacity.max(1));
		Self {
			tx,
			available: Arc::new(AtomicBool::new(true)),
		}
	}

	/// Simulate an outage: publishes fail until set back to true.
	pub fn set_available(&self, available: bool) {
		self.available.store(available, Ordering::Relaxed);
	}
}

#[async_trait::async_trait]
impl Bus for MemoryBus {
	async fn publish(&self, envelope: &BusEnvelope) -> anyhow::Result<()> {
		if !self.available.load(Ordering::Relaxed) {
			return Err(anyhow!("memory bus unavailable"));
		}
		// No receivers is not an error: nobody is listening yet.
		let _ = self.tx.send(envelope.clone());
		Ok(())
	}

	async fn subscribe(&self) -> anyhow::Result<mpsc::Receiver<BusEnvelope>> {
		let mut rx = self.tx.subscribe();
		let (out_tx, out_rx) = mpsc::channel(1024);
		tokio::spawn(async move {
			loop {
				match rx.recv().await {
					Ok(env) => {
						if out_tx.send(env).await.is_err() {
							return;
						}
					}
					Err(broadcast::error::RecvError::Lagged(n)) => {
						warn!(skipped = n, "memory bus subscriber lagged");
					}
					Err(broadcast::error::RecvError::Closed) => return,
				}
			}
		});
		Ok(out_rx)
	}

	fn name(&self) -> &'static str {
		"memory"
	}
}

/// Redis pub/sub bus.
pub struct RedisBus {
	client: redis::Client,
	publisher: ConnectionManager,
	channel_prefix: String,
}

impl RedisBus {
	pub async fn connect(url: &str, channel_prefix: &str, connect_timeout: Duration) -> anyhow::Result<Self> {
		let client = redis::Client::open(url).context("open redis client")?;
		let publisher = tokio::time::timeout(connect_timeout, ConnectionManager::new(client.clone()))
			.await
			.map_err(|_| anyhow!("redis connect timed out after {connect_timeout:?}"))?
			.context("connect redis")?;

		Ok(Self {
			client,
			publisher,
			channel_prefix: channel_prefix.to_string(),
		})
	}

	/// Shared connection, also used by the Redis presence store.
	pub fn connection(&self) -> ConnectionManager {
		self.publisher.clone()
	}

	fn channel(&self, topic: &Topic) -> String {
		format!("{}{}", self.channel_prefix, topic)
	}
}

#[async_trait::async_trait]
impl Bus for RedisBus {
	async fn publish(&self, envelope: &BusEnvelope) -> anyhow::Result<()> {
		let payload = serde_json::to_string(envelope).context("encode bus envelope")?;
		let mut conn = self.publisher.clone();
		let _receivers: i64 = conn
			.publish(self.channel(&envelope.topic), payload)
			.await
			.context("redis publish")?;
		Ok(())
	}

	async fn subscribe(&self) -> anyhow::Result<mpsc::Receiver<BusEnvelope>> {
		let (tx, rx) = mpsc::channel(1024);
		let client = self.client.clone();
		let pattern = format!("{}*", self.channel_prefix);

		tokio::spawn(async move {
			let mut backoff = Duration::from_millis(250);
			loop {
				match client.get_async_pubsub().await {
					Ok(mut pubsub) => match pubsub.psubscribe(&pattern).await {
						Ok(()) => {
							info!(pattern = %pattern, "bus subscribed");
							backoff = Duration::from_millis(250);

							let mut stream = pubsub.into_on_message();
							while let Some(msg) = stream.next().await {
								let payload: String = match msg.get_payload() {
									Ok(p) => p,
									Err(e) => {
										warn!(error = %e, "bus payload not utf-8");
										continue;
									}
								};
								match serde_json::from_str::<BusEnvelope>(&payload) {
									Ok(env) => {
										if tx.send(env).await.is_err() {
											return;
										}
									}
									Err(e) => warn!(error = %e, "bus envelope rejected"),
								}
							}
							warn!("bus subscription ended; reconnecting");
						}
						Err(e) => warn!(error = %e, "bus psubscribe failed"),
					},
					Err(e) => warn!(error = %e, "bus subscriber connect failed"),
				}

				if tx.is_closed() {
					return;
				}
				tokio::time::sleep(backoff).await;
				backoff = (backoff * 2).min(Duration::from_secs(10));
			}
		});

		Ok(rx)
	}

	fn name(&self) -> &'static str {
		"redis"
	}
}

/// Publishes to topics and keeps the local room hub fed from the bus.
#[derive(Clone)]
pub struct BroadcastAdapter {
	node_id: NodeId,
	hub: RoomHub,
	bus: Option<Arc<dyn Bus>>,
	degraded: Arc<AtomicBool>,
}

impl BroadcastAdapter {
	/// Single-node adapter: every publish is dispatched locally.
	pub fn local(node_id: NodeId, hub: RoomHub) -> Self {
		Self {
			node_id,
			hub,
			bus: None,
			degraded: Arc::new(AtomicBool::new(false)),
		}
	}

	/// Subscribe to the bus and start feeding received envelopes to the local hub.
	pub async fn with_bus(node_id: NodeId, hub: RoomHub, bus: Arc<dyn Bus>) -> anyhow::Result<Self> {
		let mut rx = bus.subscribe().await.with_context(|| format!("subscribe to {} bus", bus.name()))?;

		let listener_hub = hub.clone();
		let listener_node = node_id.clone();
		tokio::spawn(async move {
			while let Some(env) = rx.recv().await {
				dispatch_local(&listener_hub, env).await;
			}
			warn!(node = %listener_node, "bus listener stopped");
		});

		info!(node = %node_id, bus = bus.name(), "broadcast adapter using shared bus");
		Ok(Self {
			node_id,
			hub,
			bus: Some(bus),
			degraded: Arc::new(AtomicBool::new(false)),
		})
	}

	pub fn node_id(&self) -> &NodeId {
		&self.node_id
	}

	pub fn hub(&self) -> &RoomHub {
		&self.hub
	}

	pub fn is_distributed(&self) -> bool {
		self.bus.is_some()
	}

	/// Whether the last bus publish failed.
	pub fn is_degraded(&self) -> bool {
		self.degraded.load(Ordering::Relaxed)
	}

	/// Deliver an event to every connection in `topic`, on every node. Never fails; bus errors
	/// degrade to local delivery.
	pub async fn publish(&self, topic: Topic, event: ServerEvent) {
		self.send(BusEnvelope {
			origin: self.node_id.clone(),
			topic,
			body: BusBody::Event { event },
		})
		.await;
	}

	/// Join (or leave) `room` on every connection of `user`, on every node.
	pub async fn publish_membership(&self, user: &UserId, cmd: MembershipCommand) {
		let body = match cmd {
			MembershipCommand::Join(room) => BusBody::Join { room },
			MembershipCommand::Leave(room) => BusBody::Leave { room },
		};
		self.send(BusEnvelope {
			origin: self.node_id.clone(),
			topic: Topic::User(user.clone()),
			body,
		})
		.await;
	}

	async fn send(&self, env: BusEnvelope) {
		let Some(bus) = self.bus.as_ref() else {
			dispatch_local(&self.hub, env).await;
			return;
		};

		match bus.publish(&env).await {
			Ok(()) => {
				if self.degraded.swap(false, Ordering::Relaxed) {
					info!(node = %self.node_id, "bus publish recovered");
				}
			}
			Err(e) => {
				metrics::counter!("campus_bus_degraded_total").increment(1);
				if !self.degraded.swap(true, Ordering::Relaxed) {
					warn!(node = %self.node_id, error = %e, "bus publish failed; delivering to local rooms only");
				}
				dispatch_local(&self.hub, env).await;
			}
		}
	}
}

async fn dispatch_local(hub: &RoomHub, env: BusEnvelope) {
	match env.body {
		BusBody::Event { event } => {
			let name = event.name();
			let stats = hub.dispatch(&env.topic, Arc::new(event)).await;
			debug!(
				origin = %env.origin,
				topic = %env.topic,
				event = name,
				delivered = stats.delivered,
				"bus dispatch"
			);
		}
		BusBody::Join { room } => {
			hub.apply_membership(&env.topic, &MembershipCommand::Join(room)).await;
		}
		BusBody::Leave { room } => {
			hub.apply_membership(&env.topic, &MembershipCommand::Leave(room)).await;
		}
	}
}
