#![forbid(unsafe_code)]

use std::time::Duration;

use campus_domain::{ConnectionId, ConversationId, NodeId, Topic};
use campus_protocol::{GatewayKind, ServerEvent};
use tokio::time::timeout;

use crate::server::bus::{BroadcastAdapter, BusBody, BusEnvelope};
use crate::server::fixtures::{World, drain, events, next_event, tenant, uid};
use crate::server::room_hub::{MembershipCommand, RoomHub, RoomHubConfig};

fn conv(id: &str) -> Topic {
	Topic::Conversation(ConversationId::new(id).unwrap())
}

#[tokio::test]
async fn publish_on_one_node_reaches_connections_on_another() {
	let world = World::new();
	let a = world.node("node-a").await;
	let b = world.node("node-b").await;

	let conn = ConnectionId::new_v4();
	let mut rx = b.broadcaster.hub().attach(conn, GatewayKind::Notifications).await;
	b.broadcaster.hub().join(conn, Topic::User(uid("u1"))).await;

	a.broadcaster
		.publish(Topic::User(uid("u1")), ServerEvent::unread_count(7))
		.await;

	let ev = next_event(&mut rx).await.expect("event from the other node");
	assert_eq!(ev, ServerEvent::unread_count(7));
	assert!(!a.broadcaster.is_degraded());
}

#[tokio::test]
async fn publisher_node_receives_its_own_publish_once() {
	let world = World::new();
	let a = world.node("node-a").await;

	let conn = ConnectionId::new_v4();
	let mut rx = a.broadcaster.hub().attach(conn, GatewayKind::Notifications).await;
	a.broadcaster.hub().join(conn, Topic::User(uid("u1"))).await;

	a.broadcaster
		.publish(Topic::User(uid("u1")), ServerEvent::unread_count(1))
		.await;

	let got = events(&drain(&mut rx).await);
	assert_eq!(got, vec![ServerEvent::unread_count(1)]);
}

#[tokio::test]
async fn bus_outage_degrades_to_local_delivery() {
	let world = World::new();
	let a = world.node("node-a").await;
	let b = world.node("node-b").await;

	let local = ConnectionId::new_v4();
	let remote = ConnectionId::new_v4();
	let mut rx_local = a.broadcaster.hub().attach(local, GatewayKind::Notifications).await;
	let mut rx_remote = b.broadcaster.hub().attach(remote, GatewayKind::Notifications).await;
	a.broadcaster.hub().join(local, Topic::User(uid("u1"))).await;
	b.broadcaster.hub().join(remote, Topic::User(uid("u1"))).await;

	world.bus.set_available(false);
	a.broadcaster
		.publish(Topic::User(uid("u1")), ServerEvent::unread_count(2))
		.await;

	assert!(a.broadcaster.is_degraded());
	assert_eq!(next_event(&mut rx_local).await, Some(ServerEvent::unread_count(2)));
	assert!(drain(&mut rx_remote).await.is_empty(), "remote node must not see a publish that never hit the bus");

	world.bus.set_available(true);
	a.broadcaster
		.publish(Topic::User(uid("u1")), ServerEvent::unread_count(3))
		.await;
	assert!(!a.broadcaster.is_degraded(), "a successful publish clears the degraded flag");
	assert_eq!(next_event(&mut rx_remote).await, Some(ServerEvent::unread_count(3)));
}

#[tokio::test]
async fn membership_commands_propagate_across_nodes() {
	let world = World::new();
	let a = world.node("node-a").await;
	let b = world.node("node-b").await;

	let conn = ConnectionId::new_v4();
	let hub_b = b.broadcaster.hub();
	let mut rx = hub_b.attach(conn, GatewayKind::Chat).await;
	hub_b.join(conn, Topic::User(uid("parent-1"))).await;

	a.broadcaster
		.publish_membership(&uid("parent-1"), MembershipCommand::Join(conv("c1")))
		.await;

	let ev = next_event(&mut rx).await.expect("joined notice");
	assert_eq!(ev.name(), "conversation:joined");
	assert!(hub_b.is_member(conn, &conv("c1")).await);

	a.broadcaster
		.publish_membership(&uid("parent-1"), MembershipCommand::Leave(conv("c1")))
		.await;
	let ev = next_event(&mut rx).await.expect("left notice");
	assert_eq!(ev.name(), "conversation:left");
	assert!(!hub_b.is_member(conn, &conv("c1")).await);
}

#[tokio::test]
async fn local_adapter_dispatches_without_a_bus() {
	let hub = RoomHub::new(RoomHubConfig::default());
	let adapter = BroadcastAdapter::local(NodeId::new("solo").unwrap(), hub.clone());
	assert!(!adapter.is_distributed());

	let conn = ConnectionId::new_v4();
	let mut rx = hub.attach(conn, GatewayKind::Notifications).await;
	hub.join(conn, Topic::User(uid("u1"))).await;

	adapter
		.publish(Topic::User(uid("u1")), ServerEvent::unread_count(4))
		.await;
	assert_eq!(next_event(&mut rx).await, Some(ServerEvent::unread_count(4)));
	assert!(!adapter.is_degraded());
}

#[test]
fn envelope_json_carries_topic_as_string() {
	let env = BusEnvelope {
		origin: NodeId::new("node-a").unwrap(),
		topic: Topic::User(uid("u1")),
		body: BusBody::Join { room: conv("c1") },
	};
	let json = serde_json::to_value(&env).unwrap();
	assert_eq!(json["topic"], "user:u1");
	assert_eq!(json["body"]["kind"], "join");
	assert_eq!(json["body"]["room"], "conversation:c1");

	let back: BusEnvelope = serde_json::from_value(json).unwrap();
	assert_eq!(back, env);
}

#[tokio::test]
async fn tenant_topic_reaches_remote_members_after_idle_period() {
	let world = World::new();
	let a = world.node("node-a").await;
	let b = world.node("node-b").await;
	let conn = ConnectionId::new_v4();
	let mut rx = b.broadcaster.hub().attach(conn, GatewayKind::Notifications).await;
	b.broadcaster.hub().join(conn, Topic::Tenant(tenant())).await;

	tokio::time::sleep(Duration::from_millis(50)).await;
	a.broadcaster
		.publish(Topic::Tenant(tenant()), ServerEvent::unread_count(9))
		.await;
	let got = timeout(Duration::from_millis(500), async { next_event(&mut rx).await })
		.await
		.expect("delivery within timeout");
	assert_eq!(got, Some(ServerEvent::unread_count(9)));
}
