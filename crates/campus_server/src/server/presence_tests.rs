#![forbid(unsafe_code)]

use std::sync::Arc;

use campus_domain::{ConnectionId, NodeId, Role, TenantId, UserId};
use campus_protocol::{GatewayKind, ServerEvent, UserPresencePayload};

use crate::server::connection::Session;
use crate::server::fixtures::{World, drain, events, tenant, uid};
use crate::server::presence::{InMemoryPresenceStore, PresenceFilter, PresenceRecord, PresenceStore};

fn record(user: &str, node: &str) -> PresenceRecord {
	PresenceRecord {
		connection_id: ConnectionId::new_v4(),
		user_id: UserId::new(user).unwrap(),
		role: Role::Parent,
		tenant_id: tenant(),
		node_id: NodeId::new(node).unwrap(),
		gateway: GatewayKind::Chat,
		connected_at_ms: 0,
	}
}

#[tokio::test]
async fn concurrent_connects_and_disconnects_leave_consistent_counts() {
	let store = Arc::new(InMemoryPresenceStore::new());
	let records = (0..40)
		.map(|i| record("u1", if i % 2 == 0 { "node-a" } else { "node-b" }))
		.collect::<Vec<_>>();

	let mut tasks = Vec::new();
	for r in records.clone() {
		let store = store.clone();
		tasks.push(tokio::spawn(async move { store.add(&r).await.unwrap() }));
	}
	for t in tasks {
		t.await.unwrap();
	}
	assert_eq!(store.connections(&uid("u1")).await.unwrap().len(), 40);

	let mut tasks = Vec::new();
	for r in records.into_iter().skip(1) {
		let store = store.clone();
		tasks.push(tokio::spawn(async move { store.remove(&r).await.unwrap() }));
	}
	for t in tasks {
		t.await.unwrap();
	}
	assert_eq!(store.connections(&uid("u1")).await.unwrap().len(), 1);
}

#[tokio::test]
async fn first_connect_and_last_disconnect_are_announced_across_nodes() {
	let world = World::new();
	let a = world.node("node-a").await;
	let b = world.node("node-b").await;
	let watcher = world.account("admin-1", Role::Admin, "Admin");
	let parent = world.account("p1", Role::Parent, "Parent");

	let watch = Session::new(b.clone(), world.principal(&watcher), GatewayKind::Notifications);
	let (mut rx, _) = watch.open().await;
	drain(&mut rx).await;

	let first = Session::new(a.clone(), world.principal(&parent), GatewayKind::Chat);
	let second = Session::new(b.clone(), world.principal(&parent), GatewayKind::Notifications);
	let _first_rx = first.open().await;
	let _second_rx = second.open().await;

	let online = UserPresencePayload { user_id: parent.clone() };
	let got = events(&drain(&mut rx).await);
	assert_eq!(got, vec![ServerEvent::UserOnline(online.clone())], "one announcement for two connections");
	assert!(a.presence.is_online(&parent).await.unwrap());

	first.close().await;
	assert!(events(&drain(&mut rx).await).is_empty(), "still connected on node-b");
	assert!(b.presence.is_online(&parent).await.unwrap());

	second.close().await;
	assert_eq!(events(&drain(&mut rx).await), vec![ServerEvent::UserOffline(online)]);
	assert!(!a.presence.is_online(&parent).await.unwrap());
	watch.close().await;
}

#[tokio::test]
async fn list_online_filters_by_tenant_and_role() {
	let world = World::new();
	let ctx = world.node("node-a").await;
	let other = TenantId::new("school-2").unwrap();

	let mut parent = record("p1", "node-a");
	parent.role = Role::Parent;
	let mut teacher = record("t1", "node-a");
	teacher.role = Role::Teacher;
	let mut foreign = record("t9", "node-b");
	foreign.role = Role::Teacher;
	foreign.tenant_id = other;
	for r in [&parent, &teacher, &foreign] {
		ctx.presence.register(r).await.unwrap();
	}

	let all_here = ctx
		.presence
		.list_online(&PresenceFilter {
			tenant: Some(tenant()),
			role: None,
		})
		.await
		.unwrap();
	assert_eq!(all_here, vec![uid("p1"), uid("t1")]);

	let teachers = ctx
		.presence
		.list_online(&PresenceFilter {
			tenant: None,
			role: Some(Role::Teacher),
		})
		.await
		.unwrap();
	assert_eq!(teachers, vec![uid("t1"), uid("t9")]);
}

#[tokio::test]
async fn purge_node_drops_only_that_nodes_records() {
	let world = World::new();
	let ctx = world.node("node-a").await;

	let stale = record("u1", "node-old");
	let live = record("u1", "node-a");
	let other_user = record("u2", "node-old");
	for r in [&stale, &live, &other_user] {
		ctx.presence.register(r).await.unwrap();
	}

	let removed = ctx.presence.purge_node(&NodeId::new("node-old").unwrap()).await.unwrap();
	assert_eq!(removed, 2);
	assert!(ctx.presence.is_online(&uid("u1")).await.unwrap());
	assert!(!ctx.presence.is_online(&uid("u2")).await.unwrap());

	let left = ctx.presence.connections(&uid("u1")).await.unwrap();
	assert_eq!(left.len(), 1);
	assert_eq!(left[0].connection_id, live.connection_id);
}

#[tokio::test]
async fn removing_unknown_connection_is_harmless() {
	let store = InMemoryPresenceStore::new();
	assert_eq!(store.remove(&record("ghost", "node-a")).await.unwrap(), 0);
	assert!(store.all().await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn quick_reconnects_are_announced_in_order() {
	let world = World::new();
	let a = world.node("node-a").await;
	let b = world.node("node-b").await;
	let watcher = world.account("admin-1", Role::Admin, "Admin");
	let parent = world.account("p1", Role::Parent, "Parent");

	let watch = Session::new(b.clone(), world.principal(&watcher), GatewayKind::Notifications);
	let (mut rx, _) = watch.open().await;
	drain(&mut rx).await;

	for _ in 0..20 {
		let session = Session::new(a.clone(), world.principal(&parent), GatewayKind::Chat);
		let _open = session.open().await;
		session.close().await;
	}

	let online = UserPresencePayload { user_id: parent.clone() };
	let got = events(&drain(&mut rx).await);
	assert_eq!(got.len(), 40, "{got:?}");
	for pair in got.chunks(2) {
		assert_eq!(
			pair,
			[ServerEvent::UserOnline(online.clone()), ServerEvent::UserOffline(online.clone())]
		);
	}
	assert!(!a.presence.is_online(&parent).await.unwrap());
	watch.close().await;
}
