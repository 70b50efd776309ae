#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::anyhow;
use campus_domain::events::{DomainEvent, EventPayload, Money, PaymentConfirmed, TaskGraded};
use campus_domain::models::{NewNotification, Notification, StudentRef};
use campus_domain::{ConnectionId, NotificationId, PaymentId, Role, TaskId, Topic, UserId};
use campus_protocol::{GatewayKind, ServerEvent};

use crate::server::error::ServiceError;
use crate::server::fanout::NotificationService;
use crate::server::fixtures::{World, drain, events, next_event, tenant, uid};
use crate::server::resolver::ResolutionEngine;
use crate::server::store::{InsertOutcome, MemoryStore, NotificationQuery, NotificationStore, StoreError, StoreResult};

/// Store that refuses inserts for one user.
struct FailingStore {
	inner: Arc<MemoryStore>,
	fail_for: UserId,
}

#[async_trait::async_trait]
impl NotificationStore for FailingStore {
	async fn insert_notification(&self, new: NewNotification, now_ms: i64) -> StoreResult<InsertOutcome> {
		if new.user_id == self.fail_for {
			return Err(StoreError::Backend(anyhow!("disk full")));
		}
		self.inner.insert_notification(new, now_ms).await
	}

	async fn unread_count(&self, user: &UserId) -> StoreResult<u64> {
		self.inner.unread_count(user).await
	}

	async fn mark_notification_read(&self, user: &UserId, id: &NotificationId, now_ms: i64) -> StoreResult<bool> {
		self.inner.mark_notification_read(user, id, now_ms).await
	}

	async fn mark_all_notifications_read(&self, user: &UserId, now_ms: i64) -> StoreResult<u64> {
		self.inner.mark_all_notifications_read(user, now_ms).await
	}

	async fn list_notifications(&self, user: &UserId, query: NotificationQuery) -> StoreResult<Vec<Notification>> {
		self.inner.list_notifications(user, query).await
	}

	async fn delete_notification(&self, user: &UserId, id: &NotificationId) -> StoreResult<bool> {
		self.inner.delete_notification(user, id).await
	}

	async fn delete_read_notifications_before(&self, cutoff_ms: i64) -> StoreResult<u64> {
		self.inner.delete_read_notifications_before(cutoff_ms).await
	}
}

fn grade(student: &StudentRef, score: f64) -> TaskGraded {
	TaskGraded {
		task_id: TaskId::new("t-1").unwrap(),
		title: "Essay".to_string(),
		course_name: "History".to_string(),
		student: student.clone(),
		score,
		max_score: 20.0,
	}
}

fn payment(student: &StudentRef, id: &str) -> PaymentConfirmed {
	PaymentConfirmed {
		payment_id: PaymentId::new(id).unwrap(),
		student: student.clone(),
		amount: Money::new(12_500, "EUR"),
		description: "Tuition".to_string(),
	}
}

#[tokio::test]
async fn fanout_persists_and_pushes_to_each_recipient() {
	let world = World::new();
	let ctx = world.node("node-a").await;
	let parent = world.account("p1", Role::Parent, "Parent");
	let student = world.student("s1", "Ana", &[&parent]);

	let conn = ConnectionId::new_v4();
	let hub = ctx.broadcaster.hub();
	let mut rx = hub.attach(conn, GatewayKind::Notifications).await;
	hub.join(conn, Topic::User(parent.clone())).await;

	let report = ctx.notifier.task_graded(tenant(), None, grade(&student, 18.0)).await;
	assert_eq!(report.resolved, 2);
	assert_eq!(report.delivered, 2);
	assert_eq!(report.failed, 0);

	match next_event(&mut rx).await {
		Some(ServerEvent::NotificationNew(p)) => {
			assert_eq!(p.notification.user_id, parent);
			assert_eq!(p.notification.title, "Ana received a grade");
			assert!(!p.notification.is_read);
		}
		other => panic!("expected notification:new, got: {other:?}"),
	}
	assert_eq!(next_event(&mut rx).await, Some(ServerEvent::unread_count(1)));
}

#[tokio::test]
async fn repeated_trigger_with_same_key_creates_nothing() {
	let world = World::new();
	let ctx = world.node("node-a").await;
	let parent = world.account("p1", Role::Parent, "Parent");
	world.account("admin-1", Role::Admin, "Admin");
	let student = world.student("s1", "Ana", &[&parent]);

	let first = ctx.notifier.payment_confirmed(tenant(), None, payment(&student, "pay-1")).await;
	let second = ctx.notifier.payment_confirmed(tenant(), None, payment(&student, "pay-1")).await;

	assert_eq!(first.delivered, 2);
	assert_eq!(second.delivered, 0);
	assert_eq!(second.duplicates, 2);
	assert_eq!(ctx.notifications.unread_count(&parent).await.unwrap(), 1);
}

#[tokio::test]
async fn events_without_a_key_are_not_deduplicated() {
	let world = World::new();
	let ctx = world.node("node-a").await;
	let parent = world.account("p1", Role::Parent, "Parent");
	let student = world.student("s1", "Ana", &[&parent]);

	let event = DomainEvent::new(tenant(), EventPayload::PaymentConfirmed(payment(&student, "pay-1")));
	ctx.notifications.fanout(&event).await;
	ctx.notifications.fanout(&event).await;

	assert_eq!(ctx.notifications.unread_count(&parent).await.unwrap(), 2);
}

#[tokio::test]
async fn one_failing_recipient_does_not_block_the_others() {
	let world = World::new();
	let ctx = world.node("node-a").await;
	let g1 = world.account("g1", Role::Parent, "Guardian One");
	let g2 = world.account("g2", Role::Parent, "Guardian Two");
	let student = world.student("s1", "Ana", &[&g1, &g2]);

	let service = NotificationService::new(
		Arc::new(FailingStore {
			inner: world.store.clone(),
			fail_for: g1.clone(),
		}),
		Arc::new(ResolutionEngine::with_default_rules(world.directory.clone(), world.store.clone())),
		ctx.broadcaster.clone(),
	);

	let event = DomainEvent::new(tenant(), EventPayload::TaskGraded(grade(&student, 11.0)));
	let report = service.fanout(&event).await;

	assert_eq!(report.resolved, 3);
	assert_eq!(report.failed, 1);
	assert_eq!(report.delivered, 2);
	assert_eq!(world.store.unread_count(&g1).await.unwrap(), 0);
	assert_eq!(world.store.unread_count(&g2).await.unwrap(), 1);
	assert_eq!(world.store.unread_count(&uid("s1-login")).await.unwrap(), 1);
}

#[tokio::test]
async fn unread_count_is_created_minus_read() {
	let world = World::new();
	let ctx = world.node("node-a").await;
	let parent = world.account("p1", Role::Parent, "Parent");
	let student = world.student("s1", "Ana", &[&parent]);

	for n in 0..5 {
		ctx.notifier.payment_confirmed(tenant(), None, payment(&student, &format!("pay-{n}"))).await;
	}
	let listed = ctx
		.notifications
		.list(&parent, NotificationQuery::default())
		.await
		.unwrap();
	assert_eq!(listed.len(), 5);

	for n in &listed[..2] {
		assert!(ctx.notifications.mark_read(&parent, &n.id).await.unwrap());
	}
	// Already read.
	assert!(!ctx.notifications.mark_read(&parent, &listed[0].id).await.unwrap());

	assert_eq!(ctx.notifications.unread_count(&parent).await.unwrap(), 3);
	let unread = ctx
		.notifications
		.list(
			&parent,
			NotificationQuery {
				unread_only: true,
				..NotificationQuery::default()
			},
		)
		.await
		.unwrap();
	assert_eq!(unread.len(), 3);
}

#[tokio::test]
async fn only_the_owner_can_mark_read_or_delete() {
	let world = World::new();
	let ctx = world.node("node-a").await;
	let parent = world.account("p1", Role::Parent, "Parent");
	let other = world.account("p2", Role::Parent, "Other");
	let student = world.student("s1", "Ana", &[&parent]);

	ctx.notifier.payment_confirmed(tenant(), None, payment(&student, "pay-1")).await;
	let n = ctx
		.notifications
		.list(&parent, NotificationQuery::default())
		.await
		.unwrap()
		.remove(0);

	assert!(matches!(
		ctx.notifications.mark_read(&other, &n.id).await,
		Err(ServiceError::NotFound(_))
	));
	assert!(!ctx.notifications.delete(&other, &n.id).await.unwrap());
	assert_eq!(ctx.notifications.unread_count(&parent).await.unwrap(), 1);

	assert!(ctx.notifications.delete(&parent, &n.id).await.unwrap());
	assert_eq!(ctx.notifications.unread_count(&parent).await.unwrap(), 0);
}

#[tokio::test]
async fn mark_all_read_pushes_zero_count() {
	let world = World::new();
	let ctx = world.node("node-a").await;
	let parent = world.account("p1", Role::Parent, "Parent");
	let student = world.student("s1", "Ana", &[&parent]);
	ctx.notifier.payment_confirmed(tenant(), None, payment(&student, "pay-1")).await;
	ctx.notifier.payment_confirmed(tenant(), None, payment(&student, "pay-2")).await;

	let conn = ConnectionId::new_v4();
	let hub = ctx.broadcaster.hub();
	let mut rx = hub.attach(conn, GatewayKind::Notifications).await;
	hub.join(conn, Topic::User(parent.clone())).await;
	drain(&mut rx).await;

	assert_eq!(ctx.notifications.mark_all_read(&parent).await.unwrap(), 2);
	assert_eq!(events(&drain(&mut rx).await), vec![ServerEvent::unread_count(0)]);

	// Nothing left to mark, nothing pushed.
	assert_eq!(ctx.notifications.mark_all_read(&parent).await.unwrap(), 0);
	assert!(drain(&mut rx).await.is_empty());
}

#[tokio::test]
async fn unresolvable_event_delivers_nothing() {
	let world = World::new();
	let ctx = world.node("node-a").await;
	let student = world.student("s1", "Ana", &[]);
	world.directory.set_account_active(&uid("s1-login"), false);

	let report = ctx.notifier.task_graded(tenant(), None, grade(&student, 3.0)).await;
	assert_eq!(report.resolved, 0);
	assert_eq!(report.delivered, 0);
}
