#![forbid(unsafe_code)]

use campus_domain::models::{NewAttachment, StudentRef};
use campus_domain::{ConnectionId, ConversationId, Role, TenantId, Topic, UserId};
use campus_protocol::{GatewayKind, ServerEvent};

use crate::server::connection::Session;
use crate::server::error::ServiceError;
use crate::server::fixtures::{World, drain, events, next_event, uid};
use crate::server::store::{MessageQuery, NotificationQuery};

struct Cast {
	world: World,
	teacher: UserId,
	parent: UserId,
	student: StudentRef,
}

fn cast() -> Cast {
	let world = World::new();
	let teacher = world.account("teacher-1", Role::Teacher, "Ms. Reed");
	let parent = world.account("parent-1", Role::Parent, "Sam Parent");
	let student = world.student("s1", "Ana", &[&parent]);
	Cast {
		world,
		teacher,
		parent,
		student,
	}
}

fn attachment(n: usize) -> NewAttachment {
	NewAttachment {
		file_name: format!("file-{n}.pdf"),
		url: format!("https://files.example/{n}"),
		mime_type: Some("application/pdf".to_string()),
		size_bytes: 1024,
	}
}

#[tokio::test]
async fn create_validates_creator_and_participants() {
	let c = cast();
	let ctx = c.world.node("node-a").await;
	let svc = &ctx.conversations;
	let teacher = c.world.principal(&c.teacher);

	let student_login = c.world.principal(&uid("s1-login"));
	let err = svc
		.create(&student_login, c.student.clone(), &[c.teacher.clone()])
		.await
		.unwrap_err();
	assert!(matches!(err, ServiceError::Forbidden(_)), "{err:?}");

	let err = svc
		.create(&teacher, c.student.clone(), &[c.teacher.clone()])
		.await
		.unwrap_err();
	assert!(matches!(err, ServiceError::Invalid(_)), "{err:?}");

	let err = svc
		.create(&teacher, c.student.clone(), &[uid("s1-login")])
		.await
		.unwrap_err();
	assert!(matches!(err, ServiceError::Invalid(_)), "student accounts cannot participate: {err:?}");

	let foreign = c
		.world
		.account_in("parent-x", &TenantId::new("school-2").unwrap(), Role::Parent, "Foreign");
	let err = svc.create(&teacher, c.student.clone(), &[foreign]).await.unwrap_err();
	assert!(matches!(err, ServiceError::Invalid(_)), "{err:?}");

	let conv = svc
		.create(&teacher, c.student.clone(), &[c.parent.clone(), c.parent.clone()])
		.await
		.unwrap();
	let participants = svc.participants(&teacher, &conv.id).await.unwrap();
	assert_eq!(participants.len(), 2);
}

#[tokio::test]
async fn offline_parent_gets_exactly_one_notification() {
	let c = cast();
	let ctx = c.world.node("node-a").await;
	let teacher = c.world.principal(&c.teacher);

	let conv = ctx
		.conversations
		.create(&teacher, c.student.clone(), &[c.parent.clone()])
		.await
		.unwrap();
	let msg = ctx
		.notifier
		.chat_message(&teacher, &conv.id, "  Ana did great today  ".to_string(), Vec::new())
		.await
		.unwrap();
	assert_eq!(msg.body, "Ana did great today");
	assert_eq!(msg.seq, 1);

	let unread = ctx
		.notifications
		.list(
			&c.parent,
			NotificationQuery {
				unread_only: true,
				..NotificationQuery::default()
			},
		)
		.await
		.unwrap();
	assert_eq!(unread.len(), 1);
	assert_eq!(unread[0].title, "New message from Ms. Reed");
	assert_eq!(unread[0].body, "Ana did great today");

	// The sender is never notified about their own message.
	assert_eq!(ctx.notifications.unread_count(&c.teacher).await.unwrap(), 0);
}

#[tokio::test]
async fn online_participant_gets_live_message_and_no_notification() {
	let c = cast();
	let a = c.world.node("node-a").await;
	let b = c.world.node("node-b").await;
	let teacher = c.world.principal(&c.teacher);
	let parent = c.world.principal(&c.parent);

	let session = Session::new(b.clone(), parent.clone(), GatewayKind::Chat);
	let (mut rx, _initial) = session.open().await;

	let conv = a
		.conversations
		.create(&teacher, c.student.clone(), &[c.parent.clone()])
		.await
		.unwrap();
	match next_event(&mut rx).await {
		Some(ServerEvent::ConversationJoined(r)) => assert_eq!(r.conversation_id, conv.id),
		other => panic!("expected conversation:joined, got: {other:?}"),
	}

	a.conversations
		.send_message(&teacher, &conv.id, "hello".to_string(), Vec::new())
		.await
		.unwrap();
	match next_event(&mut rx).await {
		Some(ServerEvent::MessageNew(p)) => {
			assert_eq!(p.conversation_id, conv.id);
			assert_eq!(p.message.body, "hello");
		}
		other => panic!("expected message:new, got: {other:?}"),
	}
	assert_eq!(a.notifications.unread_count(&c.parent).await.unwrap(), 0);

	session.close().await;
}

#[tokio::test]
async fn parent_on_the_notifications_gateway_only_still_gets_notified() {
	let c = cast();
	let ctx = c.world.node("node-a").await;
	let teacher = c.world.principal(&c.teacher);
	let parent = c.world.principal(&c.parent);

	let session = Session::new(ctx.clone(), parent.clone(), GatewayKind::Notifications);
	let (mut rx, _initial) = session.open().await;
	assert!(ctx.presence.is_online(&c.parent).await.unwrap());

	let conv = ctx
		.conversations
		.create(&teacher, c.student.clone(), &[c.parent.clone()])
		.await
		.unwrap();
	ctx.conversations
		.send_message(&teacher, &conv.id, "see you at pickup".to_string(), Vec::new())
		.await
		.unwrap();

	let got = events(&drain(&mut rx).await);
	assert!(
		!got.iter().any(|e| matches!(e, ServerEvent::MessageNew(_))),
		"message:new only goes to chat connections: {got:?}"
	);
	assert!(
		got.iter()
			.any(|e| matches!(e, ServerEvent::NotificationNew(p) if p.notification.title == "New message from Ms. Reed")),
		"{got:?}"
	);
	assert_eq!(ctx.notifications.unread_count(&c.parent).await.unwrap(), 1);
	session.close().await;
}

#[tokio::test]
async fn admins_are_notified_even_while_online_participants_are_not() {
	let c = cast();
	let ctx = c.world.node("node-a").await;
	let admin = c.world.account("admin-1", Role::Admin, "Admin");
	let teacher = c.world.principal(&c.teacher);

	let conv = ctx
		.conversations
		.create(&teacher, c.student.clone(), &[c.parent.clone()])
		.await
		.unwrap();
	ctx.conversations
		.send_message(&teacher, &conv.id, "note".to_string(), Vec::new())
		.await
		.unwrap();

	let list = ctx
		.notifications
		.list(&admin, NotificationQuery::default())
		.await
		.unwrap();
	assert_eq!(list.len(), 1);
	assert_eq!(list[0].title, "New message about Ana");
}

#[tokio::test]
async fn messages_keep_send_order() {
	let c = cast();
	let ctx = c.world.node("node-a").await;
	let teacher = c.world.principal(&c.teacher);
	let parent = c.world.principal(&c.parent);
	let conv = ctx
		.conversations
		.create(&teacher, c.student.clone(), &[c.parent.clone()])
		.await
		.unwrap();

	for (who, body) in [(&teacher, "one"), (&parent, "two"), (&teacher, "three")] {
		ctx.conversations
			.send_message(who, &conv.id, body.to_string(), Vec::new())
			.await
			.unwrap();
	}

	let messages = ctx
		.conversations
		.list_messages(&parent, &conv.id, MessageQuery::default())
		.await
		.unwrap();
	let got = messages.iter().map(|m| (m.seq, m.body.as_str())).collect::<Vec<_>>();
	assert_eq!(got, vec![(1, "one"), (2, "two"), (3, "three")]);

	let after = ctx
		.conversations
		.list_messages(
			&parent,
			&conv.id,
			MessageQuery {
				after_seq: Some(2),
				..MessageQuery::default()
			},
		)
		.await
		.unwrap();
	assert_eq!(after.len(), 1);
	assert_eq!(after[0].body, "three");
}

#[tokio::test]
async fn send_rejects_empty_oversized_and_non_participants() {
	let c = cast();
	let ctx = c.world.node("node-a").await;
	let teacher = c.world.principal(&c.teacher);
	let conv = ctx
		.conversations
		.create(&teacher, c.student.clone(), &[c.parent.clone()])
		.await
		.unwrap();

	let err = ctx
		.conversations
		.send_message(&teacher, &conv.id, "   ".to_string(), Vec::new())
		.await
		.unwrap_err();
	assert!(matches!(err, ServiceError::Invalid(_)));

	let err = ctx
		.conversations
		.send_message(&teacher, &conv.id, "x".repeat(10_001), Vec::new())
		.await
		.unwrap_err();
	assert!(matches!(err, ServiceError::Invalid(_)));

	let err = ctx
		.conversations
		.send_message(&teacher, &conv.id, "files".to_string(), (0..11).map(attachment).collect())
		.await
		.unwrap_err();
	assert!(matches!(err, ServiceError::Invalid(_)));

	let outsider = c.world.account("teacher-2", Role::Teacher, "Other teacher");
	let err = ctx
		.conversations
		.send_message(&c.world.principal(&outsider), &conv.id, "hi".to_string(), Vec::new())
		.await
		.unwrap_err();
	assert!(matches!(err, ServiceError::Forbidden(_)));

	let err = ctx
		.conversations
		.send_message(&teacher, &ConversationId::new("nope").unwrap(), "hi".to_string(), Vec::new())
		.await
		.unwrap_err();
	assert!(matches!(err, ServiceError::NotFound(_)));

	// Attachments alone are a valid message.
	let msg = ctx
		.conversations
		.send_message(&teacher, &conv.id, String::new(), vec![attachment(1)])
		.await
		.unwrap();
	assert_eq!(msg.attachments.len(), 1);
}

#[tokio::test]
async fn read_marks_are_idempotent() {
	let c = cast();
	let ctx = c.world.node("node-a").await;
	let teacher = c.world.principal(&c.teacher);
	let parent = c.world.principal(&c.parent);
	let conv = ctx
		.conversations
		.create(&teacher, c.student.clone(), &[c.parent.clone()])
		.await
		.unwrap();
	ctx.conversations
		.send_message(&teacher, &conv.id, "a".to_string(), Vec::new())
		.await
		.unwrap();
	ctx.conversations
		.send_message(&teacher, &conv.id, "b".to_string(), Vec::new())
		.await
		.unwrap();

	let conn = ConnectionId::new_v4();
	let hub = ctx.broadcaster.hub();
	let mut rx = hub.attach(conn, GatewayKind::Chat).await;
	hub.join(conn, Topic::Conversation(conv.id.clone())).await;
	// Bus deliveries of the two messages may still be in flight.
	drain(&mut rx).await;

	assert_eq!(ctx.conversations.mark_read(&parent, &conv.id).await.unwrap(), 2);
	let got = events(&drain(&mut rx).await);
	assert_eq!(got.len(), 1);
	match &got[0] {
		ServerEvent::MessageRead(p) => assert_eq!(p.read_by, c.parent),
		other => panic!("expected message:read, got: {other:?}"),
	}

	assert_eq!(ctx.conversations.mark_read(&parent, &conv.id).await.unwrap(), 0);
	assert!(drain(&mut rx).await.is_empty(), "a repeated read mark must not broadcast");
}

#[tokio::test]
async fn delete_is_limited_and_removes_members_from_the_room() {
	let c = cast();
	let ctx = c.world.node("node-a").await;
	let teacher = c.world.principal(&c.teacher);
	let parent = c.world.principal(&c.parent);

	let session = Session::new(ctx.clone(), parent.clone(), GatewayKind::Chat);
	let (mut rx, _) = session.open().await;

	let conv = ctx
		.conversations
		.create(&teacher, c.student.clone(), &[c.parent.clone()])
		.await
		.unwrap();
	assert_eq!(next_event(&mut rx).await.map(|e| e.name()), Some("conversation:joined"));

	let err = ctx.conversations.delete(&parent, &conv.id).await.unwrap_err();
	assert!(matches!(err, ServiceError::Forbidden(_)));

	ctx.conversations.delete(&teacher, &conv.id).await.unwrap();
	assert_eq!(next_event(&mut rx).await.map(|e| e.name()), Some("conversation:left"));
	assert!(
		!ctx.broadcaster
			.hub()
			.is_member(session.conn_id(), &Topic::Conversation(conv.id.clone()))
			.await
	);

	let err = ctx.conversations.require_participant(&teacher, &conv.id).await.unwrap_err();
	assert!(matches!(err, ServiceError::NotFound(_)));
	session.close().await;
}

#[tokio::test]
async fn other_tenant_cannot_see_conversation() {
	let c = cast();
	let ctx = c.world.node("node-a").await;
	let teacher = c.world.principal(&c.teacher);
	let conv = ctx
		.conversations
		.create(&teacher, c.student.clone(), &[c.parent.clone()])
		.await
		.unwrap();

	let foreign_admin = c
		.world
		.account_in("admin-x", &TenantId::new("school-2").unwrap(), Role::Admin, "Admin X");
	let err = ctx
		.conversations
		.require_participant(&c.world.principal(&foreign_admin), &conv.id)
		.await
		.unwrap_err();
	assert!(matches!(err, ServiceError::NotFound(_)));
}
