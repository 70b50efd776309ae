#![forbid(unsafe_code)]

use campus_domain::events::{Money, PaymentConfirmed};
use campus_domain::{ConversationId, PaymentId, Role, Topic};
use campus_protocol::{
	AuthPayload, ClientEvent, ConversationRef, ErrorCode, GatewayKind, MessageSendPayload, ReadyPayload, ServerEvent,
	UserPresencePayload,
};

use crate::server::auth::AuthError;
use crate::server::connection::Session;
use crate::server::fixtures::{World, drain, events, next_event, tenant};

fn error_code(ev: Option<ServerEvent>) -> (ErrorCode, Option<String>) {
	match ev {
		Some(ServerEvent::Error(e)) => (e.code, e.event),
		other => panic!("expected error, got: {other:?}"),
	}
}

fn conv_ref(id: &ConversationId) -> ConversationRef {
	ConversationRef {
		conversation_id: id.clone(),
	}
}

#[tokio::test]
async fn notifications_gateway_opens_with_ready_and_unread_count() {
	let world = World::new();
	let ctx = world.node("node-a").await;
	let parent = world.account("p1", Role::Parent, "Parent");
	let student = world.student("s1", "Ana", &[&parent]);
	ctx.notifier
		.payment_confirmed(
			tenant(),
			None,
			PaymentConfirmed {
				payment_id: PaymentId::new("pay-1").unwrap(),
				student,
				amount: Money::new(5_000, "EUR"),
				description: "Books".to_string(),
			},
		)
		.await;

	let session = Session::new(ctx.clone(), world.principal(&parent), GatewayKind::Notifications);
	let (_rx, initial) = session.open().await;

	assert_eq!(
		initial,
		vec![
			ServerEvent::Ready(ReadyPayload {
				user_id: parent.clone(),
				role: Role::Parent,
				tenant_id: tenant(),
				gateway: GatewayKind::Notifications,
			}),
			ServerEvent::unread_count(1),
		]
	);

	let hub = ctx.broadcaster.hub();
	assert!(hub.is_member(session.conn_id(), &Topic::User(parent.clone())).await);
	assert!(hub.is_member(session.conn_id(), &Topic::Tenant(tenant())).await);
	assert!(hub.is_member(session.conn_id(), &Topic::Role(Role::Parent)).await);
	session.close().await;
}

#[tokio::test]
async fn chat_gateway_joins_existing_conversations_on_open() {
	let world = World::new();
	let ctx = world.node("node-a").await;
	let teacher = world.account("t1", Role::Teacher, "Teacher");
	let parent = world.account("p1", Role::Parent, "Parent");
	let student = world.student("s1", "Ana", &[&parent]);
	let conv = ctx
		.conversations
		.create(&world.principal(&teacher), student, &[parent.clone()])
		.await
		.unwrap();

	let session = Session::new(ctx.clone(), world.principal(&parent), GatewayKind::Chat);
	let (_rx, initial) = session.open().await;
	assert_eq!(initial.len(), 1, "chat connections get no unread count");
	assert!(
		ctx.broadcaster
			.hub()
			.is_member(session.conn_id(), &Topic::Conversation(conv.id.clone()))
			.await
	);
	assert!(
		ctx.broadcaster
			.hub()
			.is_member(session.conn_id(), &Topic::Tenant(tenant()))
			.await
	);
	assert!(
		ctx.broadcaster
			.hub()
			.is_member(session.conn_id(), &Topic::Role(Role::Parent))
			.await
	);
	session.close().await;
}

#[tokio::test]
async fn chat_connections_see_presence_changes_in_their_tenant() {
	let world = World::new();
	let a = world.node("node-a").await;
	let b = world.node("node-b").await;
	let teacher = world.account("t1", Role::Teacher, "Teacher");
	let parent = world.account("p1", Role::Parent, "Parent");

	let watcher = Session::new(a.clone(), world.principal(&teacher), GatewayKind::Chat);
	let (mut rx, _) = watcher.open().await;
	drain(&mut rx).await;

	let other = Session::new(b.clone(), world.principal(&parent), GatewayKind::Chat);
	let _other_rx = other.open().await;
	let online = UserPresencePayload { user_id: parent.clone() };
	assert_eq!(events(&drain(&mut rx).await), vec![ServerEvent::UserOnline(online.clone())]);

	other.close().await;
	assert_eq!(events(&drain(&mut rx).await), vec![ServerEvent::UserOffline(online)]);
	watcher.close().await;
}

#[tokio::test]
async fn events_are_scoped_to_their_gateway() {
	let world = World::new();
	let ctx = world.node("node-a").await;
	let parent = world.account("p1", Role::Parent, "Parent");

	let chat = Session::new(ctx.clone(), world.principal(&parent), GatewayKind::Chat);
	let notif = Session::new(ctx.clone(), world.principal(&parent), GatewayKind::Notifications);
	let _chat_rx = chat.open().await;
	let _notif_rx = notif.open().await;

	let (code, event) = error_code(chat.handle(ClientEvent::NotificationMarkAllRead).await);
	assert_eq!(code, ErrorCode::Forbidden);
	assert_eq!(event.as_deref(), Some("notification:mark-all-read"));

	let send = ClientEvent::MessageSend(MessageSendPayload {
		conversation_id: ConversationId::new("c1").unwrap(),
		content: "hi".to_string(),
		attachments: Vec::new(),
	});
	let (code, event) = error_code(notif.handle(send).await);
	assert_eq!(code, ErrorCode::Forbidden);
	assert_eq!(event.as_deref(), Some("message:send"));

	assert_eq!(notif.handle(ClientEvent::NotificationMarkAllRead).await, None);

	let (code, _) = error_code(
		chat.handle(ClientEvent::Auth(AuthPayload {
			token: "again".to_string(),
		}))
		.await,
	);
	assert_eq!(code, ErrorCode::BadRequest);

	chat.close().await;
	notif.close().await;
}

#[tokio::test]
async fn join_requires_participation_and_typing_requires_the_room() {
	let world = World::new();
	let ctx = world.node("node-a").await;
	let teacher = world.account("t1", Role::Teacher, "Teacher");
	let parent = world.account("p1", Role::Parent, "Parent");
	let outsider = world.account("p2", Role::Parent, "Outsider");
	let student = world.student("s1", "Ana", &[&parent]);
	let conv = ctx
		.conversations
		.create(&world.principal(&teacher), student, &[parent.clone()])
		.await
		.unwrap();

	let stranger = Session::new(ctx.clone(), world.principal(&outsider), GatewayKind::Chat);
	let _ = stranger.open().await;
	let (code, _) = error_code(stranger.handle(ClientEvent::ConversationJoin(conv_ref(&conv.id))).await);
	assert_eq!(code, ErrorCode::Forbidden);
	let (code, _) = error_code(stranger.handle(ClientEvent::TypingStart(conv_ref(&conv.id))).await);
	assert_eq!(code, ErrorCode::Forbidden);

	let (code, _) = error_code(
		stranger
			.handle(ClientEvent::ConversationJoin(conv_ref(&ConversationId::new("missing").unwrap())))
			.await,
	);
	assert_eq!(code, ErrorCode::NotFound);

	let member = Session::new(ctx.clone(), world.principal(&parent), GatewayKind::Chat);
	let (mut member_rx, _) = member.open().await;
	let teacher_session = Session::new(ctx.clone(), world.principal(&teacher), GatewayKind::Chat);
	let (mut teacher_rx, _) = teacher_session.open().await;
	drain(&mut teacher_rx).await;

	// Leave and come back explicitly.
	assert_eq!(
		member.handle(ClientEvent::ConversationLeave(conv_ref(&conv.id))).await,
		Some(ServerEvent::ConversationLeft(conv_ref(&conv.id)))
	);
	let (code, _) = error_code(member.handle(ClientEvent::TypingStart(conv_ref(&conv.id))).await);
	assert_eq!(code, ErrorCode::Forbidden);
	assert_eq!(
		member.handle(ClientEvent::ConversationJoin(conv_ref(&conv.id))).await,
		Some(ServerEvent::ConversationJoined(conv_ref(&conv.id)))
	);

	assert_eq!(member.handle(ClientEvent::TypingStart(conv_ref(&conv.id))).await, None);
	match next_event(&mut teacher_rx).await {
		Some(ServerEvent::TypingStart(p)) => {
			assert_eq!(p.user_id, parent);
			assert_eq!(p.user_name, "Parent");
		}
		other => panic!("expected typing:start, got: {other:?}"),
	}
	drain(&mut member_rx).await;

	stranger.close().await;
	member.close().await;
	teacher_session.close().await;
}

#[tokio::test]
async fn message_send_over_session_reaches_room() {
	let world = World::new();
	let ctx = world.node("node-a").await;
	let teacher = world.account("t1", Role::Teacher, "Teacher");
	let parent = world.account("p1", Role::Parent, "Parent");
	let student = world.student("s1", "Ana", &[&parent]);
	let conv = ctx
		.conversations
		.create(&world.principal(&teacher), student, &[parent.clone()])
		.await
		.unwrap();

	let sender = Session::new(ctx.clone(), world.principal(&parent), GatewayKind::Chat);
	let (mut rx, _) = sender.open().await;

	let reply = sender
		.handle(ClientEvent::MessageSend(MessageSendPayload {
			conversation_id: conv.id.clone(),
			content: "see you friday".to_string(),
			attachments: Vec::new(),
		}))
		.await;
	assert_eq!(reply, None);

	let got = events(&drain(&mut rx).await);
	assert!(
		got.iter()
			.any(|e| matches!(e, ServerEvent::MessageNew(p) if p.message.body == "see you friday")),
		"sender receives its own message through the room: {got:?}"
	);
	sender.close().await;
}

#[tokio::test]
async fn lag_triggers_resync_with_current_count() {
	let world = World::new();
	let ctx = world.node("node-a").await;
	let parent = world.account("p1", Role::Parent, "Parent");
	let session = Session::new(ctx.clone(), world.principal(&parent), GatewayKind::Notifications);

	assert_eq!(
		session.on_lagged(4).await,
		vec![ServerEvent::NotificationResync(Default::default()), ServerEvent::unread_count(0)]
	);
}

#[tokio::test]
async fn revalidate_fails_once_account_is_disabled() {
	let world = World::new();
	let ctx = world.node("node-a").await;
	let parent = world.account("p1", Role::Parent, "Parent");
	let session = Session::new(ctx.clone(), world.principal(&parent), GatewayKind::Chat);

	assert!(session.revalidate().await.is_ok());
	world.directory.set_account_active(&parent, false);
	assert!(matches!(session.revalidate().await, Err(AuthError::AccountDisabled)));
}

#[tokio::test]
async fn privileged_events_recheck_the_account() {
	let world = World::new();
	let ctx = world.node("node-a").await;
	let teacher = world.account("t1", Role::Teacher, "Teacher");
	let parent = world.account("p1", Role::Parent, "Parent");
	let student = world.student("s1", "Ana", &[&parent]);
	let conv = ctx
		.conversations
		.create(&world.principal(&teacher), student, &[parent.clone()])
		.await
		.unwrap();

	let session = Session::new(ctx.clone(), world.principal(&parent), GatewayKind::Chat);
	let _ = session.open().await;
	world.directory.set_account_active(&parent, false);

	let (code, event) = error_code(
		session
			.handle(ClientEvent::MessageSend(MessageSendPayload {
				conversation_id: conv.id.clone(),
				content: "still here?".to_string(),
				attachments: Vec::new(),
			}))
			.await,
	);
	assert_eq!(code, ErrorCode::Unauthorized);
	assert_eq!(event.as_deref(), Some("message:send"));

	let (code, _) = error_code(session.handle(ClientEvent::ConversationJoin(conv_ref(&conv.id))).await);
	assert_eq!(code, ErrorCode::Unauthorized);

	let messages = ctx
		.conversations
		.list_messages(&world.principal(&teacher), &conv.id, Default::default())
		.await
		.unwrap();
	assert!(messages.is_empty());
	session.close().await;
}
