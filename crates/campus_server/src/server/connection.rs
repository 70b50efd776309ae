#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use campus_domain::{ConnectionId, Topic};
use campus_protocol::{
	ClientEvent, ConversationRef, Empty, ErrorCode, FramingError, GatewayKind, ReadyPayload, ServerEvent,
	decode_client_event, encode_frame,
};
use campus_util::time::unix_ms_now;
use futures::{Sink, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::server::auth::{AuthError, CredentialSource, Principal};
use crate::server::error::ServiceError;
use crate::server::presence::PresenceRecord;
use crate::server::room_hub::{OutboundReceiver, RoomHubItem};
use crate::server::state::ServerContext;

/// One authenticated connection. Owns the connection's room membership and presence record and
/// answers client events. Transport-agnostic so it can be driven directly.
pub struct Session {
	ctx: ServerContext,
	principal: Principal,
	conn_id: ConnectionId,
	gateway: GatewayKind,
	record: PresenceRecord,
}

impl Session {
	pub fn new(ctx: ServerContext, principal: Principal, gateway: GatewayKind) -> Self {
		let conn_id = ConnectionId::new_v4();
		let record = PresenceRecord {
			connection_id: conn_id,
			user_id: principal.user_id.clone(),
			role: principal.role,
			tenant_id: principal.tenant_id.clone(),
			node_id: ctx.node_id.clone(),
			gateway,
			connected_at_ms: unix_ms_now(),
		};
		Self {
			ctx,
			principal,
			conn_id,
			gateway,
			record,
		}
	}

	pub fn principal(&self) -> &Principal {
		&self.principal
	}

	pub fn conn_id(&self) -> ConnectionId {
		self.conn_id
	}

	pub fn gateway(&self) -> GatewayKind {
		self.gateway
	}

	/// Attach to the local hub, join the gateway's topics and record presence.
	///
	/// Returns the outbound stream and the frames to send first (`ready`, and the unread count on
	/// the notifications gateway).
	pub async fn open(&self) -> (OutboundReceiver, Vec<ServerEvent>) {
		let hub = self.ctx.broadcaster.hub();
		let rx = hub.attach(self.conn_id, self.gateway).await;

		for topic in self.initial_topics().await {
			hub.join(self.conn_id, topic).await;
		}

		if let Err(e) = self.ctx.presence.register(&self.record).await {
			warn!(conn_id = %self.conn_id, user_id = %self.principal.user_id, error = %e, "presence register failed");
		}

		let mut initial = vec![ServerEvent::Ready(ReadyPayload {
			user_id: self.principal.user_id.clone(),
			role: self.principal.role,
			tenant_id: self.principal.tenant_id.clone(),
			gateway: self.gateway,
		})];
		if self.gateway == GatewayKind::Notifications {
			match self.ctx.notifications.unread_count(&self.principal.user_id).await {
				Ok(n) => initial.push(ServerEvent::unread_count(n)),
				Err(e) => warn!(user_id = %self.principal.user_id, error = %e, "initial unread count failed"),
			}
		}

		(rx, initial)
	}

	/// Personal, role and tenant topics on both gateways; chat connections also join every
	/// conversation the user is in.
	async fn initial_topics(&self) -> Vec<Topic> {
		let mut topics = vec![
			Topic::User(self.principal.user_id.clone()),
			Topic::Role(self.principal.role),
			Topic::Tenant(self.principal.tenant_id.clone()),
		];
		if self.gateway == GatewayKind::Chat {
			match self.ctx.conversations.conversations_for(&self.principal.user_id).await {
				Ok(list) => topics.extend(list.into_iter().map(|c| Topic::Conversation(c.id))),
				Err(e) => warn!(user_id = %self.principal.user_id, error = %e, "conversation lookup failed"),
			}
		}
		topics
	}

	/// Leave every room and drop the presence record.
	pub async fn close(&self) {
		let topics = self.ctx.broadcaster.hub().detach(self.conn_id).await;
		debug!(conn_id = %self.conn_id, topics = topics.len(), "detached");
		if let Err(e) = self.ctx.presence.unregister(&self.record).await {
			warn!(conn_id = %self.conn_id, user_id = %self.principal.user_id, error = %e, "presence unregister failed");
		}
	}

	/// Check that the account behind the connection is still allowed in.
	pub async fn revalidate(&self) -> Result<(), AuthError> {
		self.ctx.auth.revalidate(&self.principal).await
	}

	/// Frames to send after durable deliveries were dropped.
	pub async fn on_lagged(&self, dropped: u64) -> Vec<ServerEvent> {
		warn!(conn_id = %self.conn_id, dropped, "outbound queue lagged; asking client to resync");
		let mut out = vec![ServerEvent::NotificationResync(Empty {})];
		if let Ok(n) = self.ctx.notifications.unread_count(&self.principal.user_id).await {
			out.push(ServerEvent::unread_count(n));
		}
		out
	}

	/// Handle one client event. Returns a direct reply, if any. Broadcast results reach this
	/// connection through its outbound stream like everyone else's.
	pub async fn handle(&self, event: ClientEvent) -> Option<ServerEvent> {
		let name = event.name();
		if !event.allowed_on(self.gateway) {
			return Some(ServerEvent::error(
				ErrorCode::Forbidden,
				format!("{name} is not available on the {} gateway", self.gateway),
				Some(name),
			));
		}

		match self.dispatch(event).await {
			Ok(reply) => reply,
			Err(e) => {
				debug!(conn_id = %self.conn_id, event = name, error = %e, "client event rejected");
				Some(ServerEvent::error(e.code(), e.public_message(), Some(name)))
			}
		}
	}

	async fn dispatch(&self, event: ClientEvent) -> Result<Option<ServerEvent>, ServiceError> {
		let me = &self.principal;
		match event {
			ClientEvent::Auth(_) => Err(ServiceError::Invalid("already authenticated".to_string())),
			ClientEvent::MessageSend(p) => {
				self.ctx.auth.revalidate(me).await?;
				self.ctx
					.conversations
					.send_message(me, &p.conversation_id, p.content, p.attachments)
					.await?;
				Ok(None)
			}
			ClientEvent::MessageRead(r) => {
				self.ctx.conversations.mark_read(me, &r.conversation_id).await?;
				Ok(None)
			}
			ClientEvent::TypingStart(r) => self.typing(&r, true).await,
			ClientEvent::TypingStop(r) => self.typing(&r, false).await,
			ClientEvent::ConversationJoin(r) => {
				self.ctx.auth.revalidate(me).await?;
				self.ctx.conversations.require_participant(me, &r.conversation_id).await?;
				self.ctx
					.broadcaster
					.hub()
					.join(self.conn_id, Topic::Conversation(r.conversation_id.clone()))
					.await;
				Ok(Some(ServerEvent::ConversationJoined(r)))
			}
			ClientEvent::ConversationLeave(r) => {
				self.ctx
					.broadcaster
					.hub()
					.leave(self.conn_id, &Topic::Conversation(r.conversation_id.clone()))
					.await;
				Ok(Some(ServerEvent::ConversationLeft(r)))
			}
			ClientEvent::NotificationMarkRead(r) => {
				self.ctx.notifications.mark_read(&me.user_id, &r.notification_id).await?;
				Ok(None)
			}
			ClientEvent::NotificationMarkAllRead => {
				self.ctx.notifications.mark_all_read(&me.user_id).await?;
				Ok(None)
			}
		}
	}

	/// Typing indicators only go to rooms this connection is in.
	async fn typing(&self, r: &ConversationRef, started: bool) -> Result<Option<ServerEvent>, ServiceError> {
		let in_room = self
			.ctx
			.broadcaster
			.hub()
			.is_member(self.conn_id, &Topic::Conversation(r.conversation_id.clone()))
			.await;
		if !in_room {
			return Err(ServiceError::Forbidden(format!("not in conversation {}", r.conversation_id)));
		}
		self.ctx
			.conversations
			.typing(&self.principal, &r.conversation_id, started)
			.await;
		Ok(None)
	}
}

fn framing_error_code(e: &FramingError) -> ErrorCode {
	match e {
		FramingError::FrameTooLarge { .. } => ErrorCode::FrameTooLarge,
		FramingError::UnknownEvent(_) => ErrorCode::UnknownEvent,
		_ => ErrorCode::BadRequest,
	}
}

async fn send_event<W>(sink: &mut W, event: &ServerEvent, max_frame_bytes: usize) -> anyhow::Result<()>
where
	W: Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
	let text = match encode_frame(event, max_frame_bytes) {
		Ok(t) => t,
		Err(e) => {
			warn!(event = event.name(), error = %e, "dropping unencodable frame");
			return Ok(());
		}
	};
	sink.send(Message::Text(text.into()))
		.await
		.map_err(|e| anyhow!(e).context("websocket write failed"))
}

/// Wait for the first `auth` frame from a client that had no handshake credential.
async fn wait_for_auth<R>(stream: &mut R, max_frame_bytes: usize, timeout: Duration) -> Result<String, AuthError>
where
	R: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
	let first_text = async {
		while let Some(msg) = stream.next().await {
			match msg {
				Ok(Message::Text(t)) => return Some(t),
				Ok(Message::Ping(_) | Message::Pong(_)) => continue,
				_ => return None,
			}
		}
		None
	};

	let text = tokio::time::timeout(timeout, first_text)
		.await
		.ok()
		.flatten()
		.ok_or(AuthError::MissingCredential)?;

	match decode_client_event(text.as_str(), max_frame_bytes) {
		Ok(ClientEvent::Auth(a)) if !a.token.trim().is_empty() => Ok(a.token),
		Ok(_) => Err(AuthError::MissingCredential),
		Err(e) => Err(AuthError::Malformed(e.to_string())),
	}
}

/// Serve one upgraded websocket: authenticate, join rooms, then relay frames both ways until the
/// socket closes.
pub async fn handle_connection<S>(
	ws: WebSocketStream<S>,
	ctx: ServerContext,
	gateway: GatewayKind,
	credential: Option<(CredentialSource, String)>,
) -> anyhow::Result<()>
where
	S: AsyncRead + AsyncWrite + Unpin,
{
	struct ConnectionGaugeGuard;
	impl Drop for ConnectionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("campus_server_active_connections").decrement(1.0);
		}
	}

	metrics::gauge!("campus_server_active_connections").increment(1.0);
	let _conn_guard = ConnectionGaugeGuard;

	let max_frame = ctx.settings.max_frame_bytes;
	let (mut sink, mut stream) = ws.split();

	let token = match credential {
		Some((source, token)) => {
			debug!(source = source.as_str(), %gateway, "credential from handshake");
			Ok(token)
		}
		None => wait_for_auth(&mut stream, max_frame, ctx.settings.auth_timeout).await,
	};
	let authenticated = match token {
		Ok(token) => ctx.auth.authenticate(&token).await,
		Err(e) => Err(e),
	};
	let principal = match authenticated {
		Ok(p) => p,
		Err(e) => {
			metrics::counter!("campus_server_auth_failures_total").increment(1);
			warn!(%gateway, error = %e, "connection rejected");
			let reply = ServerEvent::error(ErrorCode::Unauthorized, "authentication failed", None);
			let _ = send_event(&mut sink, &reply, max_frame).await;
			let _ = sink.close().await;
			return Ok(());
		}
	};

	let session = Arc::new(Session::new(ctx.clone(), principal, gateway));
	info!(
		conn_id = %session.conn_id(),
		user_id = %session.principal().user_id,
		tenant = %session.principal().tenant_id,
		%gateway,
		"connection authenticated"
	);

	let (mut rx, initial) = session.open().await;
	let result = async {
		for ev in &initial {
			send_event(&mut sink, ev, max_frame).await?;
		}

		let mut revalidate = ctx.settings.revalidate_interval.map(|every| {
			let mut t = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
			t.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
			t
		});

		loop {
			tokio::select! {
				inbound = stream.next() => {
					let msg = match inbound {
						Some(Ok(m)) => m,
						Some(Err(e)) => {
							debug!(conn_id = %session.conn_id(), error = %e, "websocket read failed");
							break;
						}
						None => break,
					};
					match msg {
						Message::Text(text) => {
							let reply = match decode_client_event(text.as_str(), max_frame) {
								Ok(ev) => session.handle(ev).await,
								Err(e) => Some(ServerEvent::error(framing_error_code(&e), e.to_string(), None)),
							};
							if let Some(reply) = reply {
								send_event(&mut sink, &reply, max_frame).await?;
							}
						}
						Message::Binary(_) => {
							let reply = ServerEvent::error(ErrorCode::BadRequest, "binary frames are not supported", None);
							send_event(&mut sink, &reply, max_frame).await?;
						}
						Message::Close(_) => break,
						Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
					}
				}
				item = rx.recv() => {
					match item {
						Some(RoomHubItem::Event(ev)) => send_event(&mut sink, &ev, max_frame).await?,
						Some(RoomHubItem::Lagged { dropped }) => {
							for ev in session.on_lagged(dropped).await {
								send_event(&mut sink, &ev, max_frame).await?;
							}
						}
						None => break,
					}
				}
				_ = async {
					match revalidate.as_mut() {
						Some(t) => { t.tick().await; }
						None => std::future::pending::<()>().await,
					}
				} => {
					if let Err(e) = session.revalidate().await {
						info!(conn_id = %session.conn_id(), error = %e, "credential no longer valid; closing");
						let reply = ServerEvent::error(ErrorCode::Unauthorized, "session expired", None);
						let _ = send_event(&mut sink, &reply, max_frame).await;
						break;
					}
				}
			}
		}
		Ok::<(), anyhow::Error>(())
	}
	.await;

	session.close().await;
	let _ = sink.close().await;
	info!(conn_id = %session.conn_id(), user_id = %session.principal().user_id, "connection closed");
	result
}
