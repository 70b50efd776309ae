#![forbid(unsafe_code)]

use std::sync::Arc;

use campus_domain::events::{DomainEvent, EventPayload, NewMessageEvent};
use campus_domain::models::{
	Conversation, Message, NewAttachment, NewMessage, Participant, ParticipantRole, StudentRef, preview,
};
use campus_domain::{ConversationId, Role, Topic, UserId};
use campus_protocol::{GatewayKind, MessageNewPayload, MessageReadPayload, ServerEvent, TypingPayload};
use campus_util::time::unix_ms_now;
use tracing::{info, warn};

use crate::server::auth::Principal;
use crate::server::bus::BroadcastAdapter;
use crate::server::directory::Directory;
use crate::server::error::ServiceError;
use crate::server::fanout::{FanoutReport, NotificationService};
use crate::server::presence::PresenceRegistry;
use crate::server::resolver::RecipientGroup;
use crate::server::room_hub::MembershipCommand;
use crate::server::store::{ConversationStore, MessageQuery};

const PREVIEW_CHARS: usize = 100;
const MAX_BODY_CHARS: usize = 10_000;
const MAX_ATTACHMENTS: usize = 10;

/// Conversations between staff and guardians about one student.
pub struct ConversationService {
	store: Arc<dyn ConversationStore>,
	directory: Arc<dyn Directory>,
	notifications: Arc<NotificationService>,
	presence: Arc<PresenceRegistry>,
	broadcaster: BroadcastAdapter,
}

impl ConversationService {
	pub fn new(
		store: Arc<dyn ConversationStore>,
		directory: Arc<dyn Directory>,
		notifications: Arc<NotificationService>,
		presence: Arc<PresenceRegistry>,
		broadcaster: BroadcastAdapter,
	) -> Self {
		Self {
			store,
			directory,
			notifications,
			presence,
			broadcaster,
		}
	}

	/// Create a conversation about `student` between the creator and `others`.
	///
	/// Every participant must be an active teacher, parent or admin of the creator's tenant, and
	/// there must be at least two distinct participants. Online participants join the new room
	/// immediately, on whatever node they are connected to.
	pub async fn create(
		&self,
		creator: &Principal,
		student: StudentRef,
		others: &[UserId],
	) -> Result<Conversation, ServiceError> {
		if ParticipantRole::from_role(creator.role).is_none() {
			return Err(ServiceError::Forbidden("students cannot start conversations".to_string()));
		}

		let mut ids: Vec<UserId> = vec![creator.user_id.clone()];
		for id in others {
			if !ids.contains(id) {
				ids.push(id.clone());
			}
		}
		if ids.len() < 2 {
			return Err(ServiceError::Invalid(
				"a conversation needs at least two distinct participants".to_string(),
			));
		}

		let conversation_id = ConversationId::generate();
		let mut participants = Vec::with_capacity(ids.len());
		for id in &ids {
			let account = self
				.directory
				.account(id)
				.await?
				.filter(|a| a.is_usable() && a.tenant_id == creator.tenant_id)
				.ok_or_else(|| ServiceError::Invalid(format!("unknown participant {id}")))?;
			let role = ParticipantRole::from_role(account.role)
				.ok_or_else(|| ServiceError::Invalid(format!("{id} cannot take part in conversations")))?;
			participants.push(Participant {
				conversation_id: conversation_id.clone(),
				user_id: account.id,
				role,
				display_name: account.display_name,
			});
		}

		let conversation = Conversation {
			id: conversation_id,
			tenant_id: creator.tenant_id.clone(),
			student,
			created_by: creator.user_id.clone(),
			last_message_preview: None,
			last_message_at_ms: None,
			created_at_ms: unix_ms_now(),
		};
		self.store.create_conversation(&conversation, &participants).await?;

		let room = Topic::Conversation(conversation.id.clone());
		for p in &participants {
			self.broadcaster
				.publish_membership(&p.user_id, MembershipCommand::Join(room.clone()))
				.await;
		}

		info!(
			conversation = %conversation.id,
			tenant = %conversation.tenant_id,
			participants = participants.len(),
			"conversation created"
		);
		Ok(conversation)
	}

	/// Delete a conversation. Only its creator or a tenant admin may do this.
	pub async fn delete(&self, actor: &Principal, id: &ConversationId) -> Result<(), ServiceError> {
		let conversation = self.visible_conversation(actor, id).await?;
		if conversation.created_by != actor.user_id && actor.role != Role::Admin {
			return Err(ServiceError::Forbidden("only the creator or an admin may delete".to_string()));
		}

		let participants = self.store.participants(id).await?;
		self.store.delete_conversation(id).await?;

		let room = Topic::Conversation(id.clone());
		for p in &participants {
			self.broadcaster
				.publish_membership(&p.user_id, MembershipCommand::Leave(room.clone()))
				.await;
		}
		info!(conversation = %id, "conversation deleted");
		Ok(())
	}

	/// Conversation `id` if `user` takes part in it.
	pub async fn require_participant(&self, user: &Principal, id: &ConversationId) -> Result<Conversation, ServiceError> {
		let conversation = self.visible_conversation(user, id).await?;
		let participants = self.store.participants(id).await?;
		if !participants.iter().any(|p| p.user_id == user.user_id) {
			return Err(ServiceError::Forbidden(format!("not a participant of {id}")));
		}
		Ok(conversation)
	}

	async fn visible_conversation(&self, user: &Principal, id: &ConversationId) -> Result<Conversation, ServiceError> {
		match self.store.conversation(id).await? {
			Some(c) if c.tenant_id == user.tenant_id => Ok(c),
			_ => Err(ServiceError::NotFound(format!("conversation {id}"))),
		}
	}

	/// Append a message and deliver it.
	///
	/// Connections in the conversation room get `message:new` live. Participants with no live
	/// connection anywhere get a persisted "new message" notification instead, and tenant admins
	/// always get their variant.
	pub async fn send_message(
		&self,
		sender: &Principal,
		id: &ConversationId,
		body: String,
		attachments: Vec<NewAttachment>,
	) -> Result<Message, ServiceError> {
		let body = body.trim().to_string();
		if body.is_empty() && attachments.is_empty() {
			return Err(ServiceError::Invalid("message is empty".to_string()));
		}
		if body.chars().count() > MAX_BODY_CHARS {
			return Err(ServiceError::Invalid("message is too long".to_string()));
		}
		if attachments.len() > MAX_ATTACHMENTS {
			return Err(ServiceError::Invalid("too many attachments".to_string()));
		}

		let conversation = self.require_participant(sender, id).await?;

		let short = if body.is_empty() {
			format!("{} attachment(s)", attachments.len())
		} else {
			preview(&body, PREVIEW_CHARS)
		};
		let message = self
			.store
			.append_message(
				NewMessage {
					conversation_id: id.clone(),
					sender_id: sender.user_id.clone(),
					sender_name: sender.display_name.clone(),
					sender_role: sender.role,
					body,
					attachments,
				},
				short.clone(),
				unix_ms_now(),
			)
			.await?;

		self.broadcaster
			.publish(
				Topic::Conversation(id.clone()),
				ServerEvent::MessageNew(MessageNewPayload {
					message: message.clone(),
					conversation_id: id.clone(),
				}),
			)
			.await;

		let event = DomainEvent::new(
			conversation.tenant_id.clone(),
			EventPayload::NewMessage(NewMessageEvent {
				conversation_id: id.clone(),
				student_name: conversation.student.name.clone(),
				sender_id: sender.user_id.clone(),
				sender_name: sender.display_name.clone(),
				preview: short,
			}),
		)
		.with_actor(sender.user_id.clone())
		.with_idempotency_key(format!("message:{}", message.id));
		self.notify_offline(&event).await;

		Ok(message)
	}

	async fn notify_offline(&self, event: &DomainEvent) -> FanoutReport {
		let recipients = match self.notifications.engine().resolve(event).await {
			Ok(r) => r,
			Err(e) => {
				metrics::counter!("campus_fanout_failures_total", "stage" => "resolve").increment(1);
				warn!(error = %e, "message recipients could not be resolved");
				return FanoutReport::default();
			}
		};

		// Only a chat connection receives `message:new`; everyone else needs the notification.
		let mut offline = Vec::with_capacity(recipients.len());
		for r in recipients {
			if r.group == RecipientGroup::Participant {
				match self.presence.is_connected_on(&r.user_id, GatewayKind::Chat).await {
					Ok(true) => continue,
					Ok(false) => {}
					Err(e) => warn!(user = %r.user_id, error = %e, "presence lookup failed; notifying"),
				}
			}
			offline.push(r);
		}

		self.notifications
			.deliver(&event.tenant_id, offline, event.idempotency_key.as_deref())
			.await
	}

	/// Record read receipts for everything `reader` has not read yet. Broadcasts `message:read`
	/// only when at least one receipt was created.
	pub async fn mark_read(&self, reader: &Principal, id: &ConversationId) -> Result<u64, ServiceError> {
		self.require_participant(reader, id).await?;
		let created = self.store.mark_conversation_read(id, &reader.user_id, unix_ms_now()).await?;
		if created > 0 {
			self.broadcaster
				.publish(
					Topic::Conversation(id.clone()),
					ServerEvent::MessageRead(MessageReadPayload {
						conversation_id: id.clone(),
						read_by: reader.user_id.clone(),
						read_by_name: reader.display_name.clone(),
					}),
				)
				.await;
		}
		Ok(created)
	}

	/// Relay a typing indicator to the conversation room. The caller checks room membership.
	pub async fn typing(&self, actor: &Principal, id: &ConversationId, started: bool) {
		let payload = TypingPayload {
			conversation_id: id.clone(),
			user_id: actor.user_id.clone(),
			user_name: actor.display_name.clone(),
		};
		let event = if started {
			ServerEvent::TypingStart(payload)
		} else {
			ServerEvent::TypingStop(payload)
		};
		self.broadcaster.publish(Topic::Conversation(id.clone()), event).await;
	}

	pub async fn list_messages(
		&self,
		reader: &Principal,
		id: &ConversationId,
		query: MessageQuery,
	) -> Result<Vec<Message>, ServiceError> {
		self.require_participant(reader, id).await?;
		Ok(self.store.list_messages(id, query).await?)
	}

	pub async fn conversations_for(&self, user: &UserId) -> Result<Vec<Conversation>, ServiceError> {
		Ok(self.store.conversations_for_user(user).await?)
	}

	pub async fn participants(&self, user: &Principal, id: &ConversationId) -> Result<Vec<Participant>, ServiceError> {
		self.require_participant(user, id).await?;
		Ok(self.store.participants(id).await?)
	}
}
