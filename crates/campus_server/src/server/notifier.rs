#![forbid(unsafe_code)]

//! Typed entry point for the services that own tasks, exams, attendance and payments.
//!
//! Each method takes the denormalized payload plus the tenant, wraps it in a [`DomainEvent`] with a
//! stable idempotency key, and hands it to the fan-out service.

use std::sync::Arc;

use campus_domain::events::{
	AttendanceMarked, DomainEvent, EventPayload, ExamCreated, ExamGraded, PaymentConfirmed, PaymentOverdue,
	PaymentReminder, TaskCreated, TaskGraded, TaskOverdue,
};
use campus_domain::models::{Message, NewAttachment};
use campus_domain::{ConversationId, TenantId, UserId};

use crate::server::auth::Principal;
use crate::server::conversations::ConversationService;
use crate::server::error::ServiceError;
use crate::server::fanout::{FanoutReport, NotificationService};

#[derive(Clone)]
pub struct Notifier {
	notifications: Arc<NotificationService>,
	conversations: Arc<ConversationService>,
}

impl Notifier {
	pub fn new(notifications: Arc<NotificationService>, conversations: Arc<ConversationService>) -> Self {
		Self {
			notifications,
			conversations,
		}
	}

	async fn emit(&self, tenant: TenantId, actor: Option<UserId>, key: String, payload: EventPayload) -> FanoutReport {
		let mut event = DomainEvent::new(tenant, payload).with_idempotency_key(key);
		if let Some(actor) = actor {
			event = event.with_actor(actor);
		}
		self.notifications.fanout(&event).await
	}

	pub async fn task_created(&self, tenant: TenantId, actor: Option<UserId>, task: TaskCreated) -> FanoutReport {
		let key = format!("task-created:{}", task.task_id);
		self.emit(tenant, actor, key, EventPayload::TaskCreated(task)).await
	}

	/// A regrade with a different score notifies again; the same grade twice does not.
	pub async fn task_graded(&self, tenant: TenantId, actor: Option<UserId>, grade: TaskGraded) -> FanoutReport {
		let key = format!("task-graded:{}:{}:{}", grade.task_id, grade.student.id, grade.score);
		self.emit(tenant, actor, key, EventPayload::TaskGraded(grade)).await
	}

	pub async fn task_overdue(&self, tenant: TenantId, overdue: TaskOverdue) -> FanoutReport {
		let key = format!("task-overdue:{}:{}", overdue.task_id, overdue.due_date);
		self.emit(tenant, None, key, EventPayload::TaskOverdue(overdue)).await
	}

	pub async fn exam_created(&self, tenant: TenantId, actor: Option<UserId>, exam: ExamCreated) -> FanoutReport {
		let key = format!("exam-created:{}", exam.exam_id);
		self.emit(tenant, actor, key, EventPayload::ExamCreated(exam)).await
	}

	pub async fn exam_graded(&self, tenant: TenantId, actor: Option<UserId>, grade: ExamGraded) -> FanoutReport {
		let key = format!("exam-graded:{}:{}:{}", grade.exam_id, grade.student.id, grade.score);
		self.emit(tenant, actor, key, EventPayload::ExamGraded(grade)).await
	}

	pub async fn attendance_marked(
		&self,
		tenant: TenantId,
		actor: Option<UserId>,
		mark: AttendanceMarked,
	) -> FanoutReport {
		let key = format!(
			"attendance:{}:{}:{}:{}",
			mark.student.id,
			mark.course_name,
			mark.date,
			mark.status.as_str()
		);
		self.emit(tenant, actor, key, EventPayload::AttendanceMarked(mark)).await
	}

	pub async fn payment_confirmed(
		&self,
		tenant: TenantId,
		actor: Option<UserId>,
		payment: PaymentConfirmed,
	) -> FanoutReport {
		let key = format!("payment-confirmed:{}", payment.payment_id);
		self.emit(tenant, actor, key, EventPayload::PaymentConfirmed(payment)).await
	}

	/// Reminders are keyed by the day they are sent for, so one sweep per day notifies once.
	pub async fn payment_reminder(&self, tenant: TenantId, reminder: PaymentReminder) -> FanoutReport {
		let key = format!(
			"payment-reminder:{}:{}:{}",
			reminder.payment_id, reminder.due_date, reminder.days_until_due
		);
		self.emit(tenant, None, key, EventPayload::PaymentReminder(reminder)).await
	}

	pub async fn payment_overdue(&self, tenant: TenantId, overdue: PaymentOverdue) -> FanoutReport {
		let key = format!(
			"payment-overdue:{}:{}:{}",
			overdue.payment_id, overdue.due_date, overdue.days_overdue
		);
		self.emit(tenant, None, key, EventPayload::PaymentOverdue(overdue)).await
	}

	/// Send a chat message on behalf of a service (for example a REST endpoint).
	pub async fn chat_message(
		&self,
		sender: &Principal,
		conversation: &ConversationId,
		body: String,
		attachments: Vec<NewAttachment>,
	) -> Result<Message, ServiceError> {
		self.conversations
			.send_message(sender, conversation, body, attachments)
			.await
	}
}
