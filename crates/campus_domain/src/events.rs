//! Typed domain events produced by CRUD services and the sweep trigger.
//!
//! Payloads carry every value the notification text needs; the fan-out core never calls a domain
//! service back.

use core::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::models::StudentRef;
use crate::{ConversationId, CourseId, ExamId, PaymentId, TaskId, TenantId, UserId};

/// Event discriminant used to select a recipient rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
	TaskCreated,
	TaskGraded,
	TaskOverdue,
	ExamCreated,
	ExamGraded,
	AttendanceMarked,
	PaymentConfirmed,
	PaymentReminder,
	PaymentOverdue,
	NewMessage,
}

impl EventKind {
	pub const ALL: [EventKind; 10] = [
		EventKind::TaskCreated,
		EventKind::TaskGraded,
		EventKind::TaskOverdue,
		EventKind::ExamCreated,
		EventKind::ExamGraded,
		EventKind::AttendanceMarked,
		EventKind::PaymentConfirmed,
		EventKind::PaymentReminder,
		EventKind::PaymentOverdue,
		EventKind::NewMessage,
	];

	pub const fn as_str(self) -> &'static str {
		match self {
			EventKind::TaskCreated => "task_created",
			EventKind::TaskGraded => "task_graded",
			EventKind::TaskOverdue => "task_overdue",
			EventKind::ExamCreated => "exam_created",
			EventKind::ExamGraded => "exam_graded",
			EventKind::AttendanceMarked => "attendance_marked",
			EventKind::PaymentConfirmed => "payment_confirmed",
			EventKind::PaymentReminder => "payment_reminder",
			EventKind::PaymentOverdue => "payment_overdue",
			EventKind::NewMessage => "new_message",
		}
	}
}

impl fmt::Display for EventKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// A domain event addressed to the fan-out engine.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainEvent {
	pub tenant_id: TenantId,
	/// User who caused the event; never notified about their own action.
	pub actor: Option<UserId>,
	/// Makes repeated triggers of the same logical event no-ops.
	pub idempotency_key: Option<String>,
	pub payload: EventPayload,
}

impl DomainEvent {
	pub fn new(tenant_id: TenantId, payload: EventPayload) -> Self {
		Self {
			tenant_id,
			actor: None,
			idempotency_key: None,
			payload,
		}
	}

	pub fn with_actor(mut self, actor: UserId) -> Self {
		self.actor = Some(actor);
		self
	}

	pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
		self.idempotency_key = Some(key.into());
		self
	}

	pub fn kind(&self) -> EventKind {
		self.payload.kind()
	}
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
	TaskCreated(TaskCreated),
	TaskGraded(TaskGraded),
	TaskOverdue(TaskOverdue),
	ExamCreated(ExamCreated),
	ExamGraded(ExamGraded),
	AttendanceMarked(AttendanceMarked),
	PaymentConfirmed(PaymentConfirmed),
	PaymentReminder(PaymentReminder),
	PaymentOverdue(PaymentOverdue),
	NewMessage(NewMessageEvent),
}

impl EventPayload {
	pub fn kind(&self) -> EventKind {
		match self {
			EventPayload::TaskCreated(_) => EventKind::TaskCreated,
			EventPayload::TaskGraded(_) => EventKind::TaskGraded,
			EventPayload::TaskOverdue(_) => EventKind::TaskOverdue,
			EventPayload::ExamCreated(_) => EventKind::ExamCreated,
			EventPayload::ExamGraded(_) => EventKind::ExamGraded,
			EventPayload::AttendanceMarked(_) => EventKind::AttendanceMarked,
			EventPayload::PaymentConfirmed(_) => EventKind::PaymentConfirmed,
			EventPayload::PaymentReminder(_) => EventKind::PaymentReminder,
			EventPayload::PaymentOverdue(_) => EventKind::PaymentOverdue,
			EventPayload::NewMessage(_) => EventKind::NewMessage,
		}
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskCreated {
	pub task_id: TaskId,
	pub title: String,
	pub course_id: CourseId,
	pub course_name: String,
	pub due_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskGraded {
	pub task_id: TaskId,
	pub title: String,
	pub course_name: String,
	pub student: StudentRef,
	pub score: f64,
	pub max_score: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskOverdue {
	pub task_id: TaskId,
	pub title: String,
	pub course_name: String,
	pub due_date: NaiveDate,
	/// Students without a completed submission.
	pub students: Vec<StudentRef>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExamCreated {
	pub exam_id: ExamId,
	pub title: String,
	pub course_id: CourseId,
	pub course_name: String,
	pub exam_date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExamGraded {
	pub exam_id: ExamId,
	pub title: String,
	pub course_name: String,
	pub student: StudentRef,
	pub score: f64,
	pub max_score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttendanceStatus {
	Present,
	Absent,
	Late,
	Excused,
}

impl AttendanceStatus {
	pub const fn as_str(self) -> &'static str {
		match self {
			AttendanceStatus::Present => "present",
			AttendanceStatus::Absent => "absent",
			AttendanceStatus::Late => "late",
			AttendanceStatus::Excused => "excused",
		}
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttendanceMarked {
	pub student: StudentRef,
	pub course_name: String,
	pub date: NaiveDate,
	pub status: AttendanceStatus,
}

/// Amount in minor units plus ISO currency code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Money {
	pub amount_cents: i64,
	pub currency: String,
}

impl Money {
	pub fn new(amount_cents: i64, currency: impl Into<String>) -> Self {
		Self {
			amount_cents,
			currency: currency.into(),
		}
	}
}

impl fmt::Display for Money {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let sign = if self.amount_cents < 0 { "-" } else { "" };
		let abs = self.amount_cents.unsigned_abs();
		write!(f, "{sign}{}.{:02} {}", abs / 100, abs % 100, self.currency)
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct PaymentConfirmed {
	pub payment_id: PaymentId,
	pub student: StudentRef,
	pub amount: Money,
	pub description: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PaymentReminder {
	pub payment_id: PaymentId,
	pub student: StudentRef,
	pub amount: Money,
	pub description: String,
	pub due_date: NaiveDate,
	pub days_until_due: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PaymentOverdue {
	pub payment_id: PaymentId,
	pub student: StudentRef,
	pub amount: Money,
	pub description: String,
	pub due_date: NaiveDate,
	pub days_overdue: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewMessageEvent {
	pub conversation_id: ConversationId,
	pub student_name: String,
	pub sender_id: UserId,
	pub sender_name: String,
	pub preview: String,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn money_formats_minor_units() {
		assert_eq!(Money::new(12050, "EUR").to_string(), "120.50 EUR");
		assert_eq!(Money::new(5, "USD").to_string(), "0.05 USD");
		assert_eq!(Money::new(-100, "USD").to_string(), "-1.00 USD");
	}

	#[test]
	fn kinds_are_distinct() {
		let names: std::collections::HashSet<_> = EventKind::ALL.iter().map(|k| k.as_str()).collect();
		assert_eq!(names.len(), EventKind::ALL.len());
	}
}
