#![forbid(unsafe_code)]

//! Recipient rules, one per event kind, with per-group templates.

use std::sync::Arc;

use campus_domain::events::{AttendanceStatus, DomainEvent, EventKind, EventPayload};
use campus_domain::models::{NotificationCategory, NotificationContent};
use chrono::NaiveDate;
use serde_json::json;

use crate::server::resolver::{Audience, RecipientRule, Selector};

pub fn default_rules() -> Vec<Arc<dyn RecipientRule>> {
	vec![
		Arc::new(TaskCreatedRule),
		Arc::new(TaskGradedRule),
		Arc::new(TaskOverdueRule),
		Arc::new(ExamCreatedRule),
		Arc::new(ExamGradedRule),
		Arc::new(AttendanceMarkedRule),
		Arc::new(PaymentConfirmedRule),
		Arc::new(PaymentReminderRule),
		Arc::new(PaymentOverdueRule),
		Arc::new(NewMessageRule),
	]
}

fn day(d: NaiveDate) -> String {
	d.format("%Y-%m-%d").to_string()
}

fn due_suffix(due: Option<NaiveDate>) -> String {
	due.map(|d| format!(", due {}", day(d))).unwrap_or_default()
}

fn content(title: String, body: String, category: NotificationCategory) -> NotificationContent {
	NotificationContent::new(title, body, category)
}

pub struct TaskCreatedRule;

impl RecipientRule for TaskCreatedRule {
	fn kind(&self) -> EventKind {
		EventKind::TaskCreated
	}

	fn audiences(&self, event: &DomainEvent) -> Vec<Audience> {
		let EventPayload::TaskCreated(p) = &event.payload else {
			return Vec::new();
		};
		let link = format!("/tasks/{}", p.task_id);
		let meta = json!({"event": self.kind().as_str(), "taskId": p.task_id, "courseId": p.course_id});
		let due = due_suffix(p.due_date);

		vec![
			Audience::new(
				Selector::Roster(p.course_id.clone()),
				content(
					format!("New task: {}", p.title),
					format!("A new task \"{}\" was published in {}{due}.", p.title, p.course_name),
					NotificationCategory::Info,
				)
				.with_link(link.clone())
				.with_metadata(meta.clone()),
			),
			Audience::new(
				Selector::RosterGuardians(p.course_id.clone()),
				content(
					format!("New task in {}", p.course_name),
					format!("\"{}\" was assigned to your child in {}{due}.", p.title, p.course_name),
					NotificationCategory::Info,
				)
				.with_link(link.clone())
				.with_metadata(meta.clone()),
			),
			Audience::new(
				Selector::TenantAdmins,
				content(
					format!("Task published in {}", p.course_name),
					format!("\"{}\" was published for {}{due}.", p.title, p.course_name),
					NotificationCategory::Info,
				)
				.with_link(link)
				.with_metadata(meta),
			),
		]
	}
}

pub struct TaskGradedRule;

impl RecipientRule for TaskGradedRule {
	fn kind(&self) -> EventKind {
		EventKind::TaskGraded
	}

	fn audiences(&self, event: &DomainEvent) -> Vec<Audience> {
		let EventPayload::TaskGraded(p) = &event.payload else {
			return Vec::new();
		};
		let link = format!("/tasks/{}", p.task_id);
		let meta = json!({
			"event": self.kind().as_str(),
			"taskId": p.task_id,
			"studentId": p.student.id,
			"score": p.score,
			"maxScore": p.max_score,
		});
		let score = format!("{}/{}", p.score, p.max_score);

		vec![
			Audience::new(
				Selector::Students(vec![p.student.id.clone()]),
				content(
					format!("Task graded: {score}"),
					format!("Your submission for \"{}\" in {} was graded: {score}.", p.title, p.course_name),
					NotificationCategory::Success,
				)
				.with_link(link.clone())
				.with_metadata(meta.clone()),
			),
			Audience::new(
				Selector::GuardiansOf(vec![p.student.id.clone()]),
				content(
					format!("{} received a grade", p.student.name),
					format!("{} scored {score} on \"{}\" in {}.", p.student.name, p.title, p.course_name),
					NotificationCategory::Info,
				)
				.with_link(link.clone())
				.with_metadata(meta.clone()),
			),
			Audience::new(
				Selector::TenantAdmins,
				content(
					format!("Task graded in {}", p.course_name),
					format!("{} was graded {score} on \"{}\".", p.student.name, p.title),
					NotificationCategory::Info,
				)
				.with_link(link)
				.with_metadata(meta),
			),
		]
	}
}

pub struct TaskOverdueRule;

impl RecipientRule for TaskOverdueRule {
	fn kind(&self) -> EventKind {
		EventKind::TaskOverdue
	}

	fn audiences(&self, event: &DomainEvent) -> Vec<Audience> {
		let EventPayload::TaskOverdue(p) = &event.payload else {
			return Vec::new();
		};
		let link = format!("/tasks/{}", p.task_id);

		let mut out = Vec::with_capacity(p.students.len() * 2);
		for student in &p.students {
			let meta = json!({"event": self.kind().as_str(), "taskId": p.task_id, "studentId": student.id});
			out.push(Audience::new(
				Selector::Students(vec![student.id.clone()]),
				content(
					format!("Task overdue: {}", p.title),
					format!("\"{}\" in {} was due {} and has not been submitted.", p.title, p.course_name, day(p.due_date)),
					NotificationCategory::Warning,
				)
				.with_link(link.clone())
				.with_metadata(meta.clone()),
			));
			out.push(Audience::new(
				Selector::GuardiansOf(vec![student.id.clone()]),
				content(
					format!("{} missed a deadline", student.name),
					format!(
						"{} has not submitted \"{}\" in {} (due {}).",
						student.name,
						p.title,
						p.course_name,
						day(p.due_date)
					),
					NotificationCategory::Warning,
				)
				.with_link(link.clone())
				.with_metadata(meta),
			));
		}
		out
	}
}

pub struct ExamCreatedRule;

impl RecipientRule for ExamCreatedRule {
	fn kind(&self) -> EventKind {
		EventKind::ExamCreated
	}

	fn audiences(&self, event: &DomainEvent) -> Vec<Audience> {
		let EventPayload::ExamCreated(p) = &event.payload else {
			return Vec::new();
		};
		let link = format!("/exams/{}", p.exam_id);
		let meta = json!({"event": self.kind().as_str(), "examId": p.exam_id, "courseId": p.course_id});
		let date = day(p.exam_date);

		vec![
			Audience::new(
				Selector::Roster(p.course_id.clone()),
				content(
					format!("Exam scheduled: {}", p.title),
					format!("{} has an exam \"{}\" on {date}.", p.course_name, p.title),
					NotificationCategory::Info,
				)
				.with_link(link.clone())
				.with_metadata(meta.clone()),
			),
			Audience::new(
				Selector::RosterGuardians(p.course_id.clone()),
				content(
					format!("Upcoming exam in {}", p.course_name),
					format!("Your child has the exam \"{}\" in {} on {date}.", p.title, p.course_name),
					NotificationCategory::Info,
				)
				.with_link(link.clone())
				.with_metadata(meta.clone()),
			),
			Audience::new(
				Selector::TenantAdmins,
				content(
					format!("Exam scheduled in {}", p.course_name),
					format!("\"{}\" is scheduled for {date}.", p.title),
					NotificationCategory::Info,
				)
				.with_link(link)
				.with_metadata(meta),
			),
		]
	}
}

pub struct ExamGradedRule;

impl RecipientRule for ExamGradedRule {
	fn kind(&self) -> EventKind {
		EventKind::ExamGraded
	}

	fn audiences(&self, event: &DomainEvent) -> Vec<Audience> {
		let EventPayload::ExamGraded(p) = &event.payload else {
			return Vec::new();
		};
		let link = format!("/exams/{}", p.exam_id);
		let meta = json!({
			"event": self.kind().as_str(),
			"examId": p.exam_id,
			"studentId": p.student.id,
			"score": p.score,
			"maxScore": p.max_score,
		});
		let score = format!("{}/{}", p.score, p.max_score);

		vec![
			Audience::new(
				Selector::Students(vec![p.student.id.clone()]),
				content(
					format!("Exam graded: {score}"),
					format!("Your exam \"{}\" in {} was graded: {score}.", p.title, p.course_name),
					NotificationCategory::Success,
				)
				.with_link(link.clone())
				.with_metadata(meta.clone()),
			),
			Audience::new(
				Selector::GuardiansOf(vec![p.student.id.clone()]),
				content(
					format!("{} received an exam grade", p.student.name),
					format!("{} scored {score} on the exam \"{}\" in {}.", p.student.name, p.title, p.course_name),
					NotificationCategory::Info,
				)
				.with_link(link.clone())
				.with_metadata(meta.clone()),
			),
			Audience::new(
				Selector::TenantAdmins,
				content(
					format!("Exam graded in {}", p.course_name),
					format!("{} was graded {score} on \"{}\".", p.student.name, p.title),
					NotificationCategory::Info,
				)
				.with_link(link)
				.with_metadata(meta),
			),
		]
	}
}

pub struct AttendanceMarkedRule;

impl RecipientRule for AttendanceMarkedRule {
	fn kind(&self) -> EventKind {
		EventKind::AttendanceMarked
	}

	fn audiences(&self, event: &DomainEvent) -> Vec<Audience> {
		let EventPayload::AttendanceMarked(p) = &event.payload else {
			return Vec::new();
		};
		let category = match p.status {
			AttendanceStatus::Absent | AttendanceStatus::Late => NotificationCategory::Warning,
			AttendanceStatus::Present | AttendanceStatus::Excused => NotificationCategory::Info,
		};
		let status = p.status.as_str();
		let date = day(p.date);
		let meta = json!({
			"event": self.kind().as_str(),
			"studentId": p.student.id,
			"status": status,
			"date": date,
		});

		let mut out = vec![
			Audience::new(
				Selector::Students(vec![p.student.id.clone()]),
				content(
					format!("Attendance: {status}"),
					format!("You were marked {status} in {} on {date}.", p.course_name),
					category,
				)
				.with_link("/attendance")
				.with_metadata(meta.clone()),
			),
			Audience::new(
				Selector::GuardiansOf(vec![p.student.id.clone()]),
				content(
					format!("{} marked {status}", p.student.name),
					format!("{} was marked {status} in {} on {date}.", p.student.name, p.course_name),
					category,
				)
				.with_link("/attendance")
				.with_metadata(meta.clone()),
			),
		];

		if p.status == AttendanceStatus::Absent {
			out.push(Audience::new(
				Selector::TenantAdmins,
				content(
					format!("Absence: {}", p.student.name),
					format!("{} was absent from {} on {date}.", p.student.name, p.course_name),
					NotificationCategory::Warning,
				)
				.with_link("/attendance")
				.with_metadata(meta),
			));
		}
		out
	}
}

pub struct PaymentConfirmedRule;

impl RecipientRule for PaymentConfirmedRule {
	fn kind(&self) -> EventKind {
		EventKind::PaymentConfirmed
	}

	fn audiences(&self, event: &DomainEvent) -> Vec<Audience> {
		let EventPayload::PaymentConfirmed(p) = &event.payload else {
			return Vec::new();
		};
		let link = format!("/payments/{}", p.payment_id);
		let meta = json!({"event": self.kind().as_str(), "paymentId": p.payment_id, "studentId": p.student.id});

		vec![
			Audience::new(
				Selector::GuardiansOf(vec![p.student.id.clone()]),
				content(
					"Payment confirmed".to_string(),
					format!("{} for {} ({}) was received.", p.amount, p.description, p.student.name),
					NotificationCategory::Success,
				)
				.with_link(link.clone())
				.with_metadata(meta.clone()),
			),
			Audience::new(
				Selector::TenantAdmins,
				content(
					format!("Payment received: {}", p.student.name),
					format!("{} for {}.", p.amount, p.description),
					NotificationCategory::Success,
				)
				.with_link(link)
				.with_metadata(meta),
			),
		]
	}
}

pub struct PaymentReminderRule;

impl RecipientRule for PaymentReminderRule {
	fn kind(&self) -> EventKind {
		EventKind::PaymentReminder
	}

	fn audiences(&self, event: &DomainEvent) -> Vec<Audience> {
		let EventPayload::PaymentReminder(p) = &event.payload else {
			return Vec::new();
		};
		let title = match p.days_until_due {
			0 => "Payment due today".to_string(),
			1 => "Payment due tomorrow".to_string(),
			n => format!("Payment due in {n} days"),
		};
		let category = if p.days_until_due <= 3 {
			NotificationCategory::Warning
		} else {
			NotificationCategory::Info
		};

		vec![Audience::new(
			Selector::GuardiansOf(vec![p.student.id.clone()]),
			content(
				title,
				format!(
					"{} for {} ({}) is due on {}.",
					p.amount,
					p.description,
					p.student.name,
					day(p.due_date)
				),
				category,
			)
			.with_link(format!("/payments/{}", p.payment_id))
			.with_metadata(json!({
				"event": self.kind().as_str(),
				"paymentId": p.payment_id,
				"daysUntilDue": p.days_until_due,
			})),
		)]
	}
}

pub struct PaymentOverdueRule;

impl RecipientRule for PaymentOverdueRule {
	fn kind(&self) -> EventKind {
		EventKind::PaymentOverdue
	}

	fn audiences(&self, event: &DomainEvent) -> Vec<Audience> {
		let EventPayload::PaymentOverdue(p) = &event.payload else {
			return Vec::new();
		};
		let link = format!("/payments/{}", p.payment_id);
		let meta = json!({
			"event": self.kind().as_str(),
			"paymentId": p.payment_id,
			"daysOverdue": p.days_overdue,
		});
		let days = if p.days_overdue == 1 {
			"1 day".to_string()
		} else {
			format!("{} days", p.days_overdue)
		};

		vec![
			Audience::new(
				Selector::GuardiansOf(vec![p.student.id.clone()]),
				content(
					"Payment overdue".to_string(),
					format!(
						"{} for {} ({}) is {days} overdue (due {}).",
						p.amount,
						p.description,
						p.student.name,
						day(p.due_date)
					),
					NotificationCategory::Error,
				)
				.with_link(link.clone())
				.with_metadata(meta.clone()),
			),
			Audience::new(
				Selector::TenantAdmins,
				content(
					format!("Overdue payment: {}", p.student.name),
					format!("{} for {} is {days} overdue.", p.amount, p.description),
					NotificationCategory::Warning,
				)
				.with_link(link)
				.with_metadata(meta),
			),
		]
	}
}

pub struct NewMessageRule;

impl RecipientRule for NewMessageRule {
	fn kind(&self) -> EventKind {
		EventKind::NewMessage
	}

	fn audiences(&self, event: &DomainEvent) -> Vec<Audience> {
		let EventPayload::NewMessage(p) = &event.payload else {
			return Vec::new();
		};
		let link = format!("/messages/{}", p.conversation_id);
		let meta = json!({
			"event": self.kind().as_str(),
			"conversationId": p.conversation_id,
			"senderId": p.sender_id,
		});

		vec![
			Audience::new(
				Selector::Participants(p.conversation_id.clone()),
				content(
					format!("New message from {}", p.sender_name),
					p.preview.clone(),
					NotificationCategory::Info,
				)
				.with_link(link.clone())
				.with_metadata(meta.clone()),
			),
			Audience::new(
				Selector::TenantAdmins,
				content(
					format!("New message about {}", p.student_name),
					format!("{}: {}", p.sender_name, p.preview),
					NotificationCategory::Info,
				)
				.with_link(link)
				.with_metadata(meta),
			),
		]
	}
}
