#![forbid(unsafe_code)]

//! Time-triggered notifications: payment reminders, overdue payments and tasks, and retention of
//! read notifications.

use std::sync::Arc;

use campus_domain::events::{PaymentOverdue, PaymentReminder, TaskOverdue};
use campus_util::time::{days_before_ms, unix_ms_now};
use chrono::{Days, NaiveDate, Utc};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::server::directory::Directory;
use crate::server::fanout::{FanoutReport, NotificationService};
use crate::server::notifier::Notifier;

#[derive(Debug, Clone)]
pub struct SweepSettings {
	pub enabled: bool,
	/// Six-field cron expressions (with seconds), evaluated in UTC.
	pub payments_cron: String,
	pub tasks_cron: String,
	pub retention_cron: String,
	/// Days before the due date on which a reminder goes out.
	pub reminder_days: Vec<u32>,
	/// Overdue payments notify on day 1 and then every this many days.
	pub overdue_repeat_days: u32,
	pub retention_days: u32,
	/// How far back the task sweep looks for tasks that became overdue.
	pub task_lookback_days: u32,
}

impl Default for SweepSettings {
	fn default() -> Self {
		Self {
			enabled: true,
			payments_cron: "0 0 8 * * *".to_string(),
			tasks_cron: "0 30 8 * * *".to_string(),
			retention_cron: "0 0 3 * * *".to_string(),
			reminder_days: vec![7, 3, 0],
			overdue_repeat_days: 7,
			retention_days: 30,
			task_lookback_days: 7,
		}
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
	pub candidates: usize,
	pub notified: usize,
	pub duplicates: usize,
	pub failed: usize,
}

impl SweepReport {
	fn absorb(&mut self, fanout: FanoutReport) {
		self.candidates += 1;
		self.notified += fanout.delivered;
		self.duplicates += fanout.duplicates;
		self.failed += fanout.failed;
	}
}

/// Day 1 overdue, then every `repeat` days.
pub fn should_notify_overdue(days_overdue: u32, repeat: u32) -> bool {
	match days_overdue {
		0 => false,
		1 => true,
		d => repeat > 0 && d % repeat == 0,
	}
}

pub struct SweepRunner {
	directory: Arc<dyn Directory>,
	notifier: Notifier,
	notifications: Arc<NotificationService>,
	settings: SweepSettings,
}

impl SweepRunner {
	pub fn new(
		directory: Arc<dyn Directory>,
		notifier: Notifier,
		notifications: Arc<NotificationService>,
		settings: SweepSettings,
	) -> Self {
		Self {
			directory,
			notifier,
			notifications,
			settings,
		}
	}

	pub fn settings(&self) -> &SweepSettings {
		&self.settings
	}

	/// Remind guardians of unpaid payments due in each configured number of days.
	pub async fn run_payment_reminders(&self, today: NaiveDate) -> SweepReport {
		let mut report = SweepReport::default();

		for &days in &self.settings.reminder_days {
			let Some(target) = today.checked_add_days(Days::new(u64::from(days))) else {
				continue;
			};
			let payments = match self.directory.open_payments_due_on(target).await {
				Ok(p) => p,
				Err(e) => {
					report.failed += 1;
					error!(days, error = %e, "payment reminder query failed");
					continue;
				}
			};

			for p in payments {
				let fanout = self
					.notifier
					.payment_reminder(
						p.tenant_id,
						PaymentReminder {
							payment_id: p.payment_id,
							student: p.student,
							amount: p.amount,
							description: p.description,
							due_date: p.due_date,
							days_until_due: days,
						},
					)
					.await;
				report.absorb(fanout);
			}
		}

		log_report("payment_reminders", today, &report);
		report
	}

	pub async fn run_overdue_payments(&self, today: NaiveDate) -> SweepReport {
		let mut report = SweepReport::default();

		let payments = match self.directory.open_payments_due_before(today).await {
			Ok(p) => p,
			Err(e) => {
				report.failed += 1;
				error!(error = %e, "overdue payment query failed");
				return report;
			}
		};

		for p in payments {
			let days = (today - p.due_date).num_days();
			let Ok(days) = u32::try_from(days) else {
				continue;
			};
			if !should_notify_overdue(days, self.settings.overdue_repeat_days) {
				continue;
			}

			let fanout = self
				.notifier
				.payment_overdue(
					p.tenant_id,
					PaymentOverdue {
						payment_id: p.payment_id,
						student: p.student,
						amount: p.amount,
						description: p.description,
						due_date: p.due_date,
						days_overdue: days,
					},
				)
				.await;
			report.absorb(fanout);
		}

		log_report("overdue_payments", today, &report);
		report
	}

	/// Notify about tasks that went past their due date during the lookback window and still have
	/// missing submissions. Each task is notified once.
	pub async fn run_overdue_tasks(&self, today: NaiveDate) -> SweepReport {
		let mut report = SweepReport::default();

		let (Some(from), Some(to)) = (
			today.checked_sub_days(Days::new(u64::from(self.settings.task_lookback_days.max(1)))),
			today.checked_sub_days(Days::new(1)),
		) else {
			return report;
		};

		let tasks = match self.directory.overdue_tasks(from, to).await {
			Ok(t) => t,
			Err(e) => {
				report.failed += 1;
				error!(error = %e, "overdue task query failed");
				return report;
			}
		};

		for task in tasks.into_iter().filter(|t| !t.missing.is_empty()) {
			let fanout = self
				.notifier
				.task_overdue(
					task.tenant_id,
					TaskOverdue {
						task_id: task.task_id,
						title: task.title,
						course_name: task.course_name,
						due_date: task.due_date,
						students: task.missing,
					},
				)
				.await;
			report.absorb(fanout);
		}

		log_report("overdue_tasks", today, &report);
		report
	}

	/// Delete read notifications older than the retention window. Returns the number deleted.
	pub async fn run_retention(&self, now_ms: i64) -> u64 {
		let cutoff = days_before_ms(now_ms, self.settings.retention_days);
		match self.notifications.purge_read_before(cutoff).await {
			Ok(n) => {
				info!(deleted = n, retention_days = self.settings.retention_days, "notification retention sweep");
				n
			}
			Err(e) => {
				warn!(error = %e, "notification retention sweep failed");
				0
			}
		}
	}
}

fn log_report(sweep: &'static str, today: NaiveDate, report: &SweepReport) {
	info!(
		sweep,
		%today,
		candidates = report.candidates,
		notified = report.notified,
		duplicates = report.duplicates,
		failed = report.failed,
		"sweep finished"
	);
}

/// Schedule the sweeps. The returned scheduler must be kept alive.
pub async fn start_scheduler(runner: Arc<SweepRunner>) -> anyhow::Result<Option<JobScheduler>> {
	if !runner.settings.enabled {
		info!("sweeps disabled");
		return Ok(None);
	}

	let scheduler = JobScheduler::new().await?;

	let job_runner = Arc::clone(&runner);
	let payments = Job::new_async(runner.settings.payments_cron.as_str(), move |_uuid, _lock| {
		let runner = Arc::clone(&job_runner);
		Box::pin(async move {
			let today = Utc::now().date_naive();
			runner.run_payment_reminders(today).await;
			runner.run_overdue_payments(today).await;
		})
	})?;
	scheduler.add(payments).await?;

	let job_runner = Arc::clone(&runner);
	let tasks = Job::new_async(runner.settings.tasks_cron.as_str(), move |_uuid, _lock| {
		let runner = Arc::clone(&job_runner);
		Box::pin(async move {
			runner.run_overdue_tasks(Utc::now().date_naive()).await;
		})
	})?;
	scheduler.add(tasks).await?;

	let job_runner = Arc::clone(&runner);
	let retention = Job::new_async(runner.settings.retention_cron.as_str(), move |_uuid, _lock| {
		let runner = Arc::clone(&job_runner);
		Box::pin(async move {
			runner.run_retention(unix_ms_now()).await;
		})
	})?;
	scheduler.add(retention).await?;

	scheduler.start().await?;
	info!(
		payments = %runner.settings.payments_cron,
		tasks = %runner.settings.tasks_cron,
		retention = %runner.settings.retention_cron,
		"sweep scheduler started"
	);
	Ok(Some(scheduler))
}
