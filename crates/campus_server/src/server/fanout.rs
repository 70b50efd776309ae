#![forbid(unsafe_code)]

use std::sync::Arc;

use campus_domain::events::DomainEvent;
use campus_domain::models::{NewNotification, Notification};
use campus_domain::{NotificationId, TenantId, Topic, UserId};
use campus_protocol::ServerEvent;
use campus_util::time::unix_ms_now;
use tracing::{debug, error, warn};

use crate::server::bus::BroadcastAdapter;
use crate::server::error::ServiceError;
use crate::server::resolver::{Recipient, ResolutionEngine};
use crate::server::store::{InsertOutcome, NotificationQuery, NotificationStore};

/// Counts for one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutReport {
	pub resolved: usize,
	pub delivered: usize,
	pub duplicates: usize,
	pub failed: usize,
}

/// Persists notifications and pushes them to their owners.
pub struct NotificationService {
	store: Arc<dyn NotificationStore>,
	engine: Arc<ResolutionEngine>,
	broadcaster: BroadcastAdapter,
}

impl NotificationService {
	pub fn new(store: Arc<dyn NotificationStore>, engine: Arc<ResolutionEngine>, broadcaster: BroadcastAdapter) -> Self {
		Self {
			store,
			engine,
			broadcaster,
		}
	}

	pub fn engine(&self) -> &ResolutionEngine {
		&self.engine
	}

	/// Resolve and deliver a domain event. Never fails; problems are logged and counted.
	pub async fn fanout(&self, event: &DomainEvent) -> FanoutReport {
		let recipients = match self.engine.resolve(event).await {
			Ok(r) => r,
			Err(e) => {
				metrics::counter!("campus_fanout_failures_total", "stage" => "resolve").increment(1);
				error!(kind = %event.kind(), tenant = %event.tenant_id, error = %e, "recipient resolution failed");
				return FanoutReport::default();
			}
		};

		let report = self
			.deliver(&event.tenant_id, recipients, event.idempotency_key.as_deref())
			.await;
		debug!(
			kind = %event.kind(),
			tenant = %event.tenant_id,
			resolved = report.resolved,
			delivered = report.delivered,
			duplicates = report.duplicates,
			failed = report.failed,
			"fan-out complete"
		);
		report
	}

	/// Persist one notification per recipient, then push it and the new unread count to the
	/// recipient's personal topic. A failure for one recipient does not stop the others.
	///
	/// With an idempotency key, each row gets the dedup key `<key>:<user>` so a repeated trigger
	/// creates nothing.
	pub async fn deliver(
		&self,
		tenant: &TenantId,
		recipients: Vec<Recipient>,
		idempotency_key: Option<&str>,
	) -> FanoutReport {
		let mut report = FanoutReport {
			resolved: recipients.len(),
			..FanoutReport::default()
		};

		for recipient in recipients {
			let user_id = recipient.user_id.clone();
			let new = NewNotification {
				user_id: recipient.user_id,
				tenant_id: tenant.clone(),
				content: recipient.content,
				dedup_key: idempotency_key.map(|k| format!("{k}:{user_id}")),
			};

			match self.store.insert_notification(new, unix_ms_now()).await {
				Ok(InsertOutcome::Inserted(notification)) => {
					report.delivered += 1;
					metrics::counter!("campus_fanout_notifications_total", "group" => recipient.group.as_str())
						.increment(1);
					self.push(notification).await;
				}
				Ok(InsertOutcome::Duplicate) => {
					report.duplicates += 1;
				}
				Err(e) => {
					report.failed += 1;
					metrics::counter!("campus_fanout_failures_total", "stage" => "persist").increment(1);
					warn!(user = %user_id, error = %e, "notification persist failed; skipping recipient");
				}
			}
		}

		report
	}

	async fn push(&self, notification: Notification) {
		let user_id = notification.user_id.clone();
		self.broadcaster
			.publish(Topic::User(user_id.clone()), ServerEvent::notification(notification))
			.await;
		self.push_unread_count(&user_id).await;
	}

	/// Publish the current unread count to every connection of `user`.
	pub async fn push_unread_count(&self, user: &UserId) {
		match self.store.unread_count(user).await {
			Ok(count) => {
				self.broadcaster
					.publish(Topic::User(user.clone()), ServerEvent::unread_count(count))
					.await;
			}
			Err(e) => warn!(user = %user, error = %e, "unread count failed"),
		}
	}

	pub async fn unread_count(&self, user: &UserId) -> Result<u64, ServiceError> {
		Ok(self.store.unread_count(user).await?)
	}

	pub async fn list(&self, user: &UserId, query: NotificationQuery) -> Result<Vec<Notification>, ServiceError> {
		Ok(self.store.list_notifications(user, query).await?)
	}

	/// Mark one notification read and push the new count. Only the owner may do this.
	pub async fn mark_read(&self, user: &UserId, id: &NotificationId) -> Result<bool, ServiceError> {
		let changed = self.store.mark_notification_read(user, id, unix_ms_now()).await?;
		if changed {
			self.push_unread_count(user).await;
		}
		Ok(changed)
	}

	pub async fn mark_all_read(&self, user: &UserId) -> Result<u64, ServiceError> {
		let changed = self.store.mark_all_notifications_read(user, unix_ms_now()).await?;
		if changed > 0 {
			self.push_unread_count(user).await;
		}
		Ok(changed)
	}

	pub async fn delete(&self, user: &UserId, id: &NotificationId) -> Result<bool, ServiceError> {
		let deleted = self.store.delete_notification(user, id).await?;
		if deleted {
			self.push_unread_count(user).await;
		}
		Ok(deleted)
	}

	/// Delete read notifications created before `cutoff_ms`.
	pub async fn purge_read_before(&self, cutoff_ms: i64) -> Result<u64, ServiceError> {
		Ok(self.store.delete_read_notifications_before(cutoff_ms).await?)
	}
}
