#![forbid(unsafe_code)]

//! Read-only view of the relationship data owned by the CRUD services: accounts, guardianship,
//! enrollment, tenant administrators, and the candidates the scheduled sweeps look at.

use std::collections::{HashMap, HashSet};

use campus_domain::events::Money;
use campus_domain::models::{Account, StudentRef};
use campus_domain::{CourseId, PaymentId, Role, StudentId, TaskId, TenantId, UserId};
use chrono::NaiveDate;
use parking_lot::RwLock;

/// An unpaid payment as seen by the sweeps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuePayment {
	pub payment_id: PaymentId,
	pub tenant_id: TenantId,
	pub student: StudentRef,
	pub amount: Money,
	pub description: String,
	pub due_date: NaiveDate,
}

/// A task past its due date with the students that have not completed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverdueTask {
	pub task_id: TaskId,
	pub tenant_id: TenantId,
	pub title: String,
	pub course_name: String,
	pub due_date: NaiveDate,
	pub missing: Vec<StudentRef>,
}

/// Relationship queries. Every account-returning query only yields active, non-deleted accounts
/// of the given tenant.
#[async_trait::async_trait]
pub trait Directory: Send + Sync {
	async fn account(&self, user: &UserId) -> anyhow::Result<Option<Account>>;

	async fn is_token_revoked(&self, jti: &str) -> anyhow::Result<bool>;

	/// Login accounts of the given student records.
	async fn student_accounts(&self, tenant: &TenantId, students: &[StudentId]) -> anyhow::Result<Vec<UserId>>;

	/// Parent accounts linked to any of the given students.
	async fn guardian_accounts(&self, tenant: &TenantId, students: &[StudentId]) -> anyhow::Result<Vec<UserId>>;

	/// Students with an active enrollment in the course.
	async fn active_roster(&self, tenant: &TenantId, course: &CourseId) -> anyhow::Result<Vec<StudentId>>;

	async fn tenant_admins(&self, tenant: &TenantId) -> anyhow::Result<Vec<UserId>>;

	/// Unpaid payments due exactly on `day`.
	async fn open_payments_due_on(&self, day: NaiveDate) -> anyhow::Result<Vec<DuePayment>>;

	/// Unpaid payments due strictly before `day`.
	async fn open_payments_due_before(&self, day: NaiveDate) -> anyhow::Result<Vec<DuePayment>>;

	/// Tasks due within `[from, to]` with at least one missing submission.
	async fn overdue_tasks(&self, from: NaiveDate, to: NaiveDate) -> anyhow::Result<Vec<OverdueTask>>;
}

/// In-process directory for tests and local development.
#[derive(Default)]
pub struct MemoryDirectory {
	inner: RwLock<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
	accounts: HashMap<UserId, Account>,
	revoked: HashSet<String>,
	student_accounts: HashMap<StudentId, UserId>,
	guardians: HashMap<StudentId, Vec<UserId>>,
	/// Course -> (student, active).
	enrollments: HashMap<CourseId, Vec<(StudentId, bool)>>,
	/// Payment plus whether it was paid.
	payments: Vec<(DuePayment, bool)>,
	tasks: Vec<OverdueTask>,
}

impl Inner {
	fn usable_in(&self, tenant: &TenantId, user: &UserId) -> bool {
		self.accounts
			.get(user)
			.is_some_and(|a| a.is_usable() && &a.tenant_id == tenant)
	}
}

impl MemoryDirectory {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn upsert_account(&self, account: Account) {
		self.inner.write().accounts.insert(account.id.clone(), account);
	}

	pub fn account_snapshot(&self, user: &UserId) -> Option<Account> {
		self.inner.read().accounts.get(user).cloned()
	}

	pub fn set_account_active(&self, user: &UserId, active: bool) {
		if let Some(account) = self.inner.write().accounts.get_mut(user) {
			account.active = active;
		}
	}

	pub fn revoke_token(&self, jti: impl Into<String>) {
		self.inner.write().revoked.insert(jti.into());
	}

	pub fn link_student_account(&self, student: StudentId, user: UserId) {
		self.inner.write().student_accounts.insert(student, user);
	}

	pub fn link_guardian(&self, student: StudentId, parent: UserId) {
		let mut inner = self.inner.write();
		let list = inner.guardians.entry(student).or_default();
		if !list.contains(&parent) {
			list.push(parent);
		}
	}

	pub fn enroll(&self, course: CourseId, student: StudentId) {
		let mut inner = self.inner.write();
		let roster = inner.enrollments.entry(course).or_default();
		match roster.iter_mut().find(|(s, _)| s == &student) {
			Some(entry) => entry.1 = true,
			None => roster.push((student, true)),
		}
	}

	pub fn withdraw(&self, course: &CourseId, student: &StudentId) {
		if let Some(roster) = self.inner.write().enrollments.get_mut(course)
			&& let Some(entry) = roster.iter_mut().find(|(s, _)| s == student)
		{
			entry.1 = false;
		}
	}

	pub fn add_payment(&self, payment: DuePayment) {
		self.inner.write().payments.push((payment, false));
	}

	pub fn mark_payment_paid(&self, id: &PaymentId) {
		for (payment, paid) in self.inner.write().payments.iter_mut() {
			if &payment.payment_id == id {
				*paid = true;
			}
		}
	}

	pub fn add_overdue_task(&self, task: OverdueTask) {
		self.inner.write().tasks.push(task);
	}
}

#[async_trait::async_trait]
impl Directory for MemoryDirectory {
	async fn account(&self, user: &UserId) -> anyhow::Result<Option<Account>> {
		Ok(self.inner.read().accounts.get(user).cloned())
	}

	async fn is_token_revoked(&self, jti: &str) -> anyhow::Result<bool> {
		Ok(self.inner.read().revoked.contains(jti))
	}

	async fn student_accounts(&self, tenant: &TenantId, students: &[StudentId]) -> anyhow::Result<Vec<UserId>> {
		let inner = self.inner.read();
		Ok(students
			.iter()
			.filter_map(|s| inner.student_accounts.get(s))
			.filter(|u| inner.usable_in(tenant, u))
			.cloned()
			.collect())
	}

	async fn guardian_accounts(&self, tenant: &TenantId, students: &[StudentId]) -> anyhow::Result<Vec<UserId>> {
		let inner = self.inner.read();
		let mut out = Vec::new();
		for student in students {
			for parent in inner.guardians.get(student).into_iter().flatten() {
				let is_parent = inner.accounts.get(parent).is_some_and(|a| a.role == Role::Parent);
				if is_parent && inner.usable_in(tenant, parent) && !out.contains(parent) {
					out.push(parent.clone());
				}
			}
		}
		Ok(out)
	}

	async fn active_roster(&self, tenant: &TenantId, course: &CourseId) -> anyhow::Result<Vec<StudentId>> {
		let inner = self.inner.read();
		Ok(inner
			.enrollments
			.get(course)
			.into_iter()
			.flatten()
			.filter(|(_, active)| *active)
			.map(|(s, _)| s.clone())
			.filter(|s| {
				// Students without a login account still count; tenant is checked when one exists.
				inner
					.student_accounts
					.get(s)
					.and_then(|u| inner.accounts.get(u))
					.is_none_or(|a| &a.tenant_id == tenant)
			})
			.collect())
	}

	async fn tenant_admins(&self, tenant: &TenantId) -> anyhow::Result<Vec<UserId>> {
		let inner = self.inner.read();
		let mut out = inner
			.accounts
			.values()
			.filter(|a| a.role == Role::Admin && a.is_usable() && &a.tenant_id == tenant)
			.map(|a| a.id.clone())
			.collect::<Vec<_>>();
		out.sort();
		Ok(out)
	}

	async fn open_payments_due_on(&self, day: NaiveDate) -> anyhow::Result<Vec<DuePayment>> {
		let inner = self.inner.read();
		Ok(inner
			.payments
			.iter()
			.filter(|(p, paid)| !paid && p.due_date == day)
			.map(|(p, _)| p.clone())
			.collect())
	}

	async fn open_payments_due_before(&self, day: NaiveDate) -> anyhow::Result<Vec<DuePayment>> {
		let inner = self.inner.read();
		Ok(inner
			.payments
			.iter()
			.filter(|(p, paid)| !paid && p.due_date < day)
			.map(|(p, _)| p.clone())
			.collect())
	}

	async fn overdue_tasks(&self, from: NaiveDate, to: NaiveDate) -> anyhow::Result<Vec<OverdueTask>> {
		let inner = self.inner.read();
		Ok(inner
			.tasks
			.iter()
			.filter(|t| t.due_date >= from && t.due_date <= to && !t.missing.is_empty())
			.cloned()
			.collect())
	}
}
