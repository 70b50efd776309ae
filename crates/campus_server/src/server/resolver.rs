#![forbid(unsafe_code)]

//! Maps a domain event to the users that must hear about it and what each of them reads.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use campus_domain::events::{DomainEvent, EventKind};
use campus_domain::models::NotificationContent;
use campus_domain::{ConversationId, CourseId, StudentId, TenantId, UserId};
use thiserror::Error;

use crate::server::directory::Directory;
use crate::server::rules;
use crate::server::store::ConversationStore;

/// Audience group. Declaration order is evaluation order; the first group to claim a user wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecipientGroup {
	Subject,
	Participant,
	Guardian,
	Roster,
	Admin,
}

impl RecipientGroup {
	pub const fn as_str(self) -> &'static str {
		match self {
			RecipientGroup::Subject => "subject",
			RecipientGroup::Participant => "participant",
			RecipientGroup::Guardian => "guardian",
			RecipientGroup::Roster => "roster",
			RecipientGroup::Admin => "admin",
		}
	}
}

/// Relationship query selecting the users of one audience.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
	/// Login accounts of these students.
	Students(Vec<StudentId>),
	GuardiansOf(Vec<StudentId>),
	/// Students actively enrolled in the course.
	Roster(CourseId),
	/// Guardians of the active roster.
	RosterGuardians(CourseId),
	Participants(ConversationId),
	TenantAdmins,
}

impl Selector {
	pub fn group(&self) -> RecipientGroup {
		match self {
			Selector::Students(_) => RecipientGroup::Subject,
			Selector::Participants(_) => RecipientGroup::Participant,
			Selector::GuardiansOf(_) | Selector::RosterGuardians(_) => RecipientGroup::Guardian,
			Selector::Roster(_) => RecipientGroup::Roster,
			Selector::TenantAdmins => RecipientGroup::Admin,
		}
	}

	const fn name(&self) -> &'static str {
		match self {
			Selector::Students(_) => "students",
			Selector::GuardiansOf(_) => "guardians",
			Selector::Roster(_) => "roster",
			Selector::RosterGuardians(_) => "roster_guardians",
			Selector::Participants(_) => "participants",
			Selector::TenantAdmins => "tenant_admins",
		}
	}
}

/// One audience of a rule with the text its members receive.
#[derive(Debug, Clone, PartialEq)]
pub struct Audience {
	pub selector: Selector,
	pub content: NotificationContent,
}

impl Audience {
	pub fn new(selector: Selector, content: NotificationContent) -> Self {
		Self { selector, content }
	}
}

/// Recipient rule for one event kind.
pub trait RecipientRule: Send + Sync {
	fn kind(&self) -> EventKind;

	/// Audiences for the event, with rendered content per audience. Returns nothing for payloads of
	/// another kind.
	fn audiences(&self, event: &DomainEvent) -> Vec<Audience>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct Recipient {
	pub user_id: UserId,
	pub group: RecipientGroup,
	pub content: NotificationContent,
}

#[derive(Debug, Error)]
pub enum ResolveError {
	#[error("no recipient rule for {0}")]
	NoRule(EventKind),

	#[error("{selector} query failed: {source}")]
	Query {
		selector: &'static str,
		#[source]
		source: anyhow::Error,
	},
}

pub struct ResolutionEngine {
	rules: HashMap<EventKind, Arc<dyn RecipientRule>>,
	directory: Arc<dyn Directory>,
	conversations: Arc<dyn ConversationStore>,
}

impl ResolutionEngine {
	/// Engine without rules.
	pub fn new(directory: Arc<dyn Directory>, conversations: Arc<dyn ConversationStore>) -> Self {
		Self {
			rules: HashMap::new(),
			directory,
			conversations,
		}
	}

	/// Engine with a rule for every event kind.
	pub fn with_default_rules(directory: Arc<dyn Directory>, conversations: Arc<dyn ConversationStore>) -> Self {
		let mut engine = Self::new(directory, conversations);
		for rule in rules::default_rules() {
			engine.register(rule);
		}
		engine
	}

	/// Add or replace the rule for `rule.kind()`.
	pub fn register(&mut self, rule: Arc<dyn RecipientRule>) {
		self.rules.insert(rule.kind(), rule);
	}

	pub fn has_rule(&self, kind: EventKind) -> bool {
		self.rules.contains_key(&kind)
	}

	/// Resolve the recipients of `event`, ordered by group. Each user appears once, with the
	/// content of the first group that selected them. The actor is never a recipient.
	pub async fn resolve(&self, event: &DomainEvent) -> Result<Vec<Recipient>, ResolveError> {
		let rule = self.rules.get(&event.kind()).ok_or(ResolveError::NoRule(event.kind()))?;

		let mut audiences = rule.audiences(event);
		audiences.sort_by_key(|a| a.selector.group());

		let mut seen: HashSet<UserId> = HashSet::new();
		if let Some(actor) = event.actor.as_ref() {
			seen.insert(actor.clone());
		}

		let mut out = Vec::new();
		for audience in audiences {
			let users = self
				.select(&event.tenant_id, &audience.selector)
				.await
				.map_err(|source| ResolveError::Query {
					selector: audience.selector.name(),
					source,
				})?;

			let group = audience.selector.group();
			for user_id in users {
				if seen.insert(user_id.clone()) {
					out.push(Recipient {
						user_id,
						group,
						content: audience.content.clone(),
					});
				}
			}
		}

		Ok(out)
	}

	async fn select(&self, tenant: &TenantId, selector: &Selector) -> anyhow::Result<Vec<UserId>> {
		match selector {
			Selector::Students(students) => self.directory.student_accounts(tenant, students).await,
			Selector::GuardiansOf(students) => self.directory.guardian_accounts(tenant, students).await,
			Selector::Roster(course) => {
				let roster = self.directory.active_roster(tenant, course).await?;
				self.directory.student_accounts(tenant, &roster).await
			}
			Selector::RosterGuardians(course) => {
				let roster = self.directory.active_roster(tenant, course).await?;
				self.directory.guardian_accounts(tenant, &roster).await
			}
			Selector::Participants(conversation) => {
				let Some(conv) = self.conversations.conversation(conversation).await? else {
					return Ok(Vec::new());
				};
				if &conv.tenant_id != tenant {
					return Ok(Vec::new());
				}

				let mut out = Vec::new();
				for p in self.conversations.participants(conversation).await? {
					let usable = self
						.directory
						.account(&p.user_id)
						.await?
						.is_some_and(|a| a.is_usable() && &a.tenant_id == tenant);
					if usable {
						out.push(p.user_id);
					}
				}
				Ok(out)
			}
			Selector::TenantAdmins => self.directory.tenant_admins(tenant).await,
		}
	}
}
