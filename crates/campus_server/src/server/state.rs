#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use campus_domain::{NodeId, SecretString};
use campus_protocol::DEFAULT_MAX_FRAME_SIZE;

use crate::server::auth::{Authenticator, CredentialNames};
use crate::server::bus::BroadcastAdapter;
use crate::server::conversations::ConversationService;
use crate::server::directory::Directory;
use crate::server::fanout::NotificationService;
use crate::server::notifier::Notifier;
use crate::server::presence::{PresenceRegistry, PresenceStore};
use crate::server::resolver::ResolutionEngine;
use crate::server::store::{ConversationStore, NotificationStore};

/// Per-connection limits and auth lookup settings.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	pub max_frame_bytes: usize,
	pub credential_names: CredentialNames,
	/// How long a connection without a handshake credential may take to send `auth`.
	pub auth_timeout: Duration,
	/// Re-check the account this often while connected; `None` disables it.
	pub revalidate_interval: Option<Duration>,
}

impl Default for ConnectionSettings {
	fn default() -> Self {
		Self {
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			credential_names: CredentialNames::default(),
			auth_timeout: Duration::from_secs(5),
			revalidate_interval: Some(Duration::from_secs(300)),
		}
	}
}

/// Storage and lookup backends the node runs on.
#[derive(Clone)]
pub struct Backends {
	pub directory: Arc<dyn Directory>,
	pub notifications: Arc<dyn NotificationStore>,
	pub conversations: Arc<dyn ConversationStore>,
	pub presence: Arc<dyn PresenceStore>,
}

/// Everything a connection handler needs, shared by all connections of a node.
#[derive(Clone)]
pub struct ServerContext {
	pub node_id: NodeId,
	pub auth: Authenticator,
	pub broadcaster: BroadcastAdapter,
	pub presence: Arc<PresenceRegistry>,
	pub notifications: Arc<NotificationService>,
	pub conversations: Arc<ConversationService>,
	pub notifier: Notifier,
	pub directory: Arc<dyn Directory>,
	pub settings: ConnectionSettings,
}

impl ServerContext {
	pub fn assemble(
		secrets: Vec<SecretString>,
		backends: Backends,
		broadcaster: BroadcastAdapter,
		settings: ConnectionSettings,
	) -> Self {
		let engine = Arc::new(ResolutionEngine::with_default_rules(
			Arc::clone(&backends.directory),
			Arc::clone(&backends.conversations),
		));
		let presence = Arc::new(PresenceRegistry::new(backends.presence, broadcaster.clone()));
		let notifications = Arc::new(NotificationService::new(
			backends.notifications,
			engine,
			broadcaster.clone(),
		));
		let conversations = Arc::new(ConversationService::new(
			backends.conversations,
			Arc::clone(&backends.directory),
			Arc::clone(&notifications),
			Arc::clone(&presence),
			broadcaster.clone(),
		));
		let notifier = Notifier::new(Arc::clone(&notifications), Arc::clone(&conversations));

		Self {
			node_id: broadcaster.node_id().clone(),
			auth: Authenticator::new(secrets, Arc::clone(&backends.directory)),
			broadcaster,
			presence,
			notifications,
			conversations,
			notifier,
			directory: backends.directory,
			settings,
		}
	}
}
