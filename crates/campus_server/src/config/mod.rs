#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use campus_domain::{NodeId, SecretString};
use serde::Deserialize;
use tracing::{info, warn};

use crate::server::sweep::SweepSettings;

/// Default config path: `~/.campus/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".campus").join("config.toml"))
}

/// Load the server config from TOML and `CAMPUS_*` env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);
	apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());
	cfg.validate();

	Ok(cfg)
}

#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub auth: AuthSettings,
	pub gateways: GatewaySettings,
	pub bus: BusSettings,
	pub persistence: PersistenceSettings,
	pub sweep: SweepSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// Websocket listener address (host:port).
	pub bind: String,
	/// Identity of this node on the bus and in presence records. See [`ServerConfig::node_id`].
	pub node_id: Option<String>,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
	/// Per-connection outbound queue size.
	pub outbound_queue_capacity: usize,
	pub max_frame_bytes: usize,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			bind: "127.0.0.1:18300".to_string(),
			node_id: None,
			metrics_bind: None,
			health_bind: None,
			outbound_queue_capacity: 256,
			max_frame_bytes: campus_protocol::DEFAULT_MAX_FRAME_SIZE,
		}
	}
}

#[derive(Debug, Clone)]
pub struct AuthSettings {
	/// Token signing secrets. The first signs; all verify.
	pub hmac_secrets: Vec<SecretString>,
	pub cookie_name: String,
	pub query_param: String,
	pub handshake_timeout: Duration,
	pub revalidate_interval: Option<Duration>,
}

impl Default for AuthSettings {
	fn default() -> Self {
		Self {
			hmac_secrets: Vec::new(),
			cookie_name: "access_token".to_string(),
			query_param: "token".to_string(),
			handshake_timeout: Duration::from_secs(5),
			revalidate_interval: Some(Duration::from_secs(300)),
		}
	}
}

#[derive(Debug, Clone)]
pub struct GatewayEntry {
	pub path: String,
	pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct GatewaySettings {
	pub chat: GatewayEntry,
	pub notifications: GatewayEntry,
}

impl Default for GatewaySettings {
	fn default() -> Self {
		Self {
			chat: GatewayEntry {
				path: "/chat".to_string(),
				allowed_origins: Vec::new(),
			},
			notifications: GatewayEntry {
				path: "/notifications".to_string(),
				allowed_origins: Vec::new(),
			},
		}
	}
}

#[derive(Debug, Clone)]
pub struct BusSettings {
	/// Redis URL for the shared bus and presence. Without it the node runs standalone.
	pub redis_url: Option<SecretString>,
	pub connect_timeout: Duration,
	pub channel_prefix: String,
	pub key_prefix: String,
}

impl Default for BusSettings {
	fn default() -> Self {
		Self {
			redis_url: None,
			connect_timeout: Duration::from_secs(5),
			channel_prefix: "campus:topic:".to_string(),
			key_prefix: "campus:".to_string(),
		}
	}
}

#[derive(Debug, Clone, Default)]
pub struct PersistenceSettings {
	/// Database URL (sqlite: or postgres:). In-memory storage when unset.
	pub database_url: Option<SecretString>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,
	#[serde(default)]
	auth: FileAuthSettings,
	#[serde(default)]
	gateways: FileGateways,
	#[serde(default)]
	bus: FileBusSettings,
	#[serde(default)]
	persistence: FilePersistenceSettings,
	#[serde(default)]
	sweep: FileSweepSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	bind: Option<String>,
	node_id: Option<String>,
	metrics_bind: Option<String>,
	health_bind: Option<String>,
	outbound_queue_capacity: Option<usize>,
	max_frame_bytes: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileAuthSettings {
	#[serde(default)]
	hmac_secrets: Vec<String>,
	cookie_name: Option<String>,
	query_param: Option<String>,
	handshake_timeout_ms: Option<u64>,
	/// 0 disables revalidation.
	revalidate_interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileGateways {
	#[serde(default)]
	chat: FileGatewayEntry,
	#[serde(default)]
	notifications: FileGatewayEntry,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileGatewayEntry {
	path: Option<String>,
	allowed_origins: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileBusSettings {
	redis_url: Option<String>,
	connect_timeout_ms: Option<u64>,
	channel_prefix: Option<String>,
	key_prefix: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	database_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileSweepSettings {
	enabled: Option<bool>,
	payments_cron: Option<String>,
	tasks_cron: Option<String>,
	retention_cron: Option<String>,
	reminder_days: Option<Vec<u32>>,
	overdue_repeat_days: Option<u32>,
	retention_days: Option<u32>,
	task_lookback_days: Option<u32>,
}

fn non_empty(v: Option<String>) -> Option<String> {
	v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn gateway_entry(file: FileGatewayEntry, default: GatewayEntry) -> GatewayEntry {
	GatewayEntry {
		path: non_empty(file.path).unwrap_or(default.path),
		allowed_origins: file.allowed_origins.unwrap_or(default.allowed_origins),
	}
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let d_server = ServerSettings::default();
		let d_auth = AuthSettings::default();
		let d_gateways = GatewaySettings::default();
		let d_bus = BusSettings::default();
		let d_sweep = SweepSettings::default();

		Self {
			server: ServerSettings {
				bind: non_empty(file.server.bind).unwrap_or(d_server.bind),
				node_id: non_empty(file.server.node_id),
				metrics_bind: non_empty(file.server.metrics_bind),
				health_bind: non_empty(file.server.health_bind),
				outbound_queue_capacity: file
					.server
					.outbound_queue_capacity
					.filter(|v| *v > 0)
					.unwrap_or(d_server.outbound_queue_capacity),
				max_frame_bytes: file
					.server
					.max_frame_bytes
					.filter(|v| *v > 0)
					.unwrap_or(d_server.max_frame_bytes),
			},
			auth: AuthSettings {
				hmac_secrets: file
					.auth
					.hmac_secrets
					.into_iter()
					.filter(|s| !s.trim().is_empty())
					.map(SecretString::new)
					.collect(),
				cookie_name: non_empty(file.auth.cookie_name).unwrap_or(d_auth.cookie_name),
				query_param: non_empty(file.auth.query_param).unwrap_or(d_auth.query_param),
				handshake_timeout: file
					.auth
					.handshake_timeout_ms
					.map(Duration::from_millis)
					.unwrap_or(d_auth.handshake_timeout),
				revalidate_interval: match file.auth.revalidate_interval_secs {
					Some(0) => None,
					Some(secs) => Some(Duration::from_secs(secs)),
					None => d_auth.revalidate_interval,
				},
			},
			gateways: GatewaySettings {
				chat: gateway_entry(file.gateways.chat, d_gateways.chat),
				notifications: gateway_entry(file.gateways.notifications, d_gateways.notifications),
			},
			bus: BusSettings {
				redis_url: non_empty(file.bus.redis_url).map(SecretString::new),
				connect_timeout: file
					.bus
					.connect_timeout_ms
					.map(Duration::from_millis)
					.unwrap_or(d_bus.connect_timeout),
				channel_prefix: non_empty(file.bus.channel_prefix).unwrap_or(d_bus.channel_prefix),
				key_prefix: non_empty(file.bus.key_prefix).unwrap_or(d_bus.key_prefix),
			},
			persistence: PersistenceSettings {
				database_url: non_empty(file.persistence.database_url).map(SecretString::new),
			},
			sweep: SweepSettings {
				enabled: file.sweep.enabled.unwrap_or(d_sweep.enabled),
				payments_cron: non_empty(file.sweep.payments_cron).unwrap_or(d_sweep.payments_cron),
				tasks_cron: non_empty(file.sweep.tasks_cron).unwrap_or(d_sweep.tasks_cron),
				retention_cron: non_empty(file.sweep.retention_cron).unwrap_or(d_sweep.retention_cron),
				reminder_days: file.sweep.reminder_days.unwrap_or(d_sweep.reminder_days),
				overdue_repeat_days: file.sweep.overdue_repeat_days.unwrap_or(d_sweep.overdue_repeat_days),
				retention_days: file.sweep.retention_days.unwrap_or(d_sweep.retention_days),
				task_lookback_days: file.sweep.task_lookback_days.unwrap_or(d_sweep.task_lookback_days),
			},
		}
	}

	/// This node's identity. An explicit `node_id` wins, then the host name, so a restarted node
	/// finds and purges the presence records of its previous run. A random id is only used without
	/// a shared bus, where presence lives in this process and dies with it.
	pub fn node_id(&self, hostname: Option<String>) -> anyhow::Result<NodeId> {
		if let Some(id) = self.server.node_id.as_deref() {
			return NodeId::new(id).context("invalid node id");
		}
		if let Some(host) = non_empty(hostname) {
			return NodeId::new(host).context("invalid host name for node id");
		}
		if self.bus.redis_url.is_some() {
			return Err(anyhow!(
				"server.node_id (or CAMPUS_NODE_ID) is required with a shared bus when HOSTNAME is unset"
			));
		}
		Ok(NodeId::generate())
	}

	fn validate(&mut self) {
		if self.auth.hmac_secrets.is_empty() {
			warn!("auth config: no hmac secrets configured; every connection will be rejected");
		}
		if self.gateways.chat.path == self.gateways.notifications.path {
			warn!(path = %self.gateways.chat.path, "gateway config: chat and notifications share a path; chat wins");
		}
		if self.sweep.retention_days == 0 {
			warn!("sweep config: retention_days = 0 deletes every read notification");
		}
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn parse_list(v: &str) -> Vec<String> {
	v.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect()
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut ServerConfig, env: impl Fn(&str) -> Option<String>) {
	let var = |key: &str| env(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

	if let Some(v) = var("CAMPUS_BIND") {
		cfg.server.bind = v;
		info!("server config: bind overridden by env");
	}

	if let Some(v) = var("CAMPUS_NODE_ID") {
		cfg.server.node_id = Some(v);
		info!("server config: node_id overridden by env");
	}

	if let Some(v) = var("CAMPUS_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = var("CAMPUS_HEALTH_BIND") {
		cfg.server.health_bind = Some(v);
		info!("server config: health_bind overridden by env");
	}

	if let Some(v) = var("CAMPUS_OUTBOUND_QUEUE_CAPACITY")
		&& let Ok(capacity) = v.parse::<usize>()
		&& capacity > 0
	{
		cfg.server.outbound_queue_capacity = capacity;
		info!(capacity, "server config: outbound_queue_capacity overridden by env");
	}

	if let Some(v) = var("CAMPUS_AUTH_HMAC_SECRETS") {
		cfg.auth.hmac_secrets = parse_list(&v).into_iter().map(SecretString::new).collect();
		info!(count = cfg.auth.hmac_secrets.len(), "server auth: hmac_secrets overridden by env");
	}

	if let Some(v) = var("CAMPUS_AUTH_COOKIE_NAME") {
		cfg.auth.cookie_name = v;
		info!("server auth: cookie_name overridden by env");
	}

	if let Some(v) = var("CAMPUS_CHAT_ALLOWED_ORIGINS") {
		cfg.gateways.chat.allowed_origins = parse_list(&v);
		info!("gateway config: chat allowed_origins overridden by env");
	}

	if let Some(v) = var("CAMPUS_NOTIFICATIONS_ALLOWED_ORIGINS") {
		cfg.gateways.notifications.allowed_origins = parse_list(&v);
		info!("gateway config: notifications allowed_origins overridden by env");
	}

	if let Some(v) = var("CAMPUS_REDIS_URL") {
		cfg.bus.redis_url = Some(SecretString::new(v));
		info!("bus config: redis_url overridden by env");
	}

	if let Some(v) = var("CAMPUS_BUS_CONNECT_TIMEOUT_MS")
		&& let Ok(ms) = v.parse::<u64>()
	{
		cfg.bus.connect_timeout = Duration::from_millis(ms);
		info!(ms, "bus config: connect_timeout overridden by env");
	}

	if let Some(v) = var("CAMPUS_DATABASE_URL") {
		cfg.persistence.database_url = Some(SecretString::new(v));
		info!("persistence: database_url overridden by env");
	}

	if let Some(v) = var("CAMPUS_SWEEP_ENABLED")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.sweep.enabled = enabled;
		info!(enabled, "sweep config: enabled overridden by env");
	}

	if let Some(v) = var("CAMPUS_RETENTION_DAYS")
		&& let Ok(days) = v.parse::<u32>()
	{
		cfg.sweep.retention_days = days;
		info!(days, "sweep config: retention_days overridden by env");
	}
}
