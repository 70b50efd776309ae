#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use campus_domain::NodeId;
use campus_protocol::GatewayKind;
use campus_server::config::{ServerConfig, default_config_path, load_server_config_from_path};
use campus_server::server::auth::CredentialNames;
use campus_server::server::bus::{BroadcastAdapter, RedisBus};
use campus_server::server::directory::MemoryDirectory;
use campus_server::server::gateway::{GatewayRoute, serve};
use campus_server::server::health::{HealthState, spawn_health_server};
use campus_server::server::presence::{InMemoryPresenceStore, PresenceStore, RedisPresenceStore};
use campus_server::server::room_hub::{RoomHub, RoomHubConfig};
use campus_server::server::state::{Backends, ConnectionSettings, ServerContext};
use campus_server::server::store::{MemoryStore, SqlStore};
use campus_server::server::sweep::{SweepRunner, start_scheduler};
use redis::aio::ConnectionManager;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: campus_server [--bind host:port] [--config path]\n\
\n\
Options:\n\
\t--bind     Websocket listen address (default from config: 127.0.0.1:18300)\n\
\t--config   Config file (default: ~/.campus/config.toml)\n\
\t--help     Show this help\n\
"
	);
	std::process::exit(2)
}

struct Args {
	bind: Option<String>,
	config: Option<PathBuf>,
}

fn parse_args() -> Args {
	let mut args = Args {
		bind: None,
		config: None,
	};

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected host:port)");
					usage_and_exit();
				}
				args.bind = Some(v);
			}
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				args.config = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	args
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,campus_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("campus_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

/// Connect the shared bus. Falls back to node-local delivery when Redis is not configured or not
/// reachable within the connect timeout.
async fn connect_bus(cfg: &ServerConfig, node_id: NodeId, hub: RoomHub) -> (BroadcastAdapter, Option<ConnectionManager>) {
	let Some(url) = cfg.bus.redis_url.as_ref() else {
		info!("no redis url configured; running as a single node");
		return (BroadcastAdapter::local(node_id, hub), None);
	};

	let bus = match RedisBus::connect(url.expose(), &cfg.bus.channel_prefix, cfg.bus.connect_timeout).await {
		Ok(bus) => bus,
		Err(e) => {
			metrics::counter!("campus_bus_degraded_total").increment(1);
			warn!(error = %e, "redis unavailable at startup; delivering to this node only");
			return (BroadcastAdapter::local(node_id, hub), None);
		}
	};

	let conn = bus.connection();
	match BroadcastAdapter::with_bus(node_id.clone(), hub.clone(), Arc::new(bus)).await {
		Ok(adapter) => (adapter, Some(conn)),
		Err(e) => {
			metrics::counter!("campus_bus_degraded_total").increment(1);
			warn!(error = %e, "bus subscribe failed; delivering to this node only");
			(BroadcastAdapter::local(node_id, hub), None)
		}
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let args = parse_args();
	let config_path = match args.config {
		Some(p) => p,
		None => default_config_path()?,
	};
	let mut cfg = load_server_config_from_path(&config_path)?;
	if let Some(bind) = args.bind {
		cfg.server.bind = bind;
	}
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	init_metrics(cfg.server.metrics_bind.as_deref());

	let node_id = cfg.node_id(std::env::var("HOSTNAME").ok())?;
	info!(node = %node_id, "node identity");

	let hub = RoomHub::new(RoomHubConfig {
		subscriber_queue_capacity: cfg.server.outbound_queue_capacity,
		..RoomHubConfig::default()
	});
	let (broadcaster, redis_conn) = connect_bus(&cfg, node_id.clone(), hub).await;

	let health_state = HealthState::new(Some(broadcaster.clone()));
	if let Some(bind) = cfg.server.health_bind.as_deref() {
		match bind.parse::<std::net::SocketAddr>() {
			Ok(addr) => {
				spawn_health_server(addr, health_state.clone());
				info!(%addr, "health server listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	let presence: Arc<dyn PresenceStore> = match redis_conn {
		Some(conn) => Arc::new(RedisPresenceStore::new(conn, &cfg.bus.key_prefix)),
		None => Arc::new(InMemoryPresenceStore::new()),
	};

	let backends = match cfg.persistence.database_url.as_ref() {
		Some(url) => {
			let store = Arc::new(SqlStore::connect(url.expose()).await?);
			info!(backend = store.backend_name(), "persistence ready");
			Backends {
				directory: store.clone(),
				notifications: store.clone(),
				conversations: store,
				presence,
			}
		}
		None => {
			warn!("no database_url configured; using in-memory storage (data is lost on restart)");
			let store = Arc::new(MemoryStore::new());
			Backends {
				directory: Arc::new(MemoryDirectory::new()),
				notifications: store.clone(),
				conversations: store,
				presence,
			}
		}
	};

	let settings = ConnectionSettings {
		max_frame_bytes: cfg.server.max_frame_bytes,
		credential_names: CredentialNames {
			cookie: cfg.auth.cookie_name.clone(),
			query_param: cfg.auth.query_param.clone(),
		},
		auth_timeout: cfg.auth.handshake_timeout,
		revalidate_interval: cfg.auth.revalidate_interval,
	};
	let ctx = ServerContext::assemble(cfg.auth.hmac_secrets.clone(), backends, broadcaster, settings);

	if let Err(e) = ctx.presence.purge_node(&node_id).await {
		warn!(node = %node_id, error = %e, "stale presence cleanup failed");
	}

	let runner = Arc::new(SweepRunner::new(
		Arc::clone(&ctx.directory),
		ctx.notifier.clone(),
		Arc::clone(&ctx.notifications),
		cfg.sweep.clone(),
	));
	let _scheduler = start_scheduler(runner).await.context("start sweep scheduler")?;

	let routes = Arc::new(vec![
		GatewayRoute::new(GatewayKind::Chat, cfg.gateways.chat.path.clone())
			.with_origins(cfg.gateways.chat.allowed_origins.clone()),
		GatewayRoute::new(GatewayKind::Notifications, cfg.gateways.notifications.path.clone())
			.with_origins(cfg.gateways.notifications.allowed_origins.clone()),
	]);

	let listener = TcpListener::bind(&cfg.server.bind)
		.await
		.with_context(|| format!("bind {}", cfg.server.bind))?;
	info!(node = %node_id, bind = %cfg.server.bind, "campus_server ready");
	health_state.mark_ready();

	tokio::select! {
		res = serve(listener, ctx, routes) => res,
		_ = tokio::signal::ctrl_c() => {
			info!("shutting down");
			Ok(())
		}
	}
}
