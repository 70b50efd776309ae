#![forbid(unsafe_code)]

//! Websocket listener for the chat and notifications gateways.

use std::net::SocketAddr;
use std::sync::Arc;

use campus_protocol::GatewayKind;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http;
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::http::header::ORIGIN;
use tracing::{debug, info, warn};

use crate::server::auth::{CredentialNames, CredentialSource, credential_from_request};
use crate::server::connection::handle_connection;
use crate::server::state::ServerContext;

/// Path and CORS policy of one gateway.
#[derive(Debug, Clone)]
pub struct GatewayRoute {
	pub kind: GatewayKind,
	pub path: String,
	/// Browser origins allowed to connect. `*` allows any; an empty list only admits clients that
	/// send no `Origin` header.
	pub allowed_origins: Vec<String>,
}

impl GatewayRoute {
	pub fn new(kind: GatewayKind, path: impl Into<String>) -> Self {
		Self {
			kind,
			path: path.into(),
			allowed_origins: Vec::new(),
		}
	}

	pub fn with_origins(mut self, origins: Vec<String>) -> Self {
		self.allowed_origins = origins;
		self
	}
}

/// Accepted upgrade: which gateway, and the credential found on the request if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
	pub gateway: GatewayKind,
	pub credential: Option<(CredentialSource, String)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejection {
	pub status: StatusCode,
	pub reason: &'static str,
}

pub fn origin_allowed(origin: Option<&str>, allowed: &[String]) -> bool {
	match origin {
		None => true,
		Some(origin) => allowed
			.iter()
			.any(|a| a == "*" || a.trim_end_matches('/').eq_ignore_ascii_case(origin.trim_end_matches('/'))),
	}
}

/// Route an upgrade request and apply the gateway's origin policy.
pub fn admit<B>(req: &http::Request<B>, routes: &[GatewayRoute], names: &CredentialNames) -> Result<Admission, Rejection> {
	let path = req.uri().path();
	let path = if path.len() > 1 { path.trim_end_matches('/') } else { path };

	let route = routes.iter().find(|r| r.path == path).ok_or(Rejection {
		status: StatusCode::NOT_FOUND,
		reason: "unknown gateway",
	})?;

	let origin = req.headers().get(ORIGIN).and_then(|v| v.to_str().ok());
	if !origin_allowed(origin, &route.allowed_origins) {
		return Err(Rejection {
			status: StatusCode::FORBIDDEN,
			reason: "origin not allowed",
		});
	}

	Ok(Admission {
		gateway: route.kind,
		credential: credential_from_request(req, names),
	})
}

/// Accept websocket connections until the listener fails.
pub async fn serve(listener: TcpListener, ctx: ServerContext, routes: Arc<Vec<GatewayRoute>>) -> anyhow::Result<()> {
	if let Ok(addr) = listener.local_addr() {
		info!(%addr, gateways = routes.len(), "gateway listening");
	}

	loop {
		let (stream, remote) = listener.accept().await?;
		metrics::counter!("campus_server_connections_total").increment(1);

		let ctx = ctx.clone();
		let routes = Arc::clone(&routes);
		tokio::spawn(async move {
			if let Err(e) = accept(stream, remote, ctx, routes).await {
				warn!(%remote, error = %e, "connection handler exited with error");
			}
		});
	}
}

async fn accept(
	stream: TcpStream,
	remote: SocketAddr,
	ctx: ServerContext,
	routes: Arc<Vec<GatewayRoute>>,
) -> anyhow::Result<()> {
	let admitted: Arc<Mutex<Option<Admission>>> = Arc::new(Mutex::new(None));
	let slot = Arc::clone(&admitted);
	let names = ctx.settings.credential_names.clone();

	let callback = move |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
		match admit(req, &routes, &names) {
			Ok(admission) => {
				*slot.lock() = Some(admission);
				Ok(response)
			}
			Err(rejection) => {
				let mut err = ErrorResponse::new(Some(rejection.reason.to_string()));
				*err.status_mut() = rejection.status;
				Err(err)
			}
		}
	};

	let ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
		Ok(ws) => ws,
		Err(e) => {
			debug!(%remote, error = %e, "websocket handshake failed");
			return Ok(());
		}
	};

	let Some(admission) = admitted.lock().take() else {
		return Ok(());
	};
	debug!(%remote, gateway = %admission.gateway, "websocket upgraded");
	handle_connection(ws, ctx, admission.gateway, admission.credential).await
}
