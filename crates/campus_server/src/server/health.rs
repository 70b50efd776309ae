#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::warn;

use crate::server::bus::BroadcastAdapter;

#[derive(Clone, Default)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
	broadcaster: Option<BroadcastAdapter>,
}

impl HealthState {
	pub fn new(broadcaster: Option<BroadcastAdapter>) -> Self {
		Self {
			ready: Arc::new(AtomicBool::new(false)),
			broadcaster,
		}
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}

	/// Whether cross-node delivery has fallen back to this node only.
	pub fn is_degraded(&self) -> bool {
		self.broadcaster.as_ref().is_some_and(BroadcastAdapter::is_degraded)
	}
}

pub fn spawn_health_server(bind: SocketAddr, state: HealthState) {
	tokio::spawn(async move {
		if let Err(err) = run_health_server(bind, state).await {
			warn!(error = %err, "health server stopped");
		}
	});
}

async fn run_health_server(bind: SocketAddr, state: HealthState) -> anyhow::Result<()> {
	let listener = TcpListener::bind(bind).await?;
	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let state = state.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| handle_health(req, state.clone()));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "health connection error");
			}
		});
	}
}

fn reply(status: StatusCode, body: &'static [u8]) -> Response<Full<Bytes>> {
	let mut resp = Response::new(Full::new(Bytes::from_static(body)));
	*resp.status_mut() = status;
	resp
}

async fn handle_health(req: Request<Incoming>, state: HealthState) -> Result<Response<Full<Bytes>>, hyper::Error> {
	Ok(route(req.method(), req.uri().path(), &state))
}

fn route(method: &Method, path: &str, state: &HealthState) -> Response<Full<Bytes>> {
	if method != Method::GET {
		return reply(StatusCode::METHOD_NOT_ALLOWED, b"");
	}

	match path {
		"/healthz" if state.is_degraded() => reply(StatusCode::OK, b"degraded: bus unavailable"),
		"/healthz" => reply(StatusCode::OK, b"ok"),
		"/readyz" if state.is_ready() => reply(StatusCode::OK, b"ready"),
		"/readyz" => reply(StatusCode::SERVICE_UNAVAILABLE, b"not-ready"),
		_ => reply(StatusCode::NOT_FOUND, b""),
	}
}
