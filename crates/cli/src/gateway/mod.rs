//! WebSocket gateway
//!
//! Serves the probe protocol on `/`. Each accepted socket gets its own
//! connection task (see [`connection`]); commands on a connection run
//! concurrently and their frames funnel through one outbound queue.

mod connection;

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use tokio::net::TcpListener;
use tracing::info;
use wurm::runtime::SessionPool;
use wurm::{Discovery, Dispatcher};

pub(crate) struct GatewayState {
	dispatcher: Dispatcher,
	pool: Arc<SessionPool>,
	discovery: Discovery,
	token: String,
}

#[derive(Clone)]
pub struct Gateway {
	state: Arc<GatewayState>,
}

impl Gateway {
	/// `token` is the plain shared secret clients must present with `auth`.
	pub fn new(dispatcher: Dispatcher, pool: Arc<SessionPool>, discovery: Discovery, token: impl Into<String>) -> Self {
		Self {
			state: Arc::new(GatewayState {
				dispatcher,
				pool,
				discovery,
				token: token.into(),
			}),
		}
	}

	pub fn router(&self) -> Router {
		Router::new().route("/", get(ws_handler)).with_state(self.state.clone())
	}

	/// Serves until `shutdown` resolves.
	pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
	where
		F: Future<Output = ()> + Send + 'static,
	{
		let addr = listener.local_addr().context("Failed to read listener address")?;
		info!(target = "wurm.gateway", %addr, "gateway listening");

		axum::serve(listener, self.router())
			.with_graceful_shutdown(shutdown)
			.await
			.context("Gateway server failed")?;

		info!(target = "wurm.gateway", "gateway stopped");
		Ok(())
	}
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
	ws.on_upgrade(move |socket| connection::handle_socket(socket, state))
}
