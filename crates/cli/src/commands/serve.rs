use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info, warn};
use wurm::runtime::SessionPool;
use wurm::{Discovery, Dispatcher, LocalFilter, ProbeRegistry};

use crate::config::ServerConfig;
use crate::error::{Result, WurmError};
use crate::gateway::Gateway;

pub async fn execute(
	mut config: ServerConfig,
	host: Option<String>,
	port: Option<u16>,
	catalog: Option<PathBuf>,
) -> Result<()> {
	if let Some(host) = host {
		config.host = host;
	}
	if let Some(port) = port {
		config.port = port;
	}
	if catalog.is_some() {
		config.catalog = catalog;
	}

	let token = config.token_secret()?.ok_or_else(|| {
		WurmError::Config("no token configured; run `wurm token <secret> --save` or set WURM_TOKEN".into())
	})?;

	let registry = Arc::new(ProbeRegistry::load(config.catalog.as_deref())?);
	info!(target = "wurm.gateway", probes = registry.len(), "probe catalog loaded");

	let pool = Arc::new(SessionPool::new(config.pool_config(), config.launcher()));
	let reaper = pool.spawn_reaper();
	let dispatcher = Dispatcher::with_filter(registry, pool.clone(), LocalFilter::new(&config.scratch_path));
	let discovery = Discovery::new(config.discovery.clone());
	let gateway = Gateway::new(dispatcher, pool.clone(), discovery, token);

	let addr = format!("{}:{}", config.host, config.port);
	let listener = TcpListener::bind(&addr)
		.await
		.map_err(|source| WurmError::Bind { addr, source })?;

	install_panic_hook();
	let result = gateway.serve(listener, shutdown_signal()).await;

	reaper.abort();
	pool.shutdown().await;
	result.map_err(WurmError::from)
}

fn install_panic_hook() {
	let default_hook = std::panic::take_hook();
	std::panic::set_hook(Box::new(move |info| {
		error!(target = "wurm.gateway", panic = %info, "task panicked");
		default_hook(info);
	}));
}

async fn shutdown_signal() {
	let ctrl_c = async {
		if let Err(err) = tokio::signal::ctrl_c().await {
			warn!(target = "wurm.gateway", error = %err, "failed to install Ctrl+C handler");
			std::future::pending::<()>().await;
		}
	};

	#[cfg(unix)]
	let terminate = async {
		use tokio::signal::unix::{SignalKind, signal};

		match signal(SignalKind::terminate()) {
			Ok(mut sigterm) => {
				sigterm.recv().await;
			}
			Err(err) => {
				warn!(target = "wurm.gateway", error = %err, "failed to install SIGTERM handler");
				std::future::pending::<()>().await;
			}
		}
	};

	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		_ = ctrl_c => info!(target = "wurm.gateway", "received Ctrl+C, shutting down"),
		_ = terminate => info!(target = "wurm.gateway", "received SIGTERM, shutting down"),
	}
}
