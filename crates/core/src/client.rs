//! Probe client
//!
//! [`ProbeClient`] keeps one WebSocket connection to a gateway, drives the
//! [`Scheduler`] from the frames it receives, and runs a refresh tick per
//! watched host. Results and other notable frames are delivered on an event
//! channel handed out by [`ProbeClient::new`].
//!
//! The connection is re-established after a fixed delay whenever it closes
//! or fails; every (re)connect sends `auth`, `probes`, `hosts`, and `history`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use wurm_protocol::{Command, Frame, PARAM_DELIMITER, ProbeMeta};

use crate::error::{Error, Result};
use crate::scheduler::{Outcome, ProbeResult, Scheduler, SchedulerConfig};

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ClientConfig {
	/// Gateway endpoint, e.g. `ws://127.0.0.1:2048/`.
	pub url: String,
	/// Shared token sent with `auth`. Without one the client skips authentication.
	pub token: Option<String>,
	pub reconnect_delay: Duration,
	pub scheduler: SchedulerConfig,
}

impl ClientConfig {
	pub fn new(url: impl Into<String>) -> Self {
		Self {
			url: url.into(),
			token: None,
			reconnect_delay: DEFAULT_RECONNECT_DELAY,
			scheduler: SchedulerConfig::default(),
		}
	}
}

/// Something the application may want to react to.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
	Connected,
	Disconnected,
	AuthRejected,
	Hosts(Vec<String>),
	History(Vec<String>),
	Probes(BTreeMap<String, ProbeMeta>),
	Result(ProbeResult),
	ProbeFailed { host: String, probe: String, error: String },
	/// Error frame not tied to a tracked probe or run.
	Error { cmd: String, error: String },
	/// Any other reply (`status`, `kubectxt`, `localnet`, `probe_kubectxt`).
	Reply(Frame),
}

/// Output of an ad-hoc [`ProbeClient::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutput {
	pub stdout: String,
	pub stderr: String,
}

struct Shared {
	config: ClientConfig,
	scheduler: Mutex<Scheduler>,
	outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
	pending_runs: Mutex<HashMap<String, oneshot::Sender<Result<RunOutput>>>>,
	run_seq: AtomicU64,
	events: mpsc::UnboundedSender<ClientEvent>,
}

pub struct ProbeClient {
	shared: Arc<Shared>,
	connection: Mutex<Option<JoinHandle<()>>>,
	tickers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl ProbeClient {
	/// Creates a disconnected client and the receiver for its events.
	pub fn new(config: ClientConfig) -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
		let (events, rx) = mpsc::unbounded_channel();
		let shared = Arc::new(Shared {
			scheduler: Mutex::new(Scheduler::new(config.scheduler.clone())),
			config,
			outbound: Mutex::new(None),
			pending_runs: Mutex::new(HashMap::new()),
			run_seq: AtomicU64::new(0),
			events,
		});
		let client = Self {
			shared,
			connection: Mutex::new(None),
			tickers: Mutex::new(HashMap::new()),
		};
		(client, rx)
	}

	/// Starts the connection loop. Calling it while connected is a no-op.
	pub fn connect(&self) {
		let mut connection = self.connection.lock();
		if connection.as_ref().is_some_and(|handle| !handle.is_finished()) {
			return;
		}
		let shared = Arc::clone(&self.shared);
		*connection = Some(tokio::spawn(async move { shared.connection_loop().await }));
	}

	/// Closes the connection and stops all refresh ticks. No reconnect follows.
	pub fn disconnect(&self) {
		if let Some(handle) = self.connection.lock().take() {
			handle.abort();
		}
		for (_, ticker) in self.tickers.lock().drain() {
			ticker.abort();
		}
		if self.shared.outbound.lock().take().is_some() {
			self.shared.connection_lost();
		}
	}

	pub fn is_connected(&self) -> bool {
		self.shared.outbound.lock().is_some()
	}

	/// Watches `host`: issues its initial probes and starts its refresh tick.
	///
	/// A previous tick for the same host is replaced. If the catalog has not
	/// arrived yet, initial probes are issued as soon as it does.
	pub fn start(&self, host: &str) {
		self.stop(host);
		self.shared.scheduler.lock().watch(host);
		self.shared.issue_initial(host);

		let shared = Arc::clone(&self.shared);
		let ticked_host = host.to_string();
		let ticker = tokio::spawn(async move {
			let mut interval = tokio::time::interval(shared.config.scheduler.refresh_interval);
			interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
			interval.tick().await;
			loop {
				interval.tick().await;
				shared.tick(&ticked_host);
			}
		});
		self.tickers.lock().insert(host.to_string(), ticker);
	}

	/// Stops the refresh tick for `host`. Requests in flight still complete.
	pub fn stop(&self, host: &str) {
		if let Some(ticker) = self.tickers.lock().remove(host) {
			ticker.abort();
		}
	}

	/// Issues `probe` on `host` now, unless it is already in flight or not allowed.
	///
	/// Returns false until the catalog has arrived, since only known probes
	/// can be checked against the host.
	pub fn probe(&self, host: &str, probe: &str) -> bool {
		self.shared.scheduler.lock().watch(host);
		self.shared.issue(host, probe, 0)
	}

	/// Runs an ad-hoc command on `host` and waits for its output.
	pub async fn run(&self, host: &str, command: &str) -> Result<RunOutput> {
		let id = self.shared.run_seq.fetch_add(1, Ordering::Relaxed).to_string();
		let (tx, rx) = oneshot::channel();
		self.shared.pending_runs.lock().insert(id.clone(), tx);

		let line = format!("run {host}{PARAM_DELIMITER}{id}{PARAM_DELIMITER}{command}");
		if let Err(err) = self.shared.send(line) {
			self.shared.pending_runs.lock().remove(&id);
			return Err(err);
		}
		rx.await.unwrap_or(Err(Error::NotConnected))
	}

	/// Sends any other command, e.g. [`Command::Status`]. The answer arrives as an event.
	pub fn send(&self, command: &Command) -> Result<()> {
		self.shared.send(command.to_string())
	}

	/// Latest results for `host`.
	pub fn results(&self, host: &str) -> Vec<ProbeResult> {
		self.shared.scheduler.lock().results(host).into_iter().cloned().collect()
	}
}

impl Drop for ProbeClient {
	fn drop(&mut self) {
		self.disconnect();
	}
}

impl Shared {
	async fn connection_loop(self: Arc<Self>) {
		loop {
			match connect_async(self.config.url.as_str()).await {
				Ok((stream, _)) => {
					info!(target = "wurm.client", url = %self.config.url, "connected");
					self.serve(stream).await;
					self.connection_lost();
				}
				Err(err) => {
					warn!(target = "wurm.client", url = %self.config.url, error = %err, "connection failed");
				}
			}
			tokio::time::sleep(self.config.reconnect_delay).await;
		}
	}

	async fn serve<S>(&self, ws: tokio_tungstenite::WebSocketStream<S>)
	where
		S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
	{
		let (mut sink, mut stream) = ws.split();
		let (tx, mut rx) = mpsc::unbounded_channel::<String>();
		*self.outbound.lock() = Some(tx.clone());
		self.emit(ClientEvent::Connected);

		if let Some(token) = &self.config.token {
			let _ = tx.send(format!("auth {token}"));
		}
		for cmd in ["probes", "hosts", "history"] {
			let _ = tx.send(cmd.to_string());
		}

		let mut hosts_refresh = tokio::time::interval(self.config.scheduler.refresh_interval);
		hosts_refresh.tick().await;

		loop {
			tokio::select! {
				Some(line) = rx.recv() => {
					debug!(target = "wurm.client", %line, "send");
					if let Err(err) = sink.send(Message::Text(line)).await {
						warn!(target = "wurm.client", error = %err, "send failed");
						break;
					}
				}
				msg = stream.next() => match msg {
					Some(Ok(Message::Text(text))) => self.handle_text(&text),
					Some(Ok(Message::Close(_))) | None => break,
					Some(Ok(_)) => {}
					Some(Err(err)) => {
						warn!(target = "wurm.client", error = %err, "connection error");
						break;
					}
				},
				_ = hosts_refresh.tick() => {
					let _ = tx.send("hosts".to_string());
				}
			}
		}
	}

	fn connection_lost(&self) {
		*self.outbound.lock() = None;
		self.scheduler.lock().reset_in_flight();
		for (_, waiter) in self.pending_runs.lock().drain() {
			let _ = waiter.send(Err(Error::NotConnected));
		}
		self.emit(ClientEvent::Disconnected);
	}

	fn emit(&self, event: ClientEvent) {
		// A dropped receiver just means nobody listens anymore.
		let _ = self.events.send(event);
	}

	fn send(&self, line: String) -> Result<()> {
		let outbound = self.outbound.lock();
		let tx = outbound.as_ref().ok_or(Error::NotConnected)?;
		tx.send(line).map_err(|_| Error::NotConnected)
	}

	fn issue(&self, host: &str, probe: &str, depth: u32) -> bool {
		if self.outbound.lock().is_none() {
			return false;
		}
		if !self.scheduler.lock().begin(host, probe, depth, now_ms()) {
			return false;
		}
		self.send(format!("probe {host}{PARAM_DELIMITER}{probe}")).is_ok()
	}

	fn issue_initial(&self, host: &str) {
		let initial = self.scheduler.lock().initial_probes(host);
		for probe in initial {
			self.issue(host, &probe, 0);
		}
	}

	fn tick(&self, host: &str) {
		let due = self.scheduler.lock().due_probes(host, now_ms());
		for probe in due {
			self.issue(host, &probe, 0);
		}
	}

	fn handle_text(&self, text: &str) {
		let frame: Frame = match serde_json::from_str(text) {
			Ok(frame) => frame,
			Err(err) => {
				warn!(target = "wurm.client", error = %err, "ignoring malformed frame");
				return;
			}
		};

		match frame.cmd.as_str() {
			"version" => debug!(target = "wurm.client", version = ?frame.version, protocol = ?frame.protocol, "server version"),
			"auth" if frame.auth_accepted() => info!(target = "wurm.client", "authenticated"),
			"auth" => {
				warn!(target = "wurm.client", "authentication rejected");
				self.emit(ClientEvent::AuthRejected);
			}
			"probe" => self.handle_probe(frame),
			"run" => self.handle_run(frame),
			_ if frame.is_error() => self.emit(ClientEvent::Error {
				error: frame.error.unwrap_or_default(),
				cmd: frame.cmd,
			}),
			"hosts" => self.emit(ClientEvent::Hosts(string_list(frame.result))),
			"history" => self.emit(ClientEvent::History(string_list(frame.result))),
			"probes" => self.handle_catalog(frame),
			_ => self.emit(ClientEvent::Reply(frame)),
		}
	}

	fn handle_catalog(&self, frame: Frame) {
		let catalog: BTreeMap<String, ProbeMeta> = match frame.result.map(serde_json::from_value).transpose() {
			Ok(catalog) => catalog.unwrap_or_default(),
			Err(err) => {
				warn!(target = "wurm.client", error = %err, "ignoring malformed probe catalog");
				return;
			}
		};

		let untouched: Vec<String> = {
			let mut scheduler = self.scheduler.lock();
			scheduler.set_catalog(catalog.clone());
			scheduler
				.watched_hosts()
				.filter(|host| scheduler.is_untouched(host))
				.map(String::from)
				.collect()
		};
		self.emit(ClientEvent::Probes(catalog));
		for host in untouched {
			self.issue_initial(&host);
		}
	}

	fn handle_probe(&self, frame: Frame) {
		let outcome = self.scheduler.lock().complete(&frame, now_ms());
		match outcome {
			Some(Outcome::Completed { result, follow_ups }) => {
				let host = result.host.clone();
				self.emit(ClientEvent::Result(result));
				for follow_up in follow_ups {
					self.issue(&host, &follow_up.probe, follow_up.depth);
				}
			}
			Some(Outcome::Failed { host, probe, error }) => self.emit(ClientEvent::ProbeFailed { host, probe, error }),
			None => {
				if let Some(error) = frame.error {
					self.emit(ClientEvent::Error { cmd: frame.cmd, error });
				}
			}
		}
	}

	fn handle_run(&self, frame: Frame) {
		let Some(waiter) = frame.id.as_ref().and_then(|id| self.pending_runs.lock().remove(id)) else {
			debug!(target = "wurm.client", id = ?frame.id, "run reply without a waiting caller");
			if let Some(error) = frame.error {
				self.emit(ClientEvent::Error { cmd: frame.cmd, error });
			}
			return;
		};
		let reply = match frame.error {
			Some(error) => Err(Error::Remote(error)),
			None => Ok(RunOutput {
				stdout: frame.stdout.unwrap_or_default(),
				stderr: frame.stderr.unwrap_or_default(),
			}),
		};
		let _ = waiter.send(reply);
	}
}

fn string_list(result: Option<serde_json::Value>) -> Vec<String> {
	result.and_then(|value| serde_json::from_value(value).ok()).unwrap_or_default()
}

fn now_ms() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.unwrap_or_default()
		.as_millis() as u64
}

#[cfg(test)]
mod tests {
	use serde_json::json;
	use tokio::net::TcpListener;
	use tokio_tungstenite::accept_async;

	use super::*;

	/// Minimal gateway: answers from a fixed script and logs every line it receives.
	async fn fake_gateway(drop_first: bool) -> (String, mpsc::UnboundedReceiver<String>) {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let url = format!("ws://{}/", listener.local_addr().unwrap());
		let (log, log_rx) = mpsc::unbounded_channel();

		tokio::spawn(async move {
			let mut connections = 0;
			loop {
				let Ok((tcp, _)) = listener.accept().await else {
					return;
				};
				connections += 1;
				let log = log.clone();
				let drop_now = drop_first && connections == 1;
				tokio::spawn(async move {
					let mut ws = accept_async(tcp).await.unwrap();
					ws.send(Message::Text(Frame::version("test").to_json())).await.unwrap();
					while let Some(Ok(Message::Text(line))) = ws.next().await {
						let _ = log.send(line.clone());
						if drop_now {
							return;
						}
						for reply in respond(&line) {
							ws.send(Message::Text(reply.to_json())).await.unwrap();
						}
					}
				});
			}
		});

		(url, log_rx)
	}

	fn respond(line: &str) -> Vec<Frame> {
		match Command::parse(line).unwrap() {
			Command::Auth { token } => vec![Frame::auth(token == "secret")],
			Command::Probes => vec![Frame::result(
				"probes",
				json!({
					"A": {"command": "echo OK", "initial": true, "refresh": 60},
					"B": {"command": "echo b", "refresh": 60},
				}),
			)],
			Command::Hosts => vec![Frame::result("hosts", json!(["web1", "localhost"]))],
			Command::History => vec![Frame::result("history", json!(["db1"]))],
			Command::Probe { host, probe } => vec![Frame {
				cmd: "probe".into(),
				stdout: Some(format!("{probe} OK")),
				stderr: Some(String::new()),
				next: Some(if probe == "A" { vec!["B".into()] } else { vec![] }),
				host: Some(host),
				probe: Some(probe),
				..Frame::default()
			}],
			Command::Run { host, id, command } => vec![Frame {
				cmd: "run".into(),
				host: Some(host),
				id: Some(id),
				stdout: Some(format!("ran {command}")),
				stderr: Some(String::new()),
				..Frame::default()
			}],
			other => vec![Frame::unsupported(other.name())],
		}
	}

	async fn next_event(events: &mut mpsc::UnboundedReceiver<ClientEvent>) -> ClientEvent {
		tokio::time::timeout(Duration::from_secs(5), events.recv()).await.unwrap().unwrap()
	}

	async fn wait_for<F>(events: &mut mpsc::UnboundedReceiver<ClientEvent>, mut pred: F) -> ClientEvent
	where
		F: FnMut(&ClientEvent) -> bool,
	{
		loop {
			let event = next_event(events).await;
			if pred(&event) {
				return event;
			}
		}
	}

	fn config(url: String) -> ClientConfig {
		ClientConfig {
			token: Some("secret".into()),
			reconnect_delay: Duration::from_millis(50),
			..ClientConfig::new(url)
		}
	}

	#[tokio::test]
	async fn opens_with_auth_and_catalog_requests() {
		let (url, mut log) = fake_gateway(false).await;
		let (client, mut events) = ProbeClient::new(config(url));
		client.connect();

		assert_eq!(next_event(&mut events).await, ClientEvent::Connected);
		let mut sent = Vec::new();
		for _ in 0..4 {
			sent.push(tokio::time::timeout(Duration::from_secs(5), log.recv()).await.unwrap().unwrap());
		}
		assert_eq!(sent, vec!["auth secret", "probes", "hosts", "history"]);

		let hosts = wait_for(&mut events, |e| matches!(e, ClientEvent::Hosts(_))).await;
		assert_eq!(hosts, ClientEvent::Hosts(vec!["web1".into(), "localhost".into()]));
		client.disconnect();
	}

	#[tokio::test]
	async fn follow_ups_are_issued_after_their_trigger() {
		let (url, _log) = fake_gateway(false).await;
		let (client, mut events) = ProbeClient::new(config(url));
		client.connect();
		wait_for(&mut events, |e| matches!(e, ClientEvent::Probes(_))).await;

		client.start("web1");
		let ClientEvent::Result(a) = wait_for(&mut events, |e| matches!(e, ClientEvent::Result(_))).await else {
			unreachable!()
		};
		assert_eq!((a.probe.as_str(), a.next.clone()), ("A", vec!["B".to_string()]));

		let ClientEvent::Result(b) = wait_for(&mut events, |e| matches!(e, ClientEvent::Result(_))).await else {
			unreachable!()
		};
		assert_eq!(b.probe, "B");
		assert!(b.timestamp >= a.timestamp);
		assert_eq!(client.results("web1").len(), 2);
		client.disconnect();
	}

	#[tokio::test]
	async fn watching_before_the_catalog_arrives_still_starts_probes() {
		let (url, _log) = fake_gateway(false).await;
		let (client, mut events) = ProbeClient::new(config(url));
		client.start("web1");
		client.connect();
		let event = wait_for(&mut events, |e| matches!(e, ClientEvent::Result(_))).await;
		assert!(matches!(event, ClientEvent::Result(r) if r.probe == "A"));
		client.disconnect();
	}

	#[tokio::test]
	async fn run_resolves_by_id() {
		let (url, _log) = fake_gateway(false).await;
		let (client, mut events) = ProbeClient::new(config(url));
		client.connect();
		wait_for(&mut events, |e| *e == ClientEvent::Connected).await;

		let (first, second) = tokio::join!(client.run("web1", "uptime"), client.run("web2", "df -h"));
		assert_eq!(first.unwrap().stdout, "ran uptime");
		assert_eq!(second.unwrap().stdout, "ran df -h");
		client.disconnect();
	}

	#[tokio::test]
	async fn run_without_connection_fails() {
		let (client, _events) = ProbeClient::new(ClientConfig::new("ws://127.0.0.1:9/"));
		assert!(matches!(client.run("web1", "true").await, Err(Error::NotConnected)));
		assert!(!client.probe("web1", "A"));
	}

	#[tokio::test]
	async fn reconnects_after_the_connection_drops() {
		let (url, mut log) = fake_gateway(true).await;
		let (client, mut events) = ProbeClient::new(config(url));
		client.connect();

		wait_for(&mut events, |e| *e == ClientEvent::Disconnected).await;
		wait_for(&mut events, |e| *e == ClientEvent::Connected).await;

		let mut auths = 0;
		while auths < 2 {
			let line = tokio::time::timeout(Duration::from_secs(5), log.recv()).await.unwrap().unwrap();
			if line.starts_with("auth ") {
				auths += 1;
			}
		}
		client.disconnect();
	}
}
