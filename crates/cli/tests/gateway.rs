//! Gateway over a real socket, with local shells standing in for ssh.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use wurm::protocol::ProbeDefinition;
use wurm::runtime::{PoolConfig, SessionPool, ShellLauncher};
use wurm::{ClientConfig, ClientEvent, Discovery, DiscoveryConfig, Dispatcher, LocalFilter, ProbeClient, ProbeRegistry};
use wurm_cli::gateway::Gateway;

const SECRET: &str = "s3cret";

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestGateway {
	addr: SocketAddr,
	pool: Arc<SessionPool>,
	stop: Option<oneshot::Sender<()>>,
	_dir: TempDir,
}

impl TestGateway {
	async fn start() -> Self {
		let dir = TempDir::new().unwrap();
		let history = dir.path().join("history");
		std::fs::write(&history, "ssh web1\nls\nssh db1\nssh web1\n").unwrap();

		let mut a = ProbeDefinition::new("A", "echo 'service OK'");
		a.initial = true;
		let mut b = ProbeDefinition::new("B", "echo second");
		b.depends_on = Some("A".into());
		b.match_pattern = Some("OK".into());
		let mut agent = ProbeDefinition::new("agent", "echo agent");
		agent.local_only = true;
		let registry = Arc::new(ProbeRegistry::from_definitions([a, b, agent]));

		let launcher = ShellLauncher {
			ssh: "/bin/bash".into(),
			ssh_options: vec!["-s".into()],
			..ShellLauncher::default()
		};
		let pool = Arc::new(SessionPool::new(PoolConfig::default(), launcher));
		let dispatcher = Dispatcher::with_filter(registry, pool.clone(), LocalFilter::new(dir.path().join("scratch")));
		let discovery = Discovery::new(DiscoveryConfig {
			history_file: Some(history),
			..DiscoveryConfig::default()
		});
		let gateway = Gateway::new(dispatcher, pool.clone(), discovery, SECRET);

		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		let (stop, stopped) = oneshot::channel::<()>();
		tokio::spawn(gateway.serve(listener, async {
			let _ = stopped.await;
		}));

		Self {
			addr,
			pool,
			stop: Some(stop),
			_dir: dir,
		}
	}

	fn url(&self) -> String {
		format!("ws://{}/", self.addr)
	}

	async fn connect(&self) -> Ws {
		let (ws, _) = connect_async(self.url()).await.unwrap();
		ws
	}

	/// Connects, checks the greeting, and authenticates.
	async fn login(&self) -> Ws {
		let mut ws = self.connect().await;
		assert_eq!(recv(&mut ws).await["cmd"], "version");
		send(&mut ws, &format!("auth {SECRET}")).await;
		assert_eq!(recv(&mut ws).await, json!({"cmd": "auth", "result": 0}));
		ws
	}

	async fn stop(mut self) {
		if let Some(stop) = self.stop.take() {
			let _ = stop.send(());
		}
		self.pool.shutdown().await;
	}
}

async fn send(ws: &mut Ws, line: &str) {
	ws.send(Message::Text(line.to_string())).await.unwrap();
}

async fn recv(ws: &mut Ws) -> Value {
	loop {
		let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
			.await
			.expect("timed out waiting for a frame")
			.expect("connection closed")
			.unwrap();
		if let Message::Text(text) = msg {
			return serde_json::from_str(&text).unwrap();
		}
	}
}

#[tokio::test]
async fn greets_with_version_frame() {
	let gw = TestGateway::start().await;
	let mut ws = gw.connect().await;

	let frame = recv(&mut ws).await;
	assert_eq!(frame["cmd"], "version");
	assert_eq!(frame["protocol"], 1);
	assert!(frame["version"].is_string());
	gw.stop().await;
}

#[tokio::test]
async fn commands_before_auth_are_unsupported() {
	let gw = TestGateway::start().await;
	let mut ws = gw.connect().await;
	recv(&mut ws).await;

	for (line, cmd) in [("hosts", "hosts"), ("probe localhost:::A", "probe"), ("run localhost:::1:::id", "run")] {
		send(&mut ws, line).await;
		assert_eq!(recv(&mut ws).await, json!({"cmd": cmd, "error": "Unsupported command"}));
	}
	assert!(gw.pool.status().is_empty());
	gw.stop().await;
}

#[tokio::test]
async fn failed_auth_keeps_connection_open() {
	let gw = TestGateway::start().await;
	let mut ws = gw.connect().await;
	recv(&mut ws).await;

	send(&mut ws, "auth wrong").await;
	assert_eq!(recv(&mut ws).await, json!({"cmd": "auth", "result": 1}));
	send(&mut ws, "probes").await;
	assert_eq!(recv(&mut ws).await["error"], "Unsupported command");

	send(&mut ws, &format!("auth {SECRET}")).await;
	assert_eq!(recv(&mut ws).await, json!({"cmd": "auth", "result": 0}));
	send(&mut ws, "probes").await;
	assert!(recv(&mut ws).await["result"].is_object());
	gw.stop().await;
}

#[tokio::test]
async fn failed_reauth_drops_authentication() {
	let gw = TestGateway::start().await;
	let mut ws = gw.login().await;

	send(&mut ws, "auth wrong").await;
	assert_eq!(recv(&mut ws).await, json!({"cmd": "auth", "result": 1}));
	send(&mut ws, "probes").await;
	assert_eq!(recv(&mut ws).await, json!({"cmd": "probes", "error": "Unsupported command"}));
	gw.stop().await;
}

#[tokio::test]
async fn probes_listing_is_idempotent() {
	let gw = TestGateway::start().await;
	let mut ws = gw.login().await;

	send(&mut ws, "probes").await;
	let first = recv(&mut ws).await;
	send(&mut ws, "probes").await;
	let second = recv(&mut ws).await;

	assert_eq!(first, second);
	assert_eq!(first["result"]["A"]["command"], "echo 'service OK'");
	assert_eq!(first["result"]["A"]["initial"], true);
	assert_eq!(first["result"]["agent"]["localOnly"], true);
	gw.stop().await;
}

#[tokio::test]
async fn probe_output_names_follow_ups() {
	let gw = TestGateway::start().await;
	let mut ws = gw.login().await;

	send(&mut ws, "probe localhost:::A").await;
	let a = recv(&mut ws).await;
	assert_eq!(a["cmd"], "probe");
	assert_eq!(a["host"], "localhost");
	assert_eq!(a["probe"], "A");
	assert_eq!(a["stdout"], "service OK\n");
	assert_eq!(a["next"], json!(["B"]));

	send(&mut ws, "probe localhost:::B").await;
	let b = recv(&mut ws).await;
	assert_eq!(b["probe"], "B");
	assert_eq!(b["stdout"], "second\n");
	assert_eq!(b["next"], json!([]));
	gw.stop().await;
}

#[tokio::test]
async fn errors_are_frames() {
	let gw = TestGateway::start().await;
	let mut ws = gw.login().await;

	send(&mut ws, "reboot now").await;
	assert_eq!(recv(&mut ws).await, json!({"cmd": "reboot", "error": "Unsupported command"}));

	send(&mut ws, "probe localhost:::nope").await;
	assert_eq!(
		recv(&mut ws).await,
		json!({"cmd": "probe", "host": "localhost", "probe": "nope", "error": "No such probe"})
	);

	send(&mut ws, "probe localhost").await;
	let malformed = recv(&mut ws).await;
	assert_eq!(malformed["cmd"], "probe");
	assert!(malformed["error"].as_str().unwrap().starts_with("Malformed parameters"));

	// The connection survives all of the above.
	send(&mut ws, "probes").await;
	assert!(recv(&mut ws).await["result"].is_object());
	gw.stop().await;
}

#[tokio::test]
async fn run_keeps_spaces_in_command() {
	let gw = TestGateway::start().await;
	let mut ws = gw.login().await;

	send(&mut ws, "run localhost:::7:::echo a b | tr a-z A-Z").await;
	let frame = recv(&mut ws).await;
	assert_eq!(frame["cmd"], "run");
	assert_eq!(frame["host"], "localhost");
	assert_eq!(frame["id"], "7");
	assert_eq!(frame["stdout"], "A B\n");
	gw.stop().await;
}

#[tokio::test]
async fn remote_local_only_probe_sends_nothing() {
	let gw = TestGateway::start().await;
	let mut ws = gw.login().await;

	send(&mut ws, "probe web1:::agent").await;
	send(&mut ws, "probe localhost:::A").await;

	let frame = recv(&mut ws).await;
	assert_eq!(frame["probe"], "A");
	assert!(gw.pool.status().iter().all(|s| s.key != "web1"));
	gw.stop().await;
}

#[tokio::test]
async fn slow_host_does_not_block_connection() {
	let gw = TestGateway::start().await;
	let mut ws = gw.login().await;

	send(&mut ws, "run web1:::slow:::sleep 1; echo slow").await;
	send(&mut ws, "run localhost:::fast:::echo fast").await;

	let first = recv(&mut ws).await;
	assert_eq!(first["id"], "fast");
	let second = recv(&mut ws).await;
	assert_eq!(second["id"], "slow");
	assert_eq!(second["stdout"], "slow\n");
	gw.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn same_host_replies_follow_arrival_order() {
	let gw = TestGateway::start().await;
	let mut ws = gw.login().await;

	for round in 0..30 {
		ws.feed(Message::Text(format!("run localhost:::{round}a:::echo a"))).await.unwrap();
		ws.feed(Message::Text(format!("run localhost:::{round}b:::echo b"))).await.unwrap();
		ws.flush().await.unwrap();

		assert_eq!(recv(&mut ws).await["id"], format!("{round}a"));
		assert_eq!(recv(&mut ws).await["id"], format!("{round}b"));
	}
	gw.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn second_run_starts_after_first_completes() {
	let gw = TestGateway::start().await;
	let mut ws = gw.login().await;

	ws.feed(Message::Text("run web1:::first:::date +%s%N; sleep 0.2; date +%s%N".into()))
		.await
		.unwrap();
	ws.feed(Message::Text("run web1:::second:::date +%s%N".into())).await.unwrap();
	ws.flush().await.unwrap();

	let stamps = |frame: &Value| -> Vec<u128> {
		frame["stdout"].as_str().unwrap().lines().map(|l| l.parse().unwrap()).collect()
	};
	let first = recv(&mut ws).await;
	let second = recv(&mut ws).await;
	assert_eq!(first["id"], "first");
	assert_eq!(second["id"], "second");
	let first_end = stamps(&first)[1];
	let second_start = stamps(&second)[0];
	assert!(second_start >= first_end, "second run started before the first one finished");
	gw.stop().await;
}

#[tokio::test]
async fn history_and_status() {
	let gw = TestGateway::start().await;
	let mut ws = gw.login().await;

	send(&mut ws, "history").await;
	assert_eq!(recv(&mut ws).await, json!({"cmd": "history", "result": ["db1", "web1"]}));

	send(&mut ws, "probe localhost:::A").await;
	recv(&mut ws).await;

	send(&mut ws, "status").await;
	let status = recv(&mut ws).await;
	assert_eq!(status["cmd"], "status");
	assert_eq!(status["result"]["probes"], 3);
	let sessions = status["result"]["sessions"].as_array().unwrap();
	assert!(sessions.iter().any(|s| s["key"] == "localhost" && s["state"] == "ready"));
	gw.stop().await;
}

#[tokio::test]
async fn client_follows_chain_end_to_end() {
	let gw = TestGateway::start().await;

	let mut config = ClientConfig::new(gw.url());
	config.token = Some(SECRET.into());
	let (client, mut events) = ProbeClient::new(config);
	client.connect();
	client.start("localhost");

	let mut seen = Vec::new();
	let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
	while seen.len() < 2 {
		let event = tokio::time::timeout_at(deadline, events.recv())
			.await
			.expect("timed out waiting for results")
			.expect("event channel closed");
		match event {
			ClientEvent::Result(result) => seen.push((result.probe, result.stdout)),
			ClientEvent::AuthRejected => panic!("auth rejected"),
			_ => {}
		}
	}
	assert_eq!(
		seen,
		vec![("A".to_string(), "service OK\n".to_string()), ("B".to_string(), "second\n".to_string())]
	);

	let output = client.run("localhost", "echo via client").await.unwrap();
	assert_eq!(output.stdout, "via client\n");

	client.disconnect();
	gw.stop().await;
}
